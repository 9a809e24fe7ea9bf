use std::time::Duration;

use super::{LATEST_SUFFIX, SNAPSHOT_FILENAME};

/// Decides whether a directory entry is an aged-out snapshot image.
///
/// Only regular snapshot-kind entries qualify: the name must carry the
/// snapshot prefix, must not be the latest pointer, and the entry must not be
/// a symlink (the pointer itself, or anything an operator linked in).
pub fn is_prunable(name: &str, is_symlink: bool, age: Duration, horizon: Duration) -> bool {
    if is_symlink {
        return false;
    }
    if !name.starts_with(&format!("{SNAPSHOT_FILENAME}.")) {
        return false;
    }
    if name == format!("{SNAPSHOT_FILENAME}.{LATEST_SUFFIX}") {
        return false;
    }
    age > horizon
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn prunes_only_aged_snapshot_images() {
        assert!(is_prunable("etcd.snapshot.1700000000", false, 2 * HOUR, HOUR));
        assert!(!is_prunable("etcd.snapshot.1700000000", false, HOUR / 2, HOUR));
    }

    #[test]
    fn never_prunes_the_pointer_regardless_of_age() {
        assert!(!is_prunable("etcd.snapshot.LATEST", false, 100 * HOUR, HOUR));
        assert!(!is_prunable("etcd.snapshot.LATEST", true, 100 * HOUR, HOUR));
    }

    #[test]
    fn never_prunes_symlinks_or_foreign_files() {
        assert!(!is_prunable("etcd.snapshot.1700000000", true, 2 * HOUR, HOUR));
        assert!(!is_prunable("member.log", false, 2 * HOUR, HOUR));
        assert!(!is_prunable("etcd.snapshotter", false, 2 * HOUR, HOUR));
    }

    #[test]
    fn counter_suffixed_collision_names_still_qualify() {
        assert!(is_prunable("etcd.snapshot.1700000000.1", false, 2 * HOUR, HOUR));
    }

    #[test]
    fn age_equal_to_horizon_is_kept() {
        assert!(!is_prunable("etcd.snapshot.1700000000", false, HOUR, HOUR));
    }
}
