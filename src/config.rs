use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};

use crate::snapshot::SnapshotOpts;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "e2d",
    about = "Snapshot backup and restore for managed etcd clusters",
    disable_help_subcommand = true
)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// Where snapshots are stored: file://<dir>/, s3://<bucket>/[<prefix>/],
    /// or azure://<storage-host>/<container>.
    #[arg(long, env = "E2D_SNAPSHOT_BACKUP_URL", value_name = "URL")]
    pub snapshot_backup_url: String,

    #[arg(
        long,
        env = "E2D_SNAPSHOT_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..=3600)
    )]
    pub snapshot_timeout_secs: u64,

    /// Age horizon in seconds for pruning local snapshots; 0 disables.
    #[arg(
        long,
        env = "E2D_SNAPSHOT_RETENTION_SECS",
        value_name = "SECS",
        default_value_t = 0
    )]
    pub snapshot_retention_secs: u64,

    /// Log retention decisions without deleting anything.
    #[arg(
        long,
        env = "E2D_SNAPSHOT_RETENTION_DRY_RUN",
        value_name = "BOOL",
        default_value_t = false,
        action = ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub snapshot_retention_dry_run: bool,

    /// Lifecycle expiration in days for S3-family stores; 0 disables.
    #[arg(
        long,
        env = "E2D_SNAPSHOT_RETENTION_DAYS",
        value_name = "DAYS",
        default_value_t = 0,
        value_parser = clap::value_parser!(i64).range(0..=3650)
    )]
    pub snapshot_retention_days: i64,

    #[arg(
        long,
        env = "E2D_S3_REGION",
        value_name = "REGION",
        default_value = "us-east-1"
    )]
    pub s3_region: String,

    /// Custom endpoint for S3-compatible object stores.
    #[arg(long, env = "E2D_S3_ENDPOINT", value_name = "URL")]
    pub s3_endpoint: Option<String>,

    #[arg(
        long,
        env = "E2D_AZURE_ACCOUNT_NAME",
        value_name = "NAME",
        default_value = ""
    )]
    pub azure_account_name: String,

    #[arg(
        long,
        env = "E2D_AZURE_ACCOUNT_KEY",
        value_name = "KEY",
        default_value = "",
        hide_env_values = true
    )]
    pub azure_account_key: String,

    #[arg(
        long,
        env = "E2D_AZURE_RETRIES",
        value_name = "COUNT",
        default_value_t = 3,
        value_parser = clap::value_parser!(u32).range(0..=10)
    )]
    pub azure_retries: u32,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Read a snapshot image from stdin and persist it to the backup store.
    Save,
    /// Write the most recent snapshot image to stdout.
    Load,
    /// Validate the backup URL and backend reachability, then exit.
    Check,
}

impl Config {
    pub fn snapshot_opts(&self) -> SnapshotOpts {
        SnapshotOpts {
            timeout: Duration::from_secs(self.snapshot_timeout_secs),
            retention_window: (self.snapshot_retention_secs > 0)
                .then(|| Duration::from_secs(self.snapshot_retention_secs)),
            retention_dry_run: self.snapshot_retention_dry_run,
            retention_days: self.snapshot_retention_days,
            s3_region: self.s3_region.clone(),
            s3_endpoint: self.s3_endpoint.clone(),
            azure_account_name: self.azure_account_name.clone(),
            azure_account_key: self.azure_account_key.clone(),
            azure_retries: self.azure_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_flags_absent() {
        let cfg = Config::try_parse_from([
            "e2d",
            "--snapshot-backup-url",
            "file:///var/lib/backups/",
            "check",
        ])
        .unwrap();
        assert_eq!(cfg.snapshot_timeout_secs, 60);
        assert_eq!(cfg.snapshot_retention_secs, 0);
        assert_eq!(cfg.snapshot_retention_days, 0);
        assert!(!cfg.snapshot_retention_dry_run);
        assert_eq!(cfg.azure_retries, 3);
    }

    #[test]
    fn rejects_out_of_range_timeout() {
        let err = Config::try_parse_from([
            "e2d",
            "--snapshot-backup-url",
            "file:///var/lib/backups/",
            "--snapshot-timeout-secs",
            "0",
            "check",
        ])
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--snapshot-timeout-secs"));
        assert!(msg.contains("1..=3600"));
    }

    #[test]
    fn parses_retention_dry_run_as_bool_value() {
        let cfg = Config::try_parse_from([
            "e2d",
            "--snapshot-backup-url",
            "file:///var/lib/backups/",
            "--snapshot-retention-dry-run",
            "true",
            "check",
        ])
        .unwrap();
        assert!(cfg.snapshot_retention_dry_run);
    }

    #[test]
    fn retention_window_is_disabled_at_zero() {
        let cfg = Config::try_parse_from([
            "e2d",
            "--snapshot-backup-url",
            "file:///var/lib/backups/",
            "check",
        ])
        .unwrap();
        assert!(cfg.snapshot_opts().retention_window.is_none());
    }
}
