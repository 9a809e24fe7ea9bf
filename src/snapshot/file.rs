use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{
    LATEST_SUFFIX, SnapshotError, SnapshotStream, Snapshotter, TimestampAllocator,
    latest_object_name, retention::is_prunable, snapshot_object_name,
};

/// Stores snapshot images as regular files in one directory, with a symlink
/// named `etcd.snapshot.LATEST` marking the most recent image.
#[derive(Debug)]
pub struct FileSnapshotter {
    dir: PathBuf,
    retention: Option<Duration>,
    retention_dry_run: bool,
    clock: TimestampAllocator,
}

impl FileSnapshotter {
    pub fn new(
        dir: &Path,
        retention: Option<Duration>,
        retention_dry_run: bool,
    ) -> Result<Self, SnapshotError> {
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt as _;
            builder.mode(0o700);
        }
        builder.create(dir).map_err(|err| SnapshotError::UploadFailed {
            object: dir.display().to_string(),
            message: format!("cannot create snapshot directory: {err}"),
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            retention,
            retention_dry_run,
            clock: TimestampAllocator::new(),
        })
    }

    /// Opens a fresh image file, appending a counter to the name when a
    /// regressed clock re-produces a timestamp already on disk.
    async fn create_image_file(
        &self,
        produced: i64,
    ) -> Result<(String, tokio::fs::File), SnapshotError> {
        let base = snapshot_object_name(produced);
        let mut name = base.clone();
        let mut counter = 0u32;
        loop {
            let path = self.dir.join(&name);
            let mut opts = tokio::fs::OpenOptions::new();
            opts.write(true).create_new(true);
            #[cfg(unix)]
            opts.mode(0o600);
            match opts.open(&path).await {
                Ok(file) => return Ok((name, file)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    counter += 1;
                    name = format!("{base}.{counter}");
                }
                Err(err) => {
                    return Err(SnapshotError::UploadFailed {
                        object: path.display().to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    /// Points `etcd.snapshot.LATEST` at `file_name` by linking a side name
    /// and renaming it over the pointer, so readers always observe either the
    /// old target or the new one.
    async fn replace_pointer(&self, file_name: &str) -> Result<(), SnapshotError> {
        let latest = self.dir.join(latest_object_name());
        let latest_display = latest.display().to_string();
        let side = self.dir.join(format!("{}.{LATEST_SUFFIX}.tmp", super::SNAPSHOT_FILENAME));
        let target = PathBuf::from(file_name);
        let result = tokio::task::spawn_blocking(move || {
            let _ = std::fs::remove_file(&side);
            std::os::unix::fs::symlink(&target, &side)?;
            std::fs::rename(&side, &latest)
        })
        .await
        .expect("spawn_blocking replace_pointer");
        result.map_err(|err| SnapshotError::UploadFailed {
            object: latest_display,
            message: format!("cannot update latest pointer: {err}"),
        })
    }

    async fn prune_aged(&self, horizon: Duration) -> Result<(), SnapshotError> {
        let list_err = |err: std::io::Error| SnapshotError::RetentionFailed {
            message: format!(
                "unable to list snapshot directory {}: {err}",
                self.dir.display()
            ),
        };
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(list_err)?;
        let now = SystemTime::now();
        while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = match entry.file_type().await {
                Ok(ft) => ft,
                Err(err) => {
                    warn!(file = %name, error = %err, "skipping unreadable directory entry");
                    continue;
                }
            };
            if file_type.is_symlink() || !file_type.is_file() {
                continue;
            }
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(err) => {
                    warn!(file = %name, error = %err, "skipping entry without modification time");
                    continue;
                }
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if !is_prunable(&name, file_type.is_symlink(), age, horizon) {
                continue;
            }
            if self.retention_dry_run {
                info!(file = %name, age_secs = age.as_secs(), "retention dry run, keeping aged snapshot");
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => info!(file = %name, age_secs = age.as_secs(), "deleted aged snapshot"),
                Err(err) => warn!(file = %name, error = %err, "unable to delete aged snapshot"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Snapshotter for FileSnapshotter {
    async fn save(&self, mut stream: SnapshotStream) -> Result<(), SnapshotError> {
        let produced = self.clock.next_now();
        let (file_name, mut file) = self.create_image_file(produced).await?;
        let path = self.dir.join(&file_name);
        let object = path.display().to_string();

        let copied = tokio::io::copy(&mut stream, &mut file)
            .await
            .map_err(|err| SnapshotError::UploadFailed {
                object: object.clone(),
                message: err.to_string(),
            })?;
        file.sync_all()
            .await
            .map_err(|err| SnapshotError::UploadFailed {
                object: object.clone(),
                message: err.to_string(),
            })?;
        drop(file);
        debug!(file = %object, bytes = copied, "wrote snapshot image");

        self.replace_pointer(&file_name).await?;
        info!(target = %file_name, "updated latest snapshot pointer");

        if let Some(horizon) = self.retention {
            self.prune_aged(horizon).await?;
        }
        Ok(())
    }

    async fn load(&self) -> Result<SnapshotStream, SnapshotError> {
        let latest = self.dir.join(latest_object_name());
        match tokio::fs::File::open(&latest).await {
            Ok(file) => Ok(Box::new(file)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(SnapshotError::PointerMissing {
                object: latest.display().to_string(),
            }),
            Err(err) => Err(SnapshotError::DownloadFailed {
                object: latest.display().to_string(),
                message: err.to_string(),
            }),
        }
    }
}
