use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt as _};

pub mod azure;
pub mod file;
pub mod latest;
pub mod retention;
pub mod s3;
mod sigv4;
pub mod url;

pub use azure::{AzureConfig, AzureSnapshotter};
pub use file::FileSnapshotter;
pub use latest::LatestPointer;
pub use s3::{S3Config, S3Credentials, S3Snapshotter};
pub use url::{BackupUrl, ParseBackupUrlError, parse_backup_url};

pub const SNAPSHOT_FILENAME: &str = "etcd.snapshot";
pub const LATEST_SUFFIX: &str = "LATEST";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Object/file name for a snapshot image produced at the given unix second.
pub fn snapshot_object_name(unix_seconds: i64) -> String {
    format!("{SNAPSHOT_FILENAME}.{unix_seconds}")
}

/// Fixed name of the pointer object referencing the most recent image.
pub fn latest_object_name() -> String {
    format!("{SNAPSHOT_FILENAME}.{LATEST_SUFFIX}")
}

/// A readable snapshot image stream. Ownership transfers across the
/// [`Snapshotter`] boundary: `save` consumes its input, `load` hands the
/// returned stream to the caller.
pub type SnapshotStream = Box<dyn AsyncRead + Send + Unpin>;

/// Persists and retrieves point-in-time database images against one backing
/// store. Callers serialize invocations; implementations are not internally
/// synchronized.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    /// Consumes the stream to completion, durably writes the image under a
    /// timestamped name, then updates the latest pointer to reference it.
    /// The pointer keeps its prior value if the image write fails; a pointer
    /// update failure after a successful write leaves the image behind as an
    /// orphan for retention to reap.
    async fn save(&self, stream: SnapshotStream) -> Result<(), SnapshotError>;

    /// Returns the most recent image, positioned at offset zero.
    async fn load(&self) -> Result<SnapshotStream, SnapshotError>;
}

#[derive(Debug)]
pub enum SnapshotError {
    BucketDoesNotExist { bucket: String },
    BucketForbidden { bucket: String },
    BucketInaccessible { bucket: String, message: String },
    CredentialsMissing { backend: &'static str },
    UploadFailed { object: String, message: String },
    DownloadFailed { object: String, message: String },
    PointerMissing { object: String },
    PointerUnparseable { object: String, message: String },
    RetentionFailed { message: String },
    DeadlineExceeded { object: String },
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BucketDoesNotExist { bucket } => write!(f, "bucket {bucket} does not exist"),
            Self::BucketForbidden { bucket } => write!(f, "access to bucket {bucket} forbidden"),
            Self::BucketInaccessible { bucket, message } => {
                write!(f, "bucket {bucket} could not be accessed: {message}")
            }
            Self::CredentialsMissing { backend } => {
                write!(f, "credentials for the {backend} backend are not configured")
            }
            Self::UploadFailed { object, message } => {
                write!(f, "cannot upload {object}: {message}")
            }
            Self::DownloadFailed { object, message } => {
                write!(f, "cannot download {object}: {message}")
            }
            Self::PointerMissing { object } => {
                write!(f, "latest pointer {object} does not exist")
            }
            Self::PointerUnparseable { object, message } => {
                write!(f, "cannot parse latest pointer {object}: {message}")
            }
            Self::RetentionFailed { message } => {
                write!(f, "cannot apply retention: {message}")
            }
            Self::DeadlineExceeded { object } => {
                write!(f, "deadline exceeded while transferring {object}")
            }
        }
    }
}

impl std::error::Error for SnapshotError {}

/// Issues filename timestamps that never repeat within an instance's
/// lifetime: a wall clock that stalls or regresses yields the previous
/// second plus one instead of a duplicate name.
#[derive(Debug, Default)]
pub struct TimestampAllocator {
    last: AtomicI64,
}

impl TimestampAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, now_unix: i64) -> i64 {
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = if now_unix > last { now_unix } else { last + 1 };
            match self
                .last
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(observed) => last = observed,
            }
        }
    }

    pub fn next_now(&self) -> i64 {
        self.next(Utc::now().timestamp())
    }
}

/// Backend construction parameters shared across URL schemes. Scheme-specific
/// fields are ignored by the other backends.
#[derive(Debug, Clone)]
pub struct SnapshotOpts {
    /// Per-call deadline for remote save/load operations.
    pub timeout: Duration,
    /// Age horizon for node-managed pruning (local backend). `None` disables.
    pub retention_window: Option<Duration>,
    /// Log prune decisions without deleting anything.
    pub retention_dry_run: bool,
    /// Lifecycle expiration in days for store-managed pruning (S3-family).
    /// Zero disables rule installation.
    pub retention_days: i64,
    pub s3_region: String,
    pub s3_endpoint: Option<String>,
    pub azure_account_name: String,
    pub azure_account_key: String,
    pub azure_retries: u32,
}

impl Default for SnapshotOpts {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retention_window: None,
            retention_dry_run: false,
            retention_days: 0,
            s3_region: "us-east-1".to_string(),
            s3_endpoint: None,
            azure_account_name: String::new(),
            azure_account_key: String::new(),
            azure_retries: 3,
        }
    }
}

/// Constructs the backend selected by a parsed backup URL.
pub async fn new_snapshotter(
    url: &BackupUrl,
    opts: &SnapshotOpts,
) -> Result<Box<dyn Snapshotter>, SnapshotError> {
    match url {
        BackupUrl::File { dir } => Ok(Box::new(FileSnapshotter::new(
            dir,
            opts.retention_window,
            opts.retention_dry_run,
        )?)),
        BackupUrl::S3 { bucket, prefix } => {
            let credentials = S3Credentials::from_env()
                .ok_or(SnapshotError::CredentialsMissing { backend: "s3" })?;
            let cfg = S3Config {
                bucket: bucket.clone(),
                prefix: prefix.clone(),
                region: opts.s3_region.clone(),
                endpoint: opts.s3_endpoint.clone(),
                credentials,
                retention_days: opts.retention_days,
                timeout: opts.timeout,
            };
            Ok(Box::new(S3Snapshotter::new(cfg).await?))
        }
        BackupUrl::Azure {
            account_host,
            container,
        } => {
            if opts.azure_account_name.is_empty() || opts.azure_account_key.is_empty() {
                return Err(SnapshotError::CredentialsMissing { backend: "azure" });
            }
            // Bare storage-account names expand to the public blob endpoint.
            let endpoint = if account_host.contains('.') || account_host.contains(':') {
                format!("https://{account_host}")
            } else {
                format!("https://{account_host}.blob.core.windows.net")
            };
            let cfg = AzureConfig {
                account_name: opts.azure_account_name.clone(),
                account_key: opts.azure_account_key.clone(),
                endpoint,
                container: container.clone(),
                timeout: opts.timeout,
                retries: opts.azure_retries,
            };
            Ok(Box::new(AzureSnapshotter::new(cfg).await?))
        }
    }
}

/// Reads from `r` until `limit` bytes are buffered or the stream ends.
pub(crate) async fn read_up_to<R>(r: &mut R, limit: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(limit.min(64 * 1024));
    let mut chunk = [0u8; 64 * 1024];
    while buf.len() < limit {
        let want = (limit - buf.len()).min(chunk.len());
        let n = r.read(&mut chunk[..want]).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(buf)
}
