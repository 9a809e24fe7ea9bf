use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use futures_util::StreamExt as _;
use reqwest::{
    StatusCode,
    header::{CONTENT_TYPE, ETAG},
};
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncSeekExt as _, AsyncWriteExt as _};
use tracing::{debug, info, warn};

use super::{
    LatestPointer, SnapshotError, SnapshotStream, Snapshotter, TimestampAllocator,
    latest_object_name, read_up_to,
    sigv4::{EMPTY_PAYLOAD_SHA256, Signer, hex_sha256},
    snapshot_object_name,
};

/// Parts at or above this size switch the image upload to multipart.
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Static credentials for SigV4 signing, resolved from the standard AWS
/// environment at the configuration boundary.
#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl S3Credentials {
    pub fn from_env() -> Option<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .ok()
            .filter(|v| !v.is_empty())?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .ok()
            .filter(|v| !v.is_empty())?;
        let session_token = std::env::var("AWS_SESSION_TOKEN")
            .ok()
            .filter(|v| !v.is_empty());
        Some(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// Configuration for snapshot storage in an S3-compatible object store.
#[derive(Clone)]
pub struct S3Config {
    pub bucket: String,
    /// Key prefix under the bucket; empty, or directory-like ending in `/`.
    pub prefix: String,
    pub region: String,
    /// Overrides the regional AWS endpoint, for S3-compatible stores.
    pub endpoint: Option<String>,
    pub credentials: S3Credentials,
    /// When positive, a lifecycle rule expiring objects under the prefix
    /// after this many days is installed at startup.
    pub retention_days: i64,
    /// Per-call deadline for save and load.
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct S3Snapshotter {
    client: S3Client,
    prefix: String,
    timeout: Duration,
    clock: TimestampAllocator,
}

impl S3Snapshotter {
    pub async fn new(cfg: S3Config) -> Result<Self, SnapshotError> {
        let endpoint = cfg
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", cfg.region));
        let client = S3Client {
            http: reqwest::Client::builder()
                .user_agent("e2d")
                .build()
                .expect("reqwest client"),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: cfg.bucket.clone(),
            signer: Signer::new(
                cfg.credentials.access_key_id.clone(),
                cfg.credentials.secret_access_key.clone(),
                cfg.credentials.session_token.clone(),
                cfg.region.clone(),
            ),
        };

        client.head_bucket().await?;

        if cfg.retention_days > 0 {
            if cfg.retention_days < 2 {
                warn!(
                    days = cfg.retention_days,
                    "lifecycle horizon is shorter than two days; snapshots may expire between saves"
                );
            }
            client
                .put_bucket_lifecycle(&cfg.prefix, cfg.retention_days)
                .await?;
            info!(
                bucket = %cfg.bucket,
                days = cfg.retention_days,
                "installed lifecycle expiration rule"
            );
        }

        Ok(Self {
            client,
            prefix: cfg.prefix,
            timeout: cfg.timeout,
            clock: TimestampAllocator::new(),
        })
    }

    async fn upload_multipart(
        &self,
        key: &str,
        first: Vec<u8>,
        stream: &mut SnapshotStream,
    ) -> Result<(), SnapshotError> {
        let upload_id = self.client.create_multipart_upload(key).await?;
        let result = self.upload_parts(key, &upload_id, first, stream).await;
        if result.is_err() {
            if let Err(err) = self.client.abort_multipart_upload(key, &upload_id).await {
                warn!(key = %key, error = %err, "unable to abort interrupted multipart upload");
            }
        }
        result
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        stream: &mut SnapshotStream,
    ) -> Result<(), SnapshotError> {
        let mut parts = Vec::new();
        let mut part_number = 1u32;
        let mut buf = first;
        let mut total = 0u64;
        while !buf.is_empty() {
            total += buf.len() as u64;
            let etag = self
                .client
                .upload_part(key, upload_id, part_number, buf)
                .await?;
            parts.push((part_number, etag));
            part_number += 1;
            buf = read_up_to(stream, PART_SIZE)
                .await
                .map_err(|err| SnapshotError::UploadFailed {
                    object: key.to_string(),
                    message: err.to_string(),
                })?;
        }
        self.client
            .complete_multipart_upload(key, upload_id, &parts)
            .await?;
        debug!(key = %key, parts = parts.len(), bytes = total, "completed multipart snapshot upload");
        Ok(())
    }
}

#[async_trait]
impl Snapshotter for S3Snapshotter {
    async fn save(&self, mut stream: SnapshotStream) -> Result<(), SnapshotError> {
        let produced = self.clock.next_now();
        let produced_at = DateTime::from_timestamp(produced, 0).expect("valid unix timestamp");
        let key = format!("{}{}", self.prefix, snapshot_object_name(produced));
        let latest_key = format!("{}{}", self.prefix, latest_object_name());

        let upload = async {
            let first =
                read_up_to(&mut stream, PART_SIZE)
                    .await
                    .map_err(|err| SnapshotError::UploadFailed {
                        object: key.clone(),
                        message: err.to_string(),
                    })?;
            if first.len() < PART_SIZE {
                let bytes = first.len();
                self.client.put_object(&key, first).await?;
                debug!(key = %key, bytes, "uploaded snapshot object");
            } else {
                self.upload_multipart(&key, first, &mut stream).await?;
            }

            let pointer = LatestPointer::new(key.clone(), produced_at);
            let body = pointer
                .to_bytes()
                .map_err(|err| SnapshotError::UploadFailed {
                    object: latest_key.clone(),
                    message: err.to_string(),
                })?;
            self.client.put_object(&latest_key, body).await?;
            info!(path = %key, "updated latest snapshot pointer");
            Ok(())
        };
        match tokio::time::timeout(self.timeout, upload).await {
            Ok(result) => result,
            Err(_) => Err(SnapshotError::DeadlineExceeded { object: key }),
        }
    }

    async fn load(&self) -> Result<SnapshotStream, SnapshotError> {
        let latest_key = format!("{}{}", self.prefix, latest_object_name());

        let download = async {
            let resp = self.client.get_object(&latest_key).await?.ok_or_else(|| {
                SnapshotError::PointerMissing {
                    object: latest_key.clone(),
                }
            })?;
            let bytes = resp
                .bytes()
                .await
                .map_err(|err| SnapshotError::DownloadFailed {
                    object: latest_key.clone(),
                    message: err.to_string(),
                })?;
            let pointer = LatestPointer::from_slice(&bytes).map_err(|err| {
                SnapshotError::PointerUnparseable {
                    object: latest_key.clone(),
                    message: err.to_string(),
                }
            })?;
            debug!(path = %pointer.path, timestamp = %pointer.timestamp, "resolved latest snapshot pointer");

            let resp = self.client.get_object(&pointer.path).await?.ok_or_else(|| {
                SnapshotError::DownloadFailed {
                    object: pointer.path.clone(),
                    message: "object does not exist".to_string(),
                }
            })?;
            let spool_err = |err: String| SnapshotError::DownloadFailed {
                object: pointer.path.clone(),
                message: err,
            };
            let tmp = tempfile::tempfile()
                .map_err(|err| spool_err(format!("cannot create temporary file: {err}")))?;
            let mut file = tokio::fs::File::from_std(tmp);
            let mut body = resp.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|err| spool_err(err.to_string()))?;
                file.write_all(&chunk)
                    .await
                    .map_err(|err| spool_err(format!("cannot spool to temporary file: {err}")))?;
            }
            file.seek(std::io::SeekFrom::Start(0))
                .await
                .map_err(|err| spool_err(err.to_string()))?;
            Ok(Box::new(file) as SnapshotStream)
        };
        match tokio::time::timeout(self.timeout, download).await {
            Ok(result) => result,
            Err(_) => Err(SnapshotError::DeadlineExceeded { object: latest_key }),
        }
    }
}

#[derive(Debug)]
struct S3Client {
    http: reqwest::Client,
    endpoint: String,
    bucket: String,
    signer: Signer,
}

impl S3Client {
    fn bucket_url(&self) -> String {
        format!("{}/{}", self.endpoint, self.bucket)
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{key}", self.endpoint, self.bucket)
    }

    async fn head_bucket(&self) -> Result<(), SnapshotError> {
        let inaccessible = |message: String| SnapshotError::BucketInaccessible {
            bucket: self.bucket.clone(),
            message,
        };
        let mut req = self
            .http
            .head(self.bucket_url())
            .build()
            .map_err(|err| inaccessible(err.to_string()))?;
        self.signer.sign(&mut req, Utc::now(), EMPTY_PAYLOAD_SHA256);
        let resp = self
            .http
            .execute(req)
            .await
            .map_err(|err| inaccessible(err.to_string()))?;
        match resp.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(SnapshotError::BucketDoesNotExist {
                bucket: self.bucket.clone(),
            }),
            StatusCode::FORBIDDEN => Err(SnapshotError::BucketForbidden {
                bucket: self.bucket.clone(),
            }),
            status => Err(inaccessible(format!("unexpected status {status}"))),
        }
    }

    async fn put_bucket_lifecycle(&self, prefix: &str, days: i64) -> Result<(), SnapshotError> {
        let retention_err = |message: String| SnapshotError::RetentionFailed {
            message: format!(
                "unable to install lifecycle rule on bucket {}: {message}",
                self.bucket
            ),
        };
        let xml = format!(
            "<LifecycleConfiguration>\
             <Rule>\
             <ID>E2DLifecycle-{prefix}</ID>\
             <Filter><Prefix>{prefix}</Prefix></Filter>\
             <Status>Enabled</Status>\
             <Expiration><Days>{days}</Days></Expiration>\
             <AbortIncompleteMultipartUpload><DaysAfterInitiation>{days}</DaysAfterInitiation></AbortIncompleteMultipartUpload>\
             </Rule>\
             </LifecycleConfiguration>"
        );
        let payload_hash = hex_sha256(xml.as_bytes());
        let checksum = STANDARD.encode(Sha256::digest(xml.as_bytes()));
        let mut req = self
            .http
            .put(self.bucket_url())
            .query(&[("lifecycle", "")])
            .header(CONTENT_TYPE, "application/xml")
            .header("x-amz-sdk-checksum-algorithm", "SHA256")
            .header("x-amz-checksum-sha256", checksum)
            .body(xml)
            .build()
            .map_err(|err| retention_err(err.to_string()))?;
        self.signer.sign(&mut req, Utc::now(), &payload_hash);
        let resp = self
            .http
            .execute(req)
            .await
            .map_err(|err| retention_err(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(retention_err(format!("unexpected status {}", resp.status())));
        }
        Ok(())
    }

    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<(), SnapshotError> {
        let upload_err = |message: String| SnapshotError::UploadFailed {
            object: key.to_string(),
            message,
        };
        let payload_hash = hex_sha256(&body);
        let mut req = self
            .http
            .put(self.object_url(key))
            .body(body)
            .build()
            .map_err(|err| upload_err(err.to_string()))?;
        self.signer.sign(&mut req, Utc::now(), &payload_hash);
        let resp = self
            .http
            .execute(req)
            .await
            .map_err(|err| upload_err(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(upload_err(format!("unexpected status {}", resp.status())));
        }
        Ok(())
    }

    /// `Ok(None)` means the object does not exist; other failures are errors.
    async fn get_object(&self, key: &str) -> Result<Option<reqwest::Response>, SnapshotError> {
        let download_err = |message: String| SnapshotError::DownloadFailed {
            object: key.to_string(),
            message,
        };
        let mut req = self
            .http
            .get(self.object_url(key))
            .build()
            .map_err(|err| download_err(err.to_string()))?;
        self.signer.sign(&mut req, Utc::now(), EMPTY_PAYLOAD_SHA256);
        let resp = self
            .http
            .execute(req)
            .await
            .map_err(|err| download_err(err.to_string()))?;
        match resp.status() {
            status if status.is_success() => Ok(Some(resp)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(download_err(format!("unexpected status {status}"))),
        }
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String, SnapshotError> {
        let upload_err = |message: String| SnapshotError::UploadFailed {
            object: key.to_string(),
            message,
        };
        let mut req = self
            .http
            .post(self.object_url(key))
            .query(&[("uploads", "")])
            .build()
            .map_err(|err| upload_err(err.to_string()))?;
        self.signer.sign(&mut req, Utc::now(), EMPTY_PAYLOAD_SHA256);
        let resp = self
            .http
            .execute(req)
            .await
            .map_err(|err| upload_err(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(upload_err(format!("unexpected status {}", resp.status())));
        }
        let body = resp
            .text()
            .await
            .map_err(|err| upload_err(err.to_string()))?;
        xml_text(&body, "UploadId")
            .map(str::to_string)
            .ok_or_else(|| upload_err("response is missing an UploadId".to_string()))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Vec<u8>,
    ) -> Result<String, SnapshotError> {
        let upload_err = |message: String| SnapshotError::UploadFailed {
            object: key.to_string(),
            message,
        };
        let payload_hash = hex_sha256(&body);
        let mut req = self
            .http
            .put(self.object_url(key))
            .query(&[
                ("partNumber", part_number.to_string().as_str()),
                ("uploadId", upload_id),
            ])
            .body(body)
            .build()
            .map_err(|err| upload_err(err.to_string()))?;
        self.signer.sign(&mut req, Utc::now(), &payload_hash);
        let resp = self
            .http
            .execute(req)
            .await
            .map_err(|err| upload_err(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(upload_err(format!(
                "unexpected status {} for part {part_number}",
                resp.status()
            )));
        }
        let etag = resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| upload_err(format!("response for part {part_number} is missing an ETag")))?;
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> Result<(), SnapshotError> {
        let upload_err = |message: String| SnapshotError::UploadFailed {
            object: key.to_string(),
            message,
        };
        let mut xml = String::from("<CompleteMultipartUpload>");
        for (part_number, etag) in parts {
            xml.push_str(&format!(
                "<Part><PartNumber>{part_number}</PartNumber><ETag>{etag}</ETag></Part>"
            ));
        }
        xml.push_str("</CompleteMultipartUpload>");
        let payload_hash = hex_sha256(xml.as_bytes());
        let mut req = self
            .http
            .post(self.object_url(key))
            .query(&[("uploadId", upload_id)])
            .header(CONTENT_TYPE, "application/xml")
            .body(xml)
            .build()
            .map_err(|err| upload_err(err.to_string()))?;
        self.signer.sign(&mut req, Utc::now(), &payload_hash);
        let resp = self
            .http
            .execute(req)
            .await
            .map_err(|err| upload_err(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(upload_err(format!("unexpected status {}", resp.status())));
        }
        // A complete call can fail with a 200 carrying an error document.
        let body = resp
            .text()
            .await
            .map_err(|err| upload_err(err.to_string()))?;
        if body.contains("<Error>") {
            return Err(upload_err(
                xml_text(&body, "Code").unwrap_or("unknown error").to_string(),
            ));
        }
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), SnapshotError> {
        let upload_err = |message: String| SnapshotError::UploadFailed {
            object: key.to_string(),
            message,
        };
        let mut req = self
            .http
            .delete(self.object_url(key))
            .query(&[("uploadId", upload_id)])
            .build()
            .map_err(|err| upload_err(err.to_string()))?;
        self.signer.sign(&mut req, Utc::now(), EMPTY_PAYLOAD_SHA256);
        let resp = self
            .http
            .execute(req)
            .await
            .map_err(|err| upload_err(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(upload_err(format!("unexpected status {}", resp.status())));
        }
        Ok(())
    }
}

fn xml_text<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn extracts_text_between_tags() {
        let body = "<InitiateMultipartUploadResult><Bucket>b</Bucket>\
                    <UploadId> abc123 </UploadId></InitiateMultipartUploadResult>";
        assert_eq!(xml_text(body, "UploadId"), Some("abc123"));
        assert_eq!(xml_text(body, "Bucket"), Some("b"));
        assert_eq!(xml_text(body, "Key"), None);
    }
}
