use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{StreamExt as _, stream::BoxStream};
use hmac::{Hmac, Mac as _};
use reqwest::{
    StatusCode, Url,
    header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue, RANGE},
};
use sha2::Sha256;
use tokio::io::{AsyncSeekExt as _, AsyncWriteExt as _};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use super::{
    LatestPointer, SnapshotError, SnapshotStream, Snapshotter, TimestampAllocator,
    latest_object_name, read_up_to, snapshot_object_name,
};

type HmacSha256 = Hmac<Sha256>;

const BLOB_SERVICE_VERSION: &str = "2021-08-06";

/// Uploads at or below this size go out as a single Put Blob; larger images
/// are staged as blocks and committed with a block list.
const BLOCK_SIZE: usize = 8 * 1024 * 1024;

/// Configuration for snapshot storage in an Azure Blob container.
#[derive(Clone)]
pub struct AzureConfig {
    /// Account used for shared-key authorization.
    pub account_name: String,
    /// Base64-encoded shared key for the account.
    pub account_key: String,
    /// Blob service endpoint, e.g. `https://myaccount.blob.core.windows.net`.
    pub endpoint: String,
    /// Container holding the snapshots.
    pub container: String,
    /// Per-call deadline for save and load.
    pub timeout: Duration,
    /// Bounded retries for uploads and for resuming interrupted downloads.
    pub retries: u32,
}

#[derive(Debug)]
pub struct AzureSnapshotter {
    client: Arc<AzureClient>,
    timeout: Duration,
    retries: u32,
    clock: TimestampAllocator,
}

impl AzureSnapshotter {
    pub async fn new(cfg: AzureConfig) -> Result<Self, SnapshotError> {
        let key = STANDARD.decode(cfg.account_key.as_bytes()).map_err(|_| {
            SnapshotError::BucketInaccessible {
                bucket: cfg.container.clone(),
                message: "account key is not valid base64".to_string(),
            }
        })?;
        let endpoint = cfg.endpoint.trim_end_matches('/').to_string();
        Url::parse(&endpoint).map_err(|err| SnapshotError::BucketInaccessible {
            bucket: cfg.container.clone(),
            message: format!("invalid endpoint: {err}"),
        })?;

        let client = Arc::new(AzureClient {
            http: reqwest::Client::builder()
                .user_agent("e2d")
                .build()
                .expect("reqwest client"),
            endpoint,
            account: cfg.account_name,
            key,
            container: cfg.container,
        });
        client.check_container().await?;

        Ok(Self {
            client,
            timeout: cfg.timeout,
            retries: cfg.retries,
            clock: TimestampAllocator::new(),
        })
    }

    async fn put_blob_with_retry(&self, blob: &str, body: &[u8]) -> Result<(), SnapshotError> {
        let mut attempt = 0;
        loop {
            match self.client.put_blob(blob, body.to_vec()).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    warn!(blob = %blob, attempt, error = %err, "retrying blob upload");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn put_block_with_retry(
        &self,
        blob: &str,
        block_id: &str,
        body: &[u8],
    ) -> Result<(), SnapshotError> {
        let mut attempt = 0;
        loop {
            match self.client.put_block(blob, block_id, body.to_vec()).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    warn!(blob = %blob, block_id = %block_id, attempt, error = %err, "retrying block upload");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn put_block_list_with_retry(
        &self,
        blob: &str,
        block_ids: &[String],
    ) -> Result<(), SnapshotError> {
        let mut attempt = 0;
        loop {
            match self.client.put_block_list(blob, block_ids).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    warn!(blob = %blob, attempt, error = %err, "retrying block list commit");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl Snapshotter for AzureSnapshotter {
    async fn save(&self, mut stream: SnapshotStream) -> Result<(), SnapshotError> {
        let produced = self.clock.next_now();
        let produced_at = DateTime::from_timestamp(produced, 0).expect("valid unix timestamp");
        let name = snapshot_object_name(produced);
        let latest_name = latest_object_name();

        let upload = async {
            let upload_err = |message: String| SnapshotError::UploadFailed {
                object: name.clone(),
                message,
            };
            // Stage through an unlinked temp file so each request can be
            // retried without re-reading the consumed input stream.
            let tmp = tempfile::tempfile()
                .map_err(|err| upload_err(format!("cannot create temporary file: {err}")))?;
            let mut file = tokio::fs::File::from_std(tmp);
            let staged = tokio::io::copy(&mut stream, &mut file)
                .await
                .map_err(|err| upload_err(format!("cannot stage snapshot: {err}")))?;
            file.flush()
                .await
                .map_err(|err| upload_err(err.to_string()))?;
            file.seek(std::io::SeekFrom::Start(0))
                .await
                .map_err(|err| upload_err(err.to_string()))?;

            if staged <= BLOCK_SIZE as u64 {
                let body = read_up_to(&mut file, BLOCK_SIZE)
                    .await
                    .map_err(|err| upload_err(err.to_string()))?;
                self.put_blob_with_retry(&name, &body).await?;
            } else {
                let mut block_ids = Vec::new();
                let mut index = 0u32;
                loop {
                    let buf = read_up_to(&mut file, BLOCK_SIZE)
                        .await
                        .map_err(|err| upload_err(err.to_string()))?;
                    if buf.is_empty() {
                        break;
                    }
                    // Block ids must share one length; encode a fixed-width
                    // ordinal.
                    let block_id = STANDARD.encode(format!("{index:08}"));
                    self.put_block_with_retry(&name, &block_id, &buf).await?;
                    block_ids.push(block_id);
                    index += 1;
                }
                self.put_block_list_with_retry(&name, &block_ids).await?;
            }
            debug!(blob = %name, bytes = staged, "uploaded snapshot blob");

            let pointer = LatestPointer::new(name.clone(), produced_at);
            let body = pointer.to_bytes().map_err(|err| SnapshotError::UploadFailed {
                object: latest_name.clone(),
                message: err.to_string(),
            })?;
            self.put_blob_with_retry(&latest_name, &body).await?;
            info!(path = %name, "updated latest snapshot pointer");
            Ok(())
        };
        match tokio::time::timeout(self.timeout, upload).await {
            Ok(result) => result,
            Err(_) => Err(SnapshotError::DeadlineExceeded { object: name }),
        }
    }

    async fn load(&self) -> Result<SnapshotStream, SnapshotError> {
        let latest_name = latest_object_name();

        let download = async {
            let resp = self
                .client
                .get_blob(&latest_name, None)
                .await?
                .ok_or_else(|| SnapshotError::PointerMissing {
                    object: latest_name.clone(),
                })?;
            let bytes = resp
                .bytes()
                .await
                .map_err(|err| SnapshotError::DownloadFailed {
                    object: latest_name.clone(),
                    message: err.to_string(),
                })?;
            let pointer = LatestPointer::from_slice(&bytes).map_err(|err| {
                SnapshotError::PointerUnparseable {
                    object: latest_name.clone(),
                    message: err.to_string(),
                }
            })?;
            debug!(path = %pointer.path, timestamp = %pointer.timestamp, "resolved latest snapshot pointer");

            let resp = self
                .client
                .get_blob(&pointer.path, None)
                .await?
                .ok_or_else(|| SnapshotError::DownloadFailed {
                    object: pointer.path.clone(),
                    message: "blob does not exist".to_string(),
                })?;
            let reader =
                retrying_blob_reader(self.client.clone(), pointer.path, resp, self.retries);
            Ok(Box::new(reader) as SnapshotStream)
        };
        match tokio::time::timeout(self.timeout, download).await {
            Ok(result) => result,
            Err(_) => Err(SnapshotError::DeadlineExceeded {
                object: latest_name,
            }),
        }
    }
}

#[derive(Debug)]
struct AzureClient {
    http: reqwest::Client,
    endpoint: String,
    account: String,
    key: Vec<u8>,
    container: String,
}

impl AzureClient {
    fn container_url(&self, query: &[(&str, &str)]) -> Result<Url, String> {
        let mut url = Url::parse(&format!("{}/{}", self.endpoint, self.container))
            .map_err(|err| format!("invalid container url: {err}"))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    fn blob_url(&self, blob: &str, query: &[(&str, &str)]) -> Result<Url, String> {
        let mut url = Url::parse(&format!("{}/{}/{blob}", self.endpoint, self.container))
            .map_err(|err| format!("invalid blob url: {err}"))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    /// Stamps `req` with `x-ms-date`, `x-ms-version` and a shared-key
    /// `authorization` header derived from the canonicalized request.
    fn sign(&self, req: &mut reqwest::Request, now: DateTime<Utc>, content_length: u64) {
        let date = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let headers = req.headers_mut();
        headers.insert(
            "x-ms-date",
            HeaderValue::from_str(&date).expect("valid date header"),
        );
        headers.insert("x-ms-version", HeaderValue::from_static(BLOB_SERVICE_VERSION));

        let mut x_ms: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in req.headers() {
            let name = name.as_str().to_ascii_lowercase();
            if !name.starts_with("x-ms-") {
                continue;
            }
            if let Ok(value) = value.to_str() {
                x_ms.insert(name, value.trim().to_string());
            }
        }
        let canonical_headers: String = x_ms
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect();

        let mut resource = format!("/{}{}", self.account, req.url().path());
        let mut pairs: Vec<(String, String)> = req
            .url()
            .query_pairs()
            .map(|(k, v)| (k.to_lowercase(), v.into_owned()))
            .collect();
        pairs.sort();
        for (k, v) in &pairs {
            resource.push_str(&format!("\n{k}:{v}"));
        }

        // Newer service versions sign an empty Content-Length for empty
        // bodies.
        let content_length = if content_length == 0 {
            String::new()
        } else {
            content_length.to_string()
        };
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let range = req
            .headers()
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let string_to_sign = format!(
            "{verb}\n\n\n{content_length}\n\n{content_type}\n\n\n\n\n\n{range}\n{canonical_headers}{resource}",
            verb = req.method().as_str(),
        );

        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(string_to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());
        let authorization = format!("SharedKey {}:{signature}", self.account);
        req.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&authorization).expect("valid authorization header"),
        );
    }

    async fn check_container(&self) -> Result<(), SnapshotError> {
        let inaccessible = |message: String| SnapshotError::BucketInaccessible {
            bucket: self.container.clone(),
            message,
        };
        let url = self
            .container_url(&[("restype", "container")])
            .map_err(&inaccessible)?;
        let mut req = self
            .http
            .head(url)
            .build()
            .map_err(|err| inaccessible(err.to_string()))?;
        self.sign(&mut req, Utc::now(), 0);
        let resp = self
            .http
            .execute(req)
            .await
            .map_err(|err| inaccessible(err.to_string()))?;
        match resp.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(SnapshotError::BucketDoesNotExist {
                bucket: self.container.clone(),
            }),
            StatusCode::FORBIDDEN => Err(SnapshotError::BucketForbidden {
                bucket: self.container.clone(),
            }),
            status => Err(inaccessible(format!("unexpected status {status}"))),
        }
    }

    async fn put_blob(&self, blob: &str, body: Vec<u8>) -> Result<(), SnapshotError> {
        let upload_err = |message: String| SnapshotError::UploadFailed {
            object: blob.to_string(),
            message,
        };
        let url = self.blob_url(blob, &[]).map_err(&upload_err)?;
        let content_length = body.len() as u64;
        let mut req = self
            .http
            .put(url)
            .header("x-ms-blob-type", "BlockBlob")
            .body(body)
            .build()
            .map_err(|err| upload_err(err.to_string()))?;
        self.sign(&mut req, Utc::now(), content_length);
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

    async fn put_block(
        &self,
        blob: &str,
        block_id: &str,
        body: Vec<u8>,
    ) -> Result<(), SnapshotError> {
        let upload_err = |message: String| SnapshotError::UploadFailed {
            object: blob.to_string(),
            message,
        };
        let url = self
            .blob_url(blob, &[("comp", "block"), ("blockid", block_id)])
            .map_err(&upload_err)?;
        let content_length = body.len() as u64;
        let mut req = self
            .http
            .put(url)
            .body(body)
            .build()
            .map_err(|err| upload_err(err.to_string()))?;
        self.sign(&mut req, Utc::now(), content_length);
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

    async fn put_block_list(&self, blob: &str, block_ids: &[String]) -> Result<(), SnapshotError> {
        let upload_err = |message: String| SnapshotError::UploadFailed {
            object: blob.to_string(),
            message,
        };
        let url = self
            .blob_url(blob, &[("comp", "blocklist")])
            .map_err(&upload_err)?;
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
        for id in block_ids {
            xml.push_str(&format!("<Latest>{id}</Latest>"));
        }
        xml.push_str("</BlockList>");
        let content_length = xml.len() as u64;
        let mut req = self
            .http
            .put(url)
            .body(xml)
            .build()
            .map_err(|err| upload_err(err.to_string()))?;
        self.sign(&mut req, Utc::now(), content_length);
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

    /// `Ok(None)` means the blob does not exist; other failures are errors.
    /// A non-zero `offset` requests the tail of the blob from that byte on.
    async fn get_blob(
        &self,
        blob: &str,
        offset: Option<u64>,
    ) -> Result<Option<reqwest::Response>, SnapshotError> {
        let download_err = |message: String| SnapshotError::DownloadFailed {
            object: blob.to_string(),
            message,
        };
        let url = self.blob_url(blob, &[]).map_err(&download_err)?;
        let mut builder = self.http.get(url);
        if let Some(offset) = offset.filter(|o| *o > 0) {
            builder = builder.header(RANGE, format!("bytes={offset}-"));
        }
        let mut req = builder
            .build()
            .map_err(|err| download_err(err.to_string()))?;
        self.sign(&mut req, Utc::now(), 0);
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
}

struct BlobReadState {
    client: Arc<AzureClient>,
    blob: String,
    offset: u64,
    retries_left: u32,
    body: BoxStream<'static, reqwest::Result<Bytes>>,
}

/// Wraps a streaming blob body so mid-stream failures resume with ranged
/// re-reads, bounded by the configured retry count.
fn retrying_blob_reader(
    client: Arc<AzureClient>,
    blob: String,
    resp: reqwest::Response,
    retries: u32,
) -> impl tokio::io::AsyncRead + Send + Unpin {
    let state = BlobReadState {
        client,
        blob,
        offset: 0,
        retries_left: retries,
        body: resp.bytes_stream().boxed(),
    };
    let stream = futures_util::stream::try_unfold(state, |mut st| async move {
        loop {
            match st.body.next().await {
                Some(Ok(chunk)) => {
                    st.offset += chunk.len() as u64;
                    return Ok(Some((chunk, st)));
                }
                Some(Err(err)) if st.retries_left > 0 => {
                    st.retries_left -= 1;
                    warn!(blob = %st.blob, offset = st.offset, error = %err, "resuming interrupted blob download");
                    match st.client.get_blob(&st.blob, Some(st.offset)).await {
                        Ok(Some(resp)) => st.body = resp.bytes_stream().boxed(),
                        Ok(None) => {
                            return Err(std::io::Error::new(
                                std::io::ErrorKind::NotFound,
                                "blob disappeared during download",
                            ));
                        }
                        Err(err) => return Err(std::io::Error::other(err)),
                    }
                }
                Some(Err(err)) => return Err(std::io::Error::other(err)),
                None => return Ok(None),
            }
        }
    });
    StreamReader::new(stream.boxed())
}
