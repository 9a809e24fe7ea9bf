//! End-to-end save/load against an in-process blob store speaking the Azure
//! data-plane surface the backend uses.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, head},
};
use e2d::snapshot::{
    AzureConfig, AzureSnapshotter, LatestPointer, SnapshotError, SnapshotStream, Snapshotter,
};
use tokio::{io::AsyncReadExt as _, sync::oneshot, task::JoinHandle};

#[derive(Default)]
struct MockBlobs {
    blobs: BTreeMap<String, Vec<u8>>,
    blocks: HashMap<String, BTreeMap<String, Vec<u8>>>,
    /// When set, the first un-ranged snapshot download is cut off mid-body.
    flaky_snapshot_get: bool,
    snapshot_gets: u32,
}

type SharedBlobs = Arc<Mutex<MockBlobs>>;

fn router(blobs: SharedBlobs) -> Router {
    Router::new()
        .route("/{container}", head(head_container))
        .route("/{container}/{*blob}", get(get_blob).put(put_blob))
        .with_state(blobs)
}

async fn head_container(Path(container): Path<String>) -> StatusCode {
    match container.as_str() {
        "missing" => StatusCode::NOT_FOUND,
        "locked" => StatusCode::FORBIDDEN,
        _ => StatusCode::OK,
    }
}

async fn put_blob(
    State(blobs): State<SharedBlobs>,
    Path((_container, blob)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> StatusCode {
    let mut blobs = blobs.lock().unwrap();
    match params.get("comp").map(String::as_str) {
        Some("block") => {
            let block_id = params.get("blockid").unwrap().clone();
            blobs
                .blocks
                .entry(blob)
                .or_default()
                .insert(block_id, body.to_vec());
            StatusCode::CREATED
        }
        Some("blocklist") => {
            let list = String::from_utf8(body.to_vec()).unwrap();
            let staged = blobs.blocks.remove(&blob).unwrap_or_default();
            let mut assembled = Vec::new();
            for id in block_ids_in_order(&list) {
                assembled.extend_from_slice(&staged[&id]);
            }
            blobs.blobs.insert(blob, assembled);
            StatusCode::CREATED
        }
        _ => {
            blobs.blobs.insert(blob, body.to_vec());
            StatusCode::CREATED
        }
    }
}

fn block_ids_in_order(list: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut rest = list;
    while let Some(start) = rest.find("<Latest>") {
        rest = &rest[start + "<Latest>".len()..];
        let end = rest.find("</Latest>").unwrap();
        ids.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    ids
}

async fn get_blob(
    State(blobs): State<SharedBlobs>,
    Path((_container, blob)): Path<(String, String)>,
    headers: HeaderMap,
) -> axum::response::Response {
    let mut blobs = blobs.lock().unwrap();
    let Some(data) = blobs.blobs.get(&blob).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.strip_suffix("-"))
        .and_then(|v| v.parse::<usize>().ok());

    let is_snapshot_image =
        blob.starts_with("etcd.snapshot.") && !blob.ends_with("LATEST");
    if is_snapshot_image && range.is_none() {
        blobs.snapshot_gets += 1;
        if blobs.flaky_snapshot_get && blobs.snapshot_gets == 1 {
            // Deliver half the body, then fail the connection mid-stream.
            let half = data[..data.len() / 2].to_vec();
            let stream = futures_util::stream::iter(vec![
                Ok::<Bytes, std::io::Error>(Bytes::from(half)),
                Err(std::io::Error::other("injected mid-stream failure")),
            ]);
            return Body::from_stream(stream).into_response();
        }
    }

    match range {
        Some(offset) if offset <= data.len() => {
            (StatusCode::PARTIAL_CONTENT, data[offset..].to_vec()).into_response()
        }
        Some(_) => StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
        None => (StatusCode::OK, data).into_response(),
    }
}

async fn spawn_mock(app: Router) -> (String, oneshot::Sender<()>, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .unwrap();
    });
    (format!("http://{addr}"), shutdown_tx, join)
}

fn test_config(endpoint: String, container: &str) -> AzureConfig {
    use base64::Engine as _;

    AzureConfig {
        account_name: "devaccount".to_string(),
        account_key: base64::engine::general_purpose::STANDARD.encode(b"devaccount-shared-key"),
        endpoint,
        container: container.to_string(),
        timeout: Duration::from_secs(10),
        retries: 2,
    }
}

fn image(bytes: Vec<u8>) -> SnapshotStream {
    Box::new(std::io::Cursor::new(bytes))
}

async fn read_all(mut stream: SnapshotStream) -> Vec<u8> {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    out
}

#[tokio::test]
async fn remote_round_trip() {
    let blobs = SharedBlobs::default();
    let (endpoint, shutdown, join) = spawn_mock(router(blobs.clone())).await;

    let snapshotter = AzureSnapshotter::new(test_config(endpoint, "snapshots"))
        .await
        .unwrap();
    snapshotter.save(image(b"hello azure".to_vec())).await.unwrap();

    {
        let blobs = blobs.lock().unwrap();
        let pointer = LatestPointer::from_slice(&blobs.blobs["etcd.snapshot.LATEST"]).unwrap();
        assert!(pointer.path.starts_with("etcd.snapshot."));
        assert_eq!(blobs.blobs[&pointer.path], b"hello azure");
        assert_eq!(blobs.blobs.len(), 2, "blobs: {:?}", blobs.blobs.keys());
    }

    assert_eq!(
        read_all(snapshotter.load().await.unwrap()).await,
        b"hello azure"
    );

    let _ = shutdown.send(());
    join.await.unwrap();
}

#[tokio::test]
async fn large_images_upload_as_blocks() {
    let blobs = SharedBlobs::default();
    let (endpoint, shutdown, join) = spawn_mock(router(blobs.clone())).await;

    let snapshotter = AzureSnapshotter::new(test_config(endpoint, "snapshots"))
        .await
        .unwrap();

    // Two blocks at the 8 MiB block size.
    let data: Vec<u8> = (0..9 * 1024 * 1024).map(|i| (i % 253) as u8).collect();
    snapshotter.save(image(data.clone())).await.unwrap();

    {
        let blobs = blobs.lock().unwrap();
        let pointer = LatestPointer::from_slice(&blobs.blobs["etcd.snapshot.LATEST"]).unwrap();
        assert_eq!(blobs.blobs[&pointer.path], data);
        assert!(blobs.blocks.is_empty(), "uncommitted blocks left behind");
    }

    assert_eq!(read_all(snapshotter.load().await.unwrap()).await, data);

    let _ = shutdown.send(());
    join.await.unwrap();
}

#[tokio::test]
async fn download_resumes_after_a_mid_stream_failure() {
    let blobs = SharedBlobs::default();
    let (endpoint, shutdown, join) = spawn_mock(router(blobs.clone())).await;

    let data: Vec<u8> = (0..256 * 1024).map(|i| (i % 241) as u8).collect();
    {
        let mut blobs = blobs.lock().unwrap();
        blobs.blobs.insert("etcd.snapshot.100".to_string(), data.clone());
        let pointer = LatestPointer {
            path: "etcd.snapshot.100".to_string(),
            timestamp: "2023-11-14T22:13:20+0000".to_string(),
        };
        blobs
            .blobs
            .insert("etcd.snapshot.LATEST".to_string(), pointer.to_bytes().unwrap());
        blobs.flaky_snapshot_get = true;
    }

    let snapshotter = AzureSnapshotter::new(test_config(endpoint, "snapshots"))
        .await
        .unwrap();
    assert_eq!(read_all(snapshotter.load().await.unwrap()).await, data);
    assert!(blobs.lock().unwrap().snapshot_gets >= 1);

    let _ = shutdown.send(());
    join.await.unwrap();
}

#[tokio::test]
async fn init_maps_container_probe_statuses() {
    let blobs = SharedBlobs::default();
    let (endpoint, shutdown, join) = spawn_mock(router(blobs.clone())).await;

    let err = AzureSnapshotter::new(test_config(endpoint.clone(), "missing"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, SnapshotError::BucketDoesNotExist { .. }),
        "unexpected error: {err:?}"
    );

    let err = AzureSnapshotter::new(test_config(endpoint, "locked"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, SnapshotError::BucketForbidden { .. }),
        "unexpected error: {err:?}"
    );

    let _ = shutdown.send(());
    join.await.unwrap();
}
