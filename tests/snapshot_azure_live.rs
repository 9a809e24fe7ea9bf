//! Round trip against a real Azure storage account. Runs only when the
//! E2D_AZURE_* environment variables are present; skips otherwise so CI
//! without cloud credentials stays green.

use std::time::Duration;

use e2d::snapshot::{AzureConfig, AzureSnapshotter, Snapshotter};
use tokio::io::AsyncReadExt as _;

fn config_from_env() -> Option<AzureConfig> {
    let get = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
    Some(AzureConfig {
        account_name: get("E2D_AZURE_ACCOUNT_NAME")?,
        account_key: get("E2D_AZURE_ACCOUNT_KEY")?,
        endpoint: format!(
            "https://{}.blob.core.windows.net",
            get("E2D_AZURE_STORAGE_ACCOUNT")?
        ),
        container: get("E2D_AZURE_CONTAINER_NAME")?,
        timeout: Duration::from_secs(60),
        retries: 3,
    })
}

#[tokio::test]
async fn azure_round_trip_against_a_real_account() {
    let Some(cfg) = config_from_env() else {
        eprintln!("skipping: E2D_AZURE_* environment variables are not set");
        return;
    };

    let payload = format!("snapshot-{}", chrono::Utc::now().to_rfc3339()).into_bytes();
    let snapshotter = AzureSnapshotter::new(cfg).await.unwrap();
    snapshotter
        .save(Box::new(std::io::Cursor::new(payload.clone())))
        .await
        .unwrap();

    let mut out = Vec::new();
    snapshotter
        .load()
        .await
        .unwrap()
        .read_to_end(&mut out)
        .await
        .unwrap();
    assert_eq!(out, payload);
}
