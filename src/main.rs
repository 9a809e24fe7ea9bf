use anyhow::{Context as _, Result};
use clap::Parser as _;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use e2d::{
    config::{Command, Config},
    snapshot::{new_snapshotter, parse_backup_url},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::parse();
    let url = parse_backup_url(&cfg.snapshot_backup_url)
        .with_context(|| format!("invalid backup url: {:?}", cfg.snapshot_backup_url))?;
    let snapshotter = new_snapshotter(&url, &cfg.snapshot_opts())
        .await
        .context("cannot initialize snapshot backend")?;

    match cfg.command {
        Command::Check => {
            info!(url = %url, "snapshot backend is reachable");
        }
        Command::Save => {
            let stdin = tokio::io::stdin();
            snapshotter.save(Box::new(stdin)).await?;
            info!(url = %url, "snapshot saved");
        }
        Command::Load => {
            let mut image = snapshotter.load().await?;
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut image, &mut stdout)
                .await
                .context("cannot write snapshot to stdout")?;
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}
