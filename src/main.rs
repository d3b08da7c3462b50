use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use i8080_cpm::config::Config;
use i8080_cpm::server::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .init();

    let config = Config::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "starting 8080 CP/M emulator");
    info!(
        drives = config.drives,
        max_cycles = config.max_cycles,
        max_cycles_ceiling = config.max_cycles_ceiling,
        timeout_secs = config.session_timeout_secs,
        "session settings"
    );
    if let Some(root) = &config.disk_root {
        info!(path = %root.display(), "drives backed by host directory");
    }

    run_server(config).await
}
