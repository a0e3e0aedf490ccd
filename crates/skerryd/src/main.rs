//! skerryd entry point.
//!
//! Hosts one sandbox [`Runtime`]: recovers every sandbox recorded in the
//! state directory, then keeps the VMs' records in sync until it receives
//! a shutdown signal. Running VMs survive a restart of this process and
//! are reattached on the next start.

use skerry_core::{Runtime, RuntimeConfig};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("skerryd=info".parse()?)
                .add_directive("skerry_core=info".parse()?)
                .add_directive("skerry_vm=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting skerryd");

    let config = RuntimeConfig::from_env();
    tracing::info!(?config, "Configuration loaded");

    // Warn-only so development hosts without a VMM can still start
    config.validate_warn();

    let runtime = Runtime::from_config(config);
    let report = runtime.init().await?;
    tracing::info!(
        reattached = report.reattached,
        restored = report.restored,
        failed = report.failed,
        skipped = report.skipped,
        sandboxes = runtime.list_sandboxes().await.len(),
        "Runtime ready"
    );

    signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, detaching from sandboxes...");

    runtime.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
