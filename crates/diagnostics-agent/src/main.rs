//! OBD-II Diagnostics Agent - Main Entry Point

use anyhow::Context;
use diagnostics_agent::{init_logging, run, Settings};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;

    info!("=== OBD-II Diagnostics Agent v{} ===", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let settings = Settings::load(config_path.as_deref()).context("failed to load settings")?;
    let print_metrics = settings.print_metrics;

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let summary = run(settings).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if print_metrics {
        println!("{}", metrics.render());
    }

    Ok(())
}
