//! `serve-metrics` subcommand: run the Prometheus/pprof endpoint standalone,
//! for deployments that scrape metrics from a process separate from `run`.

use anyhow::Result;

use flyoverhead_ingest::metrics;

pub async fn handle_serve_metrics(port: u16) -> Result<()> {
    metrics::install_recorder();
    metrics::initialize_ingest_metrics();
    metrics::start_metrics_server(port).await;
    Ok(())
}
