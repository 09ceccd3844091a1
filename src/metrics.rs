//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus exporter with its own HTTP listener
pub fn setup_metrics(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!(addr = %addr, "Prometheus metrics exporter installed");

    Ok(())
}

/// Record a runtime process spawn
pub fn record_runtime_started() {
    metrics::counter!("ollama_manager_runtime_starts_total").increment(1);
}

/// Record a pull request accepted by the coordinator
pub fn record_pull_started(model: &str) {
    metrics::counter!("ollama_manager_pulls_started_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record the terminal state of a pull
pub fn record_pull_finished(model: &str, outcome: &'static str) {
    metrics::counter!("ollama_manager_pulls_finished_total",
        "model" => model.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Update the active pull gauge
pub fn update_active_pulls(count: usize) {
    metrics::gauge!("ollama_manager_active_pulls").set(count as f64);
}

/// Record registry mutations applied by one reconciliation pass
pub fn record_reconcile(added: usize, updated: usize, removed: usize, rebound: usize) {
    metrics::counter!("ollama_manager_reconcile_runs_total").increment(1);
    metrics::counter!("ollama_manager_registry_added_total").increment(added as u64);
    metrics::counter!("ollama_manager_registry_updated_total").increment(updated as u64);
    metrics::counter!("ollama_manager_registry_removed_total").increment(removed as u64);
    metrics::counter!("ollama_manager_bindings_rebound_total").increment(rebound as u64);
}
