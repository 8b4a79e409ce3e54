// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize telemetry (logs + metrics)
pub fn init_telemetry() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tidemark_node=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    if PROM_HANDLE.set(handle).is_err() {
        tracing::warn!("Prometheus handle already set. Telemetry re-initialized?");
    }

    metrics::describe_counter!(
        "tidemark_digests_submitted_total",
        "Digests accepted for aggregation"
    );
    metrics::describe_counter!(
        "tidemark_rounds_closed_total",
        "Aggregation rounds closed with at least one digest"
    );
    metrics::describe_counter!(
        "tidemark_commitments_journaled_total",
        "Commitments written to the calendar journal"
    );
    metrics::describe_counter!(
        "tidemark_anchors_broadcast_total",
        "Anchor transactions broadcast, replacements included"
    );
    metrics::describe_counter!(
        "tidemark_anchors_confirmed_total",
        "Anchor transactions that reached the confirmation threshold"
    );
    metrics::describe_counter!(
        "tidemark_backup_bytes_total",
        "Raw journal bytes served over the backup feed"
    );
    metrics::describe_histogram!(
        "tidemark_round_close_duration_seconds",
        "Time spent closing one aggregation round"
    );

    metrics::gauge!("tidemark_node_up", 1.0);
}

/// Get the Prometheus handle to render metrics
pub fn get_metrics() -> String {
    if let Some(handle) = PROM_HANDLE.get() {
        handle.render()
    } else {
        "# metrics not initialized".to_string()
    }
}
