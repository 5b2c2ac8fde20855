/*!
 * # Metrics Module
 *
 * Prometheus counters for the checkout engine, registered in the default
 * registry and exposed in text format at `/metrics`.
 *
 * - terminal publishes and publish failures
 * - webhooks received and session transitions by status and channel
 * - status polls and gateway lookups by outcome
 * - sales finalized, finalize races lost, operator force-finalizes
 */

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec,
    TextEncoder,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to export metrics: {0}")]
    ExportError(String),
}

lazy_static! {
    pub static ref GATEWAY_PUBLISHES: IntCounter = register_int_counter!(
        "pos_gateway_publishes_total",
        "Charge requests pushed to the payment terminal gateway"
    )
    .expect("metric can be created");
    pub static ref GATEWAY_PUBLISH_FAILURES: IntCounter = register_int_counter!(
        "pos_gateway_publish_failures_total",
        "Charge requests the gateway did not accept after retries"
    )
    .expect("metric can be created");
    pub static ref WEBHOOKS_RECEIVED: IntCounter = register_int_counter!(
        "pos_terminal_webhooks_received_total",
        "Terminal webhooks accepted for processing"
    )
    .expect("metric can be created");
    pub static ref SESSION_TRANSITIONS: IntCounterVec = register_int_counter_vec!(
        "pos_session_transitions_total",
        "Checkout sessions moved out of pending",
        &["status", "source"]
    )
    .expect("metric can be created");
    pub static ref POLLS: IntCounter = register_int_counter!(
        "pos_status_polls_total",
        "Client status polls served"
    )
    .expect("metric can be created");
    pub static ref GATEWAY_LOOKUPS: IntCounterVec = register_int_counter_vec!(
        "pos_gateway_lookups_total",
        "Gateway status lookups made by stale polls",
        &["outcome"]
    )
    .expect("metric can be created");
    pub static ref SALES_FINALIZED: IntCounter = register_int_counter!(
        "pos_sales_finalized_total",
        "Sales written"
    )
    .expect("metric can be created");
    pub static ref FINALIZE_RACES_LOST: IntCounter = register_int_counter!(
        "pos_finalize_races_lost_total",
        "Finalize calls that found another path had already written the sale"
    )
    .expect("metric can be created");
    pub static ref FORCE_FINALIZES: IntCounterVec = register_int_counter_vec!(
        "pos_force_finalizes_total",
        "Operator force-finalize escalations",
        &["had_session"]
    )
    .expect("metric can be created");
}

/// Touches every counter so the exporter lists them before first use.
pub fn init_metrics() {
    lazy_static::initialize(&GATEWAY_PUBLISHES);
    lazy_static::initialize(&GATEWAY_PUBLISH_FAILURES);
    lazy_static::initialize(&WEBHOOKS_RECEIVED);
    lazy_static::initialize(&SESSION_TRANSITIONS);
    lazy_static::initialize(&POLLS);
    lazy_static::initialize(&GATEWAY_LOOKUPS);
    lazy_static::initialize(&SALES_FINALIZED);
    lazy_static::initialize(&FINALIZE_RACES_LOST);
    lazy_static::initialize(&FORCE_FINALIZES);
}

pub fn export_metrics() -> Result<String, MetricsError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| MetricsError::ExportError(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| MetricsError::ExportError(e.to_string()))
}

// HTTP endpoint handler for metrics
pub async fn metrics_handler() -> axum::response::Response {
    use axum::{http::StatusCode, response::IntoResponse};

    match export_metrics() {
        Ok(body) => (
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "metrics export failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exporter_lists_checkout_counters() {
        init_metrics();
        SALES_FINALIZED.inc();
        SESSION_TRANSITIONS
            .with_label_values(&["approved", "webhook"])
            .inc();

        let text = export_metrics().unwrap();
        assert!(text.contains("pos_sales_finalized_total"));
        assert!(text.contains("pos_session_transitions_total{source=\"webhook\",status=\"approved\"}"));
        assert!(text.contains("pos_gateway_publishes_total"));
    }
}
