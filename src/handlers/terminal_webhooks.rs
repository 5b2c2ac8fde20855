use crate::{
    handlers::common::success_response,
    services::webhooks::{InboundWebhook, SIGNATURE_HEADER, TIMESTAMP_HEADER},
    AppState,
};
use axum::{extract::State, http::HeaderMap, response::Response, routing::post, Router};
use bytes::Bytes;
use serde_json::json;

pub fn terminal_webhook_routes() -> Router<AppState> {
    Router::new().route("/webhook", post(terminal_webhook))
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// POST /api/v1/terminal/webhook
#[utoipa::path(
    post,
    path = "/api/v1/terminal/webhook",
    request_body = String,
    responses(
        (status = 200, description = "Webhook acknowledged; processed asynchronously")
    ),
    tag = "terminal"
)]
pub async fn terminal_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Acknowledge before doing any work; the gateway never sees our failures
    state.services.checkout.webhooks().spawn(InboundWebhook {
        body,
        timestamp: header(&headers, TIMESTAMP_HEADER),
        signature: header(&headers, SIGNATURE_HEADER),
    });
    success_response(json!({ "ok": true }))
}
