//! Payment terminal gateway client.
//!
//! The gateway only ever acknowledges a publish synchronously; approval
//! arrives later through the webhook or a status lookup.

use crate::config::AppConfig;
use crate::services::terminal_status::{extract_field, STATE_KEYS};
use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Body sent to the gateway. `txn_id` doubles as the idempotency key, so
/// retries of one publish reuse it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishRequest {
    pub txn_id: String,
    pub invoice_number: String,
    /// Major units, two decimals ("75.00")
    pub amount: String,
    pub amount_cents: i64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl PublishRequest {
    pub fn major_units(amount_cents: i64) -> String {
        let sign = if amount_cents < 0 { "-" } else { "" };
        let abs = amount_cents.unsigned_abs();
        format!("{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayAck {
    pub http_status: u16,
    pub body: String,
}

impl GatewayAck {
    pub fn ack_text(&self) -> String {
        format!("ok {}: {}", self.http_status, self.body)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayLookup {
    pub endpoint: String,
    pub http_status: u16,
    /// Raw vendor state string, if the response carried one
    pub state: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway timed out: {0}")]
    Timeout(String),
    #[error("gateway transport error: {0}")]
    Transport(String),
    #[error("gateway returned {code}: {body}")]
    Status { code: u16, body: String },
    #[error("gateway response could not be decoded: {0}")]
    Decode(String),
}

impl GatewayError {
    fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Timeout(_) | GatewayError::Transport(_) => true,
            GatewayError::Status { code, .. } => *code >= 500,
            GatewayError::Decode(_) => false,
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            GatewayError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout(err.to_string())
        } else if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TerminalGateway: Send + Sync {
    /// Ask the terminal to start collecting `amount` for the invoice.
    async fn publish(&self, request: &PublishRequest) -> Result<GatewayAck, GatewayError>;

    /// Ask the gateway about one charge attempt. `txn_id` tells the slices of a
    /// split sale apart; they all share the invoice number.
    async fn lookup(&self, invoice_number: &str, txn_id: &str)
        -> Result<GatewayLookup, GatewayError>;
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub device_id: Option<String>,
    pub currency: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl From<&AppConfig> for GatewaySettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            base_url: cfg.gateway_base_url.trim_end_matches('/').to_string(),
            api_key: cfg.gateway_api_key.clone(),
            device_id: cfg.gateway_device_id.clone(),
            currency: cfg.default_currency.clone(),
            timeout: Duration::from_secs(cfg.gateway_timeout_secs),
            max_retries: cfg.gateway_publish_max_retries,
            retry_base_delay: Duration::from_millis(cfg.gateway_retry_base_delay_ms),
        }
    }
}

/// reqwest-backed gateway client
#[derive(Clone)]
pub struct HttpTerminalGateway {
    client: reqwest::Client,
    settings: GatewaySettings,
}

impl HttpTerminalGateway {
    pub fn new(settings: GatewaySettings) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(GatewayError::from)?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.settings.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.settings.retry_base_delay;
        let exp = base.saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter_cap = (base.as_millis() as u64 / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
        exp + Duration::from_millis(jitter)
    }

    async fn publish_once(&self, request: &PublishRequest) -> Result<GatewayAck, GatewayError> {
        let url = format!("{}/transactions", self.settings.base_url);
        let response = self
            .authorize(self.client.post(&url))
            .header("Idempotency-Key", &request.txn_id)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(GatewayAck {
                http_status: status.as_u16(),
                body,
            })
        } else {
            Err(GatewayError::Status {
                code: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl TerminalGateway for HttpTerminalGateway {
    #[instrument(skip(self, request), fields(txn_id = %request.txn_id, invoice_number = %request.invoice_number))]
    async fn publish(&self, request: &PublishRequest) -> Result<GatewayAck, GatewayError> {
        let attempts = self.settings.max_retries + 1;
        let mut attempt = 1;
        loop {
            match self.publish_once(request).await {
                Ok(ack) => {
                    debug!(attempt, status = ack.http_status, "gateway accepted publish");
                    return Ok(ack);
                }
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "Gateway publish failed: {} (attempt {}/{}), retrying in {:?}",
                        err, attempt, attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(
                        "Gateway publish failed: {} (attempt {}/{})",
                        err, attempt, attempts
                    );
                    return Err(err);
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn lookup(
        &self,
        invoice_number: &str,
        txn_id: &str,
    ) -> Result<GatewayLookup, GatewayError> {
        let endpoint = format!("{}/transactions/status", self.settings.base_url);
        let response = self
            .authorize(self.client.get(&endpoint))
            .query(&[("invoice_number", invoice_number), ("txn_id", txn_id)])
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(GatewayError::Status {
                code: status.as_u16(),
                body: text,
            });
        }

        let raw: Value =
            serde_json::from_str(&text).map_err(|e| GatewayError::Decode(e.to_string()))?;
        let state = extract_field(&raw, STATE_KEYS);

        Ok(GatewayLookup {
            endpoint,
            http_status: status.as_u16(),
            state,
            raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(base_url: String) -> GatewaySettings {
        GatewaySettings {
            base_url,
            api_key: Some("test-key".into()),
            device_id: Some("till-1".into()),
            currency: "USD".into(),
            timeout: Duration::from_secs(2),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(1),
        }
    }

    fn request() -> PublishRequest {
        PublishRequest {
            txn_id: "TXN-abc".into(),
            invoice_number: "INV-1".into(),
            amount: PublishRequest::major_units(7500),
            amount_cents: 7500,
            currency: "USD".into(),
            device_id: Some("till-1".into()),
        }
    }

    #[test]
    fn major_units_are_two_decimals() {
        assert_eq!(PublishRequest::major_units(7500), "75.00");
        assert_eq!(PublishRequest::major_units(5), "0.05");
    }

    #[tokio::test]
    async fn publish_sends_amount_and_bearer_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transactions"))
            .and(header("authorization", "Bearer test-key"))
            .and(header("idempotency-key", "TXN-abc"))
            .and(body_partial_json(json!({"invoice_number": "INV-1", "amount": "75.00"})))
            .respond_with(ResponseTemplate::new(202).set_body_string("queued"))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = HttpTerminalGateway::new(settings(server.uri())).unwrap();
        let ack = gateway.publish(&request()).await.unwrap();
        assert_eq!(ack.ack_text(), "ok 202: queued");
    }

    #[tokio::test]
    async fn publish_retries_server_errors_with_same_txn_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transactions"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/transactions"))
            .and(body_partial_json(json!({"txn_id": "TXN-abc"})))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = HttpTerminalGateway::new(settings(server.uri())).unwrap();
        let ack = gateway.publish(&request()).await.unwrap();
        assert_eq!(ack.http_status, 200);
    }

    #[tokio::test]
    async fn publish_does_not_retry_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transactions"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad amount"))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = HttpTerminalGateway::new(settings(server.uri())).unwrap();
        let err = gateway.publish(&request()).await.unwrap_err();
        assert_matches!(err, GatewayError::Status { code: 422, .. });
    }

    #[tokio::test]
    async fn publish_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transactions"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let gateway = HttpTerminalGateway::new(settings(server.uri())).unwrap();
        assert_matches!(
            gateway.publish(&request()).await,
            Err(GatewayError::Status { code: 500, .. })
        );
    }

    #[tokio::test]
    async fn lookup_reads_nested_vendor_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/transactions/status"))
            .and(query_param("invoice_number", "INV-1"))
            .and(query_param("txn_id", "TXN-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "transaction_state": "Declined – insufficient funds" }
            })))
            .mount(&server)
            .await;

        let gateway = HttpTerminalGateway::new(settings(server.uri())).unwrap();
        let lookup = gateway.lookup("INV-1", "TXN-1").await.unwrap();
        assert_eq!(lookup.http_status, 200);
        assert_eq!(
            lookup.state.as_deref(),
            Some("Declined – insufficient funds")
        );
        assert!(lookup.endpoint.ends_with("/transactions/status"));
    }

    #[tokio::test]
    async fn lookup_rejects_non_json_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/transactions/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let gateway = HttpTerminalGateway::new(settings(server.uri())).unwrap();
        assert_matches!(
            gateway.lookup("INV-1", "TXN-1").await,
            Err(GatewayError::Decode(_))
        );
    }
}
