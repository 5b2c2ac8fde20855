//! Inbound terminal webhooks.
//!
//! The HTTP handler acks first and hands the raw request to
//! [`WebhookProcessor::spawn`]; everything here runs detached from the
//! gateway's request and reports only through the database and logs.

use crate::{
    config::AppConfig,
    entities::{
        checkout_session::{self, CheckoutStatus, ResolutionSource},
        webhook_log,
    },
    errors::ServiceError,
    metrics,
    services::{
        reconciler::{Observation, ReconcileOutcome, Reconciler},
        session_store::SessionStore,
        terminal_status::{extract_field, normalize_opt, INVOICE_KEYS, STATE_KEYS, TXN_KEYS},
    },
};
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Raw webhook as received, before any interpretation.
#[derive(Debug, Clone)]
pub struct InboundWebhook {
    pub body: Bytes,
    pub timestamp: Option<String>,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureCheck {
    /// No secret configured
    Skipped,
    Valid,
    Invalid(&'static str),
}

impl SignatureCheck {
    fn as_column(&self) -> Option<bool> {
        match self {
            SignatureCheck::Skipped => None,
            SignatureCheck::Valid => Some(true),
            SignatureCheck::Invalid(_) => Some(false),
        }
    }
}

/// HMAC-SHA256 over `"{timestamp}.{body}"`, hex encoded.
#[derive(Debug, Clone)]
pub struct WebhookVerifier {
    secret: Option<String>,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    pub fn new(secret: Option<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            tolerance_secs,
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(
            cfg.terminal_webhook_secret.clone(),
            cfg.webhook_tolerance_secs(),
        )
    }

    pub fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
        let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn check(&self, timestamp: Option<&str>, signature: Option<&str>, body: &[u8]) -> SignatureCheck {
        let Some(secret) = self.secret.as_deref() else {
            return SignatureCheck::Skipped;
        };
        let (Some(ts), Some(sig)) = (timestamp, signature) else {
            return SignatureCheck::Invalid("missing signature headers");
        };
        let Ok(ts_i) = ts.trim().parse::<i64>() else {
            return SignatureCheck::Invalid("malformed timestamp");
        };
        if (Utc::now().timestamp() - ts_i).abs() > self.tolerance_secs {
            return SignatureCheck::Invalid("timestamp outside tolerance");
        }
        let expected = Self::sign(secret, ts.trim(), body);
        if !expected.is_empty() && constant_time_eq(&expected, sig.trim()) {
            SignatureCheck::Valid
        } else {
            SignatureCheck::Invalid("signature mismatch")
        }
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Fields pulled out of a webhook body. Malformed bodies parse as `{}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedWebhook {
    pub payload: Value,
    pub invoice_number: Option<String>,
    pub txn_id: Option<String>,
    pub vendor_state: Option<String>,
    pub status: CheckoutStatus,
}

pub fn parse_webhook(body: &[u8]) -> ParsedWebhook {
    let payload = match serde_json::from_slice::<Value>(body) {
        Ok(value @ Value::Object(_)) => value,
        _ => Value::Object(Default::default()),
    };
    let vendor_state = extract_field(&payload, STATE_KEYS);
    ParsedWebhook {
        invoice_number: extract_field(&payload, INVOICE_KEYS),
        txn_id: extract_field(&payload, TXN_KEYS),
        status: normalize_opt(vendor_state.as_deref()),
        vendor_state,
        payload,
    }
}

#[derive(Debug, Clone)]
pub enum WebhookDisposition {
    /// Signature check failed; logged only
    Rejected,
    /// No session matches the invoice or txn id
    Unmatched,
    Applied(ReconcileOutcome),
}

#[derive(Clone)]
pub struct WebhookProcessor {
    db: Arc<DatabaseConnection>,
    sessions: SessionStore,
    reconciler: Reconciler,
    verifier: WebhookVerifier,
}

impl WebhookProcessor {
    pub fn new(
        db: Arc<DatabaseConnection>,
        reconciler: Reconciler,
        verifier: WebhookVerifier,
    ) -> Self {
        Self {
            sessions: SessionStore::new(db.clone()),
            db,
            reconciler,
            verifier,
        }
    }

    /// Detaches processing from the caller. The task keeps no handle back to
    /// the request; failures are logged.
    pub fn spawn(&self, inbound: InboundWebhook) {
        let processor = self.clone();
        tokio::spawn(async move {
            if let Err(err) = processor.process(inbound).await {
                error!(error = %err, "terminal webhook processing failed");
            }
        });
    }

    #[instrument(skip(self, inbound))]
    pub async fn process(&self, inbound: InboundWebhook) -> Result<WebhookDisposition, ServiceError> {
        metrics::WEBHOOKS_RECEIVED.inc();
        let signature = self.verifier.check(
            inbound.timestamp.as_deref(),
            inbound.signature.as_deref(),
            &inbound.body,
        );
        let parsed = parse_webhook(&inbound.body);
        self.log(&parsed, &signature).await?;

        if let SignatureCheck::Invalid(reason) = signature {
            warn!(
                invoice_number = parsed.invoice_number.as_deref().unwrap_or("-"),
                reason, "terminal webhook signature rejected; not applied"
            );
            return Ok(WebhookDisposition::Rejected);
        }

        let Some(session) = self.target_session(&parsed).await? else {
            warn!(
                invoice_number = parsed.invoice_number.as_deref().unwrap_or("-"),
                txn_id = parsed.txn_id.as_deref().unwrap_or("-"),
                "terminal webhook matches no session"
            );
            return Ok(WebhookDisposition::Unmatched);
        };

        info!(
            invoice_number = %session.invoice_number,
            txn_id = %session.txn_id,
            vendor_state = parsed.vendor_state.as_deref().unwrap_or("-"),
            normalized = parsed.status.as_str(),
            "terminal webhook received"
        );

        let outcome = self
            .reconciler
            .apply(
                &session,
                Observation {
                    status: parsed.status,
                    payload: Some(parsed.payload),
                    source: ResolutionSource::Webhook,
                },
            )
            .await?;
        Ok(WebhookDisposition::Applied(outcome))
    }

    /// The session named by txn id when it belongs to the invoice, otherwise
    /// the invoice's latest attempt.
    async fn target_session(
        &self,
        parsed: &ParsedWebhook,
    ) -> Result<Option<checkout_session::Model>, ServiceError> {
        if let Some(txn_id) = parsed.txn_id.as_deref() {
            if let Some(session) = self.sessions.by_txn_id(txn_id).await? {
                let same_invoice = parsed
                    .invoice_number
                    .as_deref()
                    .map_or(true, |inv| inv == session.invoice_number);
                if same_invoice {
                    return Ok(Some(session));
                }
            }
        }
        match parsed.invoice_number.as_deref() {
            Some(invoice) => self.sessions.latest(invoice).await,
            None => Ok(None),
        }
    }

    async fn log(&self, parsed: &ParsedWebhook, signature: &SignatureCheck) -> Result<(), ServiceError> {
        webhook_log::ActiveModel {
            id: Set(Uuid::new_v4()),
            txn_id: Set(parsed.txn_id.clone()),
            invoice_number: Set(parsed.invoice_number.clone()),
            vendor_state: Set(parsed.vendor_state.clone()),
            normalized_state: Set(parsed.status.as_str().to_string()),
            signature_valid: Set(signature.as_column()),
            payload: Set(parsed.payload.clone()),
            received_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn malformed_body_parses_as_empty_object() {
        let parsed = parse_webhook(b"{not json");
        assert_eq!(parsed.payload, json!({}));
        assert_eq!(parsed.status, CheckoutStatus::Pending);
        assert!(parsed.invoice_number.is_none());

        // Valid JSON that is not an object is treated the same way
        assert_eq!(parse_webhook(b"[1,2]").payload, json!({}));
    }

    #[test]
    fn nested_payload_fields_are_extracted() {
        let body = json!({
            "event": "transaction.updated",
            "data": { "invoiceNumber": "INV-5", "transaction_id": "TXN-9", "status": "APPROVED" }
        });
        let parsed = parse_webhook(body.to_string().as_bytes());
        assert_eq!(parsed.invoice_number.as_deref(), Some("INV-5"));
        assert_eq!(parsed.txn_id.as_deref(), Some("TXN-9"));
        assert_eq!(parsed.vendor_state.as_deref(), Some("APPROVED"));
        assert_eq!(parsed.status, CheckoutStatus::Approved);
    }

    #[test]
    fn verifier_without_secret_skips() {
        let verifier = WebhookVerifier::new(None, 300);
        assert_eq!(verifier.check(None, None, b"{}"), SignatureCheck::Skipped);
    }

    #[test]
    fn verifier_accepts_valid_signature() {
        let verifier = WebhookVerifier::new(Some("whsec".into()), 300);
        let ts = Utc::now().timestamp().to_string();
        let body = br#"{"invoice_number":"INV-1","state":"Approved"}"#;
        let sig = WebhookVerifier::sign("whsec", &ts, body);
        assert_eq!(
            verifier.check(Some(&ts), Some(&sig), body),
            SignatureCheck::Valid
        );
    }

    #[test]
    fn verifier_rejects_tampering_and_stale_timestamps() {
        let verifier = WebhookVerifier::new(Some("whsec".into()), 300);
        let ts = Utc::now().timestamp().to_string();
        let sig = WebhookVerifier::sign("whsec", &ts, b"original");
        assert_eq!(
            verifier.check(Some(&ts), Some(&sig), b"tampered"),
            SignatureCheck::Invalid("signature mismatch")
        );

        let old = (Utc::now().timestamp() - 3600).to_string();
        let old_sig = WebhookVerifier::sign("whsec", &old, b"original");
        assert_eq!(
            verifier.check(Some(&old), Some(&old_sig), b"original"),
            SignatureCheck::Invalid("timestamp outside tolerance")
        );
        assert_eq!(
            verifier.check(None, None, b"original"),
            SignatureCheck::Invalid("missing signature headers")
        );
    }
}
