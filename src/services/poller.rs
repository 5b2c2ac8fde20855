//! Client status polling.
//!
//! Fresh pending sessions are answered from the database. Once a session has
//! been pending longer than the staleness threshold the poller asks the
//! gateway directly, bounded by a hard timeout, and feeds the answer through
//! the same reconciler the webhook path uses.

use crate::{
    config::AppConfig,
    entities::checkout_session::{self, CheckoutStatus, ResolutionSource},
    errors::ServiceError,
    metrics,
    services::{
        gateway::{GatewayError, GatewayLookup, TerminalGateway},
        reconciler::{Observation, Reconciler},
        session_store::SessionStore,
        terminal_status::{extract_message, normalize_opt},
    },
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// Where a status answer came from, for support staff.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct PollTrace {
    /// `none`, `db`, `gateway` or `gateway_error`
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_secs: Option<i64>,
}

impl PollTrace {
    fn source(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StatusReport {
    pub invoice_number: String,
    pub status: CheckoutStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sale_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slice_index: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slice_count: Option<i32>,
    pub debug: PollTrace,
}

impl StatusReport {
    fn pending_without_session(invoice_number: &str) -> Self {
        Self {
            invoice_number: invoice_number.to_string(),
            status: CheckoutStatus::Pending,
            sale_id: None,
            message: None,
            attempt: None,
            slice_index: None,
            slice_count: None,
            debug: PollTrace::source("none"),
        }
    }

    /// Client view of a session. An approved slice only reads as approved
    /// once the sale exists; until then the checkout is still in progress.
    fn from_session(session: &checkout_session::Model, debug: PollTrace) -> Self {
        let (status, message) = match (session.status, session.sale_id) {
            (CheckoutStatus::Approved, Some(_)) => (CheckoutStatus::Approved, None),
            (CheckoutStatus::Approved, None) => (CheckoutStatus::Pending, None),
            (CheckoutStatus::Declined, _) => (
                CheckoutStatus::Declined,
                session
                    .webhook_json
                    .as_ref()
                    .and_then(extract_message)
                    .or_else(|| Some("declined".to_string())),
            ),
            (CheckoutStatus::Pending, _) => (CheckoutStatus::Pending, None),
        };
        Self {
            invoice_number: session.invoice_number.clone(),
            status,
            sale_id: session.sale_id,
            message,
            attempt: Some(session.attempt),
            slice_index: Some(session.slice_index),
            slice_count: Some(session.slice_count),
            debug,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub stale_after: chrono::Duration,
    pub lookup_timeout: Duration,
}

impl From<&AppConfig> for PollerSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            stale_after: cfg.stale_after(),
            lookup_timeout: cfg.lookup_timeout(),
        }
    }
}

#[derive(Clone)]
pub struct StatusPoller {
    sessions: SessionStore,
    reconciler: Reconciler,
    gateway: Arc<dyn TerminalGateway>,
    settings: PollerSettings,
}

impl StatusPoller {
    pub fn new(
        sessions: SessionStore,
        reconciler: Reconciler,
        gateway: Arc<dyn TerminalGateway>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            sessions,
            reconciler,
            gateway,
            settings,
        }
    }

    #[instrument(skip(self))]
    pub async fn check_status(&self, invoice_number: &str) -> Result<StatusReport, ServiceError> {
        metrics::POLLS.inc();
        let Some(latest) = self.sessions.latest(invoice_number).await? else {
            return Ok(StatusReport::pending_without_session(invoice_number));
        };
        let age_secs = latest.age(Utc::now()).num_seconds();

        match latest.status {
            CheckoutStatus::Declined => Ok(StatusReport::from_session(
                &latest,
                PollTrace {
                    age_secs: Some(age_secs),
                    ..PollTrace::source("db")
                },
            )),
            CheckoutStatus::Approved if latest.sale_id.is_some() => Ok(StatusReport::from_session(
                &latest,
                PollTrace {
                    age_secs: Some(age_secs),
                    ..PollTrace::source("db")
                },
            )),
            CheckoutStatus::Approved => {
                info!(attempt = latest.attempt, "recovering approved session without a sale");
                self.reconciler.continue_if_approved(&latest).await?;
                self.report_latest(
                    invoice_number,
                    PollTrace {
                        age_secs: Some(age_secs),
                        ..PollTrace::source("recovered")
                    },
                )
                .await
            }
            CheckoutStatus::Pending if latest.age(Utc::now()) < self.settings.stale_after => {
                debug!(age_secs, "pending session still fresh");
                Ok(StatusReport::from_session(
                    &latest,
                    PollTrace {
                        age_secs: Some(age_secs),
                        ..PollTrace::source("db")
                    },
                ))
            }
            CheckoutStatus::Pending => self.consult_gateway(&latest, age_secs).await,
        }
    }

    async fn consult_gateway(
        &self,
        session: &checkout_session::Model,
        age_secs: i64,
    ) -> Result<StatusReport, ServiceError> {
        let lookup = match self.lookup(&session.invoice_number, &session.txn_id).await {
            Ok(lookup) => lookup,
            Err(err) => {
                warn!(
                    invoice_number = %session.invoice_number,
                    error = %err,
                    "gateway lookup failed; reporting pending"
                );
                return Ok(StatusReport::from_session(
                    session,
                    PollTrace {
                        http_status: err.http_status(),
                        error: Some(err.to_string()),
                        age_secs: Some(age_secs),
                        ..PollTrace::source("gateway_error")
                    },
                ));
            }
        };

        let status = normalize_opt(lookup.state.as_deref());
        info!(
            invoice_number = %session.invoice_number,
            vendor_state = lookup.state.as_deref().unwrap_or("-"),
            normalized = status.as_str(),
            "gateway lookup"
        );
        let trace = PollTrace {
            endpoint: Some(lookup.endpoint.clone()),
            http_status: Some(lookup.http_status),
            vendor_state: lookup.state.clone(),
            age_secs: Some(age_secs),
            ..PollTrace::source("gateway")
        };

        self.reconciler
            .apply(
                session,
                Observation {
                    status,
                    payload: Some(lookup.raw),
                    source: ResolutionSource::Poll,
                },
            )
            .await?;
        self.report_latest(&session.invoice_number, trace).await
    }

    async fn lookup(&self, invoice_number: &str, txn_id: &str) -> Result<GatewayLookup, GatewayError> {
        let result = match tokio::time::timeout(
            self.settings.lookup_timeout,
            self.gateway.lookup(invoice_number, txn_id),
        )
        .await
        {
            Ok(inner) => inner,
            Err(_) => Err(GatewayError::Timeout(format!(
                "lookup exceeded {}ms",
                self.settings.lookup_timeout.as_millis()
            ))),
        };
        let outcome = match &result {
            Ok(_) => "ok",
            Err(GatewayError::Timeout(_)) => "timeout",
            Err(_) => "error",
        };
        metrics::GATEWAY_LOOKUPS.with_label_values(&[outcome]).inc();
        result
    }

    /// Re-reads the invoice after a write so the answer reflects a newly
    /// opened slice or a freshly written sale.
    async fn report_latest(
        &self,
        invoice_number: &str,
        debug: PollTrace,
    ) -> Result<StatusReport, ServiceError> {
        match self.sessions.latest(invoice_number).await? {
            Some(latest) => Ok(StatusReport::from_session(&latest, debug)),
            None => Ok(StatusReport::pending_without_session(invoice_number)),
        }
    }
}
