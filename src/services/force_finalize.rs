//! Operator escalation for sales the terminal never confirmed.
//!
//! Every call is written to the `audit` log target at warn level, whatever
//! the outcome.

use crate::{
    config::AppConfig,
    entities::{
        checkout_session::{CheckoutStatus, ResolutionSource},
        sale::FinalizedBy,
    },
    errors::ServiceError,
    metrics,
    services::{
        finalizer::SaleFinalizer,
        sequencer::{ApprovalOutcome, SliceSequencer},
        session_store::SessionStore,
        totals::{prepare_sale, CartLine, SplitPart},
    },
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct ForceFinalizeRequest {
    #[serde(default)]
    #[validate(length(min = 1, max = 64))]
    pub invoice_number: Option<String>,
    #[validate(length(min = 1, max = 128, message = "Operator is required"))]
    pub operator: String,
    #[serde(default)]
    #[validate(length(max = 500))]
    pub reason: Option<String>,
    /// Only read when no session exists for the invoice
    #[serde(default)]
    pub items: Vec<CartLine>,
    #[serde(default)]
    pub tender: Option<String>,
    #[serde(default)]
    pub split: Vec<SplitPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct ForceFinalizeOutcome {
    /// Absent while later card slices of a split are still to be charged
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sale_id: Option<Uuid>,
    pub invoice_number: String,
    pub had_session: bool,
    /// Slice now waiting on the terminal, when the forced slice was not the last
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_slice: Option<i32>,
}

#[derive(Clone)]
pub struct ForceFinalizer {
    sessions: SessionStore,
    finalizer: SaleFinalizer,
    sequencer: SliceSequencer,
    min_wait: chrono::Duration,
    tax_rate: Decimal,
    invoice_prefix: String,
}

impl ForceFinalizer {
    pub fn new(
        sessions: SessionStore,
        finalizer: SaleFinalizer,
        sequencer: SliceSequencer,
        min_wait: chrono::Duration,
        tax_rate: Decimal,
        invoice_prefix: String,
    ) -> Self {
        Self {
            sessions,
            finalizer,
            sequencer,
            min_wait,
            tax_rate,
            invoice_prefix,
        }
    }

    pub fn from_config(
        sessions: SessionStore,
        finalizer: SaleFinalizer,
        sequencer: SliceSequencer,
        cfg: &AppConfig,
    ) -> Self {
        Self::new(
            sessions,
            finalizer,
            sequencer,
            cfg.force_min_wait(),
            cfg.tax_rate(),
            cfg.invoice_prefix.clone(),
        )
    }

    #[instrument(skip(self, request), fields(operator = %request.operator))]
    pub async fn force_finalize(
        &self,
        request: ForceFinalizeRequest,
    ) -> Result<ForceFinalizeOutcome, ServiceError> {
        let invoice_number = request
            .invoice_number
            .clone()
            .filter(|s| !s.trim().is_empty());

        let latest = match invoice_number.as_deref() {
            Some(invoice) => self.sessions.latest(invoice).await?,
            None => None,
        };

        let Some(session) = latest else {
            return self.without_session(invoice_number, request).await;
        };

        warn!(
            target: "audit",
            invoice_number = %session.invoice_number,
            operator = %request.operator,
            reason = request.reason.as_deref().unwrap_or("-"),
            status = session.status.as_str(),
            attempt = session.attempt,
            "force-finalize requested"
        );
        metrics::FORCE_FINALIZES.with_label_values(&["true"]).inc();

        if let Some(sale_id) = session.sale_id {
            return Ok(ForceFinalizeOutcome {
                sale_id: Some(sale_id),
                invoice_number: session.invoice_number,
                had_session: true,
                next_slice: None,
            });
        }

        match session.status {
            CheckoutStatus::Declined => {
                return Err(ServiceError::Conflict(format!(
                    "latest attempt for invoice {} was declined; resend instead",
                    session.invoice_number
                )))
            }
            CheckoutStatus::Pending if session.age(Utc::now()) < self.min_wait => {
                return Err(ServiceError::ValidationError(format!(
                    "session for invoice {} has been pending {}s; wait at least {}s before forcing",
                    session.invoice_number,
                    session.age(Utc::now()).num_seconds(),
                    self.min_wait.num_seconds()
                )))
            }
            CheckoutStatus::Pending => {
                let applied = self
                    .sessions
                    .transition(session.id, CheckoutStatus::Approved, ResolutionSource::Operator)
                    .await?;
                if !applied {
                    // Something else resolved it in the meantime; only an approval may proceed
                    let current = self.sessions.find(session.id).await?.ok_or_else(|| {
                        ServiceError::NotFound(format!("session {} vanished", session.id))
                    })?;
                    if current.status == CheckoutStatus::Declined {
                        return Err(ServiceError::Conflict(format!(
                            "invoice {} was declined while forcing",
                            current.invoice_number
                        )));
                    }
                }
            }
            CheckoutStatus::Approved => {}
        }

        // The operator vouches for this slice only; remaining card slices still
        // go to the terminal.
        let outcome = match self.sequencer.after_approval(&session).await? {
            ApprovalOutcome::Finalized { sale_id } => {
                info!(target: "audit", invoice_number = %session.invoice_number, sale_id = %sale_id, "force-finalized");
                ForceFinalizeOutcome {
                    sale_id: Some(sale_id),
                    invoice_number: session.invoice_number,
                    had_session: true,
                    next_slice: None,
                }
            }
            ApprovalOutcome::Advanced(published) => {
                info!(
                    target: "audit",
                    invoice_number = %session.invoice_number,
                    attempt = published.attempt,
                    "force-approved slice; next card slice sent to terminal"
                );
                ForceFinalizeOutcome {
                    sale_id: None,
                    invoice_number: session.invoice_number,
                    had_session: true,
                    next_slice: Some(session.slice_index + 1),
                }
            }
            ApprovalOutcome::Superseded => {
                let latest = self.sessions.latest(&session.invoice_number).await?;
                ForceFinalizeOutcome {
                    sale_id: latest.as_ref().and_then(|s| s.sale_id),
                    next_slice: latest
                        .filter(|s| s.sale_id.is_none())
                        .map(|s| s.slice_index),
                    invoice_number: session.invoice_number,
                    had_session: true,
                }
            }
        };
        Ok(outcome)
    }

    async fn without_session(
        &self,
        invoice_number: Option<String>,
        request: ForceFinalizeRequest,
    ) -> Result<ForceFinalizeOutcome, ServiceError> {
        let invoice_number =
            invoice_number.unwrap_or_else(|| super::checkout::new_invoice_number(&self.invoice_prefix));
        warn!(
            target: "audit",
            invoice_number = %invoice_number,
            operator = %request.operator,
            reason = request.reason.as_deref().unwrap_or("-"),
            "force-finalize without any terminal session"
        );
        metrics::FORCE_FINALIZES.with_label_values(&["false"]).inc();

        if request.items.is_empty() {
            return Err(ServiceError::ValidationError(
                "items are required when no checkout session exists".to_string(),
            ));
        }
        let tender = request.tender.as_deref().ok_or_else(|| {
            ServiceError::ValidationError(
                "tender is required when no checkout session exists".to_string(),
            )
        })?;
        let snapshot = prepare_sale(request.items, tender, &request.split, self.tax_rate)?;
        let sale_id = self
            .finalizer
            .record_direct(&invoice_number, &snapshot, FinalizedBy::OperatorWithoutSession)
            .await?;
        Ok(ForceFinalizeOutcome {
            sale_id: Some(sale_id),
            invoice_number,
            had_session: false,
            next_slice: None,
        })
    }
}
