//! Client-facing checkout operations.
//!
//! `CheckoutService` wires the terminal components together and is the only
//! service the HTTP layer talks to.

use crate::{
    config::AppConfig,
    entities::{
        checkout_session::{CheckoutStatus, ResolutionSource},
        sale::{self, FinalizedBy},
    },
    errors::ServiceError,
    services::{
        finalizer::SaleFinalizer,
        force_finalize::{ForceFinalizeOutcome, ForceFinalizeRequest, ForceFinalizer},
        gateway::TerminalGateway,
        poller::{PollerSettings, StatusPoller, StatusReport},
        publisher::OutboundPublisher,
        reconciler::Reconciler,
        sequencer::SliceSequencer,
        session_store::SessionStore,
        totals::{prepare_sale, CartLine, SplitPart},
        webhooks::{WebhookProcessor, WebhookVerifier},
    },
};
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// `{prefix}-{yyyymmdd}-{6 hex}`, e.g. `INV-20250301-3FA9C1`.
pub fn new_invoice_number(prefix: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
    format!("{}-{}-{:06X}", prefix, Utc::now().format("%Y%m%d"), suffix)
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct StartCheckoutRequest {
    #[serde(default)]
    #[validate(length(min = 1, max = 64))]
    pub invoice_number: Option<String>,
    #[validate(length(min = 1, message = "Cart must contain at least one item"))]
    pub items: Vec<CartLine>,
    #[schema(example = "card:visa")]
    pub tender: String,
    #[serde(default)]
    pub split: Vec<SplitPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartOutcome {
    /// No card involved; the sale is written
    Completed {
        sale_id: Uuid,
        invoice_number: String,
        total_cents: i64,
        payment_description: String,
    },
    /// The first card slice is on the terminal; poll for status
    WaitingForTerminal {
        invoice_number: String,
        attempt: i32,
        slice_index: i32,
        slice_count: i32,
        amount_cents: i64,
        ack: String,
        delivered: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct ResendOutcome {
    pub invoice_number: String,
    pub attempt: i32,
    pub txn_id: String,
    pub ack: String,
    pub delivered: bool,
}

/// One charge attempt as shown in the audit listing.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionSummary {
    pub txn_id: String,
    pub attempt: i32,
    pub slice_index: i32,
    pub slice_count: i32,
    pub amount_cents: i64,
    pub status: CheckoutStatus,
    pub resolved_by: Option<ResolutionSource>,
    pub started_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub sale_id: Option<Uuid>,
    /// Gateway ack recorded when the attempt was published
    pub ack: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SaleView {
    pub id: Uuid,
    pub invoice_number: String,
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub payment_method: String,
    #[schema(value_type = Object)]
    pub items: Value,
    #[schema(value_type = Object)]
    pub tender_parts: Value,
    pub finalized_by: FinalizedBy,
    pub created_at: DateTime<Utc>,
}

impl From<sale::Model> for SaleView {
    fn from(model: sale::Model) -> Self {
        Self {
            id: model.id,
            invoice_number: model.invoice_number,
            subtotal_cents: model.subtotal_cents,
            discount_cents: model.discount_cents,
            tax_cents: model.tax_cents,
            total_cents: model.total_cents,
            payment_method: model.payment_method,
            items: model.items,
            tender_parts: model.tender_parts,
            finalized_by: model.finalized_by,
            created_at: model.created_at,
        }
    }
}

#[derive(Clone)]
pub struct CheckoutService {
    sessions: SessionStore,
    publisher: OutboundPublisher,
    finalizer: SaleFinalizer,
    sequencer: SliceSequencer,
    poller: StatusPoller,
    forcer: ForceFinalizer,
    webhooks: WebhookProcessor,
    tax_rate: Decimal,
    invoice_prefix: String,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn TerminalGateway>,
        config: &AppConfig,
    ) -> Self {
        let sessions = SessionStore::new(db.clone());
        let publisher = OutboundPublisher::new(
            db.clone(),
            gateway.clone(),
            config.default_currency.clone(),
            config.gateway_device_id.clone(),
        );
        let finalizer = SaleFinalizer::new(db.clone());
        let sequencer =
            SliceSequencer::new(sessions.clone(), publisher.clone(), finalizer.clone());
        let reconciler = Reconciler::new(sessions.clone(), sequencer.clone());
        let poller = StatusPoller::new(
            sessions.clone(),
            reconciler.clone(),
            gateway,
            PollerSettings::from(config),
        );
        let forcer = ForceFinalizer::from_config(
            sessions.clone(),
            finalizer.clone(),
            sequencer.clone(),
            config,
        );
        let webhooks = WebhookProcessor::new(db, reconciler, WebhookVerifier::from_config(config));

        Self {
            sessions,
            publisher,
            finalizer,
            sequencer,
            poller,
            forcer,
            webhooks,
            tax_rate: config.tax_rate(),
            invoice_prefix: config.invoice_prefix.clone(),
        }
    }

    pub fn webhooks(&self) -> &WebhookProcessor {
        &self.webhooks
    }

    #[instrument(skip(self, request), fields(tender = %request.tender))]
    pub async fn start(&self, request: StartCheckoutRequest) -> Result<StartOutcome, ServiceError> {
        request.validate()?;
        let invoice_number = request
            .invoice_number
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| new_invoice_number(&self.invoice_prefix));

        let snapshot = prepare_sale(request.items, &request.tender, &request.split, self.tax_rate)?;

        if !snapshot.needs_terminal() {
            let sale_id = self
                .finalizer
                .record_direct(&invoice_number, &snapshot, FinalizedBy::Direct)
                .await?;
            return Ok(StartOutcome::Completed {
                sale_id,
                invoice_number,
                total_cents: snapshot.totals.total_cents,
                payment_description: snapshot.payment_description,
            });
        }

        if self.sessions.latest(&invoice_number).await?.is_some()
            || self.finalizer.sale_for_invoice(&invoice_number).await?.is_some()
        {
            return Err(ServiceError::Conflict(format!(
                "invoice {} already has a checkout in progress; use resend or status",
                invoice_number
            )));
        }

        let outcome = self.sequencer.begin(&invoice_number, &snapshot).await?;
        info!(
            invoice_number = %invoice_number,
            slices = snapshot.slice_count(),
            delivered = outcome.delivered,
            "card checkout started"
        );
        Ok(StartOutcome::WaitingForTerminal {
            invoice_number,
            attempt: outcome.attempt,
            slice_index: outcome.session.slice_index,
            slice_count: outcome.session.slice_count,
            amount_cents: outcome.session.amount_cents,
            ack: outcome.ack,
            delivered: outcome.delivered,
        })
    }

    pub async fn status(&self, invoice_number: &str) -> Result<StatusReport, ServiceError> {
        self.poller.check_status(invoice_number).await
    }

    pub async fn resend(&self, invoice_number: &str) -> Result<ResendOutcome, ServiceError> {
        let outcome = self.sequencer.resend(invoice_number).await?;
        Ok(ResendOutcome {
            invoice_number: invoice_number.to_string(),
            attempt: outcome.attempt,
            txn_id: outcome.txn_id,
            ack: outcome.ack,
            delivered: outcome.delivered,
        })
    }

    pub async fn force_finalize(
        &self,
        request: ForceFinalizeRequest,
    ) -> Result<ForceFinalizeOutcome, ServiceError> {
        request.validate()?;
        self.forcer.force_finalize(request).await
    }

    pub async fn sessions(&self, invoice_number: &str) -> Result<Vec<SessionSummary>, ServiceError> {
        let sessions = self.sessions.list(invoice_number).await?;
        if sessions.is_empty() {
            return Err(ServiceError::NotFound(format!(
                "no checkout sessions for invoice {}",
                invoice_number
            )));
        }
        let mut acks: HashMap<String, Option<String>> = self
            .publisher
            .history(invoice_number)
            .await?
            .into_iter()
            .map(|record| (record.txn_id, record.ack_text))
            .collect();

        Ok(sessions
            .into_iter()
            .map(|s| SessionSummary {
                ack: acks.remove(&s.txn_id).flatten(),
                txn_id: s.txn_id,
                attempt: s.attempt,
                slice_index: s.slice_index,
                slice_count: s.slice_count,
                amount_cents: s.amount_cents,
                status: s.status,
                resolved_by: s.resolved_by,
                started_at: s.started_at,
                resolved_at: s.resolved_at,
                sale_id: s.sale_id,
            })
            .collect())
    }

    pub async fn sale(&self, id: Uuid) -> Result<SaleView, ServiceError> {
        self.finalizer
            .sale(id)
            .await?
            .map(SaleView::from)
            .ok_or_else(|| ServiceError::NotFound(format!("sale {} not found", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoice_numbers_carry_prefix_and_date() {
        let invoice = new_invoice_number("POS");
        let parts: Vec<&str> = invoice.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "POS");
        assert_eq!(parts[1], Utc::now().format("%Y%m%d").to_string());
        assert_eq!(parts[2].len(), 6);
        assert_ne!(new_invoice_number("POS"), new_invoice_number("POS"));
    }
}
