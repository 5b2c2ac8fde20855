use crate::{
    entities::{
        checkout_session,
        outbound_publish::{self, PublishPhase},
    },
    errors::ServiceError,
    metrics,
    services::{
        gateway::{PublishRequest, TerminalGateway},
        session_store::{NewSession, SessionStore},
    },
};
use chrono::Utc;
use sea_orm::{
    sea_query::OnConflict, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    Set,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// One charge attempt to push to the terminal.
#[derive(Debug, Clone)]
pub struct OpenSlice {
    pub invoice_number: String,
    pub attempt: i32,
    pub slice_index: i32,
    pub slice_count: i32,
    pub amount_cents: i64,
    pub snapshot: Value,
    pub phase: PublishPhase,
}

#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub txn_id: String,
    pub attempt: i32,
    /// Stored ack text: `ok <status>: <body>` or `error: <message>`
    pub ack: String,
    /// Whether the gateway accepted the request
    pub delivered: bool,
    pub session: checkout_session::Model,
}

pub fn new_txn_id() -> String {
    format!("TXN-{}", Uuid::new_v4().simple())
}

/// Opens sessions and pushes them to the gateway.
///
/// The session row and the publish record are written before the network
/// call, so a crash or timeout mid-call still leaves a pending, recoverable
/// session. Gateway failures are recorded as ack text and never returned.
#[derive(Clone)]
pub struct OutboundPublisher {
    db: Arc<DatabaseConnection>,
    sessions: SessionStore,
    gateway: Arc<dyn TerminalGateway>,
    currency: String,
    device_id: Option<String>,
}

impl OutboundPublisher {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn TerminalGateway>,
        currency: String,
        device_id: Option<String>,
    ) -> Self {
        Self {
            sessions: SessionStore::new(db.clone()),
            db,
            gateway,
            currency,
            device_id,
        }
    }

    #[instrument(skip(self, slice), fields(invoice_number = %slice.invoice_number, attempt = slice.attempt, phase = ?slice.phase))]
    pub async fn open(&self, slice: OpenSlice) -> Result<PublishOutcome, ServiceError> {
        let txn_id = new_txn_id();

        let session = self
            .sessions
            .insert_pending(NewSession {
                invoice_number: slice.invoice_number.clone(),
                txn_id: txn_id.clone(),
                attempt: slice.attempt,
                slice_index: slice.slice_index,
                slice_count: slice.slice_count,
                amount_cents: slice.amount_cents,
                pos_snapshot: slice.snapshot.clone(),
            })
            .await?;

        let request = PublishRequest {
            txn_id: txn_id.clone(),
            invoice_number: slice.invoice_number.clone(),
            amount: PublishRequest::major_units(slice.amount_cents),
            amount_cents: slice.amount_cents,
            currency: self.currency.clone(),
            device_id: self.device_id.clone(),
        };

        self.record_intent(&request, slice.attempt, slice.phase)
            .await?;

        metrics::GATEWAY_PUBLISHES.inc();
        let (ack, delivered) = match self.gateway.publish(&request).await {
            Ok(ack) => (ack.ack_text(), true),
            Err(err) => {
                metrics::GATEWAY_PUBLISH_FAILURES.inc();
                warn!(txn_id = %txn_id, error = %err, "terminal publish failed; session stays pending");
                (format!("error: {}", err), false)
            }
        };

        // The session already exists; losing the ack text must not fail checkout
        if let Err(err) = self.record_ack(&txn_id, &ack, delivered).await {
            error!(txn_id = %txn_id, error = %err, "failed to record publish ack");
        }

        info!(txn_id = %txn_id, delivered, "terminal transaction opened");
        Ok(PublishOutcome {
            txn_id,
            attempt: slice.attempt,
            ack,
            delivered,
            session,
        })
    }

    async fn record_intent(
        &self,
        request: &PublishRequest,
        attempt: i32,
        phase: PublishPhase,
    ) -> Result<(), ServiceError> {
        let record = outbound_publish::ActiveModel {
            txn_id: Set(request.txn_id.clone()),
            invoice_number: Set(request.invoice_number.clone()),
            attempt: Set(attempt),
            phase: Set(phase),
            payload: Set(serde_json::to_value(request)?),
            ack_text: Set(None),
            ack_ok: Set(None),
            created_at: Set(Utc::now()),
            acked_at: Set(None),
        };

        outbound_publish::Entity::insert(record)
            .on_conflict(
                OnConflict::column(outbound_publish::Column::TxnId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;
        Ok(())
    }

    async fn record_ack(&self, txn_id: &str, ack: &str, ok: bool) -> Result<(), ServiceError> {
        outbound_publish::Entity::update_many()
            .set(outbound_publish::ActiveModel {
                ack_text: Set(Some(ack.to_string())),
                ack_ok: Set(Some(ok)),
                acked_at: Set(Some(Utc::now())),
                ..Default::default()
            })
            .filter(outbound_publish::Column::TxnId.eq(txn_id))
            .filter(outbound_publish::Column::AckText.is_null())
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    /// Publish records for an invoice, oldest first.
    pub async fn history(
        &self,
        invoice_number: &str,
    ) -> Result<Vec<outbound_publish::Model>, ServiceError> {
        Ok(outbound_publish::Entity::find()
            .filter(outbound_publish::Column::InvoiceNumber.eq(invoice_number))
            .order_by_asc(outbound_publish::Column::Attempt)
            .all(&*self.db)
            .await?)
    }
}
