use crate::{
    entities::{
        checkout_session,
        sale::{self, FinalizedBy},
    },
    errors::ServiceError,
    metrics,
    services::{session_store::SessionStore, totals::PosSnapshot},
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// The only writer of `sales`.
///
/// Concurrent callers for one invoice all return the same id: the unique
/// index on `sales.invoice_number` decides the winner and losers adopt the
/// winner's row.
#[derive(Clone)]
pub struct SaleFinalizer {
    db: Arc<DatabaseConnection>,
    sessions: SessionStore,
}

impl SaleFinalizer {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            sessions: SessionStore::new(db.clone()),
            db,
        }
    }

    /// Finalizes the invoice from its latest session's snapshot.
    #[instrument(skip(self))]
    pub async fn finalize(
        &self,
        invoice_number: &str,
        finalized_by: FinalizedBy,
    ) -> Result<Uuid, ServiceError> {
        let session = self.sessions.latest(invoice_number).await?.ok_or_else(|| {
            ServiceError::NotFound(format!("no checkout session for invoice {}", invoice_number))
        })?;
        self.finalize_session(&session, finalized_by).await
    }

    pub async fn finalize_session(
        &self,
        session: &checkout_session::Model,
        finalized_by: FinalizedBy,
    ) -> Result<Uuid, ServiceError> {
        if let Some(sale_id) = session.sale_id {
            return Ok(sale_id);
        }
        let snapshot = PosSnapshot::from_json(&session.pos_snapshot)?;
        let sale_id = Uuid::new_v4();
        let model = sale_model(sale_id, &session.invoice_number, &snapshot, finalized_by)?;

        let txn = self.db.begin().await?;
        let inserted = model.insert(&txn).await;
        match inserted {
            Ok(_) => {
                if !SessionStore::stamp_sale(&txn, session.id, sale_id).await? {
                    txn.rollback().await?;
                    return self
                        .adopt_winner(&session.invoice_number, Some(session.id), None)
                        .await;
                }
                txn.commit().await?;
                metrics::SALES_FINALIZED.inc();
                info!(
                    invoice_number = %session.invoice_number,
                    attempt = session.attempt,
                    sale_id = %sale_id,
                    finalized_by = ?finalized_by,
                    "sale finalized"
                );
                Ok(sale_id)
            }
            Err(err) => {
                txn.rollback().await?;
                self.adopt_winner(&session.invoice_number, Some(session.id), Some(err))
                    .await
            }
        }
    }

    /// Writes a sale that never went through the terminal (no card tender,
    /// or an operator override with no session on record).
    #[instrument(skip(self, snapshot))]
    pub async fn record_direct(
        &self,
        invoice_number: &str,
        snapshot: &PosSnapshot,
        finalized_by: FinalizedBy,
    ) -> Result<Uuid, ServiceError> {
        if let Some(existing) = self.sale_for_invoice(invoice_number).await? {
            return Ok(existing.id);
        }
        let sale_id = Uuid::new_v4();
        let model = sale_model(sale_id, invoice_number, snapshot, finalized_by)?;
        match model.insert(&*self.db).await {
            Ok(_) => {
                metrics::SALES_FINALIZED.inc();
                info!(invoice_number, sale_id = %sale_id, finalized_by = ?finalized_by, "sale recorded");
                Ok(sale_id)
            }
            Err(err) => self.adopt_winner(invoice_number, None, Some(err)).await,
        }
    }

    /// A losing insert re-reads the winning sale and stamps its own session
    /// with it when that session is still unstamped.
    async fn adopt_winner(
        &self,
        invoice_number: &str,
        session_id: Option<Uuid>,
        cause: Option<DbErr>,
    ) -> Result<Uuid, ServiceError> {
        let winner = match self.sale_for_invoice(invoice_number).await? {
            Some(sale) => sale,
            None => {
                return Err(match cause {
                    Some(err) => ServiceError::DatabaseError(err),
                    None => ServiceError::InternalError(format!(
                        "session for invoice {} already stamped but no sale exists",
                        invoice_number
                    )),
                })
            }
        };

        if let Some(id) = session_id {
            SessionStore::stamp_sale(&*self.db, id, winner.id).await?;
        }
        metrics::FINALIZE_RACES_LOST.inc();
        warn!(invoice_number, sale_id = %winner.id, "finalize race lost; adopting existing sale");
        Ok(winner.id)
    }

    pub async fn sale_for_invoice(
        &self,
        invoice_number: &str,
    ) -> Result<Option<sale::Model>, ServiceError> {
        Ok(sale::Entity::find()
            .filter(sale::Column::InvoiceNumber.eq(invoice_number))
            .one(&*self.db)
            .await?)
    }

    pub async fn sale(&self, id: Uuid) -> Result<Option<sale::Model>, ServiceError> {
        Ok(sale::Entity::find_by_id(id).one(&*self.db).await?)
    }
}

fn sale_model(
    id: Uuid,
    invoice_number: &str,
    snapshot: &PosSnapshot,
    finalized_by: FinalizedBy,
) -> Result<sale::ActiveModel, ServiceError> {
    Ok(sale::ActiveModel {
        id: Set(id),
        invoice_number: Set(invoice_number.to_string()),
        subtotal_cents: Set(snapshot.totals.subtotal_cents),
        discount_cents: Set(snapshot.totals.discount_cents),
        tax_cents: Set(snapshot.totals.tax_cents),
        total_cents: Set(snapshot.totals.total_cents),
        payment_method: Set(snapshot.payment_description.clone()),
        items: Set(serde_json::to_value(&snapshot.items)?),
        tender_parts: Set(serde_json::to_value(&snapshot.parts)?),
        finalized_by: Set(finalized_by),
        created_at: Set(Utc::now()),
    })
}
