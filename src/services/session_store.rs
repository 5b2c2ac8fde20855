use crate::{
    db::is_unique_violation,
    entities::checkout_session::{self, CheckoutStatus, ResolutionSource},
    errors::ServiceError,
};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Fields needed to open one charge attempt.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub invoice_number: String,
    pub txn_id: String,
    pub attempt: i32,
    pub slice_index: i32,
    pub slice_count: i32,
    pub amount_cents: i64,
    pub pos_snapshot: Value,
}

/// Persistence for checkout sessions. Status leaves `pending` only through
/// [`SessionStore::transition`], and `sale_id` is written only through
/// [`SessionStore::stamp_sale`]; both are conditional single-row updates.
#[derive(Clone)]
pub struct SessionStore {
    db: Arc<DatabaseConnection>,
}

impl SessionStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Inserts a pending session. A clash on `(invoice_number, attempt)`
    /// means another caller already opened this attempt.
    #[instrument(skip(self, new), fields(invoice_number = %new.invoice_number, attempt = new.attempt))]
    pub async fn insert_pending(
        &self,
        new: NewSession,
    ) -> Result<checkout_session::Model, ServiceError> {
        let now = Utc::now();
        let invoice_number = new.invoice_number.clone();
        let attempt = new.attempt;
        let model = checkout_session::ActiveModel {
            id: Set(Uuid::new_v4()),
            invoice_number: Set(new.invoice_number),
            txn_id: Set(new.txn_id),
            attempt: Set(new.attempt),
            slice_index: Set(new.slice_index),
            slice_count: Set(new.slice_count),
            amount_cents: Set(new.amount_cents),
            status: Set(CheckoutStatus::Pending),
            started_at: Set(now),
            last_seen_at: Set(now),
            resolved_at: Set(None),
            resolved_by: Set(None),
            webhook_json: Set(None),
            sale_id: Set(None),
            pos_snapshot: Set(new.pos_snapshot),
        };

        model.insert(&*self.db).await.map_err(|e| {
            if is_unique_violation(&e) {
                ServiceError::Conflict(format!(
                    "attempt {} for invoice {} is already open",
                    attempt, invoice_number
                ))
            } else {
                ServiceError::DatabaseError(e)
            }
        })
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<checkout_session::Model>, ServiceError> {
        Ok(checkout_session::Entity::find_by_id(id)
            .one(&*self.db)
            .await?)
    }

    /// Most recent attempt for the invoice.
    pub async fn latest(
        &self,
        invoice_number: &str,
    ) -> Result<Option<checkout_session::Model>, ServiceError> {
        Ok(checkout_session::Entity::find()
            .filter(checkout_session::Column::InvoiceNumber.eq(invoice_number))
            .order_by_desc(checkout_session::Column::Attempt)
            .one(&*self.db)
            .await?)
    }

    pub async fn by_txn_id(
        &self,
        txn_id: &str,
    ) -> Result<Option<checkout_session::Model>, ServiceError> {
        Ok(checkout_session::Entity::find()
            .filter(checkout_session::Column::TxnId.eq(txn_id))
            .one(&*self.db)
            .await?)
    }

    /// Every attempt for the invoice, oldest first.
    pub async fn list(
        &self,
        invoice_number: &str,
    ) -> Result<Vec<checkout_session::Model>, ServiceError> {
        Ok(checkout_session::Entity::find()
            .filter(checkout_session::Column::InvoiceNumber.eq(invoice_number))
            .order_by_asc(checkout_session::Column::Attempt)
            .all(&*self.db)
            .await?)
    }

    /// Moves a session out of `pending`. Returns false when another path
    /// already resolved it, which callers treat as a no-op.
    #[instrument(skip(self))]
    pub async fn transition(
        &self,
        id: Uuid,
        to: CheckoutStatus,
        source: ResolutionSource,
    ) -> Result<bool, ServiceError> {
        if to == CheckoutStatus::Pending {
            return Ok(false);
        }
        let now = Utc::now();
        let result = checkout_session::Entity::update_many()
            .set(checkout_session::ActiveModel {
                status: Set(to),
                resolved_at: Set(Some(now)),
                resolved_by: Set(Some(source)),
                last_seen_at: Set(now),
                ..Default::default()
            })
            .filter(checkout_session::Column::Id.eq(id))
            .filter(checkout_session::Column::Status.eq(CheckoutStatus::Pending))
            .exec(&*self.db)
            .await?;

        let applied = result.rows_affected == 1;
        debug!(applied, "conditional transition");
        Ok(applied)
    }

    /// Stores the latest gateway payload and touches `last_seen_at`,
    /// whatever the current status.
    pub async fn record_observation(
        &self,
        id: Uuid,
        payload: Option<Value>,
        seen_at: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let mut update = checkout_session::ActiveModel {
            last_seen_at: Set(seen_at),
            ..Default::default()
        };
        if let Some(payload) = payload {
            update.webhook_json = Set(Some(payload));
        }
        checkout_session::Entity::update_many()
            .set(update)
            .filter(checkout_session::Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    /// Sets `sale_id` unless one is already present.
    pub async fn stamp_sale<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        sale_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let result = checkout_session::Entity::update_many()
            .set(checkout_session::ActiveModel {
                sale_id: Set(Some(sale_id)),
                ..Default::default()
            })
            .filter(checkout_session::Column::Id.eq(id))
            .filter(checkout_session::Column::SaleId.is_null())
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }
}
