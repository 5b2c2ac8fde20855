//! Ordered charging of card slices.
//!
//! A sale's position in its slice sequence is derived from the persisted
//! sessions on every call and carried in [`SaleContext`]; nothing about an
//! in-progress sale lives in process memory between requests.

use crate::{
    entities::{
        checkout_session::{self, CheckoutStatus, ResolutionSource},
        outbound_publish::PublishPhase,
        sale::FinalizedBy,
    },
    errors::ServiceError,
    services::{
        finalizer::SaleFinalizer,
        publisher::{OpenSlice, OutboundPublisher, PublishOutcome},
        session_store::SessionStore,
        totals::{PosSnapshot, SplitSlice},
    },
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceCursor {
    /// Finalized, or halted on a decline
    Idle,
    /// Waiting on (or just approved) the slice at `index`
    Active { index: usize },
}

#[derive(Debug, Clone)]
pub struct SaleContext {
    pub invoice_number: String,
    pub snapshot: PosSnapshot,
    pub latest: checkout_session::Model,
    pub cursor: SliceCursor,
}

impl SaleContext {
    pub fn from_latest(latest: checkout_session::Model) -> Result<Self, ServiceError> {
        let snapshot = PosSnapshot::from_json(&latest.pos_snapshot)?;
        let cursor = if latest.sale_id.is_some() || latest.status == CheckoutStatus::Declined {
            SliceCursor::Idle
        } else {
            SliceCursor::Active {
                index: latest.slice_index.max(0) as usize,
            }
        };
        Ok(Self {
            invoice_number: latest.invoice_number.clone(),
            snapshot,
            latest,
            cursor,
        })
    }

    /// The slice after the cursor, if the cursor is active and one remains.
    pub fn next_slice(&self) -> Option<(usize, &SplitSlice)> {
        match self.cursor {
            SliceCursor::Active { index } => {
                self.snapshot.slice(index + 1).map(|slice| (index + 1, slice))
            }
            SliceCursor::Idle => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ApprovalOutcome {
    Finalized { sale_id: Uuid },
    Advanced(PublishOutcome),
    /// A later attempt already exists for the invoice
    Superseded,
}

/// Who the sale is attributed to: whoever approved its last slice.
fn finalized_by(last: &checkout_session::Model) -> FinalizedBy {
    match last.resolved_by {
        Some(ResolutionSource::Operator) => FinalizedBy::Operator,
        _ => FinalizedBy::Terminal,
    }
}

#[derive(Clone)]
pub struct SliceSequencer {
    sessions: SessionStore,
    publisher: OutboundPublisher,
    finalizer: SaleFinalizer,
}

impl SliceSequencer {
    pub fn new(
        sessions: SessionStore,
        publisher: OutboundPublisher,
        finalizer: SaleFinalizer,
    ) -> Self {
        Self {
            sessions,
            publisher,
            finalizer,
        }
    }

    pub async fn load(&self, invoice_number: &str) -> Result<Option<SaleContext>, ServiceError> {
        match self.sessions.latest(invoice_number).await? {
            Some(latest) => Ok(Some(SaleContext::from_latest(latest)?)),
            None => Ok(None),
        }
    }

    /// Opens the first card slice of a sale.
    #[instrument(skip(self, snapshot))]
    pub async fn begin(
        &self,
        invoice_number: &str,
        snapshot: &PosSnapshot,
    ) -> Result<PublishOutcome, ServiceError> {
        let first = snapshot.slice(0).ok_or_else(|| {
            ServiceError::InvalidOperation("sale has no card slice to charge".to_string())
        })?;
        self.publisher
            .open(OpenSlice {
                invoice_number: invoice_number.to_string(),
                attempt: 1,
                slice_index: 0,
                slice_count: snapshot.slice_count(),
                amount_cents: first.amount_cents,
                snapshot: snapshot.to_json()?,
                phase: PublishPhase::Open,
            })
            .await
    }

    /// Runs after a session's transition to `approved` was applied (or found
    /// applied without a sale). Finalizes on the last slice, otherwise opens
    /// the next one.
    #[instrument(skip(self, session), fields(invoice_number = %session.invoice_number, attempt = session.attempt))]
    pub async fn after_approval(
        &self,
        session: &checkout_session::Model,
    ) -> Result<ApprovalOutcome, ServiceError> {
        let ctx = self.load(&session.invoice_number).await?.ok_or_else(|| {
            ServiceError::NotFound(format!(
                "no checkout session for invoice {}",
                session.invoice_number
            ))
        })?;

        if ctx.latest.attempt > session.attempt {
            if ctx.latest.slice_index > session.slice_index {
                debug!("slice already advanced");
            } else {
                warn!(
                    superseded_by = ctx.latest.attempt,
                    "approval for superseded attempt; operator review needed"
                );
            }
            return Ok(ApprovalOutcome::Superseded);
        }

        if let Some(sale_id) = ctx.latest.sale_id {
            return Ok(ApprovalOutcome::Finalized { sale_id });
        }

        if ctx.latest.is_last_slice() {
            let sale_id = self
                .finalizer
                .finalize_session(&ctx.latest, finalized_by(&ctx.latest))
                .await?;
            return Ok(ApprovalOutcome::Finalized { sale_id });
        }

        match self.advance(&ctx).await {
            Ok(outcome) => Ok(ApprovalOutcome::Advanced(outcome)),
            // Another path opened the next slice first
            Err(ServiceError::Conflict(_)) => Ok(ApprovalOutcome::Superseded),
            Err(err) => Err(err),
        }
    }

    /// Opens slice i+1 at attempt+1. Only legal once slice i is approved.
    pub async fn advance(&self, ctx: &SaleContext) -> Result<PublishOutcome, ServiceError> {
        if ctx.latest.status != CheckoutStatus::Approved {
            return Err(ServiceError::InvalidOperation(format!(
                "slice {} of invoice {} is {}, not approved",
                ctx.latest.slice_index,
                ctx.invoice_number,
                ctx.latest.status.as_str()
            )));
        }
        let (index, slice) = ctx.next_slice().ok_or_else(|| {
            ServiceError::InvalidOperation(format!(
                "invoice {} has no slice after {}",
                ctx.invoice_number, ctx.latest.slice_index
            ))
        })?;

        info!(
            invoice_number = %ctx.invoice_number,
            slice_index = index,
            amount_cents = slice.amount_cents,
            "advancing to next card slice"
        );
        self.publisher
            .open(OpenSlice {
                invoice_number: ctx.invoice_number.clone(),
                attempt: ctx.latest.attempt + 1,
                slice_index: index as i32,
                slice_count: ctx.latest.slice_count,
                amount_cents: slice.amount_cents,
                snapshot: ctx.latest.pos_snapshot.clone(),
                phase: PublishPhase::NextSlice,
            })
            .await
    }

    /// Re-publishes the current slice at a bumped attempt.
    #[instrument(skip(self))]
    pub async fn resend(&self, invoice_number: &str) -> Result<PublishOutcome, ServiceError> {
        let ctx = self.load(invoice_number).await?.ok_or_else(|| {
            ServiceError::NotFound(format!(
                "no checkout session for invoice {}",
                invoice_number
            ))
        })?;

        if ctx.latest.sale_id.is_some()
            || self
                .finalizer
                .sale_for_invoice(invoice_number)
                .await?
                .is_some()
        {
            return Err(ServiceError::Conflict(format!(
                "invoice {} is already finalized",
                invoice_number
            )));
        }
        if ctx.latest.status == CheckoutStatus::Approved {
            return Err(ServiceError::Conflict(format!(
                "attempt {} of invoice {} is already approved",
                ctx.latest.attempt, invoice_number
            )));
        }

        self.publisher
            .open(OpenSlice {
                invoice_number: invoice_number.to_string(),
                attempt: ctx.latest.attempt + 1,
                slice_index: ctx.latest.slice_index,
                slice_count: ctx.latest.slice_count,
                amount_cents: ctx.latest.amount_cents,
                snapshot: ctx.latest.pos_snapshot.clone(),
                phase: PublishPhase::Resend,
            })
            .await
    }
}
