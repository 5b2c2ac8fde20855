use crate::{
    entities::checkout_session::{self, CheckoutStatus, ResolutionSource},
    errors::ServiceError,
    metrics,
    services::{
        sequencer::{ApprovalOutcome, SliceSequencer},
        session_store::SessionStore,
        terminal_status::{extract_field, TXN_KEYS},
    },
};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument};

/// A normalized gateway observation for one session.
#[derive(Debug, Clone)]
pub struct Observation {
    pub status: CheckoutStatus,
    pub payload: Option<Value>,
    pub source: ResolutionSource,
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// Session as re-read after the update
    pub session: checkout_session::Model,
    /// Whether this observation performed the pending -> resolved transition
    pub applied: bool,
    pub approval: Option<ApprovalOutcome>,
}

/// Applies observations from either channel with identical semantics:
/// store the payload, attempt the conditional transition, then hand approved
/// sessions without a sale to the sequencer.
#[derive(Clone)]
pub struct Reconciler {
    sessions: SessionStore,
    sequencer: SliceSequencer,
}

impl Reconciler {
    pub fn new(sessions: SessionStore, sequencer: SliceSequencer) -> Self {
        Self {
            sessions,
            sequencer,
        }
    }

    pub fn sequencer(&self) -> &SliceSequencer {
        &self.sequencer
    }

    #[instrument(skip(self, session, observation), fields(invoice_number = %session.invoice_number, txn_id = %session.txn_id, observed = ?observation.status))]
    pub async fn apply(
        &self,
        session: &checkout_session::Model,
        observation: Observation,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let session = self
            .named_session(session, observation.payload.as_ref())
            .await?;
        self.sessions
            .record_observation(session.id, observation.payload, Utc::now())
            .await?;

        let mut applied = false;
        if observation.status.is_terminal() {
            applied = self
                .sessions
                .transition(session.id, observation.status, observation.source)
                .await?;
            if applied {
                metrics::SESSION_TRANSITIONS
                    .with_label_values(&[observation.status.as_str(), source_label(observation.source)])
                    .inc();
                info!(to = observation.status.as_str(), "session resolved");
            } else {
                debug!("session already resolved; observation is a no-op");
            }
        }

        let current = self
            .sessions
            .find(session.id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("session {} vanished", session.id)))?;

        let approval = self.continue_if_approved(&current).await?;
        let session = if approval.is_some() {
            self.sessions.find(session.id).await?.unwrap_or(current)
        } else {
            current
        };

        Ok(ReconcileOutcome {
            session,
            applied,
            approval,
        })
    }

    /// Every slice of a split shares the invoice number, so an observation
    /// naming another attempt's txn id belongs to that attempt. Unknown txn ids
    /// (vendor-side references) leave the target unchanged.
    async fn named_session(
        &self,
        session: &checkout_session::Model,
        payload: Option<&Value>,
    ) -> Result<checkout_session::Model, ServiceError> {
        let Some(named) = payload.and_then(|p| extract_field(p, TXN_KEYS)) else {
            return Ok(session.clone());
        };
        if named == session.txn_id {
            return Ok(session.clone());
        }
        match self.sessions.by_txn_id(&named).await? {
            Some(other) if other.invoice_number == session.invoice_number => {
                debug!(
                    named_txn = %named,
                    named_attempt = other.attempt,
                    "observation names another attempt of the invoice"
                );
                Ok(other)
            }
            _ => Ok(session.clone()),
        }
    }

    /// Picks up an approved session that has neither a sale nor a successor.
    pub async fn continue_if_approved(
        &self,
        session: &checkout_session::Model,
    ) -> Result<Option<ApprovalOutcome>, ServiceError> {
        if session.status != CheckoutStatus::Approved || session.sale_id.is_some() {
            return Ok(None);
        }
        Ok(Some(self.sequencer.after_approval(session).await?))
    }
}

fn source_label(source: ResolutionSource) -> &'static str {
    match source {
        ResolutionSource::Webhook => "webhook",
        ResolutionSource::Poll => "poll",
        ResolutionSource::Operator => "operator",
    }
}
