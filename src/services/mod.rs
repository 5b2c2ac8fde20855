// Cart math and tender rules
pub mod totals;
pub mod terminal_status;

// Terminal gateway and persistence
pub mod gateway;
pub mod session_store;
pub mod publisher;

// Reconciliation
pub mod finalizer;
pub mod sequencer;
pub mod reconciler;
pub mod webhooks;
pub mod poller;
pub mod force_finalize;

// Client-facing facade
pub mod checkout;

pub use checkout::CheckoutService;
