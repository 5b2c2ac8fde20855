pub mod checkout;
pub mod common;
pub mod sales;
pub mod terminal_webhooks;

use crate::{config::AppConfig, services::CheckoutService, services::gateway::TerminalGateway};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub checkout: Arc<CheckoutService>,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: &AppConfig,
        gateway: Arc<dyn TerminalGateway>,
    ) -> Self {
        Self {
            checkout: Arc::new(CheckoutService::new(db, gateway, config)),
        }
    }
}
