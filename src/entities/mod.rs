pub mod checkout_session;
pub mod outbound_publish;
pub mod sale;
pub mod webhook_log;
