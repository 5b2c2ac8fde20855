//! Vendor state normalization.
//!
//! Terminal vendors report free text ("APPROVED", "Declined - insufficient
//! funds", "Transaction incomplete"). Matching is a case-insensitive substring
//! scan over one ordered table; the first hit wins and anything unmatched is
//! `Pending`.

use crate::entities::checkout_session::CheckoutStatus;
use serde_json::Value;

/// Ordered substring rules, grouped declined, then pending, then approved.
/// Approval roots only match text that names no failure and no outstanding
/// step, so "pending approval" and "unpaid" never settle a sale.
const STATE_RULES: &[(&str, CheckoutStatus)] = &[
    ("not approved", CheckoutStatus::Declined),
    ("unapproved", CheckoutStatus::Declined),
    ("not success", CheckoutStatus::Declined),
    ("unsuccess", CheckoutStatus::Declined),
    ("declin", CheckoutStatus::Declined),
    ("denied", CheckoutStatus::Declined),
    ("reject", CheckoutStatus::Declined),
    ("fail", CheckoutStatus::Declined),
    ("cancel", CheckoutStatus::Declined),
    ("void", CheckoutStatus::Declined),
    ("abort", CheckoutStatus::Declined),
    ("expired", CheckoutStatus::Declined),
    ("incomplete", CheckoutStatus::Pending),
    ("not complete", CheckoutStatus::Pending),
    ("uncomplete", CheckoutStatus::Pending),
    ("unpaid", CheckoutStatus::Pending),
    ("not paid", CheckoutStatus::Pending),
    ("not captur", CheckoutStatus::Pending),
    ("uncaptur", CheckoutStatus::Pending),
    ("pending", CheckoutStatus::Pending),
    ("await", CheckoutStatus::Pending),
    ("waiting", CheckoutStatus::Pending),
    ("processing", CheckoutStatus::Pending),
    ("in progress", CheckoutStatus::Pending),
    ("approv", CheckoutStatus::Approved),
    ("success", CheckoutStatus::Approved),
    ("complete", CheckoutStatus::Approved),
    ("captur", CheckoutStatus::Approved),
    ("paid", CheckoutStatus::Approved),
];

pub fn normalize_state(raw: &str) -> CheckoutStatus {
    let lowered = raw.to_lowercase();
    STATE_RULES
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, status)| *status)
        .unwrap_or(CheckoutStatus::Pending)
}

pub fn normalize_opt(raw: Option<&str>) -> CheckoutStatus {
    raw.map(normalize_state).unwrap_or(CheckoutStatus::Pending)
}

/// Containers vendors nest the interesting fields under.
const NESTED_KEYS: &[&str] = &["data", "transaction", "payload"];

pub const INVOICE_KEYS: &[&str] = &["invoice_number", "invoiceNumber", "invoice", "reference"];
pub const TXN_KEYS: &[&str] = &["txn_id", "transaction_id", "txnId"];
pub const STATE_KEYS: &[&str] = &["state", "status", "result", "transaction_state"];
const MESSAGE_KEYS: &[&str] = &["message", "reason", "response_text"];

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_in(object: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| object.get(*key).and_then(scalar_text))
}

/// First present key at the top level, then under the known containers.
pub fn extract_field(payload: &Value, keys: &[&str]) -> Option<String> {
    first_in(payload, keys).or_else(|| {
        NESTED_KEYS
            .iter()
            .filter_map(|container| payload.get(*container))
            .find_map(|nested| first_in(nested, keys))
    })
}

/// Human-readable reason a client can show next to a decline.
pub fn extract_message(payload: &Value) -> Option<String> {
    extract_field(payload, MESSAGE_KEYS).or_else(|| extract_field(payload, STATE_KEYS))
}
