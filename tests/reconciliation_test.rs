//! Webhook and poll channels racing over the same session.

mod common;

use bytes::Bytes;
use chrono::Utc;
use common::{line, TestApp};
use pos_checkout::{
    entities::{
        checkout_session::{CheckoutStatus, ResolutionSource},
        sale::{self, FinalizedBy},
        webhook_log,
    },
    services::{
        finalizer::SaleFinalizer,
        session_store::SessionStore,
        webhooks::{InboundWebhook, WebhookDisposition, WebhookVerifier},
    },
};
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::json;

async fn card_checkout(app: &TestApp, invoice_number: &str) {
    app.start(json!({
        "invoice_number": invoice_number,
        "items": [line("JKT-01", "100.00", 1)],
        "tender": "card:visa"
    }))
    .await;
}

fn unsigned(body: serde_json::Value) -> InboundWebhook {
    InboundWebhook {
        body: Bytes::from(body.to_string()),
        timestamp: None,
        signature: None,
    }
}

async fn sale_count(app: &TestApp, invoice_number: &str) -> u64 {
    sale::Entity::find()
        .filter(sale::Column::InvoiceNumber.eq(invoice_number))
        .count(&*app.state.db)
        .await
        .unwrap()
}

#[tokio::test]
async fn concurrent_finalize_writes_one_sale() {
    let app = TestApp::new().await;
    card_checkout(&app, "INV-RACE-1").await;

    let store = SessionStore::new(app.state.db.clone());
    let session = store.latest("INV-RACE-1").await.unwrap().unwrap();
    assert!(store
        .transition(session.id, CheckoutStatus::Approved, ResolutionSource::Webhook)
        .await
        .unwrap());
    let session = store.find(session.id).await.unwrap().unwrap();

    let finalizer = SaleFinalizer::new(app.state.db.clone());
    let (a, b) = tokio::join!(
        finalizer.finalize_session(&session, FinalizedBy::Terminal),
        finalizer.finalize_session(&session, FinalizedBy::Terminal),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a, b);
    assert_eq!(sale_count(&app, "INV-RACE-1").await, 1);

    let stamped = store.find(session.id).await.unwrap().unwrap();
    assert_eq!(stamped.sale_id, Some(a));
}

#[tokio::test]
async fn webhook_and_stale_poll_race_to_one_transition() {
    let app = TestApp::new().await;
    card_checkout(&app, "INV-RACE-2").await;
    app.backdate("INV-RACE-2", 120).await;
    app.gateway.script_state("INV-RACE-2", "APPROVED");

    let webhooks = app.state.services.checkout.webhooks().clone();
    let (webhook, poll) = tokio::join!(
        webhooks.process(unsigned(json!({ "invoice_number": "INV-RACE-2", "state": "APPROVED" }))),
        app.state.services.checkout.status("INV-RACE-2"),
    );
    webhook.unwrap();
    poll.unwrap();

    let sessions = app.sessions("INV-RACE-2").await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, CheckoutStatus::Approved);
    assert!(sessions[0].resolved_by.is_some());
    assert!(sessions[0].sale_id.is_some());
    assert_eq!(sale_count(&app, "INV-RACE-2").await, 1);
    assert_eq!(app.status("INV-RACE-2").await["status"], "approved");
}

#[tokio::test]
async fn duplicate_webhook_is_a_no_op() {
    let app = TestApp::new().await;
    card_checkout(&app, "INV-DUPE-1").await;
    let processor = app.state.services.checkout.webhooks();
    let body = json!({ "invoice_number": "INV-DUPE-1", "state": "APPROVED" });

    let first = processor.process(unsigned(body.clone())).await.unwrap();
    let second = processor.process(unsigned(body)).await.unwrap();

    let (WebhookDisposition::Applied(first), WebhookDisposition::Applied(second)) = (first, second)
    else {
        panic!("both deliveries should match the session");
    };
    assert!(first.applied);
    assert!(!second.applied);
    assert_eq!(first.session.sale_id, second.session.sale_id);
    assert_eq!(sale_count(&app, "INV-DUPE-1").await, 1);

    let logged = webhook_log::Entity::find()
        .filter(webhook_log::Column::InvoiceNumber.eq("INV-DUPE-1"))
        .count(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(logged, 2);
}

#[tokio::test]
async fn late_decline_does_not_undo_approval() {
    let app = TestApp::new().await;
    card_checkout(&app, "INV-LATE-1").await;
    let processor = app.state.services.checkout.webhooks();

    processor
        .process(unsigned(json!({ "invoice_number": "INV-LATE-1", "state": "APPROVED" })))
        .await
        .unwrap();
    processor
        .process(unsigned(json!({ "invoice_number": "INV-LATE-1", "state": "DECLINED", "message": "reversed" })))
        .await
        .unwrap();

    let session = &app.sessions("INV-LATE-1").await[0];
    assert_eq!(session.status, CheckoutStatus::Approved);
    assert_eq!(session.resolved_by, Some(ResolutionSource::Webhook));
    // Latest payload is kept for audit even though the status stays put
    assert_eq!(session.webhook_json.as_ref().unwrap()["state"], "DECLINED");
    assert_eq!(app.status("INV-LATE-1").await["status"], "approved");
}

#[tokio::test]
async fn pending_webhook_only_touches_last_seen() {
    let app = TestApp::new().await;
    card_checkout(&app, "INV-SEEN-1").await;
    let before = app.sessions("INV-SEEN-1").await[0].last_seen_at;

    let disposition = app
        .state
        .services
        .checkout
        .webhooks()
        .process(unsigned(json!({ "invoice_number": "INV-SEEN-1", "state": "waiting for card" })))
        .await
        .unwrap();
    assert!(matches!(disposition, WebhookDisposition::Applied(ref o) if !o.applied));

    let session = &app.sessions("INV-SEEN-1").await[0];
    assert_eq!(session.status, CheckoutStatus::Pending);
    assert!(session.last_seen_at >= before);
    assert!(session.webhook_json.is_some());
}

#[tokio::test]
async fn unknown_txn_falls_back_to_latest_attempt() {
    let app = TestApp::new().await;
    card_checkout(&app, "INV-TXN-1").await;

    app.state
        .services
        .checkout
        .webhooks()
        .process(unsigned(json!({
            "invoice_number": "INV-TXN-1",
            "txn_id": "TXN-NOT-OURS",
            "state": "APPROVED"
        })))
        .await
        .unwrap();
    assert_eq!(sale_count(&app, "INV-TXN-1").await, 1);
}

#[tokio::test]
async fn webhook_for_unknown_invoice_is_logged_and_ignored() {
    let app = TestApp::new().await;
    let disposition = app
        .state
        .services
        .checkout
        .webhooks()
        .process(unsigned(json!({ "invoice_number": "INV-GHOST", "state": "APPROVED" })))
        .await
        .unwrap();
    assert!(matches!(disposition, WebhookDisposition::Unmatched));

    let logged = webhook_log::Entity::find()
        .filter(webhook_log::Column::InvoiceNumber.eq("INV-GHOST"))
        .one(&*app.state.db)
        .await
        .unwrap()
        .expect("audit row");
    assert_eq!(logged.normalized_state, "approved");
    assert_eq!(logged.signature_valid, None);
}

#[tokio::test]
async fn signed_webhooks_are_required_when_secret_configured() {
    let app =
        TestApp::with_config(|cfg| cfg.terminal_webhook_secret = Some("whsec_test".to_string()))
            .await;
    card_checkout(&app, "INV-SIG-1").await;
    let processor = app.state.services.checkout.webhooks();
    let body = json!({ "invoice_number": "INV-SIG-1", "state": "APPROVED" }).to_string();

    let rejected = processor
        .process(InboundWebhook {
            body: Bytes::from(body.clone()),
            timestamp: None,
            signature: None,
        })
        .await
        .unwrap();
    assert!(matches!(rejected, WebhookDisposition::Rejected));
    assert_eq!(app.sessions("INV-SIG-1").await[0].status, CheckoutStatus::Pending);

    let ts = Utc::now().timestamp().to_string();
    let signature = WebhookVerifier::sign("whsec_test", &ts, body.as_bytes());
    let accepted = processor
        .process(InboundWebhook {
            body: Bytes::from(body),
            timestamp: Some(ts),
            signature: Some(signature),
        })
        .await
        .unwrap();
    assert!(matches!(accepted, WebhookDisposition::Applied(ref o) if o.applied));
    assert_eq!(sale_count(&app, "INV-SIG-1").await, 1);

    let flags: Vec<Option<bool>> = webhook_log::Entity::find()
        .filter(webhook_log::Column::InvoiceNumber.eq("INV-SIG-1"))
        .all(&*app.state.db)
        .await
        .unwrap()
        .into_iter()
        .map(|row| row.signature_valid)
        .collect();
    assert!(flags.contains(&Some(false)));
    assert!(flags.contains(&Some(true)));
}

#[tokio::test]
async fn approved_session_without_sale_is_recovered_by_poll() {
    let app = TestApp::new().await;
    card_checkout(&app, "INV-RECOVER-1").await;

    // Simulate a crash between the transition and the sale write
    let store = SessionStore::new(app.state.db.clone());
    let session = store.latest("INV-RECOVER-1").await.unwrap().unwrap();
    store
        .transition(session.id, CheckoutStatus::Approved, ResolutionSource::Poll)
        .await
        .unwrap();
    assert_eq!(sale_count(&app, "INV-RECOVER-1").await, 0);

    let status = app.status("INV-RECOVER-1").await;
    assert_eq!(status["status"], "approved");
    assert_eq!(status["debug"]["source"], "recovered");
    assert_eq!(sale_count(&app, "INV-RECOVER-1").await, 1);
}
