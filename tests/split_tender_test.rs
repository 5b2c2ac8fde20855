//! Split tenders: card slices are charged one at a time, in order.

mod common;

use bytes::Bytes;
use common::{line, TestApp};
use pos_checkout::{
    entities::{checkout_session::CheckoutStatus, sale},
    errors::ServiceError,
    services::{
        finalizer::SaleFinalizer,
        gateway::GatewayLookup,
        publisher::OutboundPublisher,
        sequencer::SliceSequencer,
        session_store::SessionStore,
        webhooks::InboundWebhook,
    },
};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde_json::{json, Value};

fn seventy_five_split(invoice_number: &str) -> Value {
    json!({
        "invoice_number": invoice_number,
        "items": [line("JKT-01", "75.00", 1)],
        "tender": "split",
        "split": [
            { "method": "cash", "amount": "20.00" },
            { "method": "card:visa", "amount": "30.00" },
            { "method": "card:amex", "amount": "25.00" }
        ]
    })
}

/// Sends `state` for the invoice's newest attempt, addressed by txn id.
async fn answer_latest(app: &TestApp, invoice_number: &str, state: &str) {
    let sessions = app.sessions(invoice_number).await;
    let latest = sessions.iter().max_by_key(|s| s.attempt).expect("a session");
    let body = json!({ "invoice_number": invoice_number, "txn_id": latest.txn_id, "state": state });
    app.state
        .services
        .checkout
        .webhooks()
        .process(InboundWebhook {
            body: Bytes::from(body.to_string()),
            timestamp: None,
            signature: None,
        })
        .await
        .expect("webhook processing");
}

fn pending_count(sessions: &[pos_checkout::entities::checkout_session::Model]) -> usize {
    sessions
        .iter()
        .filter(|s| s.status == CheckoutStatus::Pending)
        .count()
}

#[tokio::test]
async fn slices_are_charged_in_order_and_finalize_once() {
    let app = TestApp::new().await;

    let data = app.start(seventy_five_split("INV-SPLIT-1")).await;
    assert_eq!(data["status"], "waiting_for_terminal");
    assert_eq!(data["slice_index"], 0);
    assert_eq!(data["slice_count"], 2);
    assert_eq!(data["amount_cents"], 3000);

    let published = app.gateway.published_for("INV-SPLIT-1");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].amount, "30.00");

    answer_latest(&app, "INV-SPLIT-1", "APPROVED").await;

    let sessions = app.sessions("INV-SPLIT-1").await;
    assert_eq!(sessions.len(), 2);
    assert_eq!(pending_count(&sessions), 1);
    let second = sessions.iter().find(|s| s.slice_index == 1).unwrap();
    assert_eq!(second.attempt, 2);
    assert_eq!(second.amount_cents, 2500);
    assert_eq!(app.gateway.published_for("INV-SPLIT-1")[1].amount, "25.00");

    // First slice approved but the sale is not complete yet
    let status = app.status("INV-SPLIT-1").await;
    assert_eq!(status["status"], "pending");
    assert_eq!(status["slice_index"], 1);

    answer_latest(&app, "INV-SPLIT-1", "APPROVED").await;

    let status = app.status("INV-SPLIT-1").await;
    assert_eq!(status["status"], "approved");

    let sales = sale::Entity::find()
        .filter(sale::Column::InvoiceNumber.eq("INV-SPLIT-1"))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(sales.len(), 1);
    assert_eq!(sales[0].total_cents, 7500);
    assert_eq!(
        sales[0].payment_method,
        "split(cash $20.00, card:visa $30.00, card:amex $25.00)"
    );
    assert_eq!(sales[0].tender_parts.as_array().unwrap().len(), 3);
    assert_eq!(app.gateway.published_for("INV-SPLIT-1").len(), 2);
}

#[tokio::test]
async fn decline_on_later_slice_halts_the_sale() {
    let app = TestApp::new().await;
    app.start(seventy_five_split("INV-SPLIT-2")).await;

    answer_latest(&app, "INV-SPLIT-2", "APPROVED").await;
    answer_latest(&app, "INV-SPLIT-2", "Declined - do not honor").await;

    let status = app.status("INV-SPLIT-2").await;
    assert_eq!(status["status"], "declined");
    assert_eq!(status["slice_index"], 1);

    let sessions = app.sessions("INV-SPLIT-2").await;
    assert_eq!(sessions.len(), 2);
    assert_eq!(pending_count(&sessions), 0);
    assert!(sessions.iter().all(|s| s.sale_id.is_none()));
    assert_eq!(app.gateway.published_for("INV-SPLIT-2").len(), 2);

    let sales = sale::Entity::find()
        .filter(sale::Column::InvoiceNumber.eq("INV-SPLIT-2"))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert!(sales.is_empty());
}

#[tokio::test]
async fn resend_after_decline_retries_the_same_slice() {
    let app = TestApp::new().await;
    app.start(seventy_five_split("INV-SPLIT-3")).await;
    answer_latest(&app, "INV-SPLIT-3", "DECLINED").await;
    assert_eq!(app.sessions("INV-SPLIT-3").await.len(), 1);

    let outcome = app
        .state
        .services
        .checkout
        .resend("INV-SPLIT-3")
        .await
        .expect("resend after decline");
    assert_eq!(outcome.attempt, 2);

    let sessions = app.sessions("INV-SPLIT-3").await;
    let retry = sessions.iter().find(|s| s.attempt == 2).unwrap();
    assert_eq!(retry.slice_index, 0);
    assert_eq!(retry.amount_cents, 3000);
}

#[tokio::test]
async fn next_slice_is_never_opened_while_current_is_pending() {
    let app = TestApp::new().await;
    app.start(seventy_five_split("INV-SPLIT-4")).await;

    let db = app.state.db.clone();
    let sessions = SessionStore::new(db.clone());
    let publisher = OutboundPublisher::new(
        db.clone(),
        app.gateway.clone(),
        "USD".to_string(),
        None,
    );
    let sequencer = SliceSequencer::new(sessions, publisher, SaleFinalizer::new(db));

    let ctx = sequencer.load("INV-SPLIT-4").await.unwrap().unwrap();
    let err = sequencer.advance(&ctx).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidOperation(_)));

    let sessions = app.sessions("INV-SPLIT-4").await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(app.gateway.published_for("INV-SPLIT-4").len(), 1);
}

#[tokio::test]
async fn split_without_cards_completes_immediately() {
    let app = TestApp::new().await;
    let data = app
        .start(json!({
            "invoice_number": "INV-SPLIT-5",
            "items": [line("MUG-01", "30.00", 1)],
            "tender": "split",
            "split": [
                { "method": "cash", "amount": "10.00" },
                { "method": "wallet", "amount": "20.00" }
            ]
        }))
        .await;
    assert_eq!(data["status"], "completed");
    assert_eq!(data["payment_description"], "split(cash $10.00, wallet $20.00)");
    assert!(app.sessions("INV-SPLIT-5").await.is_empty());
    assert!(app.gateway.published().is_empty());
}

#[tokio::test]
async fn single_card_slice_in_split_finalizes_on_first_approval() {
    let app = TestApp::new().await;
    app.start(json!({
        "invoice_number": "INV-SPLIT-6",
        "items": [line("BAG-01", "50.00", 1)],
        "tender": "split",
        "split": [
            { "method": "cash", "amount": "15.00" },
            { "method": "card", "amount": "35.00" }
        ]
    }))
    .await;

    answer_latest(&app, "INV-SPLIT-6", "approved").await;

    let sessions = app.sessions("INV-SPLIT-6").await;
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].sale_id.is_some());
    assert_eq!(app.status("INV-SPLIT-6").await["status"], "approved");
}

#[tokio::test]
async fn status_is_stable_across_the_whole_sequence() {
    // A duplicate approval for the first slice after the second opened must
    // not open a third session or finalize early.
    let app = TestApp::new().await;
    app.start(seventy_five_split("INV-SPLIT-7")).await;
    let first_txn = app.sessions("INV-SPLIT-7").await[0].txn_id.clone();

    answer_latest(&app, "INV-SPLIT-7", "APPROVED").await;
    let replay = json!({ "invoice_number": "INV-SPLIT-7", "txn_id": first_txn, "state": "APPROVED" });
    app.state
        .services
        .checkout
        .webhooks()
        .process(InboundWebhook {
            body: Bytes::from(replay.to_string()),
            timestamp: None,
            signature: None,
        })
        .await
        .unwrap();

    let sessions = app.sessions("INV-SPLIT-7").await;
    assert_eq!(sessions.len(), 2);
    assert!(sessions.iter().all(|s| s.sale_id.is_none()));
    assert_eq!(app.status("INV-SPLIT-7").await["status"], "pending");
}

#[tokio::test]
async fn stale_poll_answered_with_earlier_slice_does_not_settle_current_one() {
    let app = TestApp::new().await;
    app.start(seventy_five_split("INV-SPLIT-8")).await;
    let first_txn = app.sessions("INV-SPLIT-8").await[0].txn_id.clone();
    answer_latest(&app, "INV-SPLIT-8", "APPROVED").await;

    // The gateway answers the slice 1 lookup with its record of slice 0
    app.backdate("INV-SPLIT-8", 120).await;
    app.gateway.script(
        "INV-SPLIT-8",
        Ok(GatewayLookup {
            endpoint: "/transactions/status".to_string(),
            http_status: 200,
            state: Some("Approved".to_string()),
            raw: json!({ "txn_id": first_txn, "state": "Approved" }),
        }),
    );

    let status = app.status("INV-SPLIT-8").await;
    assert_eq!(status["status"], "pending");
    assert_eq!(status["slice_index"], 1);

    let sessions = app.sessions("INV-SPLIT-8").await;
    let second = sessions.iter().find(|s| s.slice_index == 1).unwrap();
    assert_eq!(second.status, CheckoutStatus::Pending);
    assert!(sessions.iter().all(|s| s.sale_id.is_none()));

    let sales = sale::Entity::find()
        .filter(sale::Column::InvoiceNumber.eq("INV-SPLIT-8"))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert!(sales.is_empty());

    // The real answer for slice 1 still settles the sale
    app.gateway.script_state("INV-SPLIT-8", "Approved");
    assert_eq!(app.status("INV-SPLIT-8").await["status"], "approved");
}

#[tokio::test]
async fn force_finalize_on_split_charges_remaining_slices() {
    let app = TestApp::new().await;
    app.start(seventy_five_split("INV-SPLIT-9")).await;
    app.backdate("INV-SPLIT-9", 600).await;

    let outcome = app
        .state
        .services
        .checkout
        .force_finalize(pos_checkout::services::force_finalize::ForceFinalizeRequest {
            invoice_number: Some("INV-SPLIT-9".to_string()),
            operator: "mgr-07".to_string(),
            reason: Some("terminal rebooted".to_string()),
            items: vec![],
            tender: None,
            split: vec![],
        })
        .await
        .expect("force first slice");
    assert_eq!(outcome.sale_id, None);
    assert_eq!(outcome.next_slice, Some(1));

    let sessions = app.sessions("INV-SPLIT-9").await;
    assert_eq!(sessions.len(), 2);
    assert_eq!(app.gateway.published_for("INV-SPLIT-9").len(), 2);
    assert_eq!(app.gateway.published_for("INV-SPLIT-9")[1].amount, "25.00");
    let sales = sale::Entity::find()
        .filter(sale::Column::InvoiceNumber.eq("INV-SPLIT-9"))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert!(sales.is_empty());
    assert_eq!(app.status("INV-SPLIT-9").await["status"], "pending");

    answer_latest(&app, "INV-SPLIT-9", "APPROVED").await;
    assert_eq!(app.status("INV-SPLIT-9").await["status"], "approved");
}
