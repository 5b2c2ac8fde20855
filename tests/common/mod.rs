#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use pos_checkout::{
    config::AppConfig,
    db,
    entities::checkout_session,
    services::gateway::{GatewayAck, GatewayError, GatewayLookup, PublishRequest, TerminalGateway},
    AppState,
};
use rust_decimal::Decimal;
use sea_orm::{
    ColumnTrait, ConnectOptions, Database, EntityTrait, QueryFilter, Set,
};
use serde_json::{json, Value};
use tower::ServiceExt;

/// In-process gateway: records every publish and answers lookups from a
/// per-invoice script.
#[derive(Default)]
pub struct ScriptedGateway {
    published: Mutex<Vec<PublishRequest>>,
    lookups: Mutex<HashMap<String, VecDeque<Result<GatewayLookup, GatewayError>>>>,
    lookup_calls: Mutex<Vec<String>>,
    lookup_delay: Mutex<Option<Duration>>,
    fail_publish: Mutex<bool>,
}

impl ScriptedGateway {
    pub fn published(&self) -> Vec<PublishRequest> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_for(&self, invoice_number: &str) -> Vec<PublishRequest> {
        self.published()
            .into_iter()
            .filter(|p| p.invoice_number == invoice_number)
            .collect()
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.lock().unwrap().len()
    }

    /// Queue a vendor state for the next lookup of `invoice_number`.
    pub fn script_state(&self, invoice_number: &str, state: &str) {
        let raw = json!({ "invoice_number": invoice_number, "state": state });
        self.script(
            invoice_number,
            Ok(GatewayLookup {
                endpoint: "/transactions/status".to_string(),
                http_status: 200,
                state: Some(state.to_string()),
                raw,
            }),
        );
    }

    pub fn script(&self, invoice_number: &str, result: Result<GatewayLookup, GatewayError>) {
        self.lookups
            .lock()
            .unwrap()
            .entry(invoice_number.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn delay_lookups(&self, delay: Duration) {
        *self.lookup_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_publishes(&self, fail: bool) {
        *self.fail_publish.lock().unwrap() = fail;
    }
}

#[async_trait]
impl TerminalGateway for ScriptedGateway {
    async fn publish(&self, request: &PublishRequest) -> Result<GatewayAck, GatewayError> {
        self.published.lock().unwrap().push(request.clone());
        if *self.fail_publish.lock().unwrap() {
            return Err(GatewayError::Transport("connection refused".to_string()));
        }
        Ok(GatewayAck {
            http_status: 202,
            body: format!("queued {}", request.txn_id),
        })
    }

    async fn lookup(
        &self,
        invoice_number: &str,
        _txn_id: &str,
    ) -> Result<GatewayLookup, GatewayError> {
        self.lookup_calls
            .lock()
            .unwrap()
            .push(invoice_number.to_string());
        let delay = *self.lookup_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .lookups
            .lock()
            .unwrap()
            .get_mut(invoice_number)
            .and_then(|queue| queue.pop_front());
        next.unwrap_or_else(|| {
            Ok(GatewayLookup {
                endpoint: "/transactions/status".to_string(),
                http_status: 200,
                state: Some("processing".to_string()),
                raw: json!({ "state": "processing" }),
            })
        })
    }
}

/// Application state backed by an in-memory SQLite database and a scripted
/// gateway.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<ScriptedGateway>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(configure: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.default_tax_rate = Decimal::ZERO;
        cfg.gateway_lookup_timeout_secs = 1;
        configure(&mut cfg);

        // One connection: every handle must see the same in-memory database
        let mut opt = ConnectOptions::new(cfg.database_url.clone());
        opt.max_connections(1)
            .min_connections(1)
            .sqlx_logging(false);
        let pool = Database::connect(opt)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let gateway = Arc::new(ScriptedGateway::default());
        let state = AppState::new(Arc::new(pool), cfg, gateway.clone());

        let router = Router::new()
            .nest("/api/v1", pos_checkout::api_v1_routes())
            .layer(axum::middleware::from_fn(
                pos_checkout::middleware_helpers::request_id_middleware,
            ))
            .with_state(state.clone());

        Self {
            router,
            state,
            gateway,
        }
    }

    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
        self.request_with_headers(method, uri, body, &[]).await
    }

    pub async fn request_with_headers(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };
        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn raw_post(&self, uri: &str, body: &'static [u8]) -> Response {
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Start a checkout over HTTP and return the `data` envelope.
    pub async fn start(&self, payload: Value) -> Value {
        let response = self
            .request(Method::POST, "/api/v1/checkout/start", Some(payload))
            .await;
        assert_eq!(response.status(), 201, "start checkout failed");
        response_json(response).await["data"].clone()
    }

    pub async fn status(&self, invoice_number: &str) -> Value {
        let response = self
            .request(
                Method::GET,
                &format!("/api/v1/checkout/{}/status", invoice_number),
                None,
            )
            .await;
        assert_eq!(response.status(), 200, "status poll failed");
        response_json(response).await["data"].clone()
    }

    pub async fn sessions(&self, invoice_number: &str) -> Vec<checkout_session::Model> {
        checkout_session::Entity::find()
            .filter(checkout_session::Column::InvoiceNumber.eq(invoice_number))
            .all(&*self.state.db)
            .await
            .expect("query sessions")
    }

    /// Make every session of the invoice look `secs` seconds older.
    pub async fn backdate(&self, invoice_number: &str, secs: i64) {
        checkout_session::Entity::update_many()
            .set(checkout_session::ActiveModel {
                started_at: Set(Utc::now() - chrono::Duration::seconds(secs)),
                ..Default::default()
            })
            .filter(checkout_session::Column::InvoiceNumber.eq(invoice_number))
            .exec(&*self.state.db)
            .await
            .expect("backdate sessions");
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

pub fn line(sku: &str, price: &str, quantity: u32) -> Value {
    json!({ "sku": sku, "title": sku, "unit_price": price, "quantity": quantity, "taxable": false })
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..40 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
