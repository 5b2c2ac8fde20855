use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "POS Checkout API",
        version = "0.3.0",
        description = r#"
# POS Checkout API

Checkout for a point-of-sale counter with card payments taken on an external
payment terminal.

## Flow

1. `POST /checkout/start` totals the cart and classifies the tender. Cash,
   wallet and all-cash splits complete immediately. Card tenders push the first
   card slice to the terminal and return `waiting_for_terminal`.
2. The terminal gateway pushes results to `POST /terminal/webhook`.
3. The client polls `GET /checkout/{invoice_number}/status` until the status is
   `approved` or `declined`. Polls of a stale pending session query the
   gateway directly.
4. A declined slice can be re-sent with `POST /checkout/{invoice_number}/resend`.

Split tenders charge their card slices one after another; the sale is written
once the last slice is approved.

## Error Handling

Errors share one body format:

```json
{
  "error": "Conflict",
  "message": "invoice INV-1 already has a checkout in progress",
  "request_id": "9f0c...",
  "timestamp": "2025-03-01T12:00:00Z"
}
```
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "checkout", description = "Checkout lifecycle"),
        (name = "sales", description = "Finalized sales"),
        (name = "terminal", description = "Payment terminal gateway callbacks")
    ),
    paths(
        crate::handlers::checkout::start_checkout,
        crate::handlers::checkout::checkout_status,
        crate::handlers::checkout::resend_checkout,
        crate::handlers::checkout::list_sessions,
        crate::handlers::checkout::force_finalize,
        crate::handlers::sales::get_sale,
        crate::handlers::terminal_webhooks::terminal_webhook,
    ),
    components(
        schemas(
            crate::ApiResponse<serde_json::Value>,
            crate::services::checkout::StartCheckoutRequest,
            crate::services::checkout::StartOutcome,
            crate::services::checkout::ResendOutcome,
            crate::services::checkout::SessionSummary,
            crate::services::checkout::SaleView,
            crate::services::force_finalize::ForceFinalizeRequest,
            crate::services::force_finalize::ForceFinalizeOutcome,
            crate::services::poller::StatusReport,
            crate::services::poller::PollTrace,
            crate::services::totals::CartLine,
            crate::services::totals::SplitPart,
            crate::entities::checkout_session::CheckoutStatus,
            crate::entities::checkout_session::ResolutionSource,
            crate::entities::sale::FinalizedBy,
            crate::errors::ErrorResponse
        )
    )
)]
pub struct ApiDocV1;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_lists_checkout_paths() {
        let openapi = ApiDocV1::openapi();
        let json = serde_json::to_string_pretty(&openapi).unwrap();
        assert!(json.contains("POS Checkout API"));
        assert!(json.contains("/api/v1/checkout/start"));
        assert!(json.contains("/api/v1/terminal/webhook"));
        assert!(json.contains("StatusReport"));
    }
}
