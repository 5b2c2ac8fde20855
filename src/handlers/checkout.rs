use crate::{
    errors::{ApiError, ServiceError},
    handlers::common::{created_response, map_service_error, validate_input, validate_invoice_number},
    services::{
        checkout::{ResendOutcome, SessionSummary, StartCheckoutRequest, StartOutcome},
        force_finalize::{ForceFinalizeOutcome, ForceFinalizeRequest},
        poller::StatusReport,
    },
    ApiResponse, ApiResult, AppState,
};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use tracing::warn;

pub const OPERATOR_KEY_HEADER: &str = "x-operator-key";

pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/start", post(start_checkout))
        .route("/force-finalize", post(force_finalize))
        .route("/:invoice_number/status", get(checkout_status))
        .route("/:invoice_number/resend", post(resend_checkout))
        .route("/:invoice_number/sessions", get(list_sessions))
}

/// Start a checkout: non-card tenders complete immediately, card tenders
/// push the first slice to the terminal.
#[utoipa::path(
    post,
    path = "/api/v1/checkout/start",
    request_body = StartCheckoutRequest,
    responses(
        (status = 201, description = "Checkout started", body = ApiResponse<StartOutcome>),
        (status = 400, description = "Invalid cart or tender", body = crate::errors::ErrorResponse),
        (status = 409, description = "Invoice already has a checkout", body = crate::errors::ErrorResponse)
    ),
    tag = "checkout"
)]
pub async fn start_checkout(
    State(state): State<AppState>,
    Json(payload): Json<StartCheckoutRequest>,
) -> Result<Response, ApiError> {
    validate_input(&payload)?;
    if let Some(invoice) = payload.invoice_number.as_deref() {
        validate_invoice_number(invoice).map_err(map_service_error)?;
    }
    let outcome = state
        .services
        .checkout
        .start(payload)
        .await
        .map_err(map_service_error)?;
    Ok(created_response(ApiResponse::success(outcome)))
}

#[utoipa::path(
    get,
    path = "/api/v1/checkout/:invoice_number/status",
    params(
        ("invoice_number" = String, Path, description = "Invoice number")
    ),
    responses(
        (status = 200, description = "Current checkout status", body = ApiResponse<StatusReport>),
        (status = 400, description = "Malformed invoice number", body = crate::errors::ErrorResponse)
    ),
    tag = "checkout"
)]
pub async fn checkout_status(
    State(state): State<AppState>,
    Path(invoice_number): Path<String>,
) -> ApiResult<StatusReport> {
    validate_invoice_number(&invoice_number)?;
    let report = state.services.checkout.status(&invoice_number).await?;
    Ok(Json(ApiResponse::success(report)))
}

#[utoipa::path(
    post,
    path = "/api/v1/checkout/:invoice_number/resend",
    params(
        ("invoice_number" = String, Path, description = "Invoice number")
    ),
    responses(
        (status = 200, description = "Current slice re-published", body = ApiResponse<ResendOutcome>),
        (status = 404, description = "No session for invoice", body = crate::errors::ErrorResponse),
        (status = 409, description = "Already approved or finalized", body = crate::errors::ErrorResponse)
    ),
    tag = "checkout"
)]
pub async fn resend_checkout(
    State(state): State<AppState>,
    Path(invoice_number): Path<String>,
) -> ApiResult<ResendOutcome> {
    validate_invoice_number(&invoice_number)?;
    let outcome = state.services.checkout.resend(&invoice_number).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

#[utoipa::path(
    get,
    path = "/api/v1/checkout/:invoice_number/sessions",
    params(
        ("invoice_number" = String, Path, description = "Invoice number")
    ),
    responses(
        (status = 200, description = "Charge attempts, oldest first", body = ApiResponse<Vec<SessionSummary>>),
        (status = 404, description = "No session for invoice", body = crate::errors::ErrorResponse)
    ),
    tag = "checkout"
)]
pub async fn list_sessions(
    State(state): State<AppState>,
    Path(invoice_number): Path<String>,
) -> ApiResult<Vec<SessionSummary>> {
    validate_invoice_number(&invoice_number)?;
    let sessions = state.services.checkout.sessions(&invoice_number).await?;
    Ok(Json(ApiResponse::success(sessions)))
}

/// Operator override for a sale the terminal never confirmed.
#[utoipa::path(
    post,
    path = "/api/v1/checkout/force-finalize",
    request_body = ForceFinalizeRequest,
    responses(
        (status = 200, description = "Sale recorded", body = ApiResponse<ForceFinalizeOutcome>),
        (status = 400, description = "Too early, or cart missing", body = crate::errors::ErrorResponse),
        (status = 401, description = "Missing or wrong operator key", body = crate::errors::ErrorResponse),
        (status = 409, description = "Latest attempt declined", body = crate::errors::ErrorResponse)
    ),
    tag = "checkout"
)]
pub async fn force_finalize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ForceFinalizeRequest>,
) -> ApiResult<ForceFinalizeOutcome> {
    check_operator_key(state.config.operator_override_key.as_deref(), &headers)?;
    if let Some(invoice) = payload.invoice_number.as_deref() {
        validate_invoice_number(invoice)?;
    }
    let outcome = state.services.checkout.force_finalize(payload).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

fn check_operator_key(expected: Option<&str>, headers: &HeaderMap) -> Result<(), ServiceError> {
    let Some(expected) = expected.filter(|k| !k.is_empty()) else {
        return Ok(());
    };
    let supplied = headers
        .get(OPERATOR_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if supplied == expected {
        Ok(())
    } else {
        warn!(target: "audit", "force-finalize rejected: bad operator key");
        Err(ServiceError::Unauthorized(
            "operator key required for force-finalize".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn operator_key_is_optional_until_configured() {
        assert!(check_operator_key(None, &HeaderMap::new()).is_ok());
        assert!(check_operator_key(Some(""), &HeaderMap::new()).is_ok());
    }

    #[test]
    fn configured_operator_key_must_match() {
        let mut headers = HeaderMap::new();
        assert!(check_operator_key(Some("s3cret"), &headers).is_err());

        headers.insert(OPERATOR_KEY_HEADER, HeaderValue::from_static("wrong"));
        assert!(check_operator_key(Some("s3cret"), &headers).is_err());

        headers.insert(OPERATOR_KEY_HEADER, HeaderValue::from_static("s3cret"));
        assert!(check_operator_key(Some("s3cret"), &headers).is_ok());
    }
}
