use crate::{services::checkout::SaleView, ApiResponse, ApiResult, AppState};
use axum::{
    extract::{Path, State},
    response::Json,
    routing::get,
    Router,
};
use uuid::Uuid;

pub fn sales_routes() -> Router<AppState> {
    Router::new().route("/:id", get(get_sale))
}

#[utoipa::path(
    get,
    path = "/api/v1/sales/:id",
    params(
        ("id" = Uuid, Path, description = "Sale ID")
    ),
    responses(
        (status = 200, description = "Sale fetched", body = ApiResponse<SaleView>),
        (status = 404, description = "Sale not found", body = crate::errors::ErrorResponse)
    ),
    tag = "sales"
)]
pub async fn get_sale(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<SaleView> {
    let sale = state.services.checkout.sale(id).await?;
    Ok(Json(ApiResponse::success(sale)))
}
