use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Audit flag recording which path wrote the sale.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum FinalizedBy {
    /// Terminal approval observed via webhook or poll
    #[sea_orm(string_value = "terminal")]
    Terminal,
    /// No card involved
    #[sea_orm(string_value = "direct")]
    Direct,
    /// Operator forced an existing session through
    #[sea_orm(string_value = "operator")]
    Operator,
    /// Operator recorded a sale for which no session was ever opened
    #[sea_orm(string_value = "operator_without_session")]
    OperatorWithoutSession,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sales")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Uuid")]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub invoice_number: String,

    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    #[sea_orm(column_type = "Text")]
    pub payment_method: String,
    pub items: Json,
    pub tender_parts: Json,
    pub finalized_by: FinalizedBy,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
