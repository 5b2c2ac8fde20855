use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Why a transaction was pushed to the terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
pub enum PublishPhase {
    #[sea_orm(string_value = "open")]
    Open,
    #[sea_orm(string_value = "resend")]
    Resend,
    #[sea_orm(string_value = "next_slice")]
    NextSlice,
}

/// Write-ahead record of every request sent to the gateway, keyed by txn id.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "outbound_publish_log")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub txn_id: String,
    pub invoice_number: String,
    pub attempt: i32,
    pub phase: PublishPhase,
    pub payload: Json,
    pub ack_text: Option<String>,
    pub ack_ok: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub acked_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
