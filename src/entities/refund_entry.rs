//! Refund entry entity - One line of a transaction's refund history.
//!
//! The history is the single source of truth for a parent transaction's
//! `total_refunded`, `refund_count` and `refunded` fields.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::transaction::PaymentMethod;

/// Refund history database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "refund_entries")]
pub struct Model {
    /// Unique identifier
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Transaction the money was returned against
    pub parent_transaction_id: String,
    /// Refund transaction recording this entry
    #[sea_orm(unique)]
    pub refund_transaction_id: String,
    /// Amount returned
    pub amount: f64,
    /// How the money was returned
    pub method: PaymentMethod,
    /// Reason given by the operator
    pub reason: Option<String>,
    /// When the refund was made
    pub refunded_at: DateTimeUtc,
    /// Set when the refund itself was reversed
    pub reversed: bool,
}

/// Defines relationships between `RefundEntry` and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each entry belongs to its parent transaction
    #[sea_orm(
        belongs_to = "super::transaction::Entity",
        from = "Column::ParentTransactionId",
        to = "super::transaction::Column::Id"
    )]
    Transaction,
}

impl Related<super::transaction::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Transaction.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
