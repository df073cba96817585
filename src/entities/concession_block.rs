//! Concession block entity - A purchased or gifted grant of class entries.
//!
//! `remaining_quantity` only moves through conditional updates in
//! `core::ledger`, which keep it within `0..=original_quantity`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::transaction::{BlockSnapshot, PaymentMethod};

/// Lifecycle state of a concession block
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "kebab-case")]
pub enum BlockStatus {
    /// Usable, not yet past its expiry date
    #[sea_orm(string_value = "active")]
    Active,
    /// Past its expiry date with entries left
    #[sea_orm(string_value = "expired")]
    Expired,
    /// All entries used
    #[sea_orm(string_value = "depleted")]
    Depleted,
}

/// Concession block database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "concession_blocks")]
pub struct Model {
    /// Unique identifier for the block
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Student who owns the entries
    pub student_id: String,
    /// Package the block was sold from, absent for ad hoc grants
    pub package_id: Option<String>,
    /// Package display name (e.g. "5 Class Concession")
    pub package_name: String,
    /// Entries granted
    pub original_quantity: i32,
    /// Entries not yet used
    pub remaining_quantity: i32,
    /// Price paid for the whole block
    pub price: f64,
    /// How the block was paid for, absent for gifts
    pub payment_method: Option<PaymentMethod>,
    /// When the block was bought; FIFO consumption order
    pub purchase_date: DateTimeUtc,
    /// When the block stops being usable
    pub expiry_date: DateTimeUtc,
    /// Lifecycle state
    pub status: BlockStatus,
    /// Manual lock on an expired block, excludes it from use and from balances
    pub is_locked: bool,
    /// Transaction that created the block
    pub transaction_id: Option<String>,
    /// Free-form notes (e.g. gift reason)
    pub notes: Option<String>,
    /// When the block was created
    pub created_at: DateTimeUtc,
}

impl Model {
    /// Copy of the block suitable for restoring it later.
    #[must_use]
    pub fn snapshot(&self) -> BlockSnapshot {
        BlockSnapshot {
            id: self.id.clone(),
            student_id: self.student_id.clone(),
            package_id: self.package_id.clone(),
            package_name: self.package_name.clone(),
            original_quantity: self.original_quantity,
            remaining_quantity: self.remaining_quantity,
            price: self.price,
            payment_method: self.payment_method,
            purchase_date: self.purchase_date,
            expiry_date: self.expiry_date,
            status: self.status,
            is_locked: self.is_locked,
            notes: self.notes.clone(),
            created_at: self.created_at,
        }
    }

    /// Whether no entry of the block has been used.
    #[must_use]
    pub const fn is_unused(&self) -> bool {
        self.remaining_quantity == self.original_quantity
    }
}

/// Defines relationships between `ConcessionBlock` and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each block belongs to one student
    #[sea_orm(
        belongs_to = "super::student::Entity",
        from = "Column::StudentId",
        to = "super::student::Column::Id"
    )]
    Student,
}

impl Related<super::student::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Student.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
