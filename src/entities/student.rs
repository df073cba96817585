//! Student entity - The identity record every other document hangs off.
//!
//! `concession_balance` and `expired_concessions` are derived from the student's
//! concession blocks and are only written by the ledger. Students are never
//! hard-deleted; a merged-away student keeps its row with `deleted = true`.

use sea_orm::FromJsonQueryResult;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// List of student ids stored as a JSON column (used for `merged_from`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct StudentIds(pub Vec<String>);

impl StudentIds {
    /// Appends `id` unless it is already present.
    pub fn push_unique(&mut self, id: &str) {
        if !self.0.iter().any(|existing| existing == id) {
            self.0.push(id.to_string());
        }
    }

    /// Whether `id` is in the list.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.0.iter().any(|existing| existing == id)
    }
}

/// Student database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "students")]
pub struct Model {
    /// Unique identifier for the student
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Given name
    pub first_name: String,
    /// Family name
    pub last_name: String,
    /// Contact email
    pub email: String,
    /// Contact phone number
    pub phone: Option<String>,
    /// Preferred pronouns
    pub pronouns: Option<String>,
    /// Customer id at the payment gateway
    pub stripe_customer_id: Option<String>,
    /// Unused entries across active, unlocked concession blocks
    pub concession_balance: i32,
    /// Unused entries across expired, unlocked concession blocks
    pub expired_concessions: i32,
    /// Soft delete flag, set when the student is merged into another record
    pub deleted: bool,
    /// Surviving student id when this record was merged away
    pub merged_into: Option<String>,
    /// Ids of students that were merged into this one
    #[sea_orm(column_type = "Json")]
    pub merged_from: StudentIds,
    /// When the student registered
    pub created_at: DateTimeUtc,
    /// When the record was last modified
    pub updated_at: DateTimeUtc,
}

impl Model {
    /// "First Last" display name.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Defines relationships between Student and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One student has many concession blocks
    #[sea_orm(has_many = "super::concession_block::Entity")]
    ConcessionBlocks,
    /// One student has many transactions
    #[sea_orm(has_many = "super::transaction::Entity")]
    Transactions,
    /// One student has many check-ins
    #[sea_orm(has_many = "super::checkin::Entity")]
    Checkins,
}

impl Related<super::concession_block::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ConcessionBlocks.def()
    }
}

impl Related<super::transaction::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Transactions.def()
    }
}

impl Related<super::checkin::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Checkins.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
