//! Merge operation entity - Persisted progress of a student merge.
//!
//! A merge touches many rows in several commits. The row records the operator's
//! choices and the last completed step so an interrupted merge can be resumed.

use sea_orm::FromJsonQueryResult;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Which of the two students a merged field is taken from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldSource {
    /// Keep the surviving student's value
    #[default]
    Primary,
    /// Take the merged-away student's value
    Deprecated,
}

/// Operator choices for a merge.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct MergePlan {
    /// Source of the surviving payment gateway customer id
    pub stripe_customer: FieldSource,
    /// Source of the email (also the portal login email)
    pub email: FieldSource,
    /// Source of first and last name
    pub name: FieldSource,
    /// Source of the phone number
    pub phone: FieldSource,
    /// Source of the pronouns
    pub pronouns: FieldSource,
}

/// Last completed step of a merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "kebab-case")]
pub enum MergeStep {
    /// Both students loaded and the plan recorded
    #[sea_orm(string_value = "started")]
    Started,
    /// Transactions, check-ins and blocks point at the primary student
    #[sea_orm(string_value = "documents-repointed")]
    DocumentsRepointed,
    /// Field overrides applied to the primary student
    #[sea_orm(string_value = "primary-updated")]
    PrimaryUpdated,
    /// Deprecated student soft-deleted
    #[sea_orm(string_value = "deprecated-retired")]
    DeprecatedRetired,
    /// Portal account and auth identity cleaned up
    #[sea_orm(string_value = "completed")]
    Completed,
}

/// Merge operation database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "merge_operations")]
pub struct Model {
    /// Unique identifier
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Surviving student
    pub primary_id: String,
    /// Student being merged away
    pub deprecated_id: String,
    /// Operator choices
    #[sea_orm(column_type = "Json")]
    pub plan: MergePlan,
    /// Last completed step
    pub step: MergeStep,
    /// Transactions repointed so far
    pub transactions_moved: i32,
    /// Check-ins repointed so far
    pub checkins_moved: i32,
    /// Concession blocks repointed so far
    pub blocks_moved: i32,
    /// Error from the most recent failed attempt
    pub last_error: Option<String>,
    /// When the merge was started
    pub created_at: DateTimeUtc,
    /// When the merge last progressed
    pub updated_at: DateTimeUtc,
}

/// `MergeOperation` has no relationships with other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
