//! Portal account entity - Links an external auth identity to a student.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Portal account database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    /// Unique identifier
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Student the account belongs to
    pub student_id: String,
    /// Login email
    pub email: String,
    /// Stable user id at the identity provider, absent if the account was never activated
    pub auth_uid: Option<String>,
    /// When the account was created
    pub created_at: DateTimeUtc,
}

/// `User` has no relationships with other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
