//! System state entity - Key/value bookkeeping for scheduled maintenance.
//! Holds markers such as the time of the last concession expiry sweep.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One bookkeeping marker
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "system_state")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Marker name, e.g. `"last_expiry_sweep"`
    #[sea_orm(unique)]
    pub key: String,
    /// RFC 3339 timestamp or other plain-text value
    pub value: String,
    /// When the marker was last written
    pub updated_at: DateTimeUtc,
}

/// Markers stand alone
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
