//! Concession package entity - Catalog of concession blocks for sale.
//!
//! Packages are templates: selling one creates a purchase transaction and a
//! concession block with the package's quantity, price and expiry period.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Concession package database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "concession_packages")]
pub struct Model {
    /// Slug identifier (e.g. "5-class")
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Display name
    pub name: String,
    /// Entries granted by one purchase
    pub number_of_classes: i32,
    /// Price of one purchase
    pub price: f64,
    /// Months from purchase until the block expires
    pub expiry_months: i32,
    /// Whether the package can currently be sold
    pub is_active: bool,
    /// When the package was created
    pub created_at: DateTimeUtc,
    /// When the package was last modified
    pub updated_at: DateTimeUtc,
}

/// `ConcessionPackage` has no relationships with other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
