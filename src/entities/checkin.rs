//! Check-in entity - One student's attendance at one class date.
//!
//! The id is derived from the class date and the student's name, so a second
//! active check-in for the same day collides on the primary key.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::transaction::PaymentMethod;

/// How the class was paid for
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "kebab-case")]
pub enum EntryType {
    /// One entry consumed from a concession block
    #[sea_orm(string_value = "concession")]
    Concession,
    /// Paid at the casual rate
    #[sea_orm(string_value = "casual")]
    Casual,
    /// Paid at the student casual rate
    #[sea_orm(string_value = "casual-student")]
    CasualStudent,
    /// No charge
    #[sea_orm(string_value = "free")]
    Free,
}

impl EntryType {
    /// Whether the entry is paid with money rather than entitlement.
    #[must_use]
    pub const fn is_casual(self) -> bool {
        matches!(self, Self::Casual | Self::CasualStudent)
    }
}

/// Check-in database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "checkins")]
pub struct Model {
    /// `checkin-{YYYY-MM-DD}-{firstname}-{lastname}`
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Student who attended
    pub student_id: String,
    /// Date of the class
    pub class_date: Date,
    /// How the class was paid for
    pub entry_type: EntryType,
    /// Block an entry was consumed from, for concession check-ins
    pub block_id: Option<String>,
    /// Transaction paying for the class, for casual check-ins
    pub transaction_id: Option<String>,
    /// Whether the linked transaction was an existing online payment
    pub prepaid: bool,
    /// Amount paid at check-in
    pub amount_paid: f64,
    /// How the amount was paid
    pub payment_method: Option<PaymentMethod>,
    /// Operator notes
    pub notes: Option<String>,
    /// Soft delete flag
    pub reversed: bool,
    /// When the check-in was reversed
    pub reversed_at: Option<DateTimeUtc>,
    /// When the check-in was recorded
    pub created_at: DateTimeUtc,
}

/// Defines relationships between Checkin and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each check-in belongs to one student
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
