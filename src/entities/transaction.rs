//! Transaction entity - Financial and non-financial events for a student.
//!
//! Transactions are never deleted. Reversal sets `reversed`; refunds are tracked
//! through `refunded`, `total_refunded` and `refund_count`, which are always
//! recomputed from the `refund_entries` rows pointing at this transaction.
//! A reversed concession purchase keeps a snapshot of the block it removed in
//! `deleted_block_data` so it can be restored.

use sea_orm::FromJsonQueryResult;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::concession_block::BlockStatus;

/// Kind of transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "kebab-case")]
pub enum TransactionType {
    /// Sale of a concession package
    #[sea_orm(string_value = "concession-purchase")]
    ConcessionPurchase,
    /// Complimentary concession entries
    #[sea_orm(string_value = "concession-gift")]
    ConcessionGift,
    /// Single class at the standard rate
    #[sea_orm(string_value = "casual")]
    Casual,
    /// Single class at the student rate
    #[sea_orm(string_value = "casual-student")]
    CasualStudent,
    /// Money returned against a parent transaction
    #[sea_orm(string_value = "refund")]
    Refund,
    /// Online purchase made ahead of a class
    #[sea_orm(string_value = "purchase")]
    Purchase,
}

impl TransactionType {
    /// Short form used when building transaction ids.
    #[must_use]
    pub const fn id_tag(self) -> &'static str {
        match self {
            Self::ConcessionPurchase => "concession",
            Self::ConcessionGift => "gift",
            Self::Casual => "casual",
            Self::CasualStudent => "casual-student",
            Self::Refund => "refund",
            Self::Purchase => "purchase",
        }
    }
}

/// How money moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "kebab-case")]
pub enum PaymentMethod {
    /// Cash at the desk
    #[sea_orm(string_value = "cash")]
    Cash,
    /// Card terminal at the desk
    #[sea_orm(string_value = "eftpos")]
    Eftpos,
    /// Direct bank transfer
    #[sea_orm(string_value = "bank-transfer")]
    BankTransfer,
    /// Online card payment through the payment gateway
    #[sea_orm(string_value = "stripe")]
    Stripe,
}

impl PaymentMethod {
    /// Stored/display form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::Eftpos => "eftpos",
            Self::BankTransfer => "bank-transfer",
            Self::Stripe => "stripe",
        }
    }
}

/// Refund state of a transaction, derived from its refund history
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "kebab-case")]
pub enum RefundStatus {
    /// Nothing refunded
    #[sea_orm(string_value = "none")]
    None,
    /// Some but not all of the amount refunded
    #[sea_orm(string_value = "partial")]
    Partial,
    /// The whole amount refunded
    #[sea_orm(string_value = "full")]
    Full,
}

/// Copy of a concession block taken before a purchase reversal deleted it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct BlockSnapshot {
    /// Id of the deleted block, reused on restore
    pub id: String,
    /// Owning student at the time of deletion
    pub student_id: String,
    /// Package the block was sold from
    pub package_id: Option<String>,
    /// Package display name
    pub package_name: String,
    /// Entries granted
    pub original_quantity: i32,
    /// Entries left when the block was deleted
    pub remaining_quantity: i32,
    /// Price paid for the block
    pub price: f64,
    /// How the block was paid for
    pub payment_method: Option<PaymentMethod>,
    /// When the block was bought
    pub purchase_date: DateTimeUtc,
    /// When the block stops being usable
    pub expiry_date: DateTimeUtc,
    /// Lifecycle state at deletion
    pub status: BlockStatus,
    /// Manual lock flag at deletion
    pub is_locked: bool,
    /// Free-form notes
    pub notes: Option<String>,
    /// When the block was first created
    pub created_at: DateTimeUtc,
}

/// Transaction database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "transactions")]
pub struct Model {
    /// Unique identifier, derived from the student id, kind and creation time
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Student this transaction belongs to
    pub student_id: String,
    /// Kind of transaction
    pub transaction_type: TransactionType,
    /// Amount of money involved (always non-negative; refunds record the amount returned)
    pub amount_paid: f64,
    /// Payment method, absent for gifts
    pub payment_method: Option<PaymentMethod>,
    /// Human-readable description
    pub description: String,
    /// Package sold, for concession purchases and gifts
    pub package_id: Option<String>,
    /// Class the payment is for, for casual entries
    pub class_date: Option<Date>,
    /// Check-in this transaction is linked to
    pub checkin_id: Option<String>,
    /// Original transaction, for refunds
    pub parent_transaction_id: Option<String>,
    /// Gateway payment reference for online payments
    pub stripe_payment_intent_id: Option<String>,
    /// Soft delete flag
    pub reversed: bool,
    /// When the transaction was reversed
    pub reversed_at: Option<DateTimeUtc>,
    /// Refund state derived from the refund history
    pub refunded: RefundStatus,
    /// Sum of non-reversed refunds
    pub total_refunded: f64,
    /// Number of non-reversed refunds
    pub refund_count: i32,
    /// Snapshot of the concession block removed when this purchase was reversed
    #[sea_orm(column_type = "Json", nullable)]
    pub deleted_block_data: Option<BlockSnapshot>,
    /// When the transaction happened
    pub created_at: DateTimeUtc,
}

impl Model {
    /// Amount still available to refund.
    #[must_use]
    pub fn refundable_amount(&self) -> f64 {
        (self.amount_paid - self.total_refunded).max(0.0)
    }
}

/// Defines relationships between Transaction and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each transaction belongs to one student
    #[sea_orm(
        belongs_to = "super::student::Entity",
        from = "Column::StudentId",
        to = "super::student::Column::Id"
    )]
    Student,
    /// A transaction can carry many refund history entries
    #[sea_orm(has_many = "super::refund_entry::Entity")]
    RefundEntries,
}

impl Related<super::student::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Student.def()
    }
}

impl Related<super::refund_entry::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RefundEntries.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
