//! Transaction business logic - Purchases, gifts, reversal and restoration.
//!
//! Transactions are append-only: reversal flips `reversed` and never deletes the
//! row. Reversing a concession purchase removes the block it created after
//! snapshotting it onto the transaction, and restoring puts the same block back.
//! Each operation runs in one database transaction with the ledger changes it
//! causes.

use crate::{
    core::{
        ledger::{self, NewBlock},
        package,
        student::require_active_student,
    },
    entities::{
        Checkin, ConcessionBlock, ConcessionBlockModel, Transaction, concession_block,
        transaction::{self, BlockSnapshot, PaymentMethod, RefundStatus, TransactionType},
    },
    errors::{Error, Result},
};
use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::{QueryOrder, Set, TransactionTrait, prelude::*};
use tracing::{info, instrument, warn};

/// Parameters of a new non-refund transaction.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    /// Student the transaction belongs to
    pub student_id: String,
    /// Kind of transaction; refunds go through `core::refund`
    pub transaction_type: TransactionType,
    /// Amount paid
    pub amount_paid: f64,
    /// Payment method, required for every paid type
    pub payment_method: Option<PaymentMethod>,
    /// Human-readable description
    pub description: String,
    /// Package sold
    pub package_id: Option<String>,
    /// Class the payment is for
    pub class_date: Option<NaiveDate>,
    /// Check-in the payment is linked to
    pub checkin_id: Option<String>,
    /// Gateway payment reference for online payments
    pub stripe_payment_intent_id: Option<String>,
    /// When the transaction happened, now if absent
    pub created_at: Option<DateTime<Utc>>,
}

/// Id of a transaction: `{student_id}-{kind}-{unix millis}`.
#[must_use]
pub fn transaction_id(student_id: &str, kind: TransactionType, at: DateTime<Utc>) -> String {
    format!("{student_id}-{}-{}", kind.id_tag(), at.timestamp_millis())
}

const fn requires_payment_method(kind: TransactionType) -> bool {
    matches!(
        kind,
        TransactionType::ConcessionPurchase
            | TransactionType::Casual
            | TransactionType::CasualStudent
            | TransactionType::Purchase
    )
}

fn validate_transaction(new_transaction: &NewTransaction, has_parent: bool) -> Result<()> {
    let kind = new_transaction.transaction_type;

    if !new_transaction.amount_paid.is_finite() || new_transaction.amount_paid < 0.0 {
        return Err(Error::InvalidAmount {
            amount: new_transaction.amount_paid,
        });
    }
    if kind == TransactionType::Refund && !has_parent {
        return Err(Error::Validation {
            message: "A refund must reference the transaction it refunds".to_string(),
        });
    }
    if requires_payment_method(kind) && new_transaction.payment_method.is_none() {
        return Err(Error::InvalidPaymentMethod {
            method: format!("none given for {}", kind.id_tag()),
        });
    }
    Ok(())
}

/// Inserts a transaction row inside the caller's transaction.
///
/// Refund rows must carry a parent id; paid types must carry a payment method.
/// A duplicate id surfaces as [`Error::Conflict`].
pub(crate) async fn insert_transaction<C>(
    db: &C,
    id: String,
    new_transaction: NewTransaction,
    parent_transaction_id: Option<String>,
) -> Result<transaction::Model>
where
    C: ConnectionTrait,
{
    validate_transaction(&new_transaction, parent_transaction_id.is_some())?;
    let kind = new_transaction.transaction_type;

    let model = transaction::ActiveModel {
        id: Set(id),
        student_id: Set(new_transaction.student_id),
        transaction_type: Set(kind),
        amount_paid: Set(new_transaction.amount_paid),
        payment_method: Set(new_transaction.payment_method),
        description: Set(new_transaction.description),
        package_id: Set(new_transaction.package_id),
        class_date: Set(new_transaction.class_date),
        checkin_id: Set(new_transaction.checkin_id),
        parent_transaction_id: Set(parent_transaction_id),
        stripe_payment_intent_id: Set(new_transaction.stripe_payment_intent_id),
        reversed: Set(false),
        reversed_at: Set(None),
        refunded: Set(RefundStatus::None),
        total_refunded: Set(0.0),
        refund_count: Set(0),
        deleted_block_data: Set(None),
        created_at: Set(new_transaction.created_at.unwrap_or_else(Utc::now)),
    };

    model
        .insert(db)
        .await
        .map_err(|e| Error::from_insert(e, "Transaction"))
}

/// Records a purchase, gift or casual payment inside the caller's transaction.
pub(crate) async fn insert_purchase<C>(
    db: &C,
    new_transaction: NewTransaction,
) -> Result<transaction::Model>
where
    C: ConnectionTrait,
{
    if new_transaction.transaction_type == TransactionType::Refund {
        return Err(Error::Validation {
            message: "Refunds are recorded with perform_refund".to_string(),
        });
    }
    validate_transaction(&new_transaction, false)?;
    require_active_student(db, &new_transaction.student_id).await?;

    let at = new_transaction.created_at.unwrap_or_else(Utc::now);
    let id = transaction_id(&new_transaction.student_id, new_transaction.transaction_type, at);
    let new_transaction = NewTransaction {
        created_at: Some(at),
        ..new_transaction
    };

    insert_transaction(db, id, new_transaction, None).await
}

/// Records a purchase, gift or casual payment. Append-only; refunds are rejected.
#[instrument(skip(db, new_transaction), fields(student_id = %new_transaction.student_id, kind = ?new_transaction.transaction_type))]
pub async fn create_purchase_transaction(
    db: &DatabaseConnection,
    new_transaction: NewTransaction,
) -> Result<transaction::Model> {
    let txn = db.begin().await?;
    let result = insert_purchase(&txn, new_transaction).await?;
    txn.commit().await?;

    info!(transaction_id = %result.id, amount = result.amount_paid, "Created transaction");
    Ok(result)
}

/// Finds a transaction by id.
pub async fn get_transaction_by_id<C>(
    db: &C,
    transaction_id: &str,
) -> Result<Option<transaction::Model>>
where
    C: ConnectionTrait,
{
    Transaction::find_by_id(transaction_id)
        .one(db)
        .await
        .map_err(Into::into)
}

pub(crate) async fn require_transaction<C>(
    db: &C,
    transaction_id: &str,
) -> Result<transaction::Model>
where
    C: ConnectionTrait,
{
    get_transaction_by_id(db, transaction_id)
        .await?
        .ok_or_else(|| Error::TransactionNotFound {
            id: transaction_id.to_string(),
        })
}

/// All transactions of a student, newest first.
pub async fn get_transactions_for_student<C>(
    db: &C,
    student_id: &str,
) -> Result<Vec<transaction::Model>>
where
    C: ConnectionTrait,
{
    Transaction::find()
        .filter(transaction::Column::StudentId.eq(student_id))
        .order_by_desc(transaction::Column::CreatedAt)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Transactions created in `[from, to)`, oldest first.
pub async fn get_transactions_between(
    db: &DatabaseConnection,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<transaction::Model>> {
    Transaction::find()
        .filter(transaction::Column::CreatedAt.gte(from))
        .filter(transaction::Column::CreatedAt.lt(to))
        .order_by_asc(transaction::Column::CreatedAt)
        .all(db)
        .await
        .map_err(Into::into)
}

/// A package sale request.
#[derive(Debug, Clone)]
pub struct PackageSale {
    /// Buying student
    pub student_id: String,
    /// Package being sold
    pub package_id: String,
    /// How the package was paid for
    pub payment_method: PaymentMethod,
    /// Purchase time, now if absent
    pub purchase_date: Option<DateTime<Utc>>,
    /// Gateway payment reference for online sales
    pub stripe_payment_intent_id: Option<String>,
}

/// Sells a concession package: records the purchase and creates its block together.
#[instrument(skip(db, sale), fields(student_id = %sale.student_id, package_id = %sale.package_id))]
pub async fn sell_package(
    db: &DatabaseConnection,
    sale: PackageSale,
) -> Result<(transaction::Model, concession_block::Model)> {
    let txn = db.begin().await?;

    let package = package::get_package_by_id(&txn, &sale.package_id)
        .await?
        .ok_or_else(|| Error::PackageNotFound {
            id: sale.package_id.clone(),
        })?;
    if !package.is_active {
        return Err(Error::Validation {
            message: format!("Package {} is no longer sold", package.name),
        });
    }

    let purchase_date = sale.purchase_date.unwrap_or_else(Utc::now);
    let expiry_date = package::expiry_date_for(purchase_date, package.expiry_months)?;

    let purchase = insert_purchase(
        &txn,
        NewTransaction {
            student_id: sale.student_id.clone(),
            transaction_type: TransactionType::ConcessionPurchase,
            amount_paid: package.price,
            payment_method: Some(sale.payment_method),
            description: package.name.clone(),
            package_id: Some(package.id.clone()),
            class_date: None,
            checkin_id: None,
            stripe_payment_intent_id: sale.stripe_payment_intent_id,
            created_at: Some(purchase_date),
        },
    )
    .await?;

    let block = ledger::insert_block(
        &txn,
        NewBlock {
            student_id: sale.student_id,
            package_id: Some(package.id),
            package_name: package.name,
            quantity: package.number_of_classes,
            price: package.price,
            payment_method: Some(sale.payment_method),
            purchase_date,
            expiry_date,
            transaction_id: Some(purchase.id.clone()),
            notes: None,
        },
    )
    .await?;

    txn.commit().await?;
    info!(transaction_id = %purchase.id, block_id = %block.id, "Sold concession package");
    Ok((purchase, block))
}

/// Grants complimentary entries: a zero-amount gift transaction plus its block.
#[instrument(skip(db, reason))]
pub async fn gift_concessions(
    db: &DatabaseConnection,
    student_id: &str,
    quantity: i32,
    expiry_date: DateTime<Utc>,
    reason: &str,
) -> Result<(transaction::Model, concession_block::Model)> {
    let txn = db.begin().await?;
    let now = Utc::now();
    let reason = reason.trim();
    let description = if reason.is_empty() {
        format!("Gift of {quantity} classes")
    } else {
        format!("Gift of {quantity} classes: {reason}")
    };

    let gift = insert_purchase(
        &txn,
        NewTransaction {
            student_id: student_id.to_string(),
            transaction_type: TransactionType::ConcessionGift,
            amount_paid: 0.0,
            payment_method: None,
            description,
            package_id: None,
            class_date: None,
            checkin_id: None,
            stripe_payment_intent_id: None,
            created_at: Some(now),
        },
    )
    .await?;

    let block = ledger::insert_block(
        &txn,
        NewBlock {
            student_id: student_id.to_string(),
            package_id: None,
            package_name: "Gifted Concession".to_string(),
            quantity,
            price: 0.0,
            payment_method: None,
            purchase_date: now,
            expiry_date,
            transaction_id: Some(gift.id.clone()),
            notes: (!reason.is_empty()).then(|| reason.to_string()),
        },
    )
    .await?;

    txn.commit().await?;
    Ok((gift, block))
}

async fn block_for_transaction<C>(
    db: &C,
    transaction_id: &str,
) -> Result<Option<ConcessionBlockModel>>
where
    C: ConnectionTrait,
{
    ConcessionBlock::find()
        .filter(concession_block::Column::TransactionId.eq(transaction_id))
        .one(db)
        .await
        .map_err(Into::into)
}

/// Returns one entry to the snapshot of a block deleted by [`reverse_transaction`].
///
/// Returns `false` when no reversed transaction of the student holds a snapshot
/// of `block_id`.
pub(crate) async fn restore_snapshot_entry<C>(
    db: &C,
    student_id: &str,
    block_id: &str,
) -> Result<bool>
where
    C: ConnectionTrait,
{
    let candidates = Transaction::find()
        .filter(transaction::Column::StudentId.eq(student_id))
        .filter(transaction::Column::Reversed.eq(true))
        .filter(transaction::Column::DeletedBlockData.is_not_null())
        .all(db)
        .await?;

    let Some((holder, mut snapshot)) = candidates.into_iter().find_map(|candidate| {
        let snapshot = candidate.deleted_block_data.clone()?;
        (snapshot.id == block_id).then_some((candidate, snapshot))
    }) else {
        return Ok(false);
    };

    snapshot.remaining_quantity = (snapshot.remaining_quantity + 1).min(snapshot.original_quantity);
    let mut active: transaction::ActiveModel = holder.into();
    active.deleted_block_data = Set(Some(snapshot));
    active.update(db).await?;
    Ok(true)
}

/// Marks a transaction reversed inside the caller's transaction.
pub(crate) async fn mark_reversed<C>(
    db: &C,
    transaction: transaction::Model,
) -> Result<transaction::Model>
where
    C: ConnectionTrait,
{
    let mut active: transaction::ActiveModel = transaction.into();
    active.reversed = Set(true);
    active.reversed_at = Set(Some(Utc::now()));
    active.update(db).await.map_err(Into::into)
}

/// Soft-deletes a transaction.
///
/// Concession purchases and gifts also lose their block: it is snapshotted into
/// `deleted_block_data` and deleted, so the student's balance drops by the
/// block's unused entries. Refunds are reversed with `reverse_refund`, and a
/// transaction with live refunds or a live check-in must have those reversed first.
#[instrument(skip(db))]
pub async fn reverse_transaction(
    db: &DatabaseConnection,
    transaction_id: &str,
) -> Result<transaction::Model> {
    let txn = db.begin().await?;
    let transaction = require_transaction(&txn, transaction_id).await?;

    if transaction.reversed {
        return Err(Error::Validation {
            message: format!("Transaction {transaction_id} is already reversed"),
        });
    }
    if transaction.transaction_type == TransactionType::Refund {
        return Err(Error::Validation {
            message: "Refunds are reversed with reverse_refund".to_string(),
        });
    }
    if transaction.refund_count > 0 {
        return Err(Error::Validation {
            message: format!(
                "Transaction {transaction_id} has {} refunds; reverse them first",
                transaction.refund_count
            ),
        });
    }
    if let Some(checkin_id) = &transaction.checkin_id {
        let live_checkin = Checkin::find_by_id(checkin_id.as_str())
            .one(&txn)
            .await?
            .is_some_and(|checkin| !checkin.reversed);
        if live_checkin {
            return Err(Error::Validation {
                message: format!(
                    "Transaction {transaction_id} pays for check-in {checkin_id}; reverse the check-in instead"
                ),
            });
        }
    }

    let student_id = transaction.student_id.clone();
    let block = match transaction.transaction_type {
        TransactionType::ConcessionPurchase | TransactionType::ConcessionGift => {
            block_for_transaction(&txn, transaction_id).await?
        }
        _ => None,
    };

    let mut active: transaction::ActiveModel = transaction.into();
    active.reversed = Set(true);
    active.reversed_at = Set(Some(Utc::now()));

    if let Some(block) = block {
        info!(
            block_id = %block.id,
            unused = block.remaining_quantity,
            "Removing block of reversed purchase"
        );
        active.deleted_block_data = Set(Some(block.snapshot()));
        block.delete(&txn).await?;
    }

    let reversed = active.update(&txn).await?;
    ledger::recompute_student_balance(&txn, &student_id).await?;
    txn.commit().await?;

    info!(transaction_id, "Reversed transaction");
    Ok(reversed)
}

fn block_from_snapshot(snapshot: BlockSnapshot, transaction_id: &str) -> concession_block::ActiveModel {
    let status = ledger::status_for(snapshot.remaining_quantity, snapshot.expiry_date, Utc::now());
    let is_locked = snapshot.is_locked && status == concession_block::BlockStatus::Expired;

    concession_block::ActiveModel {
        id: Set(snapshot.id),
        student_id: Set(snapshot.student_id),
        package_id: Set(snapshot.package_id),
        package_name: Set(snapshot.package_name),
        original_quantity: Set(snapshot.original_quantity),
        remaining_quantity: Set(snapshot.remaining_quantity.clamp(0, snapshot.original_quantity)),
        price: Set(snapshot.price),
        payment_method: Set(snapshot.payment_method),
        purchase_date: Set(snapshot.purchase_date),
        expiry_date: Set(snapshot.expiry_date),
        status: Set(status),
        is_locked: Set(is_locked),
        transaction_id: Set(Some(transaction_id.to_string())),
        notes: Set(snapshot.notes),
        created_at: Set(snapshot.created_at),
    }
}

/// Undoes [`reverse_transaction`], recreating the block from its snapshot.
///
/// The block comes back under the transaction's current student, which differs
/// from the snapshot when the student was merged in the meantime.
#[instrument(skip(db))]
pub async fn restore_transaction(
    db: &DatabaseConnection,
    transaction_id: &str,
) -> Result<transaction::Model> {
    let txn = db.begin().await?;
    let transaction = require_transaction(&txn, transaction_id).await?;

    if !transaction.reversed {
        return Err(Error::Validation {
            message: format!("Transaction {transaction_id} is not reversed"),
        });
    }
    require_active_student(&txn, &transaction.student_id).await?;

    let student_id = transaction.student_id.clone();
    let snapshot = transaction.deleted_block_data.clone();

    let mut active: transaction::ActiveModel = transaction.into();
    active.reversed = Set(false);
    active.reversed_at = Set(None);
    active.deleted_block_data = Set(None);
    let restored = active.update(&txn).await?;

    if let Some(snapshot) = snapshot {
        let mut block = block_from_snapshot(snapshot, transaction_id);
        block.student_id = Set(student_id.clone());
        let block = block
            .insert(&txn)
            .await
            .map_err(|e| Error::from_insert(e, "Concession block"))?;
        info!(block_id = %block.id, remaining = block.remaining_quantity, "Restored concession block");
    } else if matches!(
        restored.transaction_type,
        TransactionType::ConcessionPurchase | TransactionType::ConcessionGift
    ) {
        warn!(transaction_id, "Restored purchase had no block snapshot");
    }

    ledger::recompute_student_balance(&txn, &student_id).await?;
    txn.commit().await?;

    info!(transaction_id, "Restored transaction");
    Ok(restored)
}
