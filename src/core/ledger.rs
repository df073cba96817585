//! Entitlement ledger - Concession blocks and the derived student balance.
//!
//! Every mutation runs in one database transaction together with the
//! recomputation of the owning student's `concession_balance` and
//! `expired_concessions`, so the derived fields never drift from the blocks.
//! Entry consumption is a conditional update
//! (`UPDATE ... SET remaining_quantity = remaining_quantity - 1 WHERE remaining_quantity > 0`):
//! two check-ins racing for the last entry cannot both succeed, the loser gets
//! [`Error::Conflict`].
//!
//! Functions generic over `C: ConnectionTrait` never open a transaction
//! themselves and are meant to be called inside the caller's transaction.

use crate::{
    core::student::require_active_student,
    entities::{
        ConcessionBlock, Student, SystemState,
        concession_block::{self, BlockStatus},
        student, system_state,
        transaction::PaymentMethod,
    },
    errors::{Error, Result},
};
use chrono::{DateTime, Utc};
use sea_orm::{
    QueryOrder, QuerySelect, Set, TransactionTrait, prelude::*, sea_query::Expr,
};
use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Upper bound on rows written in one batch commit.
pub const MAX_BATCH_SIZE: u64 = 500;

const LAST_EXPIRY_SWEEP_KEY: &str = "last_expiry_sweep";

/// Parameters of a new concession block.
#[derive(Debug, Clone)]
pub struct NewBlock {
    /// Student receiving the entries
    pub student_id: String,
    /// Package the block is sold from
    pub package_id: Option<String>,
    /// Display name of the package
    pub package_name: String,
    /// Number of entries granted
    pub quantity: i32,
    /// Price paid for the whole block
    pub price: f64,
    /// How the block was paid for
    pub payment_method: Option<PaymentMethod>,
    /// When the block was bought
    pub purchase_date: DateTime<Utc>,
    /// When the block stops being usable
    pub expiry_date: DateTime<Utc>,
    /// Transaction that created the block
    pub transaction_id: Option<String>,
    /// Free-form notes
    pub notes: Option<String>,
}

/// Derived balance of a student.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StudentBalance {
    /// Unused entries across active, unlocked blocks
    pub concession_balance: i32,
    /// Unused entries across expired, unlocked blocks
    pub expired_concessions: i32,
}

/// Sums a student's blocks into the derived balance fields.
///
/// Locked blocks count toward neither field; depleted blocks have nothing left.
#[must_use]
pub fn compute_balance(blocks: &[concession_block::Model]) -> StudentBalance {
    blocks
        .iter()
        .filter(|block| !block.is_locked && block.remaining_quantity > 0)
        .fold(StudentBalance::default(), |mut balance, block| {
            match block.status {
                BlockStatus::Active => balance.concession_balance += block.remaining_quantity,
                BlockStatus::Expired => balance.expired_concessions += block.remaining_quantity,
                BlockStatus::Depleted => {}
            }
            balance
        })
}

/// Status a block should have given its quantity and expiry date.
///
/// A block is still active at the instant of its expiry date; the expiry sweep
/// catches it from then on.
#[must_use]
pub fn status_for(remaining_quantity: i32, expiry_date: DateTime<Utc>, now: DateTime<Utc>) -> BlockStatus {
    if remaining_quantity <= 0 {
        BlockStatus::Depleted
    } else if expiry_date < now {
        BlockStatus::Expired
    } else {
        BlockStatus::Active
    }
}

/// Recomputes and stores the derived balance of a student from its blocks.
pub(crate) async fn recompute_student_balance<C>(db: &C, student_id: &str) -> Result<StudentBalance>
where
    C: ConnectionTrait,
{
    let blocks = ConcessionBlock::find()
        .filter(concession_block::Column::StudentId.eq(student_id))
        .filter(concession_block::Column::RemainingQuantity.gt(0))
        .filter(concession_block::Column::IsLocked.eq(false))
        .all(db)
        .await?;
    let balance = compute_balance(&blocks);

    let result = Student::update_many()
        .col_expr(
            student::Column::ConcessionBalance,
            Expr::value(balance.concession_balance),
        )
        .col_expr(
            student::Column::ExpiredConcessions,
            Expr::value(balance.expired_concessions),
        )
        .col_expr(student::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(student::Column::Id.eq(student_id))
        .exec(db)
        .await?;

    if result.rows_affected == 0 {
        return Err(Error::StudentNotFound {
            id: student_id.to_string(),
        });
    }

    debug!(
        student_id,
        concession_balance = balance.concession_balance,
        expired_concessions = balance.expired_concessions,
        "Recomputed student balance"
    );
    Ok(balance)
}

/// Recomputes a student's balance from scratch in its own transaction.
#[instrument(skip(db))]
pub async fn update_student_balance(
    db: &DatabaseConnection,
    student_id: &str,
) -> Result<StudentBalance> {
    let txn = db.begin().await?;
    let balance = recompute_student_balance(&txn, student_id).await?;
    txn.commit().await?;
    Ok(balance)
}

fn validate_new_block(new_block: &NewBlock) -> Result<()> {
    if new_block.quantity <= 0 {
        return Err(Error::Validation {
            message: format!("Block quantity must be positive, got {}", new_block.quantity),
        });
    }
    if !new_block.price.is_finite() || new_block.price < 0.0 {
        return Err(Error::InvalidAmount {
            amount: new_block.price,
        });
    }
    if new_block.expiry_date <= new_block.purchase_date {
        return Err(Error::Validation {
            message: "Block expiry date must be after its purchase date".to_string(),
        });
    }
    Ok(())
}

/// Inserts a block and updates the student balance inside the caller's transaction.
pub(crate) async fn insert_block<C>(db: &C, new_block: NewBlock) -> Result<concession_block::Model>
where
    C: ConnectionTrait,
{
    validate_new_block(&new_block)?;
    require_active_student(db, &new_block.student_id).await?;

    let now = Utc::now();
    let status = status_for(new_block.quantity, new_block.expiry_date, now);
    let block = concession_block::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        student_id: Set(new_block.student_id),
        package_id: Set(new_block.package_id),
        package_name: Set(new_block.package_name),
        original_quantity: Set(new_block.quantity),
        remaining_quantity: Set(new_block.quantity),
        price: Set(new_block.price),
        payment_method: Set(new_block.payment_method),
        purchase_date: Set(new_block.purchase_date),
        expiry_date: Set(new_block.expiry_date),
        status: Set(status),
        is_locked: Set(false),
        transaction_id: Set(new_block.transaction_id),
        notes: Set(new_block.notes),
        created_at: Set(now),
    }
    .insert(db)
    .await?;

    recompute_student_balance(db, &block.student_id).await?;
    info!(
        block_id = %block.id,
        student_id = %block.student_id,
        quantity = block.original_quantity,
        status = ?block.status,
        "Created concession block"
    );
    Ok(block)
}

/// Creates a concession block with all entries unused.
///
/// A block whose expiry date has already passed is created as expired. There
/// is no idempotency key: calling this twice creates two blocks.
#[instrument(skip(db, new_block), fields(student_id = %new_block.student_id))]
pub async fn create_block(
    db: &DatabaseConnection,
    new_block: NewBlock,
) -> Result<concession_block::Model> {
    let txn = db.begin().await?;
    let block = insert_block(&txn, new_block).await?;
    txn.commit().await?;
    Ok(block)
}

/// Finds a block by id.
pub async fn get_block_by_id<C>(db: &C, block_id: &str) -> Result<Option<concession_block::Model>>
where
    C: ConnectionTrait,
{
    ConcessionBlock::find_by_id(block_id)
        .one(db)
        .await
        .map_err(Into::into)
}

async fn require_block<C>(db: &C, block_id: &str) -> Result<concession_block::Model>
where
    C: ConnectionTrait,
{
    get_block_by_id(db, block_id)
        .await?
        .ok_or_else(|| Error::BlockNotFound {
            id: block_id.to_string(),
        })
}

/// All blocks of a student in purchase order.
pub async fn get_blocks_for_student<C>(
    db: &C,
    student_id: &str,
) -> Result<Vec<concession_block::Model>>
where
    C: ConnectionTrait,
{
    ConcessionBlock::find()
        .filter(concession_block::Column::StudentId.eq(student_id))
        .order_by_asc(concession_block::Column::PurchaseDate)
        .order_by_asc(concession_block::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

async fn oldest_usable_block<C>(
    db: &C,
    student_id: &str,
    status: BlockStatus,
) -> Result<Option<concession_block::Model>>
where
    C: ConnectionTrait,
{
    ConcessionBlock::find()
        .filter(concession_block::Column::StudentId.eq(student_id))
        .filter(concession_block::Column::Status.eq(status))
        .filter(concession_block::Column::RemainingQuantity.gt(0))
        .filter(concession_block::Column::IsLocked.eq(false))
        .order_by_asc(concession_block::Column::PurchaseDate)
        .order_by_asc(concession_block::Column::Id)
        .one(db)
        .await
        .map_err(Into::into)
}

/// Selects the block the next entry should come from.
///
/// Oldest purchase first, active blocks before expired ones; expired blocks are
/// only considered with `allow_expired`. Locked blocks are never chosen. Blocks
/// bought at the same instant are ordered by id.
pub async fn get_next_available_block<C>(
    db: &C,
    student_id: &str,
    allow_expired: bool,
) -> Result<Option<concession_block::Model>>
where
    C: ConnectionTrait,
{
    if let Some(block) = oldest_usable_block(db, student_id, BlockStatus::Active).await? {
        return Ok(Some(block));
    }

    if allow_expired {
        return oldest_usable_block(db, student_id, BlockStatus::Expired).await;
    }

    Ok(None)
}

/// Uses one entry of a block inside the caller's transaction.
pub(crate) async fn consume_entry<C>(db: &C, block_id: &str) -> Result<concession_block::Model>
where
    C: ConnectionTrait,
{
    let block = require_block(db, block_id).await?;

    let result = ConcessionBlock::update_many()
        .col_expr(
            concession_block::Column::RemainingQuantity,
            Expr::col(concession_block::Column::RemainingQuantity).sub(1),
        )
        .filter(concession_block::Column::Id.eq(block_id))
        .filter(concession_block::Column::RemainingQuantity.gt(0))
        .filter(concession_block::Column::IsLocked.eq(false))
        .filter(concession_block::Column::Status.ne(BlockStatus::Depleted))
        .exec(db)
        .await?;

    if result.rows_affected == 0 {
        warn!(block_id, "Conditional decrement matched no block");
        return Err(Error::Conflict {
            message: format!("Concession block {block_id} has no usable entries left"),
        });
    }

    ConcessionBlock::update_many()
        .col_expr(
            concession_block::Column::Status,
            Expr::value(BlockStatus::Depleted),
        )
        .filter(concession_block::Column::Id.eq(block_id))
        .filter(concession_block::Column::RemainingQuantity.lte(0))
        .exec(db)
        .await?;

    recompute_student_balance(db, &block.student_id).await?;
    require_block(db, block_id).await
}

/// Uses one entry of a block.
///
/// Fails with [`Error::BlockNotFound`] if the block is gone and with
/// [`Error::Conflict`] if it has nothing left or is locked.
#[instrument(skip(db))]
pub async fn use_block_entry(
    db: &DatabaseConnection,
    block_id: &str,
) -> Result<concession_block::Model> {
    let txn = db.begin().await?;
    let block = consume_entry(&txn, block_id).await?;
    txn.commit().await?;

    debug!(
        block_id,
        remaining = block.remaining_quantity,
        status = ?block.status,
        "Used concession entry"
    );
    Ok(block)
}

/// Gives one used entry back to a block inside the caller's transaction.
pub(crate) async fn restore_entry<C>(db: &C, block_id: &str) -> Result<concession_block::Model>
where
    C: ConnectionTrait,
{
    require_block(db, block_id).await?;

    let result = ConcessionBlock::update_many()
        .col_expr(
            concession_block::Column::RemainingQuantity,
            Expr::col(concession_block::Column::RemainingQuantity).add(1),
        )
        .filter(concession_block::Column::Id.eq(block_id))
        .filter(
            Expr::col(concession_block::Column::RemainingQuantity)
                .lt(Expr::col(concession_block::Column::OriginalQuantity)),
        )
        .exec(db)
        .await?;

    if result.rows_affected == 0 {
        return Err(Error::Conflict {
            message: format!("Concession block {block_id} has no used entries to restore"),
        });
    }

    let block = require_block(db, block_id).await?;
    let block = if block.status == BlockStatus::Depleted {
        let status = status_for(block.remaining_quantity, block.expiry_date, Utc::now());
        let mut active: concession_block::ActiveModel = block.into();
        active.status = Set(status);
        active.update(db).await?
    } else {
        block
    };

    recompute_student_balance(db, &block.student_id).await?;
    Ok(block)
}

/// Gives one used entry back to a block, reviving a depleted block.
#[instrument(skip(db))]
pub async fn restore_block_entry(
    db: &DatabaseConnection,
    block_id: &str,
) -> Result<concession_block::Model> {
    let txn = db.begin().await?;
    let block = restore_entry(&txn, block_id).await?;
    txn.commit().await?;
    Ok(block)
}

async fn set_lock(
    db: &DatabaseConnection,
    block_id: &str,
    locked: bool,
) -> Result<concession_block::Model> {
    let txn = db.begin().await?;
    let block = require_block(&txn, block_id).await?;

    if locked && block.status != BlockStatus::Expired {
        return Err(Error::Validation {
            message: format!("Only expired blocks can be locked; block {block_id} is {:?}", block.status),
        });
    }
    if block.is_locked == locked {
        return Err(Error::Validation {
            message: format!(
                "Concession block {block_id} is already {}",
                if locked { "locked" } else { "unlocked" }
            ),
        });
    }

    let mut active: concession_block::ActiveModel = block.into();
    active.is_locked = Set(locked);
    let block = active.update(&txn).await?;

    recompute_student_balance(&txn, &block.student_id).await?;
    txn.commit().await?;

    info!(block_id, locked, "Changed concession block lock");
    Ok(block)
}

/// Locks an expired block so its unused entries can no longer be used.
pub async fn lock_block(db: &DatabaseConnection, block_id: &str) -> Result<concession_block::Model> {
    set_lock(db, block_id, true).await
}

/// Unlocks a previously locked block.
pub async fn unlock_block(
    db: &DatabaseConnection,
    block_id: &str,
) -> Result<concession_block::Model> {
    set_lock(db, block_id, false).await
}

/// Deletes a block none of whose entries were used.
#[instrument(skip(db))]
pub async fn delete_unused_block(db: &DatabaseConnection, block_id: &str) -> Result<()> {
    let txn = db.begin().await?;
    let block = require_block(&txn, block_id).await?;

    if !block.is_unused() {
        return Err(Error::Validation {
            message: format!(
                "Concession block {block_id} has {} used entries and cannot be deleted",
                block.original_quantity - block.remaining_quantity
            ),
        });
    }

    let student_id = block.student_id.clone();
    block.delete(&txn).await?;
    recompute_student_balance(&txn, &student_id).await?;
    txn.commit().await?;

    info!(block_id, student_id, "Deleted unused concession block");
    Ok(())
}

/// Moves every active block past its expiry date to expired and recomputes
/// the owners' balances.
///
/// Works in batches of at most [`MAX_BATCH_SIZE`] blocks, each committed with
/// the balances of the students it touched. Running it again right away
/// affects nothing. Returns the number of blocks expired.
#[instrument(skip(db))]
pub async fn mark_expired_blocks(db: &DatabaseConnection) -> Result<u64> {
    let now = Utc::now();
    let mut expired = 0;

    loop {
        let txn = db.begin().await?;
        let batch: Vec<(String, String)> = ConcessionBlock::find()
            .select_only()
            .column(concession_block::Column::Id)
            .column(concession_block::Column::StudentId)
            .filter(concession_block::Column::Status.eq(BlockStatus::Active))
            .filter(concession_block::Column::ExpiryDate.lte(now))
            .order_by_asc(concession_block::Column::Id)
            .limit(MAX_BATCH_SIZE)
            .into_tuple()
            .all(&txn)
            .await?;

        if batch.is_empty() {
            record_expiry_sweep(&txn, now).await?;
            txn.commit().await?;
            break;
        }

        let (block_ids, student_ids): (Vec<String>, BTreeSet<String>) = batch.into_iter().unzip();
        let result = ConcessionBlock::update_many()
            .col_expr(
                concession_block::Column::Status,
                Expr::value(BlockStatus::Expired),
            )
            .filter(concession_block::Column::Id.is_in(block_ids))
            .filter(concession_block::Column::Status.eq(BlockStatus::Active))
            .exec(&txn)
            .await?;

        for student_id in &student_ids {
            recompute_student_balance(&txn, student_id).await?;
        }
        txn.commit().await?;

        expired += result.rows_affected;
        debug!(
            batch = result.rows_affected,
            students = student_ids.len(),
            "Expired batch of concession blocks"
        );
    }

    info!(expired, "Expiry sweep finished");
    Ok(expired)
}

async fn record_expiry_sweep<C>(db: &C, at: DateTime<Utc>) -> Result<()>
where
    C: ConnectionTrait,
{
    let value = at.to_rfc3339();
    let now = Utc::now();

    let existing = SystemState::find()
        .filter(system_state::Column::Key.eq(LAST_EXPIRY_SWEEP_KEY))
        .one(db)
        .await?;

    if let Some(state) = existing {
        let mut active_model: system_state::ActiveModel = state.into();
        active_model.value = Set(value);
        active_model.updated_at = Set(now);
        active_model.update(db).await?;
    } else {
        system_state::ActiveModel {
            key: Set(LAST_EXPIRY_SWEEP_KEY.to_string()),
            value: Set(value),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(db)
        .await?;
    }

    Ok(())
}

/// When the expiry sweep last completed, if ever.
pub async fn last_expiry_sweep(db: &DatabaseConnection) -> Result<Option<DateTime<Utc>>> {
    let state = SystemState::find()
        .filter(system_state::Column::Key.eq(LAST_EXPIRY_SWEEP_KEY))
        .one(db)
        .await?;

    state
        .map(|s| {
            DateTime::parse_from_rfc3339(&s.value)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|e| Error::Config {
                    message: format!("Failed to parse last expiry sweep time: {e}"),
                })
        })
        .transpose()
}
