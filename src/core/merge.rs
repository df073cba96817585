//! Student merge - Folding a duplicate student record into a surviving one.
//!
//! A merge runs as a sequence of steps, and the last completed step is stored
//! in `merge_operations` after each one. Repointing documents happens in batches
//! that each commit on their own, so an interrupted merge is finished with
//! [`resume_merge`] rather than rolled back. Every step can run again safely.

use crate::{
    core::{
        ledger::{self, MAX_BATCH_SIZE},
        retry::with_retry,
        services::{IdentityProvider, ServiceError},
        student::{get_portal_account, get_student, require_active_student},
    },
    entities::{
        Checkin, ConcessionBlock, MergeOperation, Student, Transaction, User, checkin,
        concession_block,
        merge_operation::{self, FieldSource, MergePlan, MergeStep},
        student, transaction, user,
    },
    errors::{Error, Result},
};
use chrono::Utc;
use sea_orm::{QuerySelect, Set, TransactionTrait, prelude::*, sea_query::Expr};
use tracing::{debug, info, instrument, warn};

/// A merge to perform.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    /// Student that survives
    pub primary_id: String,
    /// Student merged away
    pub deprecated_id: String,
    /// Which student each merged field comes from
    pub plan: MergePlan,
}

/// Rows moved from one student to another.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepointSummary {
    /// Transactions repointed
    pub transactions: u64,
    /// Check-ins repointed
    pub checkins: u64,
    /// Concession blocks repointed
    pub blocks: u64,
}

async fn repoint_batch<E>(
    db: &DatabaseConnection,
    id_column: E::Column,
    student_column: E::Column,
    from: &str,
    to: &str,
) -> Result<u64>
where
    E: EntityTrait,
{
    let ids: Vec<String> = E::find()
        .select_only()
        .column(id_column)
        .filter(student_column.eq(from))
        .limit(MAX_BATCH_SIZE)
        .into_tuple()
        .all(db)
        .await?;

    if ids.is_empty() {
        return Ok(0);
    }

    let txn = db.begin().await?;
    let result = E::update_many()
        .col_expr(student_column, Expr::value(to))
        .filter(id_column.is_in(ids))
        .filter(student_column.eq(from))
        .exec(&txn)
        .await?;
    txn.commit().await?;

    Ok(result.rows_affected)
}

async fn repoint_table<E>(
    db: &DatabaseConnection,
    id_column: E::Column,
    student_column: E::Column,
    from: &str,
    to: &str,
) -> Result<u64>
where
    E: EntityTrait,
{
    let mut moved = 0;
    loop {
        let batch = with_retry("repoint batch", || {
            repoint_batch::<E>(db, id_column, student_column, from, to)
        })
        .await?;
        if batch == 0 {
            break;
        }
        debug!(table = E::default().table_name(), batch, "Repointed batch");
        moved += batch;
    }
    Ok(moved)
}

/// Moves every transaction, check-in and concession block of `from` to `to`.
///
/// Each batch of at most [`MAX_BATCH_SIZE`] rows commits separately. Running it
/// again after it finished moves nothing. The receiving student's balance is
/// recomputed at the end.
#[instrument(skip(db))]
pub async fn repoint_student_documents(
    db: &DatabaseConnection,
    from: &str,
    to: &str,
) -> Result<RepointSummary> {
    let summary = RepointSummary {
        transactions: repoint_table::<Transaction>(
            db,
            transaction::Column::Id,
            transaction::Column::StudentId,
            from,
            to,
        )
        .await?,
        checkins: repoint_table::<Checkin>(
            db,
            checkin::Column::Id,
            checkin::Column::StudentId,
            from,
            to,
        )
        .await?,
        blocks: repoint_table::<ConcessionBlock>(
            db,
            concession_block::Column::Id,
            concession_block::Column::StudentId,
            from,
            to,
        )
        .await?,
    };

    ledger::update_student_balance(db, to).await?;
    info!(
        transactions = summary.transactions,
        checkins = summary.checkins,
        blocks = summary.blocks,
        "Repointed student documents"
    );
    Ok(summary)
}

/// Starts a merge of `deprecated_id` into `primary_id` and runs it to completion.
///
/// On failure the error is stored on the operation and returned; the merge can
/// then be continued with [`resume_merge`].
#[instrument(skip(db, identity, request), fields(primary_id = %request.primary_id, deprecated_id = %request.deprecated_id))]
pub async fn merge_students(
    db: &DatabaseConnection,
    identity: &dyn IdentityProvider,
    request: MergeRequest,
) -> Result<merge_operation::Model> {
    if request.primary_id == request.deprecated_id {
        return Err(Error::Validation {
            message: "Cannot merge a student into itself".to_string(),
        });
    }
    require_active_student(db, &request.primary_id).await?;
    require_active_student(db, &request.deprecated_id).await?;

    let now = Utc::now();
    let operation = merge_operation::ActiveModel {
        primary_id: Set(request.primary_id),
        deprecated_id: Set(request.deprecated_id),
        plan: Set(request.plan),
        step: Set(MergeStep::Started),
        transactions_moved: Set(0),
        checkins_moved: Set(0),
        blocks_moved: Set(0),
        last_error: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await?;

    info!(merge_id = operation.id, "Started student merge");
    run_merge(db, identity, operation).await
}

/// Continues a merge from its last completed step. A completed merge is returned as is.
#[instrument(skip(db, identity))]
pub async fn resume_merge(
    db: &DatabaseConnection,
    identity: &dyn IdentityProvider,
    operation_id: i64,
) -> Result<merge_operation::Model> {
    let operation = get_merge_operation(db, operation_id)
        .await?
        .ok_or(Error::MergeNotFound { id: operation_id })?;

    info!(step = ?operation.step, "Resuming student merge");
    run_merge(db, identity, operation).await
}

/// Finds a merge operation by id.
pub async fn get_merge_operation(
    db: &DatabaseConnection,
    operation_id: i64,
) -> Result<Option<merge_operation::Model>> {
    MergeOperation::find_by_id(operation_id)
        .one(db)
        .await
        .map_err(Into::into)
}

async fn run_merge(
    db: &DatabaseConnection,
    identity: &dyn IdentityProvider,
    mut operation: merge_operation::Model,
) -> Result<merge_operation::Model> {
    loop {
        let outcome = match operation.step {
            MergeStep::Completed => {
                info!(merge_id = operation.id, "Student merge complete");
                return Ok(operation);
            }
            MergeStep::Started => {
                repoint_student_documents(db, &operation.deprecated_id, &operation.primary_id)
                    .await
                    .map(|moved| (MergeStep::DocumentsRepointed, Some(moved)))
            }
            MergeStep::DocumentsRepointed => apply_overrides(db, &operation)
                .await
                .map(|()| (MergeStep::PrimaryUpdated, None)),
            MergeStep::PrimaryUpdated => retire_deprecated(db, &operation)
                .await
                .map(|()| (MergeStep::DeprecatedRetired, None)),
            MergeStep::DeprecatedRetired => clean_up_accounts(db, identity, &operation)
                .await
                .map(|()| (MergeStep::Completed, None)),
        };

        match outcome {
            Ok((next, moved)) => operation = advance(db, operation, next, moved).await?,
            Err(err) => {
                record_failure(db, &operation, &err).await;
                return Err(err);
            }
        }
    }
}

fn add_moved(current: i32, moved: u64) -> i32 {
    current.saturating_add(i32::try_from(moved).unwrap_or(i32::MAX))
}

async fn advance(
    db: &DatabaseConnection,
    operation: merge_operation::Model,
    next: MergeStep,
    moved: Option<RepointSummary>,
) -> Result<merge_operation::Model> {
    debug!(merge_id = operation.id, step = ?next, "Merge step done");

    let mut active: merge_operation::ActiveModel = operation.clone().into();
    if let Some(moved) = moved {
        active.transactions_moved = Set(add_moved(operation.transactions_moved, moved.transactions));
        active.checkins_moved = Set(add_moved(operation.checkins_moved, moved.checkins));
        active.blocks_moved = Set(add_moved(operation.blocks_moved, moved.blocks));
    }
    active.step = Set(next);
    active.last_error = Set(None);
    active.updated_at = Set(Utc::now());
    active.update(db).await.map_err(Into::into)
}

async fn record_failure(db: &DatabaseConnection, operation: &merge_operation::Model, err: &Error) {
    warn!(merge_id = operation.id, step = ?operation.step, error = %err, "Student merge failed");

    let mut active: merge_operation::ActiveModel = operation.clone().into();
    active.last_error = Set(Some(err.to_string()));
    active.updated_at = Set(Utc::now());
    if let Err(record_err) = active.update(db).await {
        warn!(merge_id = operation.id, error = %record_err, "Could not record merge failure");
    }
}

fn pick<T: Clone>(source: FieldSource, primary: &T, deprecated: &T) -> T {
    match source {
        FieldSource::Primary => primary.clone(),
        FieldSource::Deprecated => deprecated.clone(),
    }
}

async fn apply_overrides(db: &DatabaseConnection, operation: &merge_operation::Model) -> Result<()> {
    let txn = db.begin().await?;
    let primary = require_active_student(&txn, &operation.primary_id).await?;
    let deprecated = get_student(&txn, &operation.deprecated_id)
        .await?
        .ok_or_else(|| Error::StudentNotFound {
            id: operation.deprecated_id.clone(),
        })?;
    let plan = &operation.plan;

    // The chosen customer id wins; an empty choice falls back to the other side
    let stripe_customer_id = match plan.stripe_customer {
        FieldSource::Primary => primary
            .stripe_customer_id
            .clone()
            .or_else(|| deprecated.stripe_customer_id.clone()),
        FieldSource::Deprecated => deprecated
            .stripe_customer_id
            .clone()
            .or_else(|| primary.stripe_customer_id.clone()),
    };

    let mut merged_from = primary.merged_from.clone();
    merged_from.push_unique(&deprecated.id);
    for earlier in &deprecated.merged_from.0 {
        merged_from.push_unique(earlier);
    }

    let mut active: student::ActiveModel = primary.clone().into();
    active.email = Set(pick(plan.email, &primary.email, &deprecated.email));
    active.first_name = Set(pick(plan.name, &primary.first_name, &deprecated.first_name));
    active.last_name = Set(pick(plan.name, &primary.last_name, &deprecated.last_name));
    active.phone = Set(pick(plan.phone, &primary.phone, &deprecated.phone));
    active.pronouns = Set(pick(plan.pronouns, &primary.pronouns, &deprecated.pronouns));
    active.stripe_customer_id = Set(stripe_customer_id);
    active.merged_from = Set(merged_from);
    active.updated_at = Set(Utc::now());
    active.update(&txn).await?;

    txn.commit().await?;
    Ok(())
}

async fn retire_deprecated(
    db: &DatabaseConnection,
    operation: &merge_operation::Model,
) -> Result<()> {
    let result = Student::update_many()
        .col_expr(student::Column::Deleted, Expr::value(true))
        .col_expr(
            student::Column::MergedInto,
            Expr::value(operation.primary_id.clone()),
        )
        .col_expr(student::Column::ConcessionBalance, Expr::value(0))
        .col_expr(student::Column::ExpiredConcessions, Expr::value(0))
        .col_expr(student::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(student::Column::Id.eq(operation.deprecated_id.as_str()))
        .exec(db)
        .await?;

    if result.rows_affected == 0 {
        return Err(Error::StudentNotFound {
            id: operation.deprecated_id.clone(),
        });
    }
    Ok(())
}

fn tolerate_missing(result: std::result::Result<(), ServiceError>, uid: &str) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(ServiceError::NotFound(message)) => {
            warn!(uid, %message, "Identity already gone at the provider");
            Ok(())
        }
        Err(err) => Err(err.into_error("Identity provider")),
    }
}

async fn clean_up_accounts(
    db: &DatabaseConnection,
    identity: &dyn IdentityProvider,
    operation: &merge_operation::Model,
) -> Result<()> {
    // The deprecated login goes first so its email is free for the primary
    if let Some(account) = get_portal_account(db, &operation.deprecated_id).await? {
        if let Some(uid) = &account.auth_uid {
            tolerate_missing(identity.delete_user(uid).await, uid)?;
            info!(uid = %uid, "Deleted identity of merged student");
        }
        User::delete_by_id(account.id).exec(db).await?;
    }

    if operation.plan.email != FieldSource::Deprecated {
        return Ok(());
    }

    let primary = get_student(db, &operation.primary_id)
        .await?
        .ok_or_else(|| Error::StudentNotFound {
            id: operation.primary_id.clone(),
        })?;
    let Some(account) = get_portal_account(db, &operation.primary_id).await? else {
        return Ok(());
    };

    if let Some(uid) = &account.auth_uid {
        tolerate_missing(identity.update_email(uid, &primary.email).await, uid)?;
    }
    let mut active: user::ActiveModel = account.into();
    active.email = Set(primary.email);
    active.update(db).await?;

    Ok(())
}
