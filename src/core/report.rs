//! Report generation business logic.
//!
//! Statements, takings summaries and attendance lists. All functions return
//! structured data; formatting helpers render single lines for plain-text output.

use crate::{
    core::{checkin, ledger, student::get_student, transaction as reconciliation},
    entities::{
        Checkin, Student, checkin as checkin_entity, concession_block,
        student,
        transaction::{self, TransactionType},
    },
    errors::{Error, Result},
};
use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::{QueryOrder, prelude::*};
use serde::Serialize;
use std::collections::BTreeMap;

/// Everything the desk needs to answer "what does this student have left?".
#[derive(Debug, Clone, Serialize)]
pub struct StudentStatement {
    /// The student, with stored balances
    pub student: student::Model,
    /// Unused entries in active blocks
    pub concession_balance: i32,
    /// Unused entries in expired, unlocked blocks
    pub expired_concessions: i32,
    /// All blocks, oldest purchase first
    pub blocks: Vec<concession_block::Model>,
    /// Most recent transactions, newest first
    pub recent_transactions: Vec<transaction::Model>,
    /// Most recent check-ins, latest class first
    pub recent_checkins: Vec<checkin_entity::Model>,
}

/// Builds a statement for a student, merged-away students included.
///
/// # Arguments
/// * `db` - Database connection
/// * `student_id` - Student to report on
/// * `limit` - Maximum number of recent transactions and check-ins (default 10)
pub async fn generate_student_statement(
    db: &DatabaseConnection,
    student_id: &str,
    limit: Option<u64>,
) -> Result<StudentStatement> {
    let student = get_student(db, student_id)
        .await?
        .ok_or_else(|| Error::StudentNotFound {
            id: student_id.to_string(),
        })?;

    let limit = usize::try_from(limit.unwrap_or(10)).unwrap_or(usize::MAX);
    let blocks = ledger::get_blocks_for_student(db, student_id).await?;
    let recent_transactions = reconciliation::get_transactions_for_student(db, student_id)
        .await?
        .into_iter()
        .take(limit)
        .collect();
    let recent_checkins = checkin::get_checkins_for_student(db, student_id)
        .await?
        .into_iter()
        .take(limit)
        .collect();

    Ok(StudentStatement {
        concession_balance: student.concession_balance,
        expired_concessions: student.expired_concessions,
        student,
        blocks,
        recent_transactions,
        recent_checkins,
    })
}

/// Money taken and returned over a period. Reversed records are left out.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransactionSummary {
    /// Start of the period, inclusive
    pub from: Option<DateTime<Utc>>,
    /// End of the period, exclusive
    pub to: Option<DateTime<Utc>>,
    /// Money taken
    pub gross: f64,
    /// Money returned
    pub refunds: f64,
    /// `gross - refunds`
    pub net: f64,
    /// Net amount per payment method
    pub by_method: BTreeMap<String, f64>,
    /// Number of paying transactions
    pub transaction_count: usize,
    /// Number of refunds
    pub refund_count: usize,
}

/// Folds transactions into a summary. The period bounds are left empty.
#[must_use]
pub fn summarize(transactions: &[transaction::Model]) -> TransactionSummary {
    let mut summary = TransactionSummary::default();

    for transaction in transactions.iter().filter(|t| !t.reversed) {
        let method = transaction
            .payment_method
            .map_or("none", |method| method.as_str())
            .to_string();

        if transaction.transaction_type == TransactionType::Refund {
            summary.refunds += transaction.amount_paid;
            summary.refund_count += 1;
            *summary.by_method.entry(method).or_default() -= transaction.amount_paid;
        } else if transaction.amount_paid > 0.0 {
            summary.gross += transaction.amount_paid;
            summary.transaction_count += 1;
            *summary.by_method.entry(method).or_default() += transaction.amount_paid;
        }
    }

    summary.net = summary.gross - summary.refunds;
    summary
}

/// Summarises takings for transactions created in `[from, to)`.
pub async fn summarize_transactions(
    db: &DatabaseConnection,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<TransactionSummary> {
    if to <= from {
        return Err(Error::Validation {
            message: "Report period must end after it starts".to_string(),
        });
    }

    let transactions = reconciliation::get_transactions_between(db, from, to).await?;
    Ok(TransactionSummary {
        from: Some(from),
        to: Some(to),
        ..summarize(&transactions)
    })
}

/// One line of an attendance list.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceEntry {
    /// The check-in
    pub checkin: checkin_entity::Model,
    /// Attending student, if still on record
    pub student: Option<student::Model>,
}

/// Active check-ins of a class date with their students, in arrival order.
pub async fn attendance_for_date(
    db: &DatabaseConnection,
    class_date: NaiveDate,
) -> Result<Vec<AttendanceEntry>> {
    let rows = Checkin::find()
        .filter(checkin_entity::Column::ClassDate.eq(class_date))
        .filter(checkin_entity::Column::Reversed.eq(false))
        .order_by_asc(checkin_entity::Column::CreatedAt)
        .find_also_related(Student)
        .all(db)
        .await?;

    Ok(rows
        .into_iter()
        .map(|(checkin, student)| AttendanceEntry { checkin, student })
        .collect())
}

/// Renders any report as pretty-printed JSON for export.
pub fn to_json<T: Serialize>(report: &T) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

/// Formats an amount with a leading sign for refunds.
#[must_use]
pub fn format_amount(amount: f64, is_refund: bool) -> String {
    if is_refund {
        format!("-${amount:.2}")
    } else {
        format!("${amount:.2}")
    }
}

/// Formats a transaction as a single statement line.
#[must_use]
pub fn format_transaction_line(transaction: &transaction::Model) -> String {
    let amount = format_amount(
        transaction.amount_paid,
        transaction.transaction_type == TransactionType::Refund,
    );
    let reversed = if transaction.reversed { " (reversed)" } else { "" };
    format!(
        "{} {} - {}{reversed}",
        transaction.created_at.format("%Y-%m-%d"),
        amount,
        transaction.description
    )
}
