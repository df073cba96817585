//! Check-in business logic - Recording and reversing class attendance.
//!
//! A check-in either consumes one concession entry, records a casual payment,
//! links an online payment made ahead of the class, or is free. The check-in row
//! and its ledger or transaction side effects commit together.

use crate::{
    config::studio::RatesConfig,
    core::{
        ledger,
        student::require_active_student,
        transaction::{self as reconciliation, NewTransaction},
    },
    entities::{
        Checkin,
        checkin::{self, EntryType},
        transaction::{self, PaymentMethod, TransactionType},
    },
    errors::{Error, Result},
};
use chrono::{NaiveDate, Utc};
use sea_orm::{QueryOrder, Set, TransactionTrait, prelude::*};
use tracing::{debug, info, instrument, warn};

fn name_slug(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

/// Id of a student's check-in for a class date: `checkin-{YYYY-MM-DD}-{first}-{last}`.
#[must_use]
pub fn checkin_id(class_date: NaiveDate, first_name: &str, last_name: &str) -> String {
    format!(
        "checkin-{}-{}-{}",
        class_date.format("%Y-%m-%d"),
        name_slug(first_name),
        name_slug(last_name)
    )
}

/// How a check-in is paid for.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckinPayment {
    /// Nothing paid at the desk (concession and free entries)
    None,
    /// Paid at the desk; the configured casual rate applies when `amount` is absent
    Paid {
        /// Amount taken
        amount: Option<f64>,
        /// How it was paid
        method: PaymentMethod,
    },
    /// Covered by an online payment made before the class
    Prepaid {
        /// The pending online transaction
        transaction_id: String,
    },
}

/// A check-in to record.
#[derive(Debug, Clone)]
pub struct CheckinRequest {
    /// Attending student
    pub student_id: String,
    /// Date of the class
    pub class_date: NaiveDate,
    /// How the class is paid for
    pub entry_type: EntryType,
    /// Payment details for casual entries
    pub payment: CheckinPayment,
    /// Let concession entries fall back to expired blocks
    pub allow_expired: bool,
    /// Operator notes
    pub notes: Option<String>,
}

struct Settlement {
    block_id: Option<String>,
    transaction_id: Option<String>,
    prepaid: bool,
    amount_paid: f64,
    payment_method: Option<PaymentMethod>,
}

impl Settlement {
    const fn unpaid(block_id: Option<String>) -> Self {
        Self {
            block_id,
            transaction_id: None,
            prepaid: false,
            amount_paid: 0.0,
            payment_method: None,
        }
    }
}

const fn casual_transaction_type(entry_type: EntryType) -> TransactionType {
    match entry_type {
        EntryType::CasualStudent => TransactionType::CasualStudent,
        _ => TransactionType::Casual,
    }
}

async fn link_prepaid_transaction<C>(
    db: &C,
    transaction_id: &str,
    request: &CheckinRequest,
    id: &str,
) -> Result<transaction::Model>
where
    C: ConnectionTrait,
{
    let prepaid = reconciliation::require_transaction(db, transaction_id).await?;

    let problem = if prepaid.student_id != request.student_id {
        Some("belongs to another student")
    } else if !matches!(
        prepaid.transaction_type,
        TransactionType::Casual | TransactionType::CasualStudent | TransactionType::Purchase
    ) {
        Some("is not a class payment")
    } else if prepaid.reversed {
        Some("has been reversed")
    } else if prepaid.checkin_id.is_some() {
        Some("is already linked to a check-in")
    } else {
        None
    };
    if let Some(problem) = problem {
        return Err(Error::Validation {
            message: format!("Prepaid transaction {transaction_id} {problem}"),
        });
    }

    let mut active: transaction::ActiveModel = prepaid.into();
    active.checkin_id = Set(Some(id.to_string()));
    active.class_date = Set(Some(request.class_date));
    active.update(db).await.map_err(Into::into)
}

async fn settle<C>(
    db: &C,
    rates: &RatesConfig,
    request: &CheckinRequest,
    id: &str,
) -> Result<Settlement>
where
    C: ConnectionTrait,
{
    match (request.entry_type, &request.payment) {
        (EntryType::Concession, CheckinPayment::None) => {
            let block =
                ledger::get_next_available_block(db, &request.student_id, request.allow_expired)
                    .await?
                    .ok_or_else(|| Error::Validation {
                        message: format!(
                            "Student {} has no concession entries available",
                            request.student_id
                        ),
                    })?;
            let block = ledger::consume_entry(db, &block.id).await?;
            debug!(block_id = %block.id, remaining = block.remaining_quantity, "Consumed entry");
            Ok(Settlement::unpaid(Some(block.id)))
        }
        (EntryType::Free, CheckinPayment::None) => Ok(Settlement::unpaid(None)),
        (EntryType::Concession | EntryType::Free, _) => Err(Error::Validation {
            message: "Concession and free check-ins take no payment".to_string(),
        }),
        (entry_type, CheckinPayment::Paid { amount, method }) => {
            let amount = amount.unwrap_or_else(|| rates.rate_for(entry_type));
            if !amount.is_finite() || amount <= 0.0 {
                return Err(Error::InvalidAmount { amount });
            }

            let payment = reconciliation::insert_purchase(
                db,
                NewTransaction {
                    student_id: request.student_id.clone(),
                    transaction_type: casual_transaction_type(entry_type),
                    amount_paid: amount,
                    payment_method: Some(*method),
                    description: format!("Casual entry {}", request.class_date),
                    package_id: None,
                    class_date: Some(request.class_date),
                    checkin_id: Some(id.to_string()),
                    stripe_payment_intent_id: None,
                    created_at: None,
                },
            )
            .await?;

            Ok(Settlement {
                block_id: None,
                transaction_id: Some(payment.id),
                prepaid: false,
                amount_paid: amount,
                payment_method: Some(*method),
            })
        }
        (_, CheckinPayment::Prepaid { transaction_id }) => {
            let prepaid = link_prepaid_transaction(db, transaction_id, request, id).await?;
            Ok(Settlement {
                block_id: None,
                transaction_id: Some(prepaid.id),
                prepaid: true,
                amount_paid: prepaid.amount_paid,
                payment_method: prepaid.payment_method,
            })
        }
        (_, CheckinPayment::None) => Err(Error::Validation {
            message: "Casual check-ins need a payment or a prepaid transaction".to_string(),
        }),
    }
}

/// Records a student's attendance at a class.
///
/// A second check-in for the same student and day is a [`Error::Conflict`]
/// unless the earlier one was reversed, in which case it is replaced.
#[instrument(skip(db, rates, request), fields(student_id = %request.student_id, class_date = %request.class_date, entry_type = ?request.entry_type))]
pub async fn record_checkin(
    db: &DatabaseConnection,
    rates: &RatesConfig,
    request: CheckinRequest,
) -> Result<checkin::Model> {
    let txn = db.begin().await?;
    let student = require_active_student(&txn, &request.student_id).await?;
    let id = checkin_id(request.class_date, &student.first_name, &student.last_name);

    if let Some(existing) = Checkin::find_by_id(id.as_str()).one(&txn).await? {
        if !existing.reversed {
            return Err(Error::Conflict {
                message: format!("{} is already checked in on {}", student.full_name(), request.class_date),
            });
        }
        debug!(checkin_id = %id, "Replacing reversed check-in");
        existing.delete(&txn).await?;
    }

    let settlement = settle(&txn, rates, &request, &id).await?;

    let checkin = checkin::ActiveModel {
        id: Set(id),
        student_id: Set(request.student_id),
        class_date: Set(request.class_date),
        entry_type: Set(request.entry_type),
        block_id: Set(settlement.block_id),
        transaction_id: Set(settlement.transaction_id),
        prepaid: Set(settlement.prepaid),
        amount_paid: Set(settlement.amount_paid),
        payment_method: Set(settlement.payment_method),
        notes: Set(request.notes),
        reversed: Set(false),
        reversed_at: Set(None),
        created_at: Set(Utc::now()),
    }
    .insert(&txn)
    .await
    .map_err(|e| Error::from_insert(e, "Check-in"))?;

    txn.commit().await?;
    info!(checkin_id = %checkin.id, "Recorded check-in");
    Ok(checkin)
}

/// Undoes a check-in.
///
/// The consumed concession entry goes back to its block. A payment taken at the
/// desk is reversed; a prepaid online payment is unlinked so it can be used again.
#[instrument(skip(db))]
pub async fn reverse_checkin(db: &DatabaseConnection, checkin_id: &str) -> Result<checkin::Model> {
    let txn = db.begin().await?;
    let checkin = Checkin::find_by_id(checkin_id)
        .one(&txn)
        .await?
        .ok_or_else(|| Error::CheckinNotFound {
            id: checkin_id.to_string(),
        })?;

    if checkin.reversed {
        return Err(Error::Validation {
            message: format!("Check-in {checkin_id} is already reversed"),
        });
    }

    if let Some(block_id) = &checkin.block_id {
        if ledger::get_block_by_id(&txn, block_id).await?.is_some() {
            ledger::restore_entry(&txn, block_id).await?;
        } else if reconciliation::restore_snapshot_entry(&txn, &checkin.student_id, block_id)
            .await?
        {
            debug!(checkin_id, block_id = %block_id, "Returned entry to deleted block snapshot");
        } else {
            warn!(checkin_id, block_id = %block_id, "Block of reversed check-in no longer exists");
        }
    }

    if let Some(transaction_id) = &checkin.transaction_id {
        match reconciliation::get_transaction_by_id(&txn, transaction_id).await? {
            Some(payment) if checkin.prepaid => {
                let mut active: transaction::ActiveModel = payment.into();
                active.checkin_id = Set(None);
                active.update(&txn).await?;
            }
            Some(payment) if !payment.reversed => {
                if payment.refund_count > 0 {
                    return Err(Error::Validation {
                        message: format!(
                            "Payment {transaction_id} has refunds; reverse them first"
                        ),
                    });
                }
                reconciliation::mark_reversed(&txn, payment).await?;
            }
            Some(_) => {}
            None => warn!(checkin_id, transaction_id = %transaction_id, "Payment of reversed check-in not found"),
        }
    }

    let mut active: checkin::ActiveModel = checkin.into();
    active.reversed = Set(true);
    active.reversed_at = Set(Some(Utc::now()));
    let reversed = active.update(&txn).await?;

    txn.commit().await?;
    info!(checkin_id, "Reversed check-in");
    Ok(reversed)
}

/// Check-ins of a class date in arrival order, reversed ones included.
pub async fn get_checkins_for_date<C>(db: &C, class_date: NaiveDate) -> Result<Vec<checkin::Model>>
where
    C: ConnectionTrait,
{
    Checkin::find()
        .filter(checkin::Column::ClassDate.eq(class_date))
        .order_by_asc(checkin::Column::CreatedAt)
        .all(db)
        .await
        .map_err(Into::into)
}

/// A student's check-ins, most recent class first.
pub async fn get_checkins_for_student<C>(db: &C, student_id: &str) -> Result<Vec<checkin::Model>>
where
    C: ConnectionTrait,
{
    Checkin::find()
        .filter(checkin::Column::StudentId.eq(student_id))
        .order_by_desc(checkin::Column::ClassDate)
        .all(db)
        .await
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::float_cmp)]
    use super::*;
    use crate::core::ledger::get_block_by_id;
    use crate::core::transaction::get_transaction_by_id;
    use crate::entities::concession_block::BlockStatus;
    use crate::test_utils::*;

    fn class_day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 4).unwrap()
    }

    fn concession_checkin(student_id: &str) -> CheckinRequest {
        CheckinRequest {
            student_id: student_id.to_string(),
            class_date: class_day(),
            entry_type: EntryType::Concession,
            payment: CheckinPayment::None,
            allow_expired: false,
            notes: None,
        }
    }

    #[test]
    fn test_checkin_id_format() {
        assert_eq!(
            checkin_id(class_day(), "Mary Anne", "  Van   Dyke "),
            "checkin-2025-03-04-mary-anne-van-dyke"
        );
    }

    #[tokio::test]
    async fn test_concession_checkin_consumes_oldest_block() -> Result<()> {
        let (db, student) = setup_with_student().await?;
        let older = create_test_block(&db, &student.id, 1, days_ago(10)).await?;
        let newer = create_test_block(&db, &student.id, 5, days_ago(1)).await?;
        let rates = RatesConfig::default();

        let checkin = record_checkin(&db, &rates, concession_checkin(&student.id)).await?;
        assert_eq!(checkin.id, "checkin-2025-03-04-test-student");
        assert_eq!(checkin.block_id.as_deref(), Some(older.id.as_str()));
        assert_eq!(checkin.amount_paid, 0.0);

        let older = get_block_by_id(&db, &older.id).await?.unwrap();
        assert_eq!(older.status, BlockStatus::Depleted);
        assert_eq!(reload_student(&db, &student.id).await?.concession_balance, 5);
        assert_eq!(get_block_by_id(&db, &newer.id).await?.unwrap().remaining_quantity, 5);

        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_checkin_is_conflict_until_reversed() -> Result<()> {
        let (db, student) = setup_with_student().await?;
        let block = create_test_block(&db, &student.id, 5, days_ago(1)).await?;
        let rates = RatesConfig::default();

        let first = record_checkin(&db, &rates, concession_checkin(&student.id)).await?;
        let second = record_checkin(&db, &rates, concession_checkin(&student.id)).await;
        assert!(matches!(second, Err(Error::Conflict { .. })));
        assert_eq!(reload_student(&db, &student.id).await?.concession_balance, 4);

        let reversed = reverse_checkin(&db, &first.id).await?;
        assert!(reversed.reversed);
        assert_eq!(reload_student(&db, &student.id).await?.concession_balance, 5);
        assert_eq!(get_block_by_id(&db, &block.id).await?.unwrap().remaining_quantity, 5);

        let again = reverse_checkin(&db, &first.id).await;
        assert!(matches!(again, Err(Error::Validation { .. })));

        let replaced = record_checkin(&db, &rates, concession_checkin(&student.id)).await?;
        assert!(!replaced.reversed);
        assert_eq!(reload_student(&db, &student.id).await?.concession_balance, 4);
        assert_eq!(get_checkins_for_date(&db, class_day()).await?.len(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_reversing_checkin_of_removed_block_returns_entry_on_restore() -> Result<()> {
        let (db, student) = setup_with_student().await?;
        let (purchase, block) = sell_test_package(&db, &student.id).await?;
        let rates = RatesConfig::default();

        let checkin = record_checkin(&db, &rates, concession_checkin(&student.id)).await?;
        assert_eq!(checkin.block_id.as_deref(), Some(block.id.as_str()));

        reconciliation::reverse_transaction(&db, &purchase.id).await?;
        assert!(get_block_by_id(&db, &block.id).await?.is_none());
        assert_eq!(reload_student(&db, &student.id).await?.concession_balance, 0);

        reverse_checkin(&db, &checkin.id).await?;
        let snapshot = get_transaction_by_id(&db, &purchase.id)
            .await?
            .unwrap()
            .deleted_block_data
            .unwrap();
        assert_eq!(snapshot.remaining_quantity, 5);

        reconciliation::restore_transaction(&db, &purchase.id).await?;
        let restored = get_block_by_id(&db, &block.id).await?.unwrap();
        assert_eq!(restored.remaining_quantity, 5);
        assert_eq!(restored.status, BlockStatus::Active);
        assert_eq!(reload_student(&db, &student.id).await?.concession_balance, 5);

        Ok(())
    }

    #[tokio::test]
    async fn test_concession_checkin_without_entries() -> Result<()> {
        let (db, student) = setup_with_student().await?;
        create_block_with_dates(&db, &student.id, 3, days_ago(200), days_ago(5)).await?;
        let rates = RatesConfig::default();

        let result = record_checkin(&db, &rates, concession_checkin(&student.id)).await;
        assert!(matches!(result, Err(Error::Validation { .. })));

        let mut request = concession_checkin(&student.id);
        request.allow_expired = true;
        let checkin = record_checkin(&db, &rates, request).await?;
        assert!(checkin.block_id.is_some());

        Ok(())
    }

    #[tokio::test]
    async fn test_casual_checkin_uses_configured_rate() -> Result<()> {
        let (db, student) = setup_with_student().await?;
        let rates = RatesConfig::default();

        let checkin = record_checkin(
            &db,
            &rates,
            CheckinRequest {
                entry_type: EntryType::CasualStudent,
                payment: CheckinPayment::Paid {
                    amount: None,
                    method: PaymentMethod::Cash,
                },
                ..concession_checkin(&student.id)
            },
        )
        .await?;

        assert_eq!(checkin.amount_paid, rates.casual_student);
        assert!(!checkin.prepaid);
        let payment = get_transaction_by_id(&db, checkin.transaction_id.as_deref().unwrap())
            .await?
            .unwrap();
        assert_eq!(payment.transaction_type, TransactionType::CasualStudent);
        assert_eq!(payment.checkin_id.as_deref(), Some(checkin.id.as_str()));
        assert_eq!(payment.class_date, Some(class_day()));

        reverse_checkin(&db, &checkin.id).await?;
        let payment = get_transaction_by_id(&db, &payment.id).await?.unwrap();
        assert!(payment.reversed);

        Ok(())
    }

    #[tokio::test]
    async fn test_casual_checkin_requires_payment() -> Result<()> {
        let (db, student) = setup_with_student().await?;
        let rates = RatesConfig::default();

        let unpaid = record_checkin(
            &db,
            &rates,
            CheckinRequest {
                entry_type: EntryType::Casual,
                ..concession_checkin(&student.id)
            },
        )
        .await;
        assert!(matches!(unpaid, Err(Error::Validation { .. })));

        let zero = record_checkin(
            &db,
            &rates,
            CheckinRequest {
                entry_type: EntryType::Casual,
                payment: CheckinPayment::Paid {
                    amount: Some(0.0),
                    method: PaymentMethod::Cash,
                },
                ..concession_checkin(&student.id)
            },
        )
        .await;
        assert!(matches!(zero, Err(Error::InvalidAmount { .. })));
        assert!(get_checkins_for_student(&db, &student.id).await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_prepaid_checkin_links_and_unlinks() -> Result<()> {
        let (db, student) = setup_with_student().await?;
        let online = create_stripe_purchase(&db, &student.id, 15.0, "pi_789").await?;
        let rates = RatesConfig::default();

        let request = CheckinRequest {
            entry_type: EntryType::Casual,
            payment: CheckinPayment::Prepaid {
                transaction_id: online.id.clone(),
            },
            ..concession_checkin(&student.id)
        };
        let checkin = record_checkin(&db, &rates, request.clone()).await?;
        assert!(checkin.prepaid);
        assert_eq!(checkin.amount_paid, 15.0);
        assert_eq!(checkin.payment_method, Some(PaymentMethod::Stripe));

        let linked = get_transaction_by_id(&db, &online.id).await?.unwrap();
        assert_eq!(linked.checkin_id.as_deref(), Some(checkin.id.as_str()));

        reverse_checkin(&db, &checkin.id).await?;
        let unlinked = get_transaction_by_id(&db, &online.id).await?.unwrap();
        assert!(unlinked.checkin_id.is_none());
        assert!(!unlinked.reversed);

        // The unlinked payment can cover the class again
        let checkin = record_checkin(&db, &rates, request).await?;
        assert!(checkin.prepaid);

        Ok(())
    }

    #[tokio::test]
    async fn test_prepaid_transaction_of_other_student_rejected() -> Result<()> {
        let (db, student) = setup_with_student().await?;
        let other = create_test_student(&db, "Other", "Person").await?;
        let online = create_stripe_purchase(&db, &other.id, 15.0, "pi_000").await?;

        let result = record_checkin(
            &db,
            &RatesConfig::default(),
            CheckinRequest {
                entry_type: EntryType::Casual,
                payment: CheckinPayment::Prepaid {
                    transaction_id: online.id,
                },
                ..concession_checkin(&student.id)
            },
        )
        .await;
        assert!(matches!(result, Err(Error::Validation { .. })));

        Ok(())
    }

    #[tokio::test]
    async fn test_free_checkin_touches_nothing() -> Result<()> {
        let (db, student) = setup_with_student().await?;
        create_test_block(&db, &student.id, 2, days_ago(1)).await?;

        let checkin = record_checkin(
            &db,
            &RatesConfig::default(),
            CheckinRequest {
                entry_type: EntryType::Free,
                ..concession_checkin(&student.id)
            },
        )
        .await?;

        assert!(checkin.block_id.is_none());
        assert!(checkin.transaction_id.is_none());
        assert_eq!(reload_student(&db, &student.id).await?.concession_balance, 2);

        Ok(())
    }
}
