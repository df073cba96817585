//! Refunds against recorded transactions.
//!
//! The refund history in `refund_entries` is the only source of a parent
//! transaction's refund totals. Every refund or refund reversal rewrites the
//! parent's `total_refunded`, `refund_count` and `refunded` from the non-reversed
//! entries inside the same database transaction.

use crate::{
    core::{
        services::PaymentGateway,
        transaction::{self as reconciliation, NewTransaction, insert_transaction, transaction_id},
    },
    entities::{
        RefundEntry, refund_entry,
        transaction::{self, PaymentMethod, RefundStatus, TransactionType},
    },
    errors::{Error, Result},
};
use chrono::{DateTime, Utc};
use sea_orm::{QueryOrder, Set, TransactionTrait, prelude::*};
use tracing::{error, info, instrument};

/// Amounts closer than this are treated as equal.
pub const REFUND_EPSILON: f64 = 0.01;

/// Refund state for `total_refunded` out of `original_amount`.
#[must_use]
pub fn derive_refund_status(total_refunded: f64, original_amount: f64) -> RefundStatus {
    if total_refunded <= 0.0 {
        RefundStatus::None
    } else if (total_refunded - original_amount).abs() < REFUND_EPSILON
        || total_refunded >= original_amount
    {
        RefundStatus::Full
    } else {
        RefundStatus::Partial
    }
}

/// Checks whether a transaction can be refunded and returns the amount still refundable.
pub fn check_refund_eligibility(transaction: &transaction::Model) -> Result<f64> {
    let reason = if transaction.reversed {
        Some("Transaction has been reversed")
    } else if transaction.refunded == RefundStatus::Full {
        Some("Transaction has already been fully refunded")
    } else {
        match transaction.transaction_type {
            TransactionType::ConcessionGift => Some("Gifted concessions cannot be refunded"),
            TransactionType::Refund => Some("A refund cannot itself be refunded"),
            _ => None,
        }
    };

    match reason {
        Some(reason) => Err(Error::RefundNotAllowed {
            reason: reason.to_string(),
        }),
        None => Ok(transaction.refundable_amount()),
    }
}

/// A refund to perform.
#[derive(Debug, Clone)]
pub struct RefundRequest {
    /// Transaction being refunded
    pub transaction_id: String,
    /// Amount to return, ignored for a full refund
    pub amount: f64,
    /// Refund everything still refundable
    pub is_full_refund: bool,
    /// How the money is returned
    pub method: PaymentMethod,
    /// Operator's reason
    pub reason: Option<String>,
}

/// Result of a refund.
#[derive(Debug, Clone, PartialEq)]
pub struct RefundOutcome {
    /// The new refund transaction
    pub refund: transaction::Model,
    /// The refunded transaction with its recomputed totals
    pub parent: transaction::Model,
}

fn resolve_amount(request: &RefundRequest, refundable: f64) -> Result<f64> {
    let amount = if request.is_full_refund {
        refundable
    } else {
        request.amount
    };

    if !amount.is_finite() || amount <= 0.0 {
        return Err(Error::InvalidAmount { amount });
    }
    if amount > refundable + REFUND_EPSILON {
        return Err(Error::RefundNotAllowed {
            reason: format!("Refund of {amount:.2} exceeds the refundable {refundable:.2}"),
        });
    }

    Ok(amount.min(refundable))
}

/// Records a refund transaction against `parent` inside the caller's transaction.
///
/// The id is `{student_id}-refund-{millis}`; a collision is a [`Error::Conflict`].
pub async fn create_refund_transaction<C>(
    db: &C,
    parent: &transaction::Model,
    amount: f64,
    method: PaymentMethod,
    reason: Option<&str>,
    at: DateTime<Utc>,
) -> Result<transaction::Model>
where
    C: ConnectionTrait,
{
    let description = match reason {
        Some(reason) => format!("Refund: {} ({reason})", parent.description),
        None => format!("Refund: {}", parent.description),
    };

    insert_transaction(
        db,
        transaction_id(&parent.student_id, TransactionType::Refund, at),
        NewTransaction {
            student_id: parent.student_id.clone(),
            transaction_type: TransactionType::Refund,
            amount_paid: amount,
            payment_method: Some(method),
            description,
            package_id: parent.package_id.clone(),
            class_date: parent.class_date,
            checkin_id: None,
            stripe_payment_intent_id: parent.stripe_payment_intent_id.clone(),
            created_at: Some(at),
        },
        Some(parent.id.clone()),
    )
    .await
}

/// Rewrites a parent's refund totals from its non-reversed history entries.
async fn recompute_refund_totals<C>(db: &C, parent_id: &str) -> Result<transaction::Model>
where
    C: ConnectionTrait,
{
    let parent = reconciliation::require_transaction(db, parent_id).await?;
    let entries = RefundEntry::find()
        .filter(refund_entry::Column::ParentTransactionId.eq(parent_id))
        .filter(refund_entry::Column::Reversed.eq(false))
        .all(db)
        .await?;

    let total: f64 = entries.iter().map(|entry| entry.amount).sum();
    let count = i32::try_from(entries.len()).map_err(|_| Error::Validation {
        message: format!("Too many refunds recorded against {parent_id}"),
    })?;
    let status = derive_refund_status(total, parent.amount_paid);

    let mut active: transaction::ActiveModel = parent.into();
    active.total_refunded = Set(total);
    active.refund_count = Set(count);
    active.refunded = Set(status);
    active.update(db).await.map_err(Into::into)
}

/// Refunds a transaction.
///
/// Stripe refunds go to the payment gateway first; a gateway failure leaves the
/// database untouched. The refund transaction, its history entry and the parent's
/// totals are then written in one database transaction.
#[instrument(skip(db, gateway, request), fields(transaction_id = %request.transaction_id, method = ?request.method))]
pub async fn perform_refund(
    db: &DatabaseConnection,
    gateway: &dyn PaymentGateway,
    request: RefundRequest,
) -> Result<RefundOutcome> {
    let parent = reconciliation::require_transaction(db, &request.transaction_id).await?;
    let refundable = check_refund_eligibility(&parent)?;
    let amount = resolve_amount(&request, refundable)?;

    let receipt = if request.method == PaymentMethod::Stripe {
        let payment_intent_id =
            parent
                .stripe_payment_intent_id
                .as_deref()
                .ok_or_else(|| Error::InvalidPaymentMethod {
                    method: "stripe refund of a payment made outside the gateway".to_string(),
                })?;
        let receipt = gateway
            .refund(payment_intent_id, amount)
            .await
            .map_err(|e| e.into_error("Payment gateway"))?;
        info!(refund_id = %receipt.refund_id, amount, "Payment gateway refund issued");
        Some(receipt)
    } else {
        None
    };

    let result = record_refund(db, &request, amount).await;
    if let (Err(err), Some(receipt)) = (&result, &receipt) {
        error!(
            refund_id = %receipt.refund_id,
            error = %err,
            "Gateway refund issued but not recorded"
        );
    }
    let outcome = result?;

    info!(
        refund_transaction_id = %outcome.refund.id,
        amount,
        total_refunded = outcome.parent.total_refunded,
        status = ?outcome.parent.refunded,
        "Refund recorded"
    );
    Ok(outcome)
}

async fn record_refund(
    db: &DatabaseConnection,
    request: &RefundRequest,
    amount: f64,
) -> Result<RefundOutcome> {
    let txn = db.begin().await?;

    // The parent may have been refunded since the eligibility check
    let parent = reconciliation::require_transaction(&txn, &request.transaction_id).await?;
    let refundable = check_refund_eligibility(&parent)?;
    if amount > refundable + REFUND_EPSILON {
        return Err(Error::Conflict {
            message: format!(
                "Transaction {} was refunded concurrently; only {refundable:.2} remains",
                parent.id
            ),
        });
    }

    let now = Utc::now();
    let reason = request
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|reason| !reason.is_empty());
    let refund =
        create_refund_transaction(&txn, &parent, amount, request.method, reason, now).await?;

    refund_entry::ActiveModel {
        parent_transaction_id: Set(parent.id.clone()),
        refund_transaction_id: Set(refund.id.clone()),
        amount: Set(amount),
        method: Set(request.method),
        reason: Set(reason.map(ToString::to_string)),
        refunded_at: Set(now),
        reversed: Set(false),
        ..Default::default()
    }
    .insert(&txn)
    .await
    .map_err(|e| Error::from_insert(e, "Refund entry"))?;

    let parent = recompute_refund_totals(&txn, &parent.id).await?;
    txn.commit().await?;

    Ok(RefundOutcome { refund, parent })
}

/// Reverses a single refund and recomputes its parent.
///
/// Refunds paid out through the payment gateway moved real money and cannot be
/// reversed here. Returns the parent transaction.
#[instrument(skip(db))]
pub async fn reverse_refund(
    db: &DatabaseConnection,
    refund_transaction_id: &str,
) -> Result<transaction::Model> {
    let txn = db.begin().await?;
    let refund = reconciliation::require_transaction(&txn, refund_transaction_id).await?;

    if refund.transaction_type != TransactionType::Refund {
        return Err(Error::Validation {
            message: format!("Transaction {refund_transaction_id} is not a refund"),
        });
    }
    if refund.reversed {
        return Err(Error::RefundNotAllowed {
            reason: "Refund has already been reversed".to_string(),
        });
    }
    if refund.payment_method == Some(PaymentMethod::Stripe) {
        return Err(Error::RefundNotAllowed {
            reason: "Stripe refunds cannot be reversed".to_string(),
        });
    }

    let entry = RefundEntry::find()
        .filter(refund_entry::Column::RefundTransactionId.eq(refund_transaction_id))
        .one(&txn)
        .await?
        .ok_or_else(|| Error::Validation {
            message: format!("Refund {refund_transaction_id} has no history entry"),
        })?;
    let parent_id = entry.parent_transaction_id.clone();

    let mut entry: refund_entry::ActiveModel = entry.into();
    entry.reversed = Set(true);
    entry.update(&txn).await?;

    reconciliation::mark_reversed(&txn, refund).await?;
    let parent = recompute_refund_totals(&txn, &parent_id).await?;
    txn.commit().await?;

    info!(
        parent_transaction_id = %parent.id,
        total_refunded = parent.total_refunded,
        status = ?parent.refunded,
        "Reversed refund"
    );
    Ok(parent)
}

/// Refund history of a transaction, oldest first, reversed entries included.
pub async fn get_refund_history<C>(
    db: &C,
    parent_transaction_id: &str,
) -> Result<Vec<refund_entry::Model>>
where
    C: ConnectionTrait,
{
    RefundEntry::find()
        .filter(refund_entry::Column::ParentTransactionId.eq(parent_transaction_id))
        .order_by_asc(refund_entry::Column::RefundedAt)
        .order_by_asc(refund_entry::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::float_cmp)]
    use super::*;
    use crate::core::services::NoPaymentGateway;
    use crate::core::transaction::{get_transaction_by_id, reverse_transaction};
    use crate::test_utils::*;
    use std::time::Duration;

    fn refund_of(transaction_id: &str, amount: f64, method: PaymentMethod) -> RefundRequest {
        RefundRequest {
            transaction_id: transaction_id.to_string(),
            amount,
            is_full_refund: false,
            method,
            reason: Some("Class cancelled".to_string()),
        }
    }

    // Refund ids carry millisecond timestamps
    async fn next_millisecond() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    #[test]
    fn test_derive_refund_status_thresholds() {
        assert_eq!(derive_refund_status(0.0, 55.0), RefundStatus::None);
        assert_eq!(derive_refund_status(20.0, 55.0), RefundStatus::Partial);
        assert_eq!(derive_refund_status(54.995, 55.0), RefundStatus::Full);
        assert_eq!(derive_refund_status(55.0, 55.0), RefundStatus::Full);
        assert_eq!(derive_refund_status(60.0, 55.0), RefundStatus::Full);
        assert_eq!(derive_refund_status(54.98, 55.0), RefundStatus::Partial);
    }

    #[tokio::test]
    async fn test_partial_then_full_refund() -> Result<()> {
        let (db, student) = setup_with_student().await?;
        let (purchase, _) = sell_test_package(&db, &student.id).await?;
        assert_eq!(purchase.amount_paid, 55.0);

        let first = perform_refund(
            &db,
            &NoPaymentGateway,
            refund_of(&purchase.id, 20.0, PaymentMethod::Cash),
        )
        .await?;
        assert_eq!(first.parent.refunded, RefundStatus::Partial);
        assert_eq!(first.parent.total_refunded, 20.0);
        assert_eq!(first.parent.refund_count, 1);
        assert_eq!(first.refund.transaction_type, TransactionType::Refund);
        assert_eq!(
            first.refund.parent_transaction_id.as_deref(),
            Some(purchase.id.as_str())
        );
        assert!(first.refund.id.starts_with(&format!("{}-refund-", student.id)));

        next_millisecond().await;
        let second = perform_refund(
            &db,
            &NoPaymentGateway,
            refund_of(&purchase.id, 35.0, PaymentMethod::Cash),
        )
        .await?;
        assert_eq!(second.parent.refunded, RefundStatus::Full);
        assert_eq!(second.parent.total_refunded, 55.0);
        assert_eq!(second.parent.refund_count, 2);

        let third = perform_refund(
            &db,
            &NoPaymentGateway,
            refund_of(&purchase.id, 1.0, PaymentMethod::Cash),
        )
        .await;
        assert!(matches!(third, Err(Error::RefundNotAllowed { .. })));

        assert_eq!(get_refund_history(&db, &purchase.id).await?.len(), 2);

        Ok(())
    }

    #[tokio::test]
    async fn test_refund_amount_validation() -> Result<()> {
        let (db, student) = setup_with_student().await?;
        let (purchase, _) = sell_test_package(&db, &student.id).await?;

        let zero = perform_refund(
            &db,
            &NoPaymentGateway,
            refund_of(&purchase.id, 0.0, PaymentMethod::Cash),
        )
        .await;
        assert!(matches!(zero, Err(Error::InvalidAmount { .. })));

        let too_much = perform_refund(
            &db,
            &NoPaymentGateway,
            refund_of(&purchase.id, 55.5, PaymentMethod::Cash),
        )
        .await;
        assert!(matches!(too_much, Err(Error::RefundNotAllowed { .. })));

        // Within a cent of the remaining amount is accepted and clamped
        let outcome = perform_refund(
            &db,
            &NoPaymentGateway,
            refund_of(&purchase.id, 55.005, PaymentMethod::Cash),
        )
        .await?;
        assert_eq!(outcome.refund.amount_paid, 55.0);
        assert_eq!(outcome.parent.refunded, RefundStatus::Full);

        Ok(())
    }

    #[tokio::test]
    async fn test_full_refund_uses_remaining_amount() -> Result<()> {
        let (db, student) = setup_with_student().await?;
        let (purchase, _) = sell_test_package(&db, &student.id).await?;

        perform_refund(
            &db,
            &NoPaymentGateway,
            refund_of(&purchase.id, 15.0, PaymentMethod::Eftpos),
        )
        .await?;

        next_millisecond().await;
        let mut request = refund_of(&purchase.id, 0.0, PaymentMethod::Eftpos);
        request.is_full_refund = true;
        let outcome = perform_refund(&db, &NoPaymentGateway, request).await?;

        assert_eq!(outcome.refund.amount_paid, 40.0);
        assert_eq!(outcome.parent.total_refunded, 55.0);
        assert_eq!(outcome.parent.refunded, RefundStatus::Full);

        Ok(())
    }

    #[tokio::test]
    async fn test_ineligible_transactions() -> Result<()> {
        let (db, student) = setup_with_student().await?;
        let (gift, _) = gift_test_concessions(&db, &student.id, 2).await?;

        let result = perform_refund(
            &db,
            &NoPaymentGateway,
            refund_of(&gift.id, 1.0, PaymentMethod::Cash),
        )
        .await;
        match result {
            Err(Error::RefundNotAllowed { reason }) => {
                assert_eq!(reason, "Gifted concessions cannot be refunded");
            }
            other => panic!("expected RefundNotAllowed, got {other:?}"),
        }

        let (purchase, _) = sell_test_package(&db, &student.id).await?;
        reverse_transaction(&db, &purchase.id).await?;
        let reversed = get_transaction_by_id(&db, &purchase.id).await?.unwrap();
        assert!(matches!(
            check_refund_eligibility(&reversed),
            Err(Error::RefundNotAllowed { .. })
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_reverse_refund_excludes_only_that_entry() -> Result<()> {
        let (db, student) = setup_with_student().await?;
        let (purchase, _) = sell_test_package(&db, &student.id).await?;

        let first = perform_refund(
            &db,
            &NoPaymentGateway,
            refund_of(&purchase.id, 20.0, PaymentMethod::Cash),
        )
        .await?;
        next_millisecond().await;
        perform_refund(
            &db,
            &NoPaymentGateway,
            refund_of(&purchase.id, 10.0, PaymentMethod::BankTransfer),
        )
        .await?;

        let parent = reverse_refund(&db, &first.refund.id).await?;
        assert_eq!(parent.total_refunded, 10.0);
        assert_eq!(parent.refund_count, 1);
        assert_eq!(parent.refunded, RefundStatus::Partial);

        let history = get_refund_history(&db, &purchase.id).await?;
        assert_eq!(history.len(), 2);
        assert!(history[0].reversed);
        assert!(!history[1].reversed);

        let refund = get_transaction_by_id(&db, &first.refund.id).await?.unwrap();
        assert!(refund.reversed);

        let again = reverse_refund(&db, &first.refund.id).await;
        assert!(matches!(again, Err(Error::RefundNotAllowed { .. })));

        let not_refund = reverse_refund(&db, &purchase.id).await;
        assert!(matches!(not_refund, Err(Error::Validation { .. })));

        Ok(())
    }

    #[tokio::test]
    async fn test_purchase_with_refunds_cannot_be_reversed() -> Result<()> {
        let (db, student) = setup_with_student().await?;
        let (purchase, _) = sell_test_package(&db, &student.id).await?;

        let outcome = perform_refund(
            &db,
            &NoPaymentGateway,
            refund_of(&purchase.id, 5.0, PaymentMethod::Cash),
        )
        .await?;
        let result = reverse_transaction(&db, &purchase.id).await;
        assert!(matches!(result, Err(Error::Validation { .. })));

        let refund_reversal = reverse_transaction(&db, &outcome.refund.id).await;
        assert!(matches!(refund_reversal, Err(Error::Validation { .. })));

        reverse_refund(&db, &outcome.refund.id).await?;
        assert!(reverse_transaction(&db, &purchase.id).await?.reversed);

        Ok(())
    }

    #[tokio::test]
    async fn test_stripe_refund_calls_gateway_first() -> Result<()> {
        let (db, student) = setup_with_student().await?;
        let purchase = create_stripe_purchase(&db, &student.id, 30.0, "pi_123").await?;
        let gateway = RecordingGateway::default();

        let outcome = perform_refund(
            &db,
            &gateway,
            refund_of(&purchase.id, 12.5, PaymentMethod::Stripe),
        )
        .await?;
        assert_eq!(gateway.calls(), vec![("pi_123".to_string(), 12.5)]);
        assert_eq!(outcome.parent.total_refunded, 12.5);

        let reversal = reverse_refund(&db, &outcome.refund.id).await;
        assert!(matches!(reversal, Err(Error::RefundNotAllowed { .. })));

        Ok(())
    }

    #[tokio::test]
    async fn test_gateway_failure_writes_nothing() -> Result<()> {
        let (db, student) = setup_with_student().await?;
        let purchase = create_stripe_purchase(&db, &student.id, 30.0, "pi_456").await?;

        let result = perform_refund(
            &db,
            &NoPaymentGateway,
            refund_of(&purchase.id, 10.0, PaymentMethod::Stripe),
        )
        .await;
        assert!(matches!(result, Err(Error::ExternalService { .. })));

        let parent = get_transaction_by_id(&db, &purchase.id).await?.unwrap();
        assert_eq!(parent.total_refunded, 0.0);
        assert_eq!(parent.refunded, RefundStatus::None);
        assert!(get_refund_history(&db, &purchase.id).await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_stripe_refund_needs_payment_intent() -> Result<()> {
        let (db, student) = setup_with_student().await?;
        let (purchase, _) = sell_test_package(&db, &student.id).await?;
        let gateway = RecordingGateway::default();

        let result = perform_refund(
            &db,
            &gateway,
            refund_of(&purchase.id, 10.0, PaymentMethod::Stripe),
        )
        .await;
        assert!(matches!(result, Err(Error::InvalidPaymentMethod { .. })));
        assert!(gateway.calls().is_empty());

        Ok(())
    }
}
