//! Shared test utilities for the studio ledger.
//!
//! This module provides common helper functions for setting up test databases,
//! creating test entities with sensible defaults, and recording fakes for the
//! external service traits.

use crate::{
    config::studio::PackageConfig,
    core::{
        ledger::{self, NewBlock},
        package,
        services::{IdentityProvider, PaymentGateway, RefundReceipt, ServiceError},
        student::{self as registry, NewStudent},
        transaction::{self as reconciliation, NewTransaction, PackageSale},
    },
    entities::{
        self,
        transaction::{PaymentMethod, RefundStatus, TransactionType},
    },
    errors::{Error, Result},
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use std::sync::Mutex;

/// Creates an in-memory `SQLite` database with all tables initialized.
/// This is the standard setup for all integration tests.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = sea_orm::Database::connect("sqlite::memory:").await?;
    crate::config::database::create_tables(&db).await?;
    Ok(db)
}

/// Creates a file-backed `SQLite` database in the temp directory, for tests that
/// need several pooled connections writing at once.
pub async fn setup_file_test_db() -> Result<DatabaseConnection> {
    let path = std::env::temp_dir().join(format!("studio-ledger-{}.sqlite", uuid::Uuid::new_v4()));
    let db = sea_orm::Database::connect(format!("sqlite://{}?mode=rwc", path.display())).await?;
    crate::config::database::create_tables(&db).await?;
    Ok(db)
}

/// Registers a test student.
///
/// # Defaults
/// * `email`: `"{first}.{last}@example.com"`, lowercased
/// * `phone` and `pronouns`: None
pub async fn create_test_student(
    db: &DatabaseConnection,
    first_name: &str,
    last_name: &str,
) -> Result<entities::student::Model> {
    registry::register_student(
        db,
        NewStudent {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email: format!("{first_name}.{last_name}@example.com"),
            ..Default::default()
        },
    )
    .await
}

/// Sets up a complete test environment with one student named "Test Student".
/// Returns (db, student) for common test scenarios.
pub async fn setup_with_student() -> Result<(DatabaseConnection, entities::student::Model)> {
    let db = setup_test_db().await?;
    let student = create_test_student(&db, "Test", "Student").await?;
    Ok((db, student))
}

/// Reloads a student to observe the balances stored by the ledger.
pub async fn reload_student(
    db: &DatabaseConnection,
    student_id: &str,
) -> Result<entities::student::Model> {
    registry::get_student(db, student_id)
        .await?
        .ok_or_else(|| Error::StudentNotFound {
            id: student_id.to_string(),
        })
}

/// Sets the phone number and payment customer id of a student.
pub async fn set_test_contact(
    db: &DatabaseConnection,
    student_id: &str,
    phone: Option<&str>,
    stripe_customer_id: Option<&str>,
) -> Result<entities::student::Model> {
    let student = reload_student(db, student_id).await?;
    let mut active: entities::student::ActiveModel = student.into();
    active.phone = Set(phone.map(ToString::to_string));
    active.stripe_customer_id = Set(stripe_customer_id.map(ToString::to_string));
    active.update(db).await.map_err(Into::into)
}

/// The current time minus `days` days.
#[must_use]
pub fn days_ago(days: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(days)
}

/// Block parameters with a test package name, a cash price of 10 per entry and no transaction.
#[must_use]
pub fn test_new_block(
    student_id: &str,
    quantity: i32,
    purchase_date: DateTime<Utc>,
    expiry_date: DateTime<Utc>,
) -> NewBlock {
    NewBlock {
        student_id: student_id.to_string(),
        package_id: None,
        package_name: "Test Package".to_string(),
        quantity,
        price: f64::from(quantity) * 10.0,
        payment_method: Some(PaymentMethod::Cash),
        purchase_date,
        expiry_date,
        transaction_id: None,
        notes: None,
    }
}

/// Creates a block that expires 180 days after `purchase_date`.
pub async fn create_test_block(
    db: &DatabaseConnection,
    student_id: &str,
    quantity: i32,
    purchase_date: DateTime<Utc>,
) -> Result<entities::concession_block::Model> {
    create_block_with_dates(
        db,
        student_id,
        quantity,
        purchase_date,
        purchase_date + Duration::days(180),
    )
    .await
}

/// Creates a block with explicit purchase and expiry dates.
pub async fn create_block_with_dates(
    db: &DatabaseConnection,
    student_id: &str,
    quantity: i32,
    purchase_date: DateTime<Utc>,
    expiry_date: DateTime<Utc>,
) -> Result<entities::concession_block::Model> {
    ledger::create_block(
        db,
        test_new_block(student_id, quantity, purchase_date, expiry_date),
    )
    .await
}

/// Package configuration named after its id, expiring after 6 months.
#[must_use]
pub fn test_package_config(id: &str, classes: i32, price: f64) -> PackageConfig {
    PackageConfig {
        id: id.to_string(),
        name: format!("{id} package"),
        classes,
        price,
        expiry_months: 6,
    }
}

/// Seeds a 5-class package at $55 and a 10-class package at $100.
pub async fn seed_test_packages(db: &DatabaseConnection) -> Result<usize> {
    package::seed_packages(
        db,
        &[
            test_package_config("5-class", 5, 55.0),
            test_package_config("10-class", 10, 100.0),
        ],
    )
    .await
}

/// Sells the 5-class package for cash, seeding the catalog if needed.
pub async fn sell_test_package(
    db: &DatabaseConnection,
    student_id: &str,
) -> Result<(
    entities::transaction::Model,
    entities::concession_block::Model,
)> {
    seed_test_packages(db).await?;
    reconciliation::sell_package(
        db,
        PackageSale {
            student_id: student_id.to_string(),
            package_id: "5-class".to_string(),
            payment_method: PaymentMethod::Cash,
            purchase_date: None,
            stripe_payment_intent_id: None,
        },
    )
    .await
}

/// Gifts `quantity` entries that expire in 90 days.
pub async fn gift_test_concessions(
    db: &DatabaseConnection,
    student_id: &str,
    quantity: i32,
) -> Result<(
    entities::transaction::Model,
    entities::concession_block::Model,
)> {
    reconciliation::gift_concessions(
        db,
        student_id,
        quantity,
        Utc::now() + Duration::days(90),
        "Test gift",
    )
    .await
}

/// Transaction parameters paid in cash with a test description.
#[must_use]
pub fn test_new_transaction(
    student_id: &str,
    transaction_type: TransactionType,
    amount: f64,
) -> NewTransaction {
    NewTransaction {
        student_id: student_id.to_string(),
        transaction_type,
        amount_paid: amount,
        payment_method: Some(PaymentMethod::Cash),
        description: "Test transaction".to_string(),
        package_id: None,
        class_date: None,
        checkin_id: None,
        stripe_payment_intent_id: None,
        created_at: None,
    }
}

/// Records a cash casual payment at `at`.
pub async fn create_casual_transaction(
    db: &DatabaseConnection,
    student_id: &str,
    amount: f64,
    at: DateTime<Utc>,
) -> Result<entities::transaction::Model> {
    let mut request = test_new_transaction(student_id, TransactionType::Casual, amount);
    request.created_at = Some(at);
    reconciliation::create_purchase_transaction(db, request).await
}

/// Records an online class purchase paid through the payment gateway.
pub async fn create_stripe_purchase(
    db: &DatabaseConnection,
    student_id: &str,
    amount: f64,
    payment_intent_id: &str,
) -> Result<entities::transaction::Model> {
    let mut request = test_new_transaction(student_id, TransactionType::Purchase, amount);
    request.payment_method = Some(PaymentMethod::Stripe);
    request.stripe_payment_intent_id = Some(payment_intent_id.to_string());
    reconciliation::create_purchase_transaction(db, request).await
}

/// An unsaved transaction model described by its kind.
#[must_use]
pub fn test_transaction_model(
    student_id: &str,
    transaction_type: TransactionType,
    amount: f64,
) -> entities::transaction::Model {
    let created_at = Utc::now();
    entities::transaction::Model {
        id: reconciliation::transaction_id(student_id, transaction_type, created_at),
        student_id: student_id.to_string(),
        transaction_type,
        amount_paid: amount,
        payment_method: Some(PaymentMethod::Cash),
        description: format!("{transaction_type:?}"),
        package_id: None,
        class_date: None,
        checkin_id: None,
        parent_transaction_id: None,
        stripe_payment_intent_id: None,
        reversed: false,
        reversed_at: None,
        refunded: RefundStatus::None,
        total_refunded: 0.0,
        refund_count: 0,
        deleted_block_data: None,
        created_at,
    }
}

/// Payment gateway fake that accepts every refund and records it.
#[derive(Debug, Default)]
pub struct RecordingGateway {
    calls: Mutex<Vec<(String, f64)>>,
}

impl RecordingGateway {
    /// Refunds issued so far as (payment intent, amount).
    #[allow(clippy::unwrap_used)]
    pub fn calls(&self) -> Vec<(String, f64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for RecordingGateway {
    #[allow(clippy::unwrap_used)]
    async fn refund(
        &self,
        payment_intent_id: &str,
        amount: f64,
    ) -> std::result::Result<RefundReceipt, ServiceError> {
        let mut calls = self.calls.lock().unwrap();
        calls.push((payment_intent_id.to_string(), amount));
        Ok(RefundReceipt {
            refund_id: format!("re_{}", calls.len()),
        })
    }
}

/// Identity provider fake recording deletions and email changes.
#[derive(Debug, Default)]
pub struct RecordingIdentityProvider {
    missing: Vec<String>,
    failing: bool,
    deleted: Mutex<Vec<String>>,
    email_updates: Mutex<Vec<(String, String)>>,
}

impl RecordingIdentityProvider {
    /// A provider that reports these uids as unknown.
    #[must_use]
    pub fn with_missing_users(uids: &[&str]) -> Self {
        Self {
            missing: uids.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }

    /// A provider whose every call fails.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Uids deleted so far.
    #[allow(clippy::unwrap_used)]
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    /// Email changes so far as (uid, email).
    #[allow(clippy::unwrap_used)]
    pub fn email_updates(&self) -> Vec<(String, String)> {
        self.email_updates.lock().unwrap().clone()
    }

    fn check(&self, uid: &str) -> std::result::Result<(), ServiceError> {
        if self.failing {
            return Err(ServiceError::Failed("identity provider unavailable".to_string()));
        }
        if self.missing.iter().any(|missing| missing == uid) {
            return Err(ServiceError::NotFound(uid.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for RecordingIdentityProvider {
    #[allow(clippy::unwrap_used)]
    async fn delete_user(&self, uid: &str) -> std::result::Result<(), ServiceError> {
        self.check(uid)?;
        self.deleted.lock().unwrap().push(uid.to_string());
        Ok(())
    }

    #[allow(clippy::unwrap_used)]
    async fn update_email(&self, uid: &str, email: &str) -> std::result::Result<(), ServiceError> {
        self.check(uid)?;
        self.email_updates
            .lock()
            .unwrap()
            .push((uid.to_string(), email.to_string()));
        Ok(())
    }
}
