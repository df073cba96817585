//! Student business logic - Registration, lookup and contact updates.
//!
//! Derived balance fields are never written here; they belong to the ledger.
//! Students are soft-deleted only through a merge.

use crate::{
    entities::{Student, User, student, user},
    errors::{Error, Result},
};
use chrono::Utc;
use sea_orm::{Condition, QueryOrder, Set, prelude::*};
use tracing::{info, instrument};
use uuid::Uuid;

/// Details captured when a student registers.
#[derive(Debug, Clone, Default)]
pub struct NewStudent {
    /// Given name
    pub first_name: String,
    /// Family name
    pub last_name: String,
    /// Contact email
    pub email: String,
    /// Contact phone number
    pub phone: Option<String>,
    /// Preferred pronouns
    pub pronouns: Option<String>,
}

/// Contact changes; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct StudentUpdate {
    /// New given name
    pub first_name: Option<String>,
    /// New family name
    pub last_name: Option<String>,
    /// New email
    pub email: Option<String>,
    /// New phone, `Some(None)` clears it
    pub phone: Option<Option<String>>,
    /// New pronouns, `Some(None)` clears them
    pub pronouns: Option<Option<String>>,
}

fn validate_name(name: &str, field: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation {
            message: format!("Student {field} cannot be empty"),
        });
    }
    Ok(trimmed.to_string())
}

fn validate_email(email: &str) -> Result<String> {
    let trimmed = email.trim();
    if !trimmed.contains('@') {
        return Err(Error::Validation {
            message: format!("Invalid email address: {trimmed}"),
        });
    }
    Ok(trimmed.to_lowercase())
}

/// Registers a new student with zero balances.
#[instrument(skip(db, new_student), fields(email = %new_student.email))]
pub async fn register_student(
    db: &DatabaseConnection,
    new_student: NewStudent,
) -> Result<student::Model> {
    let first_name = validate_name(&new_student.first_name, "first name")?;
    let last_name = validate_name(&new_student.last_name, "last name")?;
    let email = validate_email(&new_student.email)?;

    let now = Utc::now();
    let model = student::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        first_name: Set(first_name),
        last_name: Set(last_name),
        email: Set(email),
        phone: Set(new_student.phone),
        pronouns: Set(new_student.pronouns),
        stripe_customer_id: Set(None),
        concession_balance: Set(0),
        expired_concessions: Set(0),
        deleted: Set(false),
        merged_into: Set(None),
        merged_from: Set(student::StudentIds::default()),
        created_at: Set(now),
        updated_at: Set(now),
    };

    let result = model.insert(db).await?;
    info!(student_id = %result.id, "Registered student");
    Ok(result)
}

/// Finds a student by id, including soft-deleted ones.
pub async fn get_student<C>(db: &C, student_id: &str) -> Result<Option<student::Model>>
where
    C: ConnectionTrait,
{
    Student::find_by_id(student_id)
        .one(db)
        .await
        .map_err(Into::into)
}

/// Loads a student that exists and has not been merged away.
pub(crate) async fn require_active_student<C>(db: &C, student_id: &str) -> Result<student::Model>
where
    C: ConnectionTrait,
{
    let student = get_student(db, student_id)
        .await?
        .ok_or_else(|| Error::StudentNotFound {
            id: student_id.to_string(),
        })?;

    if student.deleted {
        return Err(Error::StudentNotFound {
            id: student_id.to_string(),
        });
    }

    Ok(student)
}

/// All students that have not been merged away, ordered by last then first name.
pub async fn list_active_students(db: &DatabaseConnection) -> Result<Vec<student::Model>> {
    Student::find()
        .filter(student::Column::Deleted.eq(false))
        .order_by_asc(student::Column::LastName)
        .order_by_asc(student::Column::FirstName)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Case-insensitive substring search over names and email of active students.
pub async fn search_students(db: &DatabaseConnection, query: &str) -> Result<Vec<student::Model>> {
    let query = query.trim();
    if query.is_empty() {
        return list_active_students(db).await;
    }

    Student::find()
        .filter(student::Column::Deleted.eq(false))
        .filter(
            Condition::any()
                .add(student::Column::FirstName.contains(query))
                .add(student::Column::LastName.contains(query))
                .add(student::Column::Email.contains(query)),
        )
        .order_by_asc(student::Column::LastName)
        .order_by_asc(student::Column::FirstName)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Applies contact changes to an active student.
#[instrument(skip(db, update))]
pub async fn update_student(
    db: &DatabaseConnection,
    student_id: &str,
    update: StudentUpdate,
) -> Result<student::Model> {
    let student = require_active_student(db, student_id).await?;
    let mut active: student::ActiveModel = student.into();

    if let Some(first_name) = update.first_name {
        active.first_name = Set(validate_name(&first_name, "first name")?);
    }
    if let Some(last_name) = update.last_name {
        active.last_name = Set(validate_name(&last_name, "last name")?);
    }
    if let Some(email) = update.email {
        active.email = Set(validate_email(&email)?);
    }
    if let Some(phone) = update.phone {
        active.phone = Set(phone);
    }
    if let Some(pronouns) = update.pronouns {
        active.pronouns = Set(pronouns);
    }
    active.updated_at = Set(Utc::now());

    active.update(db).await.map_err(Into::into)
}

/// Records the payment gateway customer id for a student.
pub async fn set_stripe_customer_id(
    db: &DatabaseConnection,
    student_id: &str,
    customer_id: Option<String>,
) -> Result<student::Model> {
    let student = require_active_student(db, student_id).await?;
    let mut active: student::ActiveModel = student.into();
    active.stripe_customer_id = Set(customer_id);
    active.updated_at = Set(Utc::now());
    active.update(db).await.map_err(Into::into)
}

/// Creates the portal account linking a login to a student. One account per student.
#[instrument(skip(db))]
pub async fn link_portal_account(
    db: &DatabaseConnection,
    student_id: &str,
    email: &str,
    auth_uid: Option<String>,
) -> Result<user::Model> {
    require_active_student(db, student_id).await?;

    if get_portal_account(db, student_id).await?.is_some() {
        return Err(Error::Conflict {
            message: format!("Student {student_id} already has a portal account"),
        });
    }

    let account = user::ActiveModel {
        student_id: Set(student_id.to_string()),
        email: Set(validate_email(email)?),
        auth_uid: Set(auth_uid),
        created_at: Set(Utc::now()),
        ..Default::default()
    };

    account.insert(db).await.map_err(Into::into)
}

/// The portal account of a student, if any.
pub async fn get_portal_account<C>(db: &C, student_id: &str) -> Result<Option<user::Model>>
where
    C: ConnectionTrait,
{
    User::find()
        .filter(user::Column::StudentId.eq(student_id))
        .one(db)
        .await
        .map_err(Into::into)
}
