//! Concession package catalog.
//!
//! Packages are seeded from studio.toml and read when a package is sold.

use crate::{
    config::studio::PackageConfig,
    entities::{ConcessionPackage, concession_package},
    errors::{Error, Result},
};
use chrono::{DateTime, Months, Utc};
use sea_orm::{QueryOrder, Set, prelude::*};
use tracing::{debug, info, instrument};

/// All packages that can currently be sold, cheapest first.
pub async fn get_active_packages(db: &DatabaseConnection) -> Result<Vec<concession_package::Model>> {
    ConcessionPackage::find()
        .filter(concession_package::Column::IsActive.eq(true))
        .order_by_asc(concession_package::Column::Price)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Finds a package by id, active or not.
pub async fn get_package_by_id<C>(
    db: &C,
    package_id: &str,
) -> Result<Option<concession_package::Model>>
where
    C: ConnectionTrait,
{
    ConcessionPackage::find_by_id(package_id)
        .one(db)
        .await
        .map_err(Into::into)
}

fn validate_package(package: &PackageConfig) -> Result<()> {
    if package.id.trim().is_empty() || package.name.trim().is_empty() {
        return Err(Error::Config {
            message: "Package id and name cannot be empty".to_string(),
        });
    }
    if package.classes <= 0 || package.expiry_months <= 0 {
        return Err(Error::Config {
            message: format!(
                "Package {} needs a positive class count and expiry period",
                package.id
            ),
        });
    }
    if !package.price.is_finite() || package.price < 0.0 {
        return Err(Error::InvalidAmount {
            amount: package.price,
        });
    }
    Ok(())
}

/// Inserts every configured package that is not in the catalog yet.
///
/// Existing packages are left untouched so prices edited in the database survive
/// a restart. Returns the number of packages inserted.
#[instrument(skip(db, packages), fields(configured = packages.len()))]
pub async fn seed_packages(db: &DatabaseConnection, packages: &[PackageConfig]) -> Result<usize> {
    let mut inserted = 0;

    for package in packages {
        validate_package(package)?;

        let package_id = package.id.trim();
        if get_package_by_id(db, package_id).await?.is_some() {
            debug!(package_id, "Package already seeded");
            continue;
        }

        let now = Utc::now();
        concession_package::ActiveModel {
            id: Set(package_id.to_string()),
            name: Set(package.name.trim().to_string()),
            number_of_classes: Set(package.classes),
            price: Set(package.price),
            expiry_months: Set(package.expiry_months),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await?;
        inserted += 1;
    }

    info!(inserted, "Seeded concession packages");
    Ok(inserted)
}

/// Stops a package from being sold; blocks already sold are unaffected.
pub async fn deactivate_package(
    db: &DatabaseConnection,
    package_id: &str,
) -> Result<concession_package::Model> {
    let package = get_package_by_id(db, package_id)
        .await?
        .ok_or_else(|| Error::PackageNotFound {
            id: package_id.to_string(),
        })?;

    let mut active: concession_package::ActiveModel = package.into();
    active.is_active = Set(false);
    active.updated_at = Set(Utc::now());
    active.update(db).await.map_err(Into::into)
}

/// Expiry date of a block bought at `purchase_date` from a package lasting `expiry_months`.
pub fn expiry_date_for(purchase_date: DateTime<Utc>, expiry_months: i32) -> Result<DateTime<Utc>> {
    let months = u32::try_from(expiry_months)
        .ok()
        .filter(|months| *months > 0)
        .ok_or_else(|| Error::Validation {
            message: format!("Invalid expiry period: {expiry_months} months"),
        })?;

    purchase_date
        .checked_add_months(Months::new(months))
        .ok_or_else(|| Error::Validation {
            message: "Expiry date out of range".to_string(),
        })
}
