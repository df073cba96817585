//! Studio configuration loading from studio.toml
//!
//! The file defines the concession package catalog (seeded into the database on
//! start-up), the default casual rates used at check-in, and how often the
//! expiry sweep runs.

use crate::entities::checkin::EntryType;
use crate::errors::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "studio.toml";

/// Configuration structure representing the entire studio.toml file
#[derive(Debug, Deserialize, Default)]
pub struct StudioConfig {
    /// Concession packages to seed
    #[serde(default)]
    pub packages: Vec<PackageConfig>,
    /// Default check-in prices
    #[serde(default)]
    pub rates: RatesConfig,
    /// Expiry sweep scheduling
    #[serde(default)]
    pub sweep: SweepConfig,
}

/// Configuration for a single concession package
#[derive(Debug, Deserialize, Clone)]
pub struct PackageConfig {
    /// Slug identifier (e.g. "5-class")
    pub id: String,
    /// Display name
    pub name: String,
    /// Entries granted by one purchase
    pub classes: i32,
    /// Price of one purchase
    pub price: f64,
    /// Months until a purchased block expires
    pub expiry_months: i32,
}

/// Default prices for casual entries
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RatesConfig {
    /// Standard single-class price
    #[serde(default = "default_casual_rate")]
    pub casual: f64,
    /// Student single-class price
    #[serde(default = "default_casual_student_rate")]
    pub casual_student: f64,
}

impl Default for RatesConfig {
    fn default() -> Self {
        Self {
            casual: default_casual_rate(),
            casual_student: default_casual_student_rate(),
        }
    }
}

impl RatesConfig {
    /// Default price for a check-in of this type; concession and free entries cost nothing.
    #[must_use]
    pub const fn rate_for(&self, entry_type: EntryType) -> f64 {
        match entry_type {
            EntryType::Casual => self.casual,
            EntryType::CasualStudent => self.casual_student,
            EntryType::Concession | EntryType::Free => 0.0,
        }
    }
}

const fn default_casual_rate() -> f64 {
    15.0
}

const fn default_casual_student_rate() -> f64 {
    12.0
}

/// Expiry sweep scheduling
#[derive(Debug, Deserialize, Clone, Copy, Default)]
pub struct SweepConfig {
    /// Seconds between sweeps; run once and exit when absent
    pub interval_secs: Option<u64>,
}

impl SweepConfig {
    /// Interval between sweeps, if the sweep should repeat.
    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        self.interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Loads studio configuration from a TOML file
///
/// # Errors
/// Returns an error if:
/// - The file cannot be read
/// - The TOML syntax is invalid
/// - Required fields are missing
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<StudioConfig> {
    let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::Config {
        message: format!("Failed to read config file: {e}"),
    })?;

    parse_config(&contents)
}

/// Parses studio configuration from TOML text.
pub fn parse_config(contents: &str) -> Result<StudioConfig> {
    toml::from_str(contents).map_err(|e| Error::Config {
        message: format!("Failed to parse studio.toml: {e}"),
    })
}

/// Loads configuration from `STUDIO_CONFIG`, falling back to ./studio.toml.
/// A missing default file yields the built-in defaults with an empty catalog.
pub fn load_default_config() -> Result<StudioConfig> {
    match std::env::var("STUDIO_CONFIG") {
        Ok(path) => load_config(path),
        Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => load_config(DEFAULT_CONFIG_PATH),
        Err(_) => {
            tracing::warn!("No {DEFAULT_CONFIG_PATH} found, using defaults");
            Ok(StudioConfig::default())
        }
    }
}
