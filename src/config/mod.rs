/// Database configuration and connection management
pub mod database;

/// Studio configuration loading from studio.toml
pub mod studio;
