//! Infrastructure layer: persistent record store and process configuration.

pub mod config;
pub mod postgres;

pub use config::{ConfigError, ProviderSettings, Settings};
pub use postgres::PostgresJobStore;
