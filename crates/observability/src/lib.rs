//! Process-wide tracing setup shared by every binary.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::{LogFormat, init, init_with};
