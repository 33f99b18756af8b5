//! `draftmill-core`: shared identifiers and the domain error model.
//!
//! This crate contains no I/O and no provider or storage concerns.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{InvocationId, JobId};
