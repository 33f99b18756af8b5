//! HTTP trigger surface: create jobs, drive them with `continue`, inspect them.

pub mod app;
pub mod middleware;
