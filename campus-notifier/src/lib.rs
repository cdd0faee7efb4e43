//! campus-notifier library crate.
//!
//! Watches the shared campus records store for new, changed and withdrawn
//! news, tests and debts, and fans notifications out to the affected students
//! exactly once per change.

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod notification;
pub mod utils;

pub use error::{Error, Result};
