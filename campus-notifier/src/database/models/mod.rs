//! Database models for campus-notifier.
//!
//! These models map directly to the rows this core reads from the shared
//! store and the ledger rows it writes.

pub mod change;
pub mod ledger;
pub mod recipient;

pub use change::*;
pub use ledger::*;
pub use recipient::*;
