//! Repository layer for database access.
//!
//! Each repository is a trait with a SQLx implementation so the notification
//! pipeline can be exercised against fakes or a live store.

pub mod change;
pub mod ledger;
pub mod recipient;

pub use change::*;
pub use ledger::*;
pub use recipient::*;

use std::sync::Arc;

use super::DbPool;

/// The repositories the notification pipeline needs, behind their traits.
#[derive(Clone)]
pub struct Repositories {
    pub changes: Arc<dyn ChangeRepository>,
    pub recipients: Arc<dyn RecipientRepository>,
    pub ledger: Arc<dyn LedgerRepository>,
}

impl Repositories {
    /// SQLx implementations sharing one pool.
    pub fn from_pool(pool: DbPool) -> Self {
        Self {
            changes: Arc::new(SqlxChangeRepository::new(pool.clone())),
            recipients: Arc::new(SqlxRecipientRepository::new(pool.clone())),
            ledger: Arc::new(SqlxLedgerRepository::new(pool)),
        }
    }
}
