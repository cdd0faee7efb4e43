//! Change detection and notification fan-out.
//!
//! One pipeline serves every entity type and watched files alike:
//!
//! ```text
//! ChangeScanner ─► RecipientResolver ─► DeliveryEngine ─► Transport
//!                                           │
//!                                      DedupLedger
//! ```
//!
//! # Example
//!
//! ```ignore
//! use campus_notifier::notification::CycleCoordinator;
//!
//! let coordinator = Arc::new(CycleCoordinator::from_pool(pool, transport, &config, token));
//! let mut state = coordinator.initial_state();
//! let report = coordinator.run_cycle(&mut state).await?;
//! ```

pub mod channels;
pub mod coordinator;
pub mod delivery;
pub mod events;
pub mod ledger;
pub mod resolver;
pub mod scanner;
pub mod watcher;

pub use channels::{FailureClass, Transport, TransportConfig, TransportError};
pub use coordinator::{CycleCoordinator, CyclePhase, CycleReport};
pub use delivery::{DeliveryConfig, DeliveryEngine, DeliveryOutcome, DeliveryReport, DeliveryTask};
pub use events::{ChangeKind, ChangeRecord, EntityKey, EntityType, FileChange, NotificationType};
pub use ledger::{DedupLedger, LedgerConfig, LedgerKey};
pub use resolver::RecipientResolver;
pub use scanner::{ChangeScanner, ScanOutcome, ScannerConfig, ScannerState, classify};
pub use watcher::{FileChangeWatcher, FileFingerprint, WatcherConfig};
