//! Cycle coordinator.
//!
//! Drives the scan → resolve → deliver pipeline on a fixed interval, threading
//! the scan cursor through [`ScannerState`]. A cycle that hits a store failure
//! leaves the cursor where it was, so the same window is retried after the
//! error backoff. File watching and ledger cache pruning run as sibling loops
//! on the same cancellation token.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channels::Transport;
use super::delivery::{DeliveryEngine, DeliveryReport, DeliveryTask};
use super::events::{ChangeRecord, NotificationType};
use super::ledger::{DedupLedger, LedgerConfig};
use super::resolver::RecipientResolver;
use super::scanner::{ChangeScanner, PendingRetry, ScannerConfig, ScannerState};
use super::watcher::{FileChangeWatcher, WatcherConfig};
use crate::config::NotifierConfig;
use crate::database::DbPool;
use crate::database::repositories::Repositories;
use crate::{Error, Result};

/// What the coordinator is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CyclePhase {
    Idle,
    Scanning,
    Resolving,
    Delivering,
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Exclusive lower bound of the scanned window (epoch ms).
    pub window_start_ms: i64,
    /// Changes returned by the scan.
    pub changes: usize,
    /// Rows skipped as malformed.
    pub skipped_rows: usize,
    /// Changes carried over from earlier cycles and retried.
    pub retried: usize,
    /// Changes still carried forward after this cycle.
    pub carried_forward: usize,
    pub delivery: DeliveryReport,
}

/// Owns the pipeline components and runs cycles.
pub struct CycleCoordinator {
    scanner: ChangeScanner,
    resolver: RecipientResolver,
    ledger: Arc<DedupLedger>,
    delivery: Arc<DeliveryEngine>,
    watcher: FileChangeWatcher,
    scanner_config: ScannerConfig,
    ledger_config: LedgerConfig,
    watcher_config: WatcherConfig,
    phase: RwLock<CyclePhase>,
    cancellation_token: CancellationToken,
}

impl CycleCoordinator {
    pub fn new(
        repos: Repositories,
        transport: Arc<dyn Transport>,
        config: &NotifierConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        let ledger = Arc::new(DedupLedger::new(repos.ledger));
        let delivery = Arc::new(DeliveryEngine::new(
            transport,
            Arc::clone(&ledger),
            Arc::clone(&repos.recipients),
            config.delivery.clone(),
        ));

        Self {
            scanner: ChangeScanner::new(repos.changes, config.scanner.lag_buffer()),
            resolver: RecipientResolver::new(repos.recipients),
            ledger,
            delivery,
            watcher: FileChangeWatcher::new(config.watcher.paths.clone()),
            scanner_config: config.scanner.clone(),
            ledger_config: config.ledger.clone(),
            watcher_config: config.watcher.clone(),
            phase: RwLock::new(CyclePhase::Idle),
            cancellation_token,
        }
    }

    /// Wire every component against one shared pool.
    pub fn from_pool(
        pool: DbPool,
        transport: Arc<dyn Transport>,
        config: &NotifierConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self::new(
            Repositories::from_pool(pool),
            transport,
            config,
            cancellation_token,
        )
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.read()
    }

    fn set_phase(&self, phase: CyclePhase) {
        *self.phase.write() = phase;
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub fn ledger(&self) -> &DedupLedger {
        &self.ledger
    }

    /// Cursor for a fresh start: `now - startup_lookback`.
    pub fn initial_state(&self) -> ScannerState {
        ScannerState::with_lookback(self.scanner_config.startup_lookback())
    }

    /// Run one scan → resolve → deliver cycle.
    ///
    /// On success the cursor advances to the cycle's start time and the retry
    /// list is replaced. On error the state is left untouched.
    pub async fn run_cycle(&self, state: &mut ScannerState) -> Result<CycleReport> {
        let result = self.run_cycle_inner(state).await;
        self.set_phase(CyclePhase::Idle);
        result
    }

    async fn run_cycle_inner(&self, state: &mut ScannerState) -> Result<CycleReport> {
        let cycle_start = Utc::now();
        let window_start_ms = state.window_start_ms(self.scanner_config.lag_buffer());

        self.set_phase(CyclePhase::Scanning);
        let outcome = self.scanner.scan(state).await?;
        let changes = outcome.records.len();

        // Fresh records get the full retry budget; carried records keep theirs.
        let budget = self.scanner_config.max_retry_cycles;
        let mut work: Vec<(ChangeRecord, u32)> =
            outcome.records.into_iter().map(|r| (r, budget)).collect();
        let mut retried = 0;
        for retry in state.retries() {
            if !work.iter().any(|(r, _)| r.same_instance(&retry.record)) {
                work.push((retry.record.clone(), retry.cycles_left));
                retried += 1;
            }
        }

        self.set_phase(CyclePhase::Resolving);
        let mut tasks = Vec::new();
        for (record, _) in &work {
            let recipients = self.resolver.resolve(record).await?;
            if recipients.is_empty() {
                debug!(entity = %record.key, kind = %record.kind, "No recipients for change");
                continue;
            }
            let text: Arc<str> = Arc::from(record.message());
            tasks.extend(
                recipients
                    .into_iter()
                    .map(|r| DeliveryTask::for_change(record, r, Arc::clone(&text))),
            );
        }

        self.set_phase(CyclePhase::Delivering);
        let delivery = self.delivery.deliver(tasks, &self.cancellation_token).await;
        if delivery.store_failures > 0 {
            return Err(Error::store_unavailable(
                "deliver notifications",
                format!("{} ledger or recipient writes failed", delivery.store_failures),
            ));
        }

        let unsent: HashSet<(NotificationType, &str)> = delivery
            .retry_keys
            .iter()
            .map(|k| (k.notification_type, k.entity_key.as_str()))
            .collect();
        let mut carried = Vec::new();
        for (record, cycles_left) in work {
            let entity_key = record.ledger_entity_key();
            if !unsent.contains(&(record.notification_type(), entity_key.as_str())) {
                continue;
            }
            if cycles_left == 0 {
                warn!(
                    entity = %record.key,
                    kind = %record.kind,
                    "Giving up on change after repeated delivery failures"
                );
                continue;
            }
            carried.push(PendingRetry {
                record,
                cycles_left: cycles_left - 1,
            });
        }

        let carried_forward = carried.len();
        state.replace_retries(carried);
        state.advance_to(cycle_start);

        Ok(CycleReport {
            window_start_ms,
            changes,
            skipped_rows: outcome.skipped,
            retried,
            carried_forward,
            delivery,
        })
    }

    /// Check every watched file and broadcast pending content changes.
    ///
    /// A file is marked notified only when its broadcast completed; otherwise
    /// it stays pending and is dispatched again on the next check.
    pub async fn check_files(&self) -> Result<DeliveryReport> {
        let mut report = DeliveryReport::default();
        for path in self.watcher.paths() {
            let changed = self.watcher.check_changed(path).await;
            if !changed && !self.watcher.is_pending(path) {
                continue;
            }
            let Some(change) = self.watcher.pending_change(path) else {
                continue;
            };

            let recipients = self.resolver.broadcast().await?;
            let text: Arc<str> = Arc::from(change.message());
            let tasks = recipients
                .into_iter()
                .map(|r| DeliveryTask::for_file(&change, r, Arc::clone(&text)))
                .collect();
            let file_report = self.delivery.deliver(tasks, &self.cancellation_token).await;

            if file_report.is_complete() {
                self.watcher.mark_notified(path, &change);
                info!(path = %path.display(), sent = file_report.sent, "File change broadcast");
            } else {
                warn!(
                    path = %path.display(),
                    exhausted = file_report.exhausted,
                    store_failures = file_report.store_failures,
                    "File change broadcast incomplete, will retry"
                );
            }
            report.merge(file_report);
        }
        Ok(report)
    }

    /// Drop ledger cache entries older than the configured horizon.
    pub fn prune_ledger(&self) -> usize {
        self.ledger.prune(self.ledger_config.cache_horizon())
    }

    /// Run until the cancellation token fires.
    pub async fn run(self: Arc<Self>) {
        info!(
            poll_interval_secs = self.scanner_config.poll_interval_secs,
            watched_files = self.watcher.paths().len(),
            "Cycle coordinator started"
        );

        let watch_handle = (!self.watcher.paths().is_empty())
            .then(|| tokio::spawn(Arc::clone(&self).watch_loop()));
        let prune_handle = tokio::spawn(Arc::clone(&self).prune_loop());

        let mut state = self.initial_state();
        loop {
            let wait = match self.run_cycle(&mut state).await {
                Ok(report) => {
                    info!(
                        changes = report.changes,
                        skipped_rows = report.skipped_rows,
                        retried = report.retried,
                        sent = report.delivery.sent,
                        deactivated = report.delivery.deactivated,
                        carried_forward = report.carried_forward,
                        "Cycle completed"
                    );
                    self.scanner_config.poll_interval()
                }
                Err(e) => {
                    error!(
                        error = %e,
                        cursor = %state.last_check_time(),
                        "Cycle failed, retrying the same window after backoff"
                    );
                    self.scanner_config.error_backoff()
                }
            };

            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        if let Some(handle) = watch_handle {
            let _ = handle.await;
        }
        let _ = prune_handle.await;
        info!("Cycle coordinator stopped");
    }

    async fn watch_loop(self: Arc<Self>) {
        loop {
            if let Err(e) = self.check_files().await {
                error!(error = %e, "File check failed");
            }
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    debug!("File watcher shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.watcher_config.check_interval()) => {}
            }
        }
    }

    async fn prune_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    debug!("Ledger pruner shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.ledger_config.prune_interval()) => {
                    self.prune_ledger();
                }
            }
        }
    }

    /// Request shutdown. In-flight sends finish; no new batches start.
    pub fn shutdown(&self) {
        self.cancellation_token.cancel();
    }
}
