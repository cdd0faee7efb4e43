//! Delivery engine.
//!
//! Turns (change, recipient) pairs into transport sends. Each task consults the
//! dedup ledger first, sends under a global concurrency bound, and records the
//! ledger entry only after the transport confirmed delivery. Tasks run in
//! batches separated by a fixed pause to stay under transport rate limits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channels::Transport;
use super::events::{ChangeRecord, FileChange};
use super::ledger::{DedupLedger, LedgerKey};
use crate::database::models::Recipient;
use crate::database::repositories::RecipientRepository;

/// Delivery engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Global bound on concurrent transport sends.
    pub max_concurrent_sends: usize,
    /// Tasks started together before the inter-batch pause.
    pub batch_size: usize,
    pub inter_batch_pause_ms: u64,
    /// Send attempts per task, including the first.
    pub max_attempts: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sends: 16,
            batch_size: 25,
            inter_batch_pause_ms: 1000,
            max_attempts: 3,
            initial_retry_delay_ms: 500,
            max_retry_delay_ms: 10_000,
        }
    }
}

impl DeliveryConfig {
    pub fn inter_batch_pause(&self) -> Duration {
        Duration::from_millis(self.inter_batch_pause_ms)
    }
}

/// One message for one recipient.
#[derive(Debug, Clone)]
pub struct DeliveryTask {
    pub key: LedgerKey,
    pub recipient: Recipient,
    /// Rendered once per change and shared by all its tasks.
    pub text: Arc<str>,
}

impl DeliveryTask {
    pub fn for_change(record: &ChangeRecord, recipient: Recipient, text: Arc<str>) -> Self {
        Self {
            key: record.ledger_key(recipient.id),
            recipient,
            text,
        }
    }

    pub fn for_file(change: &FileChange, recipient: Recipient, text: Arc<str>) -> Self {
        Self {
            key: change.ledger_key(recipient.id),
            recipient,
            text,
        }
    }
}

/// Final state of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum DeliveryOutcome {
    Sent,
    /// Delivered, but the ledger write failed.
    SentUnrecorded,
    AlreadySent,
    RecipientInactive,
    /// Permanent failure; the recipient was flipped to inactive.
    Deactivated,
    /// Transient failures used up every attempt.
    Exhausted,
    Cancelled,
    /// The ledger or recipient store failed before a send.
    StoreFailed,
}

/// Counts for one [`DeliveryEngine::deliver`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub skipped: usize,
    pub deactivated: usize,
    pub exhausted: usize,
    pub cancelled: usize,
    pub store_failures: usize,
    /// Keys left unsent for a later attempt (exhausted or cancelled).
    pub retry_keys: Vec<LedgerKey>,
}

impl DeliveryReport {
    fn record(&mut self, key: LedgerKey, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Sent => self.sent += 1,
            DeliveryOutcome::SentUnrecorded => {
                self.sent += 1;
                self.store_failures += 1;
            }
            DeliveryOutcome::AlreadySent | DeliveryOutcome::RecipientInactive => self.skipped += 1,
            DeliveryOutcome::Deactivated => self.deactivated += 1,
            DeliveryOutcome::Exhausted => {
                self.exhausted += 1;
                self.retry_keys.push(key);
            }
            DeliveryOutcome::Cancelled => {
                self.cancelled += 1;
                self.retry_keys.push(key);
            }
            DeliveryOutcome::StoreFailed => self.store_failures += 1,
        }
    }

    /// Add another report's counts to this one.
    pub fn merge(&mut self, other: DeliveryReport) {
        self.sent += other.sent;
        self.skipped += other.skipped;
        self.deactivated += other.deactivated;
        self.exhausted += other.exhausted;
        self.cancelled += other.cancelled;
        self.store_failures += other.store_failures;
        self.retry_keys.extend(other.retry_keys);
    }

    /// Every task reached a final state that needs no further attempt.
    pub fn is_complete(&self) -> bool {
        self.exhausted == 0 && self.cancelled == 0 && self.store_failures == 0
    }

    pub fn total(&self) -> usize {
        self.sent
            + self.skipped
            + self.deactivated
            + self.exhausted
            + self.cancelled
            + self.store_failures
    }
}

/// Delivery engine shared by the change pipeline and the file watcher.
pub struct DeliveryEngine {
    transport: Arc<dyn Transport>,
    ledger: Arc<DedupLedger>,
    recipients: Arc<dyn RecipientRepository>,
    /// Global send concurrency bound.
    semaphore: Arc<Semaphore>,
    config: DeliveryConfig,
}

impl DeliveryEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        ledger: Arc<DedupLedger>,
        recipients: Arc<dyn RecipientRepository>,
        config: DeliveryConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_sends.max(1)));
        Self {
            transport,
            ledger,
            recipients,
            semaphore,
            config,
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Deliver every task, in batches.
    ///
    /// Recipients deactivated by a permanent failure are skipped for the rest
    /// of this call. Cancellation stops new batches and pending retries;
    /// sends already in flight finish.
    pub async fn deliver(
        self: &Arc<Self>,
        tasks: Vec<DeliveryTask>,
        cancel: &CancellationToken,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        if tasks.is_empty() {
            return report;
        }

        let total = tasks.len();
        let batch_size = self.config.batch_size.max(1);
        let deactivated: Arc<DashSet<i64>> = Arc::new(DashSet::new());
        let mut remaining = tasks.into_iter().peekable();

        while remaining.peek().is_some() {
            if cancel.is_cancelled() {
                for task in remaining.by_ref() {
                    report.record(task.key, DeliveryOutcome::Cancelled);
                }
                break;
            }

            let mut batch = JoinSet::new();
            let mut keys = HashMap::new();
            for task in remaining.by_ref().take(batch_size) {
                let engine = Arc::clone(self);
                let deactivated = Arc::clone(&deactivated);
                let cancel = cancel.clone();
                let key = task.key.clone();
                let handle = batch.spawn(async move {
                    engine.deliver_one(task, &deactivated, &cancel).await
                });
                keys.insert(handle.id(), key);
            }

            while let Some(joined) = batch.join_next_with_id().await {
                let (id, outcome) = match joined {
                    Ok((id, outcome)) => (id, outcome),
                    Err(e) => {
                        // Never sent: carried over like an exhausted task
                        error!(error = %e, "Delivery task panicked");
                        (e.id(), DeliveryOutcome::Exhausted)
                    }
                };
                let Some(key) = keys.remove(&id) else {
                    continue;
                };
                debug!(key = %key, outcome = %outcome, "Delivery task finished");
                report.record(key, outcome);
            }

            if remaining.peek().is_some() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.inter_batch_pause()) => {}
                }
            }
        }

        info!(
            total,
            sent = report.sent,
            skipped = report.skipped,
            deactivated = report.deactivated,
            exhausted = report.exhausted,
            cancelled = report.cancelled,
            store_failures = report.store_failures,
            "Delivery finished"
        );
        report
    }

    async fn deliver_one(
        &self,
        task: DeliveryTask,
        deactivated: &DashSet<i64>,
        cancel: &CancellationToken,
    ) -> DeliveryOutcome {
        let recipient_id = task.recipient.id;
        if !task.recipient.is_active() || deactivated.contains(&recipient_id) {
            return DeliveryOutcome::RecipientInactive;
        }

        match self.ledger.already_sent(&task.key).await {
            Ok(true) => return DeliveryOutcome::AlreadySent,
            Ok(false) => {}
            Err(e) => {
                error!(key = %task.key, error = %e, "Ledger lookup failed");
                return DeliveryOutcome::StoreFailed;
            }
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = {
                let Ok(_permit) = self.semaphore.acquire().await else {
                    return DeliveryOutcome::Cancelled;
                };
                self.transport.send(recipient_id, &task.text).await
            };

            let err = match result {
                Ok(()) => {
                    return match self.ledger.mark_sent(&task.key).await {
                        Ok(()) => DeliveryOutcome::Sent,
                        Err(e) => {
                            error!(key = %task.key, error = %e, "Sent but failed to record in ledger");
                            DeliveryOutcome::SentUnrecorded
                        }
                    };
                }
                Err(err) => err,
            };

            if err.is_permanent() {
                warn!(recipient_id, error = %err, "Permanent delivery failure, deactivating recipient");
                if !deactivated.insert(recipient_id) {
                    return DeliveryOutcome::RecipientInactive;
                }
                return match self.recipients.deactivate(recipient_id).await {
                    Ok(_) => DeliveryOutcome::Deactivated,
                    Err(e) => {
                        error!(recipient_id, error = %e, "Failed to deactivate recipient");
                        DeliveryOutcome::StoreFailed
                    }
                };
            }

            if attempt >= self.config.max_attempts.max(1) {
                warn!(
                    key = %task.key,
                    attempts = attempt,
                    error = %err,
                    "Delivery attempts exhausted, leaving unsent"
                );
                return DeliveryOutcome::Exhausted;
            }

            let backoff = self.calculate_retry_delay(attempt - 1);
            let delay = err.retry_after.map_or(backoff, |after| after.max(backoff));
            debug!(
                key = %task.key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient delivery failure, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return DeliveryOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Exponential backoff with ±25% jitter.
    fn calculate_retry_delay(&self, attempts: u32) -> Duration {
        let base_delay = self.config.initial_retry_delay_ms;
        let max_delay = self.config.max_retry_delay_ms;

        let delay_ms = base_delay.saturating_mul(2u64.saturating_pow(attempts));
        let delay_ms = delay_ms.min(max_delay);

        let jitter_range = delay_ms / 4;
        let jittered = if jitter_range > 0 {
            let offset = rand::random::<u64>() % (jitter_range * 2 + 1);
            (delay_ms - jitter_range).saturating_add(offset)
        } else {
            delay_ms
        };

        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DbPool;
    use crate::database::models::RecipientStatus;
    use crate::database::repositories::{
        LedgerRepository, SqlxLedgerRepository, SqlxRecipientRepository,
    };
    use crate::database::test_support::memory_store;
    use crate::notification::channels::TransportError;
    use crate::notification::channels::test_support::ScriptedTransport;
    use crate::notification::events::NotificationType;

    fn fast_config() -> DeliveryConfig {
        DeliveryConfig {
            max_concurrent_sends: 4,
            batch_size: 10,
            inter_batch_pause_ms: 1,
            max_attempts: 3,
            initial_retry_delay_ms: 1,
            max_retry_delay_ms: 5,
        }
    }

    async fn setup(
        transport: Arc<ScriptedTransport>,
        config: DeliveryConfig,
    ) -> (Arc<DeliveryEngine>, DbPool) {
        let pool = memory_store().await;
        sqlx::raw_sql(
            r#"
            INSERT INTO students (id_student, id_group, login, telegram_id, status) VALUES
                (1, 1, 'r1', 1, 'active'),
                (2, 1, 'r2', 2, 'active'),
                (3, 1, 'r3', 3, 'active');
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let ledger = Arc::new(DedupLedger::new(Arc::new(SqlxLedgerRepository::new(
            pool.clone(),
        ))));
        let engine = DeliveryEngine::new(
            transport,
            ledger,
            Arc::new(SqlxRecipientRepository::new(pool.clone())),
            config,
        );
        (Arc::new(engine), pool)
    }

    fn recipient(id: i64) -> Recipient {
        Recipient {
            id,
            student_id: id,
            group_id: 1,
            status: RecipientStatus::Active,
        }
    }

    fn task(entity_key: &str, recipient_id: i64) -> DeliveryTask {
        DeliveryTask {
            key: LedgerKey::new(NotificationType::News, entity_key, recipient_id),
            recipient: recipient(recipient_id),
            text: Arc::from("News: Open day"),
        }
    }

    async fn status_of(pool: &DbPool, telegram_id: i64) -> String {
        sqlx::query_scalar("SELECT status FROM students WHERE telegram_id = ?")
            .bind(telegram_id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sends_once_and_records() {
        let transport = Arc::new(ScriptedTransport::new());
        let (engine, pool) = setup(transport.clone(), fast_config()).await;
        let cancel = CancellationToken::new();

        let report = engine.deliver(vec![task("42", 1), task("42", 2)], &cancel).await;
        assert_eq!(report.sent, 2);
        assert!(report.is_complete());

        let report = engine.deliver(vec![task("42", 1), task("42", 2)], &cancel).await;
        assert_eq!(report.sent, 0);
        assert_eq!(report.skipped, 2);
        assert_eq!(transport.sent().len(), 2);

        let repo = SqlxLedgerRepository::new(pool);
        assert_eq!(repo.list_for_recipient(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_deactivates_without_ledger_entry() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.block(2);
        let (engine, pool) = setup(transport.clone(), fast_config()).await;

        let report = engine
            .deliver(
                vec![task("42", 1), task("42", 2), task("43", 2)],
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.sent, 1);
        assert!(report.deactivated >= 1);
        assert_eq!(report.total(), 3);
        assert_eq!(status_of(&pool, 2).await, "inactive");

        let repo = SqlxLedgerRepository::new(pool);
        assert!(repo.list_for_recipient(2).await.unwrap().is_empty());
        assert_eq!(transport.sent_to(2), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fail_next(1, TransportError::transient("502 - Bad Gateway"));
        transport.fail_next(
            1,
            TransportError::transient("429 - Too Many Requests")
                .with_retry_after(Duration::from_millis(5)),
        );
        let (engine, _pool) = setup(transport.clone(), fast_config()).await;

        let report = engine
            .deliver(vec![task("42", 1)], &CancellationToken::new())
            .await;
        assert_eq!(report.sent, 1);
        assert_eq!(transport.attempts(), 3);
        assert_eq!(transport.sent_to(1), 1);
    }

    #[tokio::test]
    async fn test_exhausted_tasks_are_left_unsent() {
        let transport = Arc::new(ScriptedTransport::new());
        for _ in 0..3 {
            transport.fail_next(1, TransportError::transient("timeout"));
        }
        let (engine, pool) = setup(transport.clone(), fast_config()).await;

        let report = engine
            .deliver(vec![task("42", 1)], &CancellationToken::new())
            .await;
        assert_eq!(report.exhausted, 1);
        assert_eq!(report.retry_keys, vec![task("42", 1).key]);
        assert!(!report.is_complete());
        assert_eq!(status_of(&pool, 1).await, "active");

        // Next run succeeds and records exactly one entry
        let report = engine
            .deliver(vec![task("42", 1)], &CancellationToken::new())
            .await;
        assert_eq!(report.sent, 1);
        let repo = SqlxLedgerRepository::new(pool);
        assert_eq!(repo.list_for_recipient(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_bound_is_respected() {
        let transport = Arc::new(ScriptedTransport::with_send_delay(Duration::from_millis(10)));
        let config = DeliveryConfig {
            max_concurrent_sends: 2,
            batch_size: 50,
            ..fast_config()
        };
        let (engine, _pool) = setup(transport.clone(), config).await;

        let tasks = (0..12).map(|i| task(&format!("n{i}"), 1)).collect();
        let report = engine.deliver(tasks, &CancellationToken::new()).await;
        assert_eq!(report.sent, 12);
        assert!(transport.max_in_flight() <= 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_sends_nothing() {
        let transport = Arc::new(ScriptedTransport::new());
        let (engine, _pool) = setup(transport.clone(), fast_config()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = engine.deliver(vec![task("42", 1), task("42", 2)], &cancel).await;
        assert_eq!(report.cancelled, 2);
        assert_eq!(report.retry_keys.len(), 2);
        assert_eq!(transport.attempts(), 0);
    }

    #[tokio::test]
    async fn test_batches_are_paced() {
        let transport = Arc::new(ScriptedTransport::new());
        let config = DeliveryConfig {
            batch_size: 1,
            inter_batch_pause_ms: 20,
            ..fast_config()
        };
        let (engine, _pool) = setup(transport.clone(), config).await;

        let started = std::time::Instant::now();
        let tasks = (0..3).map(|i| task(&format!("n{i}"), 1)).collect();
        engine.deliver(tasks, &CancellationToken::new()).await;
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    /// Panics on every send to one recipient, succeeds for the others.
    struct PanickingTransport {
        panic_for: i64,
    }

    #[async_trait::async_trait]
    impl Transport for PanickingTransport {
        fn transport_type(&self) -> &'static str {
            "panicking"
        }

        async fn send(
            &self,
            recipient_id: i64,
            _text: &str,
        ) -> std::result::Result<(), crate::notification::channels::TransportError> {
            if recipient_id == self.panic_for {
                panic!("transport bug for recipient {recipient_id}");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panicked_task_is_left_for_retry() {
        let pool = memory_store().await;
        let ledger = Arc::new(DedupLedger::new(Arc::new(SqlxLedgerRepository::new(
            pool.clone(),
        ))));
        let engine = Arc::new(DeliveryEngine::new(
            Arc::new(PanickingTransport { panic_for: 1 }),
            ledger,
            Arc::new(SqlxRecipientRepository::new(pool.clone())),
            fast_config(),
        ));

        let report = engine
            .deliver(vec![task("42", 1), task("42", 2)], &CancellationToken::new())
            .await;
        assert_eq!(report.sent, 1);
        assert_eq!(report.exhausted, 1);
        assert_eq!(report.retry_keys, vec![task("42", 1).key]);
        assert!(!report.is_complete());

        let repo = SqlxLedgerRepository::new(pool);
        assert!(repo.list_for_recipient(1).await.unwrap().is_empty());
    }

    #[test]
    fn test_retry_delay_bounds() {
        let engine = DeliveryEngine {
            transport: Arc::new(ScriptedTransport::new()),
            ledger: Arc::new(DedupLedger::new(Arc::new(NeverLedger))),
            recipients: Arc::new(NeverRecipients),
            semaphore: Arc::new(Semaphore::new(1)),
            config: DeliveryConfig::default(),
        };
        for attempt in 0..8 {
            let delay = engine.calculate_retry_delay(attempt).as_millis() as u64;
            let nominal = (500u64 << attempt).min(10_000);
            assert!(delay >= nominal - nominal / 4, "attempt {attempt}: {delay}");
            assert!(delay <= nominal + nominal / 4, "attempt {attempt}: {delay}");
        }
    }

    struct NeverLedger;

    #[async_trait::async_trait]
    impl LedgerRepository for NeverLedger {
        async fn exists(&self, _key: &LedgerKey) -> crate::Result<bool> {
            Ok(false)
        }
        async fn insert(&self, _key: &LedgerKey, _sent_at: i64) -> crate::Result<()> {
            Ok(())
        }
        async fn list_for_recipient(
            &self,
            _recipient_id: i64,
        ) -> crate::Result<Vec<crate::database::models::LedgerEntryDbModel>> {
            Ok(Vec::new())
        }
    }

    struct NeverRecipients;

    #[async_trait::async_trait]
    impl RecipientRepository for NeverRecipients {
        async fn list_active(&self) -> crate::Result<Vec<Recipient>> {
            Ok(Vec::new())
        }
        async fn list_active_for_news(&self, _news_id: i64) -> crate::Result<Vec<Recipient>> {
            Ok(Vec::new())
        }
        async fn list_active_in_group(&self, _group_id: i64) -> crate::Result<Vec<Recipient>> {
            Ok(Vec::new())
        }
        async fn find_active_for_student(
            &self,
            _student_id: i64,
        ) -> crate::Result<Option<Recipient>> {
            Ok(None)
        }
        async fn deactivate(&self, _recipient_id: i64) -> crate::Result<bool> {
            Ok(false)
        }
    }
}
