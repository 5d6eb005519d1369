//! Queue consumer that persists trap events
//!
//! Each worker owns a fixed set of partitions, handles deliveries in order,
//! and acknowledges an entry only after its transaction committed or the
//! payload was safely dead-lettered. Anything else stays pending and is
//! replayed to the same consumer name on a later poll or after a restart.

use crate::config::{DedupeStrategy, PersisterConfig};
use crate::dead_letter::{DeadLetter, DeadLetterSink, FailureKind};
use crate::error::StoreError;
use crate::health::HealthState;
use crate::message;
use crate::queue::{Consumer, Delivery, EventQueue};
use crate::store::{PersistOutcome, TrapRecord, TrapStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Persisted { trap_id: i64 },
    Duplicate,
    DeadLettered,
    /// Left unacknowledged for a later redelivery.
    Deferred,
}

/// Per-worker totals returned when the worker exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub consumer: String,
    pub persisted: u64,
    pub duplicates: u64,
    pub dead_lettered: u64,
    pub deferred: u64,
}

impl WorkerReport {
    fn record(&mut self, disposition: &Disposition) {
        match disposition {
            Disposition::Persisted { .. } => self.persisted += 1,
            Disposition::Duplicate => self.duplicates += 1,
            Disposition::DeadLettered => self.dead_lettered += 1,
            Disposition::Deferred => self.deferred += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PersisterSettings {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub dedupe: DedupeStrategy,
    /// Pause after an empty poll.
    pub idle_delay: Duration,
}

impl PersisterSettings {
    pub fn new(config: &PersisterConfig, batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            dedupe: config.dedupe,
            idle_delay: Duration::from_millis(50),
        }
    }

    /// Delay before retry `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

#[derive(Clone)]
pub struct Persister {
    queue: Arc<dyn EventQueue>,
    store: Arc<dyn TrapStore>,
    dead_letters: DeadLetterSink,
    health: Arc<HealthState>,
    settings: PersisterSettings,
}

impl Persister {
    pub fn new(
        queue: Arc<dyn EventQueue>,
        store: Arc<dyn TrapStore>,
        dead_letters: DeadLetterSink,
        health: Arc<HealthState>,
        settings: PersisterSettings,
    ) -> Self {
        Self {
            queue,
            store,
            dead_letters,
            health,
            settings,
        }
    }

    /// One task per worker, each with a disjoint partition set.
    pub fn spawn_workers(
        &self,
        consumer_prefix: &str,
        workers: u32,
        partitions: u32,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<WorkerReport>> {
        (0..workers)
            .map(|index| {
                let consumer = Consumer::for_worker(consumer_prefix, index, workers, partitions);
                let persister = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { persister.run_worker(consumer, cancel).await })
            })
            .collect()
    }

    /// Poll and persist until cancelled. In-flight deliveries finish first.
    pub async fn run_worker(&self, mut consumer: Consumer, cancel: CancellationToken) -> WorkerReport {
        let mut report = WorkerReport {
            consumer: consumer.name.clone(),
            ..WorkerReport::default()
        };
        let mut poll_failures = 0u32;
        info!(
            consumer = %consumer.name,
            partitions = ?consumer.partitions,
            "Persister worker started"
        );

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.queue.poll(&mut consumer, self.settings.batch_size) => polled,
            };

            let deliveries = match polled {
                Ok(deliveries) => {
                    poll_failures = 0;
                    self.health.record_poll();
                    deliveries
                }
                Err(e) => {
                    poll_failures = poll_failures.saturating_add(1);
                    self.health.set_queue_reachable(false);
                    let delay = self.settings.backoff(poll_failures);
                    warn!(consumer = %consumer.name, "Queue poll failed ({}), retrying in {:?}", e, delay);
                    if self.sleep_or_cancel(delay, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            if deliveries.is_empty() {
                if self.sleep_or_cancel(self.settings.idle_delay, &cancel).await {
                    break;
                }
                continue;
            }

            for delivery in &deliveries {
                let disposition = self.process_delivery(delivery, &cancel).await;
                if disposition == Disposition::Deferred {
                    consumer.replay_pending();
                }
                report.record(&disposition);
            }
        }

        info!(
            consumer = %report.consumer,
            persisted = report.persisted,
            duplicates = report.duplicates,
            dead_lettered = report.dead_lettered,
            deferred = report.deferred,
            "Persister worker stopped"
        );
        report
    }

    /// Decode, persist with retries, then acknowledge or dead-letter one delivery.
    pub async fn process_delivery(&self, delivery: &Delivery, cancel: &CancellationToken) -> Disposition {
        let decoded = match message::decode(&delivery.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(delivery = %delivery.id, "Rejecting invalid payload: {}", e);
                let failure = FailureKind::Validation { error: e.to_string() };
                return self.dead_letter(delivery, failure).await;
            }
        };
        let record = TrapRecord::from_decoded(&decoded);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.store.persist(&record, self.settings.dedupe).await {
                Ok(outcome) => {
                    self.health.set_store_reachable(true);
                    let disposition = match outcome {
                        PersistOutcome::Inserted { trap_id } => {
                            debug!(delivery = %delivery.id, trap_id, "Persisted trap");
                            Disposition::Persisted { trap_id }
                        }
                        PersistOutcome::Duplicate => {
                            debug!(delivery = %delivery.id, "Skipped redelivered trap");
                            Disposition::Duplicate
                        }
                    };
                    return self.acknowledge(delivery, disposition).await;
                }
                Err(StoreError::Fatal(reason)) => {
                    error!(
                        delivery = %delivery.id,
                        payload = %delivery.payload,
                        "Store rejected trap: {}", reason
                    );
                    return self.dead_letter(delivery, FailureKind::StoreFatal { error: reason }).await;
                }
                Err(StoreError::Transient(reason)) => {
                    self.health.set_store_reachable(false);
                    if attempt >= self.settings.max_attempts {
                        error!(delivery = %delivery.id, attempts = attempt, "Store retries exhausted: {}", reason);
                        let failure = FailureKind::RetriesExhausted {
                            attempts: attempt,
                            last_error: reason,
                        };
                        return self.dead_letter(delivery, failure).await;
                    }
                    let delay = self.settings.backoff(attempt);
                    warn!(
                        delivery = %delivery.id,
                        attempt,
                        "Transient store failure ({}), retrying in {:?}", reason, delay
                    );
                    if self.sleep_or_cancel(delay, cancel).await {
                        return Disposition::Deferred;
                    }
                }
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, failure: FailureKind) -> Disposition {
        let letter = DeadLetter::new(failure, delivery.payload.as_str()).with_delivery(delivery.partition, delivery.id.as_str());
        match self.dead_letters.write(&letter).await {
            Ok(_) => self.acknowledge(delivery, Disposition::DeadLettered).await,
            Err(e) => {
                error!(delivery = %delivery.id, "Dead letter failed, leaving entry pending: {:#}", e);
                Disposition::Deferred
            }
        }
    }

    async fn acknowledge(&self, delivery: &Delivery, disposition: Disposition) -> Disposition {
        match self.queue.ack(delivery).await {
            Ok(()) => disposition,
            Err(e) => {
                // Committed work replays as a duplicate when the fingerprint gate is on.
                warn!(delivery = %delivery.id, outcome = ?disposition, "Acknowledge failed: {}", e);
                self.health.set_queue_reachable(false);
                Disposition::Deferred
            }
        }
    }

    /// Returns true when cancellation cut the sleep short.
    async fn sleep_or_cancel(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::{Normalizer, RawTrapRecord};
    use crate::queue::MemoryQueue;
    use crate::store::MemoryTrapStore;
    use tempfile::TempDir;

    fn settings(max_attempts: u32) -> PersisterSettings {
        PersisterSettings {
            batch_size: 16,
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            dedupe: DedupeStrategy::Fingerprint,
            idle_delay: Duration::from_millis(1),
        }
    }

    fn fixture(max_attempts: u32) -> (TempDir, Arc<MemoryQueue>, Arc<MemoryTrapStore>, Persister) {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(MemoryQueue::new(1));
        let store = Arc::new(MemoryTrapStore::new());
        let persister = Persister::new(
            queue.clone(),
            store.clone(),
            DeadLetterSink::new(dir.path().join("dead")),
            HealthState::new(),
            settings(max_attempts),
        );
        (dir, queue, store, persister)
    }

    async fn publish_one(queue: &MemoryQueue) -> Delivery {
        let raw = RawTrapRecord::parse_handoff(
            "r1\nUDP: [10.0.0.5]:161->[10.0.0.2]:162\nSNMPv2-MIB::snmpTrapOID.0 IF-MIB::linkDown\n",
        );
        let event = Normalizer::default().normalize(&raw);
        let line = message::encode(&event).unwrap();
        queue.publish(event.partition_key(), &line).await.unwrap();
        poll_all(queue).await.remove(0)
    }

    async fn poll_all(queue: &MemoryQueue) -> Vec<Delivery> {
        let mut consumer = Consumer::new("test-0", vec![0]);
        queue.poll(&mut consumer, 100).await.unwrap()
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let s = settings(5);
        assert_eq!(s.backoff(1), Duration::from_millis(1));
        assert_eq!(s.backoff(2), Duration::from_millis(2));
        assert_eq!(s.backoff(3), Duration::from_millis(4));
        assert_eq!(s.backoff(40), Duration::from_millis(4));
    }

    #[tokio::test]
    async fn committed_delivery_is_acknowledged() {
        let (_dir, queue, store, persister) = fixture(3);
        let delivery = publish_one(&queue).await;

        let disposition = persister.process_delivery(&delivery, &CancellationToken::new()).await;
        assert_eq!(disposition, Disposition::Persisted { trap_id: 1 });
        assert_eq!(store.row_count(), 1);
        assert_eq!(queue.unacknowledged(), 0);
    }

    #[tokio::test]
    async fn malformed_payload_is_dead_lettered_and_acknowledged() {
        let (dir, queue, store, persister) = fixture(3);
        queue.publish("k", "{\"level\":\"INFO\"}").await.unwrap();
        let delivery = poll_all(&queue).await.remove(0);

        let disposition = persister.process_delivery(&delivery, &CancellationToken::new()).await;
        assert_eq!(disposition, Disposition::DeadLettered);
        assert_eq!(store.row_count(), 0);
        assert_eq!(queue.unacknowledged(), 0);

        let letters = DeadLetterSink::new(dir.path().join("dead")).list().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].delivery_id.as_deref(), Some(delivery.id.as_str()));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (_dir, queue, store, persister) = fixture(3);
        store.inject_failure(StoreError::Transient("connection reset".into()));
        store.inject_failure(StoreError::Transient("connection reset".into()));
        let delivery = publish_one(&queue).await;

        let disposition = persister.process_delivery(&delivery, &CancellationToken::new()).await;
        assert!(matches!(disposition, Disposition::Persisted { .. }));
        assert_eq!(store.row_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_end_in_a_dead_letter() {
        let (dir, queue, store, persister) = fixture(2);
        for _ in 0..2 {
            store.inject_failure(StoreError::Transient("too many clients".into()));
        }
        let delivery = publish_one(&queue).await;

        let disposition = persister.process_delivery(&delivery, &CancellationToken::new()).await;
        assert_eq!(disposition, Disposition::DeadLettered);
        let letters = DeadLetterSink::new(dir.path().join("dead")).list().await.unwrap();
        assert_eq!(
            letters[0].failure,
            FailureKind::RetriesExhausted {
                attempts: 2,
                last_error: "too many clients".into()
            }
        );
        assert_eq!(queue.unacknowledged(), 0);
    }

    #[tokio::test]
    async fn fatal_failure_dead_letters_without_retry() {
        let (_dir, queue, store, persister) = fixture(5);
        store.inject_failure(StoreError::Fatal("value too long".into()));
        let delivery = publish_one(&queue).await;

        let disposition = persister.process_delivery(&delivery, &CancellationToken::new()).await;
        assert_eq!(disposition, Disposition::DeadLettered);
        assert_eq!(store.row_count(), 0);
    }

    #[tokio::test]
    async fn unwritable_dead_letter_leaves_the_entry_pending() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let queue = Arc::new(MemoryQueue::new(1));
        let persister = Persister::new(
            queue.clone(),
            Arc::new(MemoryTrapStore::new()),
            DeadLetterSink::new(blocker.join("dead")),
            HealthState::new(),
            settings(1),
        );
        queue.publish("k", "garbage").await.unwrap();
        let delivery = poll_all(&queue).await.remove(0);

        let disposition = persister.process_delivery(&delivery, &CancellationToken::new()).await;
        assert_eq!(disposition, Disposition::Deferred);
        assert_eq!(queue.unacknowledged(), 1);
    }

    #[tokio::test]
    async fn failed_acknowledge_defers_and_replays_as_a_duplicate() {
        let (_dir, queue, store, persister) = fixture(3);
        let delivery = publish_one(&queue).await;

        queue.set_unavailable(true);
        let disposition = persister.process_delivery(&delivery, &CancellationToken::new()).await;
        assert_eq!(disposition, Disposition::Deferred);
        assert_eq!(store.row_count(), 1);
        assert_eq!(queue.unacknowledged(), 1);

        queue.set_unavailable(false);
        let mut consumer = Consumer::new("test-0", vec![0]);
        let replayed = queue.poll(&mut consumer, 10).await.unwrap().remove(0);
        assert_eq!(
            persister.process_delivery(&replayed, &CancellationToken::new()).await,
            Disposition::Duplicate
        );
        assert_eq!(queue.unacknowledged(), 0);
        assert_eq!(store.row_count(), 1);
    }

    #[tokio::test]
    async fn worker_recovers_entries_from_a_lost_reply() {
        let (_dir, queue, store, persister) = fixture(3);
        let raw = RawTrapRecord::parse_handoff(
            "r9\nUDP: [10.0.0.9]:161->[10.0.0.2]:162\nSNMPv2-MIB::snmpTrapOID.0 IF-MIB::linkUp\n",
        );
        let event = Normalizer::default().normalize(&raw);
        queue.publish(event.partition_key(), &message::encode(&event).unwrap()).await.unwrap();
        queue.lose_next_reply();

        let cancel = CancellationToken::new();
        let handles = persister.spawn_workers("trapsink", 1, 1, &cancel);
        for _ in 0..100 {
            if queue.unacknowledged() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.row_count(), 1);
        assert_eq!(queue.unacknowledged(), 0);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_defers() {
        let (dir, queue, store, _) = fixture(5);
        let persister = Persister::new(
            queue.clone(),
            store.clone(),
            DeadLetterSink::new(dir.path().join("dead")),
            HealthState::new(),
            PersisterSettings {
                initial_backoff: Duration::from_secs(60),
                max_backoff: Duration::from_secs(60),
                ..settings(5)
            },
        );
        store.inject_failure(StoreError::Transient("restarting".into()));
        let delivery = publish_one(&queue).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let disposition = persister.process_delivery(&delivery, &cancel).await;
        assert_eq!(disposition, Disposition::Deferred);
        assert_eq!(queue.unacknowledged(), 1);
    }

    #[tokio::test]
    async fn worker_drains_and_stops_on_cancel() {
        let (_dir, queue, store, persister) = fixture(3);
        for n in 0..5 {
            queue.publish("k", &format!("bad-{}", n)).await.unwrap();
        }
        publish_one(&queue).await;
        queue.redeliver_pending();

        let cancel = CancellationToken::new();
        let handles = persister.spawn_workers("trapsink", 1, 1, &cancel);
        for _ in 0..100 {
            if queue.unacknowledged() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();

        let mut reports = Vec::new();
        for handle in handles {
            reports.push(handle.await.unwrap());
        }
        assert_eq!(reports[0].consumer, "trapsink-0");
        assert_eq!(reports[0].persisted, 1);
        assert_eq!(reports[0].dead_lettered, 5);
        assert_eq!(store.row_count(), 1);
    }
}
