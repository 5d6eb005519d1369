//! Queue seam for trap events
//!
//! The queue is an external durable log. `EventQueue` is the only surface the
//! publisher and persister see; Redis Streams back it in production, one
//! stream per partition under a single consumer group.

use crate::error::QueueError;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamReadReply;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Stream entry field holding the canonical message.
pub const PAYLOAD_FIELD: &str = "payload";

/// Delivery handed to a consumer; acknowledge it once it is durable downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub partition: u32,
    pub id: String,
    pub payload: String,
    /// Entry was delivered before and never acknowledged.
    pub redelivered: bool,
}

/// One member of the consumer group and the partitions it owns.
#[derive(Debug, Clone)]
pub struct Consumer {
    pub name: String,
    pub partitions: Vec<u32>,
    /// Partitions whose own pending entries are still being walked, with the
    /// last entry id returned from each.
    replay: BTreeMap<u32, String>,
    replay_requested: bool,
}

impl Consumer {
    pub fn new(name: impl Into<String>, partitions: Vec<u32>) -> Self {
        let mut consumer = Self {
            name: name.into(),
            partitions,
            replay: BTreeMap::new(),
            replay_requested: false,
        };
        consumer.restart_replay();
        consumer
    }

    /// Worker `index` of `workers` owns partitions `p` with `p % workers == index`.
    pub fn for_worker(prefix: &str, index: u32, workers: u32, partitions: u32) -> Self {
        let owned = (0..partitions).filter(|p| p % workers == index).collect();
        Self::new(format!("{}-{}", prefix, index), owned)
    }

    /// Walk the pending entries again after the next read of new entries.
    pub fn replay_pending(&mut self) {
        self.replay_requested = true;
    }

    pub fn is_replaying(&self) -> bool {
        !self.replay.is_empty()
    }

    fn restart_replay(&mut self) {
        self.replay = self.partitions.iter().map(|p| (*p, "0".to_string())).collect();
        self.replay_requested = false;
    }

    /// Move each cursor past the entries just returned. A partition with
    /// nothing returned has no pending entries left and stops replaying.
    fn advance_replay(&mut self, returned: &[Delivery]) {
        self.replay.retain(|partition, cursor| {
            match returned.iter().rev().find(|d| d.partition == *partition) {
                Some(last) => {
                    *cursor = last.id.clone();
                    true
                }
                None => false,
            }
        });
    }

    fn read_finished(&mut self) {
        if self.replay_requested {
            self.restart_replay();
        }
    }
}

#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Append a payload; returns the entry id assigned by the queue.
    async fn publish(&self, partition_key: &str, payload: &str) -> Result<String, QueueError>;

    /// Next batch for this consumer, at most `max` entries.
    async fn poll(&self, consumer: &mut Consumer, max: usize) -> Result<Vec<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;
}

/// Stable partition for a key, identical across processes and builds.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    let digest = Sha256::digest(key.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix % partitions
}

/// Redis Streams backed queue
pub struct RedisStreamQueue {
    client: redis::Client,
    stream: String,
    group: String,
    partitions: u32,
    /// Publishes are refused once a partition holds this many entries; 0 is unbounded.
    max_stream_length: u64,
    block_ms: u64,
    connection: AsyncMutex<Option<MultiplexedConnection>>,
    /// Blocking reads stall a connection, so each consumer reads on its own.
    readers: AsyncMutex<HashMap<String, MultiplexedConnection>>,
}

impl RedisStreamQueue {
    pub fn new(config: &crate::config::QueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| QueueError::Protocol(format!("invalid queue URL: {}", e)))?;
        Ok(Self {
            client,
            stream: config.stream.clone(),
            group: config.consumer_group.clone(),
            partitions: config.partitions.max(1),
            max_stream_length: config.max_stream_length,
            block_ms: config.block_ms,
            connection: AsyncMutex::new(None),
            readers: AsyncMutex::new(HashMap::new()),
        })
    }

    fn stream_key(&self, partition: u32) -> String {
        format!("{}:{}", self.stream, partition)
    }

    fn partition_of(&self, key: &str) -> Option<u32> {
        key.strip_prefix(&self.stream)?
            .strip_prefix(':')?
            .parse()
            .ok()
    }

    /// Shared multiplexed connection, re-established after failures.
    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!("Connected to queue for stream {}", self.stream);
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reader_connection(&self, consumer: &str) -> Result<MultiplexedConnection, QueueError> {
        let mut readers = self.readers.lock().await;
        if let Some(conn) = readers.get(consumer) {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        readers.insert(consumer.to_string(), conn.clone());
        Ok(conn)
    }

    async fn reset_on_failure(&self, err: &QueueError) {
        match err {
            QueueError::Unavailable(_) => {
                *self.connection.lock().await = None;
                self.readers.lock().await.clear();
            }
            // A restarted broker without persistence forgets the group.
            QueueError::Protocol(message) if message.contains("NOGROUP") => {
                if let Err(e) = self.ensure_group().await {
                    warn!("Failed to recreate consumer group {}: {}", self.group, e);
                }
            }
            _ => {}
        }
    }

    /// Create the consumer group on every partition stream if it does not exist yet.
    pub async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        for partition in 0..self.partitions {
            let result: redis::RedisResult<String> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(self.stream_key(partition))
                .arg(&self.group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;
            match result {
                Ok(_) => info!("Created consumer group {} on {}", self.group, self.stream_key(partition)),
                Err(e) if e.code() == Some("BUSYGROUP") => {
                    debug!("Consumer group {} already exists on {}", self.group, self.stream_key(partition));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// XREADGROUP over the consumer's partitions: new entries with BLOCK, or
    /// its own pending entries after the replay cursors.
    async fn read_group(
        &self,
        conn: &mut MultiplexedConnection,
        consumer: &Consumer,
        max: usize,
        from_pending: bool,
    ) -> Result<Vec<Delivery>, QueueError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&consumer.name)
            .arg("COUNT")
            .arg(max);
        if !from_pending {
            cmd.arg("BLOCK").arg(self.block_ms);
        }
        cmd.arg("STREAMS");
        if from_pending {
            for partition in consumer.replay.keys() {
                cmd.arg(self.stream_key(*partition));
            }
            for cursor in consumer.replay.values() {
                cmd.arg(cursor);
            }
        } else {
            for partition in &consumer.partitions {
                cmd.arg(self.stream_key(*partition));
            }
            for _ in &consumer.partitions {
                cmd.arg(">");
            }
        }

        let reply: Option<StreamReadReply> = cmd.query_async(conn).await?;
        let mut deliveries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            let Some(partition) = self.partition_of(&key.key) else {
                warn!("Ignoring entries from unexpected stream {}", key.key);
                continue;
            };
            for entry in key.ids {
                // Pending entries deleted from the stream come back without fields.
                let payload: String = entry.get(PAYLOAD_FIELD).unwrap_or_default();
                deliveries.push(Delivery {
                    partition,
                    id: entry.id,
                    payload,
                    redelivered: from_pending,
                });
            }
        }
        Ok(deliveries)
    }

    async fn append(&self, conn: &mut MultiplexedConnection, key: &str, payload: &str) -> Result<String, QueueError> {
        if self.max_stream_length > 0 {
            let len: u64 = redis::cmd("XLEN").arg(key).query_async(conn).await?;
            if len >= self.max_stream_length {
                return Err(QueueError::Full(self.max_stream_length));
            }
        }
        let id: String = redis::cmd("XADD")
            .arg(key)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(conn)
            .await?;
        Ok(id)
    }
}

#[async_trait]
impl EventQueue for RedisStreamQueue {
    async fn publish(&self, partition_key: &str, payload: &str) -> Result<String, QueueError> {
        let mut conn = self.connection().await?;
        let key = self.stream_key(partition_for(partition_key, self.partitions));

        let result = self.append(&mut conn, &key, payload).await;
        if let Err(e) = &result {
            self.reset_on_failure(e).await;
        }
        result
    }

    async fn poll(&self, consumer: &mut Consumer, max: usize) -> Result<Vec<Delivery>, QueueError> {
        if consumer.partitions.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.reader_connection(&consumer.name).await?;

        if consumer.is_replaying() {
            match self.read_group(&mut conn, consumer, max, true).await {
                Ok(pending) => {
                    consumer.advance_replay(&pending);
                    if !pending.is_empty() {
                        info!("Consumer {} replaying {} pending entries", consumer.name, pending.len());
                        return Ok(pending);
                    }
                }
                Err(e) => {
                    consumer.restart_replay();
                    self.reset_on_failure(&e).await;
                    return Err(e);
                }
            }
        }

        // A lost reply still moved its entries into this consumer's pending list.
        match self.read_group(&mut conn, consumer, max, false).await {
            Ok(fresh) => {
                consumer.read_finished();
                Ok(fresh)
            }
            Err(e) => {
                consumer.restart_replay();
                self.reset_on_failure(&e).await;
                Err(e)
            }
        }
    }

    /// XACK and XDEL in one transaction; acknowledged entries leave the stream.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let key = self.stream_key(delivery.partition);
        let result: redis::RedisResult<(i64, i64)> = redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&key)
            .arg(&self.group)
            .arg(&delivery.id)
            .cmd("XDEL")
            .arg(&key)
            .arg(&delivery.id)
            .query_async(&mut conn)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = QueueError::from(e);
                self.reset_on_failure(&err).await;
                Err(err)
            }
        }
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = QueueError::from(e);
                self.reset_on_failure(&err).await;
                Err(err)
            }
        }
    }
}

#[derive(Debug, Default)]
struct MemoryPartition {
    entries: BTreeMap<u64, String>,
    /// Delivered but unacknowledged, with the consumer holding them.
    pending: BTreeMap<u64, String>,
    delivered: HashSet<u64>,
    /// Highest id handed out to the group.
    last_delivered: u64,
    next_id: u64,
}

/// In-process queue with the same delivery contract, plus fault injection.
#[derive(Debug)]
pub struct MemoryQueue {
    partitions: Vec<Mutex<MemoryPartition>>,
    max_length: u64,
    unavailable: AtomicBool,
    lose_next_reply: AtomicBool,
}

impl MemoryQueue {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| Mutex::new(MemoryPartition::default())).collect(),
            max_length: 0,
            unavailable: AtomicBool::new(false),
            lose_next_reply: AtomicBool::new(false),
        }
    }

    /// Refuse publishes once a partition holds `max_length` entries.
    pub fn with_max_length(mut self, max_length: u64) -> Self {
        self.max_length = max_length;
        self
    }

    /// Make every operation fail as if the broker were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Deliver the next batch of new entries, then fail as if the reply was lost on the wire.
    pub fn lose_next_reply(&self) {
        self.lose_next_reply.store(true, Ordering::SeqCst);
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    /// Entries published and not yet acknowledged, across partitions.
    pub fn unacknowledged(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| p.lock().map(|p| p.entries.len()).unwrap_or(0))
            .sum()
    }

    /// Payloads currently held, in partition then publish order.
    pub fn payloads(&self) -> Vec<String> {
        self.partitions
            .iter()
            .flat_map(|p| p.lock().map(|p| p.entries.values().cloned().collect::<Vec<_>>()).unwrap_or_default())
            .collect()
    }

    /// Return every pending entry to the pool, as a consumer crash would.
    pub fn redeliver_pending(&self) {
        for partition in &self.partitions {
            if let Ok(mut partition) = partition.lock() {
                partition.pending.clear();
                partition.last_delivered = 0;
            }
        }
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(QueueError::Unavailable("memory queue marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn partition(&self, index: u32) -> Result<std::sync::MutexGuard<'_, MemoryPartition>, QueueError> {
        self.partitions
            .get(index as usize)
            .ok_or_else(|| QueueError::Protocol(format!("no partition {}", index)))?
            .lock()
            .map_err(|_| QueueError::Protocol("partition lock poisoned".to_string()))
    }

    fn read_pending(&self, consumer: &Consumer, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut deliveries = Vec::new();
        for (&index, cursor) in &consumer.replay {
            let after = entry_number(cursor).unwrap_or(0);
            let partition = self.partition(index)?;
            let owned = partition
                .pending
                .range(after + 1..)
                .filter(|(_, owner)| **owner == consumer.name)
                .take(max.saturating_sub(deliveries.len()));
            for (id, _) in owned {
                deliveries.push(Delivery {
                    partition: index,
                    id: format!("{}-{}", index, id),
                    payload: partition.entries.get(id).cloned().unwrap_or_default(),
                    redelivered: true,
                });
            }
        }
        Ok(deliveries)
    }

    fn read_new(&self, consumer: &Consumer, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut deliveries = Vec::new();
        for &index in &consumer.partitions {
            if deliveries.len() >= max {
                break;
            }
            let mut partition = self.partition(index)?;
            let fresh: Vec<(u64, String)> = partition
                .entries
                .range(partition.last_delivered + 1..)
                .take(max - deliveries.len())
                .map(|(id, payload)| (*id, payload.clone()))
                .collect();
            for (id, payload) in fresh {
                let redelivered = !partition.delivered.insert(id);
                partition.pending.insert(id, consumer.name.clone());
                partition.last_delivered = id;
                deliveries.push(Delivery {
                    partition: index,
                    id: format!("{}-{}", index, id),
                    payload,
                    redelivered,
                });
            }
        }
        Ok(deliveries)
    }
}

/// Sequence number of a memory queue entry id (`{partition}-{n}`).
fn entry_number(id: &str) -> Option<u64> {
    id.rsplit('-').next()?.parse().ok()
}

#[async_trait]
impl EventQueue for MemoryQueue {
    async fn publish(&self, partition_key: &str, payload: &str) -> Result<String, QueueError> {
        self.check_available()?;
        let index = partition_for(partition_key, self.partition_count());
        let mut partition = self.partition(index)?;
        if self.max_length > 0 && partition.entries.len() as u64 >= self.max_length {
            return Err(QueueError::Full(self.max_length));
        }
        partition.next_id += 1;
        let id = partition.next_id;
        partition.entries.insert(id, payload.to_string());
        Ok(format!("{}-{}", index, id))
    }

    async fn poll(&self, consumer: &mut Consumer, max: usize) -> Result<Vec<Delivery>, QueueError> {
        if let Err(e) = self.check_available() {
            consumer.restart_replay();
            return Err(e);
        }

        if consumer.is_replaying() {
            let pending = self.read_pending(consumer, max)?;
            consumer.advance_replay(&pending);
            if !pending.is_empty() {
                return Ok(pending);
            }
        }

        let fresh = self.read_new(consumer, max)?;
        if self.lose_next_reply.swap(false, Ordering::SeqCst) {
            consumer.restart_replay();
            return Err(QueueError::Unavailable("connection dropped before the reply".to_string()));
        }
        consumer.read_finished();
        Ok(fresh)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.check_available()?;
        let id = entry_number(&delivery.id)
            .ok_or_else(|| QueueError::Protocol(format!("bad delivery id {}", delivery.id)))?;
        let mut partition = self.partition(delivery.partition)?;
        partition.pending.remove(&id);
        partition.entries.remove(&id);
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.check_available()
    }
}
