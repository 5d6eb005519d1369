//! Relational store for persisted traps and their daily statistics
//!
//! Each consumed event is written in one transaction: an optional delivery
//! gate, the trap row, and the `(day, oid, source_ip)` statistic upsert.

use crate::config::{DedupeStrategy, StoreConfig};
use crate::error::StoreError;
use crate::event::Severity;
use crate::message::DecodedTrap;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Row-ready projection of a decoded trap.
#[derive(Debug, Clone, PartialEq)]
pub struct TrapRecord {
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
    pub source_ip: String,
    pub trap_oid: String,
    pub trap_name: String,
    pub severity: Severity,
    pub uptime: String,
    pub transport: String,
    pub variable_bindings: serde_json::Value,
    pub raw_data: serde_json::Value,
    pub fingerprint: String,
}

impl TrapRecord {
    pub fn from_decoded(decoded: &DecodedTrap) -> Self {
        let event = &decoded.event;
        let variable_bindings = event
            .variable_bindings
            .iter()
            .map(|vb| {
                json!({
                    "oid": vb.oid,
                    "value": vb.value,
                    "resolved_name": vb.oid,
                    "description": "",
                })
            })
            .collect::<Vec<_>>();

        Self {
            timestamp: event.timestamp,
            hostname: event.host.clone(),
            source_ip: event.source_ip.clone(),
            trap_oid: event.notification_oid.clone(),
            trap_name: event.notification_name.clone(),
            severity: event.severity,
            uptime: event.uptime.clone(),
            transport: event.transport.clone(),
            variable_bindings: serde_json::Value::Array(variable_bindings),
            raw_data: decoded.raw.clone(),
            fingerprint: decoded.fingerprint.clone(),
        }
    }

    pub fn stat_key(&self) -> StatKey {
        StatKey {
            date: self.timestamp.date_naive(),
            trap_oid: self.trap_oid.clone(),
            source_ip: self.source_ip.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatKey {
    pub date: NaiveDate,
    pub trap_oid: String,
    pub source_ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapStatistic {
    pub trap_name: String,
    pub severity: String,
    pub count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl TrapStatistic {
    pub fn first(record: &TrapRecord) -> Self {
        Self {
            trap_name: record.trap_name.clone(),
            severity: record.severity.to_string(),
            count: 1,
            first_seen: record.timestamp,
            last_seen: record.timestamp,
        }
    }

    /// Merge one more occurrence; mirrors the `ON CONFLICT DO UPDATE` clause.
    pub fn absorb(&mut self, record: &TrapRecord) {
        self.count += 1;
        self.first_seen = self.first_seen.min(record.timestamp);
        self.last_seen = self.last_seen.max(record.timestamp);
        if !record.trap_name.is_empty() {
            self.trap_name = record.trap_name.clone();
        }
        self.severity = record.severity.to_string();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Inserted { trap_id: i64 },
    /// Same delivery fingerprint was committed before; nothing written.
    Duplicate,
}

#[async_trait]
pub trait TrapStore: Send + Sync {
    async fn persist(&self, record: &TrapRecord, dedupe: DedupeStrategy) -> Result<PersistOutcome, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Drop delivery fingerprints recorded before `cutoff`; returns how many went.
    async fn prune_deliveries(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

const MIGRATIONS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS snmp_traps (
        id BIGSERIAL PRIMARY KEY,
        timestamp TIMESTAMPTZ NOT NULL,
        hostname TEXT NOT NULL DEFAULT '',
        source_ip TEXT NOT NULL DEFAULT '',
        trap_oid TEXT NOT NULL DEFAULT '',
        trap_name TEXT NOT NULL DEFAULT '',
        variable_bindings JSONB NOT NULL DEFAULT '[]'::jsonb,
        raw_data JSONB NOT NULL DEFAULT '{}'::jsonb,
        severity TEXT NOT NULL DEFAULT 'info',
        uptime TEXT NOT NULL DEFAULT '',
        transport TEXT NOT NULL DEFAULT '',
        acknowledged BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_snmp_traps_timestamp ON snmp_traps (timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS idx_snmp_traps_source_ip ON snmp_traps (source_ip)",
    "CREATE INDEX IF NOT EXISTS idx_snmp_traps_trap_oid ON snmp_traps (trap_oid)",
    "CREATE INDEX IF NOT EXISTS idx_snmp_traps_severity ON snmp_traps (severity)",
    r#"CREATE TABLE IF NOT EXISTS snmp_trap_stats (
        id BIGSERIAL PRIMARY KEY,
        date DATE NOT NULL,
        trap_oid TEXT NOT NULL,
        trap_name TEXT NOT NULL DEFAULT '',
        source_ip TEXT NOT NULL,
        severity TEXT NOT NULL DEFAULT 'info',
        count BIGINT NOT NULL DEFAULT 0,
        first_seen TIMESTAMPTZ NOT NULL,
        last_seen TIMESTAMPTZ NOT NULL,
        CONSTRAINT snmp_trap_stats_key UNIQUE (date, trap_oid, source_ip)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS snmp_trap_deliveries (
        fingerprint TEXT PRIMARY KEY,
        delivered_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_snmp_trap_deliveries_delivered_at ON snmp_trap_deliveries (delivered_at)",
    r#"CREATE OR REPLACE VIEW recent_traps AS
        SELECT id, timestamp, hostname, source_ip, trap_oid, trap_name, severity,
               uptime, transport, variable_bindings, acknowledged, created_at
        FROM snmp_traps
        WHERE timestamp > NOW() - INTERVAL '24 hours'
        ORDER BY timestamp DESC"#,
    r#"CREATE OR REPLACE VIEW trap_summary AS
        SELECT trap_name, trap_oid, severity,
               COUNT(*) AS count,
               MIN(timestamp) AS first_seen,
               MAX(timestamp) AS last_seen
        FROM snmp_traps
        GROUP BY trap_name, trap_oid, severity"#,
];

const INSERT_DELIVERY: &str = "INSERT INTO snmp_trap_deliveries (fingerprint) VALUES ($1) \
     ON CONFLICT (fingerprint) DO NOTHING RETURNING fingerprint";

const PRUNE_DELIVERIES: &str = "DELETE FROM snmp_trap_deliveries WHERE delivered_at < $1";

const INSERT_TRAP: &str = "INSERT INTO snmp_traps (
        timestamp, hostname, source_ip, trap_oid, trap_name,
        severity, uptime, transport, variable_bindings, raw_data
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    RETURNING id";

const UPSERT_STATISTIC: &str = "INSERT INTO snmp_trap_stats (
        date, trap_oid, trap_name, source_ip, severity, count, first_seen, last_seen
    ) VALUES ($1, $2, $3, $4, $5, 1, $6, $6)
    ON CONFLICT (date, trap_oid, source_ip) DO UPDATE SET
        count = snmp_trap_stats.count + 1,
        first_seen = LEAST(snmp_trap_stats.first_seen, EXCLUDED.first_seen),
        last_seen = GREATEST(snmp_trap_stats.last_seen, EXCLUDED.last_seen),
        trap_name = COALESCE(NULLIF(EXCLUDED.trap_name, ''), snmp_trap_stats.trap_name),
        severity = EXCLUDED.severity";

/// PostgreSQL store sharing one pool across all persister workers.
#[derive(Clone)]
pub struct PgTrapStore {
    pool: PgPool,
}

impl PgTrapStore {
    /// Build the pool without connecting; connections open on first use.
    pub fn connect_lazy(config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect_lazy(&config.database_url)
            .map_err(|e| StoreError::Fatal(format!("invalid database URL: {}", e)))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and views when missing. Safe to run repeatedly.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Store schema is up to date ({} statements)", MIGRATIONS.len());
        Ok(())
    }

    /// Operator toggle of the `acknowledged` flag. Returns false when no row matched.
    pub async fn set_acknowledged(&self, trap_id: i64, acknowledged: bool) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE snmp_traps SET acknowledged = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(trap_id)
        .bind(acknowledged)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn statistic(&self, key: &StatKey) -> Result<Option<TrapStatistic>, StoreError> {
        let row = sqlx::query(
            "SELECT trap_name, severity, count, first_seen, last_seen FROM snmp_trap_stats \
             WHERE date = $1 AND trap_oid = $2 AND source_ip = $3",
        )
        .bind(key.date)
        .bind(&key.trap_oid)
        .bind(&key.source_ip)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<TrapStatistic, StoreError> {
            Ok(TrapStatistic {
                trap_name: row.try_get("trap_name")?,
                severity: row.try_get("severity")?,
                count: row.try_get("count")?,
                first_seen: row.try_get("first_seen")?,
                last_seen: row.try_get("last_seen")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl TrapStore for PgTrapStore {
    async fn persist(&self, record: &TrapRecord, dedupe: DedupeStrategy) -> Result<PersistOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        if dedupe == DedupeStrategy::Fingerprint {
            let gate: Option<String> = sqlx::query_scalar(INSERT_DELIVERY)
                .bind(&record.fingerprint)
                .fetch_optional(&mut *tx)
                .await?;
            if gate.is_none() {
                tx.rollback().await?;
                debug!("Delivery {} already committed", record.fingerprint);
                return Ok(PersistOutcome::Duplicate);
            }
        }

        let trap_id: i64 = sqlx::query_scalar(INSERT_TRAP)
            .bind(record.timestamp)
            .bind(&record.hostname)
            .bind(&record.source_ip)
            .bind(&record.trap_oid)
            .bind(&record.trap_name)
            .bind(record.severity.as_str())
            .bind(&record.uptime)
            .bind(&record.transport)
            .bind(&record.variable_bindings)
            .bind(&record.raw_data)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(UPSERT_STATISTIC)
            .bind(record.timestamp.date_naive())
            .bind(&record.trap_oid)
            .bind(&record.trap_name)
            .bind(&record.source_ip)
            .bind(record.severity.as_str())
            .bind(record.timestamp)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(PersistOutcome::Inserted { trap_id })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn prune_deliveries(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(PRUNE_DELIVERIES).bind(cutoff).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<TrapRecord>,
    stats: HashMap<StatKey, TrapStatistic>,
    /// Fingerprint to the time it was recorded.
    fingerprints: HashMap<String, DateTime<Utc>>,
    /// Failures to return before succeeding again.
    injected: VecDeque<StoreError>,
}

/// In-process store; one mutex makes each persist atomic like a transaction.
#[derive(Debug, Default)]
pub struct MemoryTrapStore {
    state: Mutex<MemoryState>,
}

impl MemoryTrapStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure for the next `persist` or `ping` call.
    pub fn inject_failure(&self, error: StoreError) {
        if let Ok(mut state) = self.state.lock() {
            state.injected.push_back(error);
        }
    }

    pub fn row_count(&self) -> usize {
        self.state.lock().map(|s| s.rows.len()).unwrap_or(0)
    }

    pub fn rows(&self) -> Vec<TrapRecord> {
        self.state.lock().map(|s| s.rows.clone()).unwrap_or_default()
    }

    pub fn statistic(&self, key: &StatKey) -> Option<TrapStatistic> {
        self.state.lock().ok()?.stats.get(key).cloned()
    }

    pub fn statistics(&self) -> HashMap<StatKey, TrapStatistic> {
        self.state.lock().map(|s| s.stats.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Fatal("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl TrapStore for MemoryTrapStore {
    async fn persist(&self, record: &TrapRecord, dedupe: DedupeStrategy) -> Result<PersistOutcome, StoreError> {
        let mut state = self.lock()?;
        if let Some(error) = state.injected.pop_front() {
            return Err(error);
        }

        if dedupe == DedupeStrategy::Fingerprint {
            if state.fingerprints.contains_key(&record.fingerprint) {
                return Ok(PersistOutcome::Duplicate);
            }
            state.fingerprints.insert(record.fingerprint.clone(), Utc::now());
        }

        state.rows.push(record.clone());
        let trap_id = state.rows.len() as i64;

        state
            .stats
            .entry(record.stat_key())
            .and_modify(|stat| stat.absorb(record))
            .or_insert_with(|| TrapStatistic::first(record));

        Ok(PersistOutcome::Inserted { trap_id })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        match state.injected.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn prune_deliveries(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let before = state.fingerprints.len();
        state.fingerprints.retain(|_, delivered_at| *delivered_at >= cutoff);
        Ok((before - state.fingerprints.len()) as u64)
    }
}

/// Prune delivery fingerprints older than `retention` every `interval` until cancelled.
pub async fn run_delivery_pruner(
    store: Arc<dyn TrapStore>,
    retention: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    let Ok(retention) = chrono::Duration::from_std(retention) else {
        warn!("Delivery retention {:?} is out of range, pruning disabled", retention);
        return;
    };
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match store.prune_deliveries(Utc::now() - retention).await {
                    Ok(0) => {}
                    Ok(pruned) => info!("Pruned {} delivery fingerprints", pruned),
                    Err(e) => warn!("Delivery pruning failed: {}", e),
                }
            }
        }
    }
}
