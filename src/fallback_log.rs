//! Local fallback log used while the queue is unreachable
//!
//! The handler appends canonical lines here as JSON Lines. The reconciler
//! moves the file aside, re-publishes each line verbatim and drops a line only
//! once the queue has confirmed it.

use crate::dead_letter::{DeadLetter, DeadLetterSink, FailureKind};
use crate::message;
use crate::queue::EventQueue;
use anyhow::{Context, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DRAINING_SUFFIX: &str = ".draining";
const CHECKPOINT_SUFFIX: &str = ".tmp";

/// Append-only JSON Lines file.
#[derive(Debug, Clone)]
pub struct FallbackLog {
    path: PathBuf,
}

impl FallbackLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling the reconciler renames the active log to.
    pub fn draining_path(&self) -> PathBuf {
        with_suffix(&self.path, DRAINING_SUFFIX)
    }

    /// Append one line and flush it to disk before returning.
    pub async fn append(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create fallback directory: {}", parent.display()))?;
        }

        let mut record = String::with_capacity(line.len() + 1);
        record.push_str(line);
        record.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open fallback log: {}", self.path.display()))?;
        // One write per line keeps concurrent appenders from interleaving.
        file.write_all(record.as_bytes())
            .await
            .with_context(|| format!("Failed to append to fallback log: {}", self.path.display()))?;
        file.sync_data()
            .await
            .with_context(|| format!("Failed to sync fallback log: {}", self.path.display()))?;
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Counters for one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub republished: usize,
    pub dead_lettered: usize,
    /// Lines left on disk for the next pass.
    pub remaining: usize,
    /// Set when a publish failed and the pass stopped early.
    pub interrupted_by: Option<String>,
}

impl DrainReport {
    pub fn is_idle(&self) -> bool {
        self.republished == 0 && self.dead_lettered == 0 && self.remaining == 0
    }
}

pub struct Reconciler {
    log: FallbackLog,
    queue: Arc<dyn EventQueue>,
    dead_letters: DeadLetterSink,
    checkpoint_every: usize,
    publish_timeout: Duration,
    settle_delay: Duration,
}

impl Reconciler {
    pub fn new(
        log: FallbackLog,
        queue: Arc<dyn EventQueue>,
        dead_letters: DeadLetterSink,
        checkpoint_every: usize,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            log,
            queue,
            dead_letters,
            checkpoint_every: checkpoint_every.max(1),
            publish_timeout,
            settle_delay: Duration::from_millis(250),
        }
    }

    /// Pause after renaming so appenders holding the old handle finish their line.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// One pass: a leftover draining file first, then the active log.
    pub async fn drain_once(&self, cancel: &CancellationToken) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let draining = self.log.draining_path();
        let mut rotated = false;

        loop {
            if fs::try_exists(&draining).await.unwrap_or(false) {
                self.drain_file(&draining, cancel, &mut report).await?;
                if report.interrupted_by.is_some() || report.remaining > 0 || cancel.is_cancelled() {
                    break;
                }
            }

            if rotated || !fs::try_exists(self.log.path()).await.unwrap_or(false) {
                break;
            }

            fs::rename(self.log.path(), &draining)
                .await
                .with_context(|| format!("Failed to rotate fallback log: {}", self.log.path().display()))?;
            rotated = true;
            debug!("Fallback log moved to {}", draining.display());
            tokio::time::sleep(self.settle_delay).await;
        }

        if !report.is_idle() {
            info!(
                republished = report.republished,
                dead_lettered = report.dead_lettered,
                remaining = report.remaining,
                "Fallback reconcile pass finished"
            );
        }
        Ok(report)
    }

    async fn drain_file(&self, path: &Path, cancel: &CancellationToken, report: &mut DrainReport) -> Result<()> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read fallback file: {}", path.display()))?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();

        let mut consumed = 0;
        let mut since_checkpoint = 0;

        for line in &lines {
            if cancel.is_cancelled() {
                break;
            }

            match message::decode(line) {
                Ok(decoded) => {
                    let publish = self.queue.publish(decoded.event.partition_key(), line);
                    let outcome = match tokio::time::timeout(self.publish_timeout, publish).await {
                        Ok(Ok(id)) => Ok(id),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err(format!("publish timed out after {:?}", self.publish_timeout)),
                    };
                    match outcome {
                        Ok(id) => {
                            debug!("Republished fallback line as {}", id);
                            report.republished += 1;
                        }
                        Err(reason) => {
                            warn!("Fallback drain stopped: {}", reason);
                            report.interrupted_by = Some(reason);
                            break;
                        }
                    }
                }
                Err(e) => {
                    let letter = DeadLetter::new(
                        FailureKind::UnreadableFallback { error: e.to_string() },
                        *line,
                    );
                    if let Err(write_err) = self.dead_letters.write(&letter).await {
                        error!("Keeping unreadable fallback line, dead letter failed: {:#}", write_err);
                        report.interrupted_by = Some(write_err.to_string());
                        break;
                    }
                    report.dead_lettered += 1;
                }
            }

            consumed += 1;
            since_checkpoint += 1;
            if since_checkpoint >= self.checkpoint_every && consumed < lines.len() {
                self.checkpoint(path, &lines[consumed..]).await?;
                since_checkpoint = 0;
            }
        }

        let rest = &lines[consumed..];
        report.remaining += rest.len();
        if rest.is_empty() {
            fs::remove_file(path)
                .await
                .with_context(|| format!("Failed to remove drained file: {}", path.display()))?;
        } else if since_checkpoint > 0 {
            self.checkpoint(path, rest).await?;
        }
        Ok(())
    }

    /// Replace the draining file with the lines not yet confirmed.
    async fn checkpoint(&self, path: &Path, rest: &[&str]) -> Result<()> {
        let tmp = with_suffix(path, CHECKPOINT_SUFFIX);
        let mut body = rest.join("\n");
        body.push('\n');

        {
            let mut file = fs::File::create(&tmp)
                .await
                .with_context(|| format!("Failed to create checkpoint: {}", tmp.display()))?;
            file.write_all(body.as_bytes()).await?;
            file.sync_data().await?;
        }
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace draining file: {}", path.display()))?;
        debug!("Checkpointed {} pending fallback lines", rest.len());
        Ok(())
    }

    /// Drain on a fixed interval until cancelled.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_once(&cancel).await {
                        error!("Fallback reconcile pass failed: {:#}", e);
                    }
                }
            }
        }
        debug!("Fallback reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TrapEvent;
    use crate::normalizer::{Normalizer, RawTrapRecord};
    use crate::queue::MemoryQueue;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn line(n: u32) -> String {
        let raw = RawTrapRecord::from_pairs(
            "r1",
            &format!("UDP: [10.0.0.{}]:161->[10.0.0.2]:162", n % 250),
            [("SNMPv2-MIB::snmpTrapOID.0", "IF-MIB::linkUp")],
        );
        let event: TrapEvent =
            Normalizer::default().normalize_at(&raw, Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, n % 60).unwrap());
        message::encode(&event).unwrap()
    }

    fn reconciler(dir: &TempDir, queue: Arc<MemoryQueue>, checkpoint_every: usize) -> Reconciler {
        Reconciler::new(
            FallbackLog::new(dir.path().join("fallback.jsonl")),
            queue,
            DeadLetterSink::new(dir.path().join("dead")),
            checkpoint_every,
            Duration::from_secs(1),
        )
        .with_settle_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn append_writes_one_line_per_event() {
        let dir = TempDir::new().unwrap();
        let log = FallbackLog::new(dir.path().join("nested/fallback.jsonl"));
        log.append(&line(1)).await.unwrap();
        log.append(&line(2)).await.unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.lines().collect::<Vec<_>>(), vec![line(1), line(2)]);
        assert!(log.draining_path().to_string_lossy().ends_with("fallback.jsonl.draining"));
    }

    #[tokio::test]
    async fn drain_republishes_verbatim_and_removes_the_file() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(MemoryQueue::new(2));
        let reconciler = reconciler(&dir, queue.clone(), 2);
        for n in 0..5 {
            reconciler.log.append(&line(n)).await.unwrap();
        }

        let report = reconciler.drain_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.republished, 5);
        assert_eq!(report.remaining, 0);

        let mut published = queue.payloads();
        published.sort();
        let mut expected: Vec<String> = (0..5).map(line).collect();
        expected.sort();
        assert_eq!(published, expected);
        assert!(!reconciler.log.path().exists());
        assert!(!reconciler.log.draining_path().exists());
    }

    #[tokio::test]
    async fn outage_keeps_unconfirmed_lines() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(MemoryQueue::new(1));
        let reconciler = reconciler(&dir, queue.clone(), 1);
        reconciler.log.append(&line(1)).await.unwrap();
        reconciler.log.append(&line(2)).await.unwrap();

        queue.set_unavailable(true);
        let report = reconciler.drain_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.republished, 0);
        assert_eq!(report.remaining, 2);
        assert!(report.interrupted_by.is_some());

        // New traps land in a fresh active file while the draining one waits.
        reconciler.log.append(&line(3)).await.unwrap();

        queue.set_unavailable(false);
        let report = reconciler.drain_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.republished, 3);
        assert_eq!(queue.payloads(), vec![line(1), line(2), line(3)]);
    }

    #[tokio::test]
    async fn unparsable_lines_are_dead_lettered() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(MemoryQueue::new(1));
        let reconciler = reconciler(&dir, queue.clone(), 8);
        reconciler.log.append("{not a trap").await.unwrap();
        reconciler.log.append(&line(7)).await.unwrap();

        let report = reconciler.drain_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.republished, 1);

        let letters = DeadLetterSink::new(dir.path().join("dead")).list().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].payload, "{not a trap");
    }

    #[tokio::test]
    async fn idle_pass_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let reconciler = reconciler(&dir, Arc::new(MemoryQueue::new(1)), 4);
        let report = reconciler.drain_once(&CancellationToken::new()).await.unwrap();
        assert!(report.is_idle());
    }
}
