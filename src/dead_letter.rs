//! Dead-letter sink for payloads the pipeline gave up on
//!
//! Every rejected payload is kept verbatim as one pretty-printed JSON file so
//! an operator can inspect it and re-publish it by hand.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// Payload is not a valid trap message.
    Validation { error: String },
    /// Store stayed unavailable for every attempt.
    RetriesExhausted { attempts: u32, last_error: String },
    /// Store rejected the row outright.
    StoreFatal { error: String },
    /// Fallback log line could not be read back.
    UnreadableFallback { error: String },
}

impl FailureKind {
    pub fn reason(&self) -> &'static str {
        match self {
            FailureKind::Validation { .. } => "validation failure",
            FailureKind::RetriesExhausted { .. } => "store retries exhausted",
            FailureKind::StoreFatal { .. } => "fatal store failure",
            FailureKind::UnreadableFallback { .. } => "unreadable fallback line",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub rejected_at: DateTime<Utc>,
    pub reason: String,
    pub failure: FailureKind,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
}

impl DeadLetter {
    pub fn new(failure: FailureKind, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            rejected_at: Utc::now(),
            reason: failure.reason().to_string(),
            failure,
            payload: payload.into(),
            partition: None,
            delivery_id: None,
        }
    }

    pub fn with_delivery(mut self, partition: u32, delivery_id: impl Into<String>) -> Self {
        self.partition = Some(partition);
        self.delivery_id = Some(delivery_id.into());
        self
    }

    fn file_name(&self) -> String {
        format!("{}_{}.json", self.id, self.rejected_at.timestamp_millis())
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetterSink {
    directory: PathBuf,
}

impl DeadLetterSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Write one dead letter and return where it landed.
    pub async fn write(&self, letter: &DeadLetter) -> Result<PathBuf> {
        fs::create_dir_all(&self.directory)
            .await
            .with_context(|| format!("Failed to create dead-letter directory: {}", self.directory.display()))?;

        let file_path = self.directory.join(letter.file_name());
        let json_content =
            serde_json::to_string_pretty(letter).context("Failed to serialise dead letter to JSON")?;

        fs::write(&file_path, json_content)
            .await
            .with_context(|| format!("Failed to write dead letter to file: {}", file_path.display()))?;

        warn!(
            reason = %letter.reason,
            file = %file_path.display(),
            "Dead-lettered payload"
        );
        Ok(file_path)
    }

    /// All dead letters on disk, oldest first. Unreadable files are skipped.
    pub async fn list(&self) -> Result<Vec<DeadLetter>> {
        let mut letters = Vec::new();
        if !self.directory.exists() {
            return Ok(letters);
        }

        let mut entries = fs::read_dir(&self.directory)
            .await
            .with_context(|| format!("Failed to read dead-letter directory: {}", self.directory.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let file_path = entry.path();
            if file_path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&file_path)
                .await
                .map_err(anyhow::Error::from)
                .and_then(|content| serde_json::from_str::<DeadLetter>(&content).map_err(Into::into));
            match parsed {
                Ok(letter) => letters.push(letter),
                Err(e) => debug!("Skipping unreadable dead letter {}: {}", file_path.display(), e),
            }
        }

        letters.sort_by(|a, b| a.rejected_at.cmp(&b.rejected_at));
        Ok(letters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_one_file_per_letter() {
        let dir = TempDir::new().unwrap();
        let sink = DeadLetterSink::new(dir.path().join("dead"));

        let letter = DeadLetter::new(
            FailureKind::Validation { error: "not json".into() },
            "{broken",
        )
        .with_delivery(3, "1700000000000-0");
        let path = sink.write(&letter).await.unwrap();

        assert!(path.starts_with(sink.directory()));
        let content = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["payload"], "{broken");
        assert_eq!(value["failure"]["kind"], "validation");
        assert_eq!(value["reason"], "validation failure");
        assert_eq!(value["partition"], 3);

        let listed = sink.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, letter.id);
    }

    #[tokio::test]
    async fn missing_directory_lists_nothing() {
        let dir = TempDir::new().unwrap();
        let sink = DeadLetterSink::new(dir.path().join("absent"));
        assert!(sink.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unwritable_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let sink = DeadLetterSink::new(blocker.join("dead"));

        let letter = DeadLetter::new(
            FailureKind::StoreFatal { error: "check constraint".into() },
            "{}",
        );
        assert!(sink.write(&letter).await.is_err());
    }
}
