//! Logging setup and size-based log rotation
//!
//! Console and file layers are assembled from the logging section. With the
//! `size` strategy the file is written by a plain appender and a background
//! monitor copies it aside and truncates it once it grows past the limit.

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

static GUARD_HOLDER: OnceLock<WorkerGuard> = OnceLock::new();

fn parse_level(level: &str) -> tracing::Level {
    match level {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// Install the global subscriber. Call once per process.
pub fn initialise_logging(config: &LoggingConfig, daemon_mode: bool) -> Result<()> {
    let level = parse_level(&config.level);
    let mut layers = Vec::new();

    if config.console_output && !daemon_mode {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true);
        layers.push(console_layer.boxed());
    }

    if let Some(ref log_file_path) = config.file_output {
        let log_path = Path::new(log_file_path);
        let log_dir = log_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));

        std::fs::create_dir_all(log_dir).context("Failed to create log directory")?;

        let file_appender = match config.rotation_strategy.as_str() {
            "daily" => {
                let stem = log_path.file_stem().and_then(|s| s.to_str()).unwrap_or("trapsink");
                tracing_appender::rolling::daily(log_dir, stem)
            }
            "hourly" => {
                let stem = log_path.file_stem().and_then(|s| s.to_str()).unwrap_or("trapsink");
                tracing_appender::rolling::hourly(log_dir, stem)
            }
            _ => {
                let file_name = log_path.file_name().and_then(|s| s.to_str()).unwrap_or("trapsink.log");
                tracing_appender::rolling::never(log_dir, file_name)
            }
        };

        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        layers.push(file_layer.boxed());

        // Dropping the guard stops the background writer.
        let _ = GUARD_HOLDER.set(guard);
    }

    if layers.is_empty() {
        let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        layers.push(stderr_layer.boxed());
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(tracing_subscriber::filter::LevelFilter::from_level(level))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

pub struct LogRotationManager {
    log_file_path: PathBuf,
    max_size_bytes: u64,
    max_files: usize,
    check_interval: Duration,
}

impl LogRotationManager {
    pub fn new(log_file_path: PathBuf, max_size_mb: u64, max_files: usize, check_interval: Duration) -> Self {
        Self {
            log_file_path,
            max_size_bytes: max_size_mb.saturating_mul(1024 * 1024),
            max_files,
            check_interval,
        }
    }

    pub async fn run(&self, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(self.check_interval);
        info!(
            "Started log rotation monitoring for {} (max size: {}MB, max files: {})",
            self.log_file_path.display(),
            self.max_size_bytes / (1024 * 1024),
            self.max_files
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check_and_rotate().await {
                        error!("Log rotation check failed: {:#}", e);
                    }
                }
            }
        }
    }

    /// Rotate when over the limit; returns the rotated copy if one was made.
    pub async fn check_and_rotate(&self) -> Result<Option<PathBuf>> {
        let metadata = match tokio::fs::metadata(&self.log_file_path).await {
            Ok(metadata) => metadata,
            Err(_) => {
                debug!("Log file {} doesn't exist, skipping rotation check", self.log_file_path.display());
                return Ok(None);
            }
        };

        if metadata.len() <= self.max_size_bytes {
            return Ok(None);
        }

        info!(
            "Log file {} size ({}MB) exceeds limit ({}MB), rotating",
            self.log_file_path.display(),
            metadata.len() / (1024 * 1024),
            self.max_size_bytes / (1024 * 1024)
        );
        let rotated = self.rotate().await?;
        self.cleanup_old_logs().await?;
        Ok(Some(rotated))
    }

    fn name_parts(&self) -> (PathBuf, String, String) {
        let log_dir = self
            .log_file_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        let stem = self
            .log_file_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("trapsink")
            .to_string();
        let extension = self
            .log_file_path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("log")
            .to_string();
        (log_dir, stem, extension)
    }

    /// Copy then truncate, so the appender's open handle keeps working.
    async fn rotate(&self) -> Result<PathBuf> {
        let (log_dir, stem, extension) = self.name_parts();
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S%3f");
        let rotated_path = log_dir.join(format!("{}.{}.{}", stem, timestamp, extension));

        tokio::fs::copy(&self.log_file_path, &rotated_path)
            .await
            .context("Failed to copy log file for rotation")?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.log_file_path)
            .await
            .context("Failed to open log file for truncation")?;
        file.set_len(0).await.context("Failed to truncate log file")?;

        info!("Rotated log file to {}", rotated_path.display());
        Ok(rotated_path)
    }

    /// Keep at most `max_files` rotated copies, removing the oldest.
    async fn cleanup_old_logs(&self) -> Result<()> {
        let (log_dir, stem, extension) = self.name_parts();
        let prefix = format!("{}.", stem);
        let suffix = format!(".{}", extension);
        let active = self.log_file_path.file_name().and_then(|s| s.to_str()).unwrap_or_default().to_string();

        let mut rotated = Vec::new();
        let mut entries = tokio::fs::read_dir(&log_dir)
            .await
            .context("Failed to read log directory")?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            if name != active && name.starts_with(&prefix) && name.ends_with(&suffix) {
                rotated.push((name, path));
            }
        }

        // Rotated names embed a sortable timestamp.
        rotated.sort();
        if rotated.len() > self.max_files {
            let excess = rotated.len() - self.max_files;
            for (_, path) in rotated.iter().take(excess) {
                match tokio::fs::remove_file(path).await {
                    Ok(_) => info!("Removed old log file: {}", path.display()),
                    Err(e) => warn!("Failed to remove old log file {}: {}", path.display(), e),
                }
            }
        }
        Ok(())
    }
}

/// Spawn the size monitor when the file layer uses the `size` strategy.
pub fn start_log_rotation_monitoring(
    config: &LoggingConfig,
    cancel: tokio_util::sync::CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    if config.rotation_strategy != "size" {
        return None;
    }
    let log_path = config.file_output.as_ref()?;
    let manager = LogRotationManager::new(
        PathBuf::from(log_path),
        config.max_log_size_mb,
        config.max_log_files,
        Duration::from_secs(300),
    );
    Some(tokio::spawn(async move { manager.run(cancel).await }))
}
