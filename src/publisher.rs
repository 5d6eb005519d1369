//! Event publisher and the one-shot trap handler
//!
//! Publishing never fails while either the queue or the local fallback log
//! accepts the line.

use crate::error::PublishError;
use crate::event::TrapEvent;
use crate::fallback_log::FallbackLog;
use crate::message;
use crate::normalizer::{Normalizer, RawTrapRecord};
use crate::queue::EventQueue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where a published event ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Queued { id: String },
    Fallback,
}

pub struct EventPublisher {
    queue: Arc<dyn EventQueue>,
    fallback: FallbackLog,
    timeout: Duration,
}

impl EventPublisher {
    pub fn new(queue: Arc<dyn EventQueue>, fallback: FallbackLog, timeout: Duration) -> Self {
        Self {
            queue,
            fallback,
            timeout,
        }
    }

    pub async fn publish(&self, event: &TrapEvent) -> Result<Ack, PublishError> {
        let line = message::encode(event)?;
        self.publish_line(event.partition_key(), &line).await
    }

    /// Publish an already serialised canonical line.
    pub async fn publish_line(&self, partition_key: &str, line: &str) -> Result<Ack, PublishError> {
        let queue_failure = match tokio::time::timeout(self.timeout, self.queue.publish(partition_key, line)).await {
            Ok(Ok(id)) => {
                debug!("Published trap as {}", id);
                return Ok(Ack::Queued { id });
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("publish timed out after {} ms", self.timeout.as_millis()),
        };

        warn!("Queue unavailable ({}), writing trap to fallback log", queue_failure);
        match self.fallback.append(line).await {
            Ok(()) => Ok(Ack::Fallback),
            Err(e) => {
                error!("Fallback log failed, trap lost: {:#}", e);
                Err(PublishError::Unavailable {
                    queue: queue_failure,
                    fallback: format!("{:#}", e),
                })
            }
        }
    }
}

/// Normalize one raw trap and publish it.
pub struct TrapHandler {
    normalizer: Normalizer,
    publisher: EventPublisher,
}

impl TrapHandler {
    pub fn new(normalizer: Normalizer, publisher: EventPublisher) -> Self {
        Self { normalizer, publisher }
    }

    pub async fn handle(&self, raw: &RawTrapRecord) -> Result<Ack, PublishError> {
        let event = self.normalizer.normalize(raw);
        info!(
            host = %event.host,
            src_ip = %event.source_ip,
            trap = %event.notification_name,
            severity = %event.severity,
            oid_count = event.processed_binding_count,
            "Processed SNMP trap"
        );
        self.publisher.publish(&event).await
    }
}
