//! trapsink Library
//!
//! Normalizes SNMP traps handed over by a trap daemon, publishes them to a
//! partitioned Redis stream with a local fallback log, and persists them into
//! PostgreSQL together with per-day statistics.

pub mod config;
pub mod dead_letter;
pub mod error;
pub mod event;
pub mod fallback_log;
pub mod health;
pub mod logging;
pub mod message;
pub mod normalizer;
pub mod persister;
pub mod publisher;
pub mod queue;
pub mod severity;
pub mod store;

pub use config::Config;
pub use dead_letter::{DeadLetter, DeadLetterSink, FailureKind};
pub use error::{PublishError, QueueError, StoreError, ValidationError};
pub use event::{Severity, TrapEvent, VariableBinding};
pub use fallback_log::{FallbackLog, Reconciler};
pub use health::HealthState;
pub use normalizer::{Normalizer, RawTrapRecord};
pub use persister::{Disposition, Persister, PersisterSettings};
pub use publisher::{Ack, EventPublisher, TrapHandler};
pub use queue::{EventQueue, MemoryQueue, RedisStreamQueue};
pub use store::{MemoryTrapStore, PgTrapStore, TrapStore};
