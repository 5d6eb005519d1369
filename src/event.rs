//! Trap event model for trapsink
//!
//! A `TrapEvent` is the canonical unit that flows from the normalizer,
//! through the queue, into the relational store.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Coarse operational impact of a trap, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// One (identifier, value) pair attached to a trap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableBinding {
    pub oid: String,
    pub value: String,
}

impl VariableBinding {
    pub fn new(oid: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            oid: oid.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapEvent {
    pub timestamp: DateTime<Utc>,
    pub host: String,
    pub source_ip: String,
    pub transport: String,
    pub notification_oid: String,
    pub notification_name: String,
    pub severity: Severity,
    pub uptime: String,
    pub variable_bindings: Vec<VariableBinding>,
    pub processed_binding_count: usize,
    /// Lines consumed from the handoff, headers included.
    pub processed_lines: usize,
}

impl TrapEvent {
    /// ISO-8601 UTC with millisecond precision, e.g. `2024-05-01T10:00:00.123Z`
    pub fn timestamp_string(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Key used to pick a queue partition so traps from one agent keep their order.
    pub fn partition_key(&self) -> &str {
        if self.source_ip.is_empty() {
            &self.host
        } else {
            &self.source_ip
        }
    }
}
