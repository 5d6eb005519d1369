//! Canonical queue message for trap events
//!
//! One JSON object per trap. The exact bytes produced here are what the
//! queue and the fallback log carry, so their SHA-256 identifies a delivery.

use crate::error::ValidationError;
use crate::event::{Severity, TrapEvent, VariableBinding};
use crate::normalizer::HANDLER_VERSION;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const MESSAGE_LEVEL: &str = "INFO";
pub const MESSAGE_TEXT: &str = "SNMP trap received";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrapMessage {
    pub timestamp: String,
    pub level: String,
    #[serde(default)]
    pub message: String,
    pub trap: TrapHeader,
    pub varbinds: Vec<VariableBinding>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrapHeader {
    pub host: String,
    pub source_ip: String,
    pub transport: String,
    pub oid: String,
    pub name: String,
    pub severity: Severity,
    pub uptime: String,
    pub varbind_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MessageMetadata {
    #[serde(default)]
    pub handler_version: String,
    #[serde(default)]
    pub processed_lines: usize,
}

/// A consumed message that passed validation.
#[derive(Debug, Clone)]
pub struct DecodedTrap {
    pub event: TrapEvent,
    /// The message as parsed, stored verbatim in `raw_data`.
    pub raw: serde_json::Value,
    pub fingerprint: String,
}

impl TrapMessage {
    pub fn from_event(event: &TrapEvent) -> Self {
        Self {
            timestamp: event.timestamp_string(),
            level: MESSAGE_LEVEL.to_string(),
            message: MESSAGE_TEXT.to_string(),
            trap: TrapHeader {
                host: event.host.clone(),
                source_ip: event.source_ip.clone(),
                transport: event.transport.clone(),
                oid: event.notification_oid.clone(),
                name: event.notification_name.clone(),
                severity: event.severity,
                uptime: event.uptime.clone(),
                varbind_count: event.processed_binding_count,
            },
            varbinds: event.variable_bindings.clone(),
            metadata: MessageMetadata {
                handler_version: HANDLER_VERSION.to_string(),
                processed_lines: event.processed_lines,
            },
        }
    }

    /// Compact single-line JSON. String escaping is serde_json's: quote,
    /// backslash, `\n`, `\r`, `\t` and other C0 controls; non-ASCII is kept as is.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Serialise an event straight to its canonical line.
pub fn encode(event: &TrapEvent) -> Result<String, serde_json::Error> {
    TrapMessage::from_event(event).to_line()
}

/// Validate and decode a payload taken off the queue.
pub fn decode(payload: &str) -> Result<DecodedTrap, ValidationError> {
    let raw: serde_json::Value =
        serde_json::from_str(payload).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    let message: TrapMessage = serde_json::from_value(raw.clone())
        .map_err(|e| ValidationError::Schema(e.to_string()))?;

    let timestamp = DateTime::parse_from_rfc3339(&message.timestamp)
        .map_err(|_| ValidationError::InvalidTimestamp(message.timestamp.clone()))?
        .with_timezone(&Utc);

    if message.trap.varbind_count != message.varbinds.len() {
        return Err(ValidationError::BindingCountMismatch {
            declared: message.trap.varbind_count,
            actual: message.varbinds.len(),
        });
    }

    let event = TrapEvent {
        timestamp,
        host: message.trap.host,
        source_ip: message.trap.source_ip,
        transport: message.trap.transport,
        notification_oid: message.trap.oid,
        notification_name: message.trap.name,
        severity: message.trap.severity,
        uptime: message.trap.uptime,
        processed_binding_count: message.trap.varbind_count,
        variable_bindings: message.varbinds,
        processed_lines: message.metadata.processed_lines,
    };

    Ok(DecodedTrap {
        event,
        raw,
        fingerprint: fingerprint(payload),
    })
}

/// Lowercase hex SHA-256 of the payload bytes.
pub fn fingerprint(payload: &str) -> String {
    let digest = Sha256::digest(payload.as_bytes());
    format!("{:x}", digest)
}
