//! Trap normalizer
//!
//! Turns the decoded trap handed over by the protocol engine into a
//! `TrapEvent`. Normalization is total: anything that does not fit the
//! grammar is kept as an unparsed binding instead of rejecting the trap.

use crate::config::NormalizerConfig;
use crate::event::{TrapEvent, VariableBinding};
use crate::severity;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

/// Version of the handoff grammar, reported in event metadata.
pub const HANDLER_VERSION: &str = "2.0";

pub const TRAP_OID_BINDINGS: &[&str] = &[
    "SNMPv2-MIB::snmpTrapOID.0",
    ".1.3.6.1.6.3.1.1.4.1.0",
    "1.3.6.1.6.3.1.1.4.1.0",
    "iso.3.6.1.6.3.1.1.4.1.0",
];

pub const UPTIME_BINDINGS: &[&str] = &[
    "DISMAN-EVENT-MIB::sysUpTimeInstance",
    "SNMPv2-MIB::sysUpTime.0",
    ".1.3.6.1.2.1.1.3.0",
    "1.3.6.1.2.1.1.3.0",
    "iso.3.6.1.2.1.1.3.0",
];

const UNPARSED_PREFIX: &str = "UNPARSED";

static BRACKETED_SOURCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]:\d+->").expect("valid regex"));
static DOTTED_QUAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})").expect("valid regex"));

/// One binding line as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawBinding {
    Pair { oid: String, value: String },
    /// A line that is not `token whitespace rest`, kept verbatim.
    Unparsed(String),
}

/// Decoded trap record as handed off by the protocol engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawTrapRecord {
    pub host: String,
    pub source_address: String,
    pub transport: String,
    pub bindings: Vec<RawBinding>,
    /// Input lines consumed, headers included.
    pub line_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandoffState {
    ExpectHost,
    ExpectTransport,
    ExpectBinding,
}

impl RawTrapRecord {
    /// Build a record from structured pairs, as an in-process engine would.
    pub fn from_pairs<I, K, V>(host: &str, transport: &str, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let bindings: Vec<RawBinding> = pairs
            .into_iter()
            .map(|(oid, value)| RawBinding::Pair {
                oid: oid.into(),
                value: value.into(),
            })
            .collect();
        Self {
            host: host.to_string(),
            source_address: String::new(),
            transport: transport.to_string(),
            line_count: bindings.len() + 2,
            bindings,
        }
    }

    /// Parse the line-oriented `traphandle` handoff.
    ///
    /// Line 1 is the host, line 2 the transport descriptor, every further
    /// non-blank line one binding. End of input ends the trap.
    pub fn parse_handoff(input: &str) -> Self {
        let mut record = RawTrapRecord::default();
        let mut state = HandoffState::ExpectHost;

        for line in input.lines() {
            let line = line.trim_end_matches(['\r', '\n']);
            record.line_count += 1;

            state = match state {
                HandoffState::ExpectHost => {
                    record.host = line.trim().to_string();
                    HandoffState::ExpectTransport
                }
                HandoffState::ExpectTransport => {
                    record.transport = line.trim().to_string();
                    HandoffState::ExpectBinding
                }
                HandoffState::ExpectBinding => {
                    if !line.trim().is_empty() {
                        record.bindings.push(parse_binding_line(line));
                    }
                    HandoffState::ExpectBinding
                }
            };
        }

        record
    }
}

/// Split a binding line on its first whitespace run.
pub fn parse_binding_line(line: &str) -> RawBinding {
    let trimmed = line.trim_start();
    match trimmed.split_once(char::is_whitespace) {
        Some((oid, rest)) if !rest.trim().is_empty() => RawBinding::Pair {
            oid: oid.to_string(),
            value: rest.trim_start().trim_end().to_string(),
        },
        _ => RawBinding::Unparsed(line.trim_end().to_string()),
    }
}

/// Best-effort numeric source address from a transport descriptor.
///
/// Tries `[addr]:port->` first, then the first dotted quad; empty when neither matches.
pub fn extract_source_ip(transport: &str) -> String {
    if let Some(caps) = BRACKETED_SOURCE.captures(transport) {
        return caps[1].to_string();
    }
    if let Some(caps) = DOTTED_QUAD.captures(transport) {
        return caps[1].to_string();
    }
    String::new()
}

/// Derive the short notification name from the trap OID binding value.
///
/// Known notifications take their table symbol in any rendering; anything
/// else keeps the text after the MIB module prefix.
pub fn notification_name(notification_oid: &str) -> String {
    match severity::lookup(notification_oid) {
        Some(entry) => entry.symbol.to_string(),
        None => severity::short_name(notification_oid).to_string(),
    }
}

/// Stateless trap normalizer; one instance may serve any number of traps.
#[derive(Debug, Clone)]
pub struct Normalizer {
    severity_override_bindings: Vec<String>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(&NormalizerConfig::default())
    }
}

impl Normalizer {
    pub fn new(config: &NormalizerConfig) -> Self {
        Self {
            severity_override_bindings: config.severity_override_bindings.clone(),
        }
    }

    /// Normalize a trap with the current wall-clock time.
    pub fn normalize(&self, raw: &RawTrapRecord) -> TrapEvent {
        self.normalize_at(raw, Utc::now())
    }

    /// Normalize a trap with an explicit event time.
    pub fn normalize_at(&self, raw: &RawTrapRecord, timestamp: DateTime<Utc>) -> TrapEvent {
        let mut source_ip = extract_source_ip(&raw.transport);
        if source_ip.is_empty() {
            source_ip = raw.source_address.trim().to_string();
        }

        let mut notification_oid = String::new();
        let mut uptime = String::new();
        let mut alarm_severity: Option<String> = None;
        let mut variable_bindings = Vec::with_capacity(raw.bindings.len());

        for (index, binding) in raw.bindings.iter().enumerate() {
            let binding = match binding {
                RawBinding::Pair { oid, value } if is_valid_identifier(oid) => {
                    VariableBinding::new(oid.as_str(), value.trim_end())
                }
                RawBinding::Pair { oid, value } => {
                    unparsed(index, format!("{} {}", oid, value).trim())
                }
                RawBinding::Unparsed(line) => unparsed(index, line.trim_end()),
            };

            if TRAP_OID_BINDINGS.contains(&binding.oid.as_str()) {
                notification_oid = binding.value.clone();
            } else if UPTIME_BINDINGS.contains(&binding.oid.as_str()) {
                uptime = binding.value.clone();
            } else if self.is_override_binding(&binding.oid) {
                alarm_severity = Some(binding.value.clone());
            }

            variable_bindings.push(binding);
        }

        let severity = match &alarm_severity {
            Some(value) => severity::from_alarm_value(value),
            None => severity::classify(&notification_oid),
        };
        let notification_name = notification_name(&notification_oid);

        debug!(
            host = %raw.host,
            src_ip = %source_ip,
            trap = %notification_name,
            severity = %severity,
            "Normalized trap"
        );

        TrapEvent {
            timestamp,
            host: raw.host.clone(),
            source_ip,
            transport: raw.transport.clone(),
            notification_oid,
            notification_name,
            severity,
            uptime,
            processed_binding_count: variable_bindings.len(),
            variable_bindings,
            processed_lines: raw.line_count,
        }
    }

    fn is_override_binding(&self, oid: &str) -> bool {
        self.severity_override_bindings
            .iter()
            .any(|token| !token.is_empty() && oid.contains(token.as_str()))
    }
}

fn is_valid_identifier(oid: &str) -> bool {
    !oid.is_empty() && !oid.chars().any(char::is_whitespace)
}

fn unparsed(index: usize, line: &str) -> VariableBinding {
    VariableBinding::new(format!("{}.{}", UNPARSED_PREFIX, index + 1), line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Severity;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn bracketed_transport_yields_the_sending_address() {
        assert_eq!(extract_source_ip("UDP: [10.0.0.5]:161->[10.0.0.2]:162"), "10.0.0.5");
    }

    #[test]
    fn bare_dotted_quad_is_the_second_strategy() {
        assert_eq!(extract_source_ip("TCP 172.16.4.20 port 1162"), "172.16.4.20");
        assert_eq!(extract_source_ip("<UNKNOWN>"), "");
    }

    #[test]
    fn handoff_walks_host_transport_then_bindings() {
        let input = "r1\nUDP: [192.168.1.10]:161->[192.168.1.1]:162\n\
                     1.3.6.1.2.1.1.3.0 12345   \n\
                     SNMPv2-MIB::snmpTrapOID.0\tlinkDown\n\
                     \n\
                     garbage-without-value\n";
        let record = RawTrapRecord::parse_handoff(input);

        assert_eq!(record.host, "r1");
        assert_eq!(record.transport, "UDP: [192.168.1.10]:161->[192.168.1.1]:162");
        assert_eq!(record.line_count, 6);
        assert_eq!(
            record.bindings,
            vec![
                RawBinding::Pair { oid: "1.3.6.1.2.1.1.3.0".into(), value: "12345".into() },
                RawBinding::Pair { oid: "SNMPv2-MIB::snmpTrapOID.0".into(), value: "linkDown".into() },
                RawBinding::Unparsed("garbage-without-value".into()),
            ]
        );
    }

    #[test]
    fn end_to_end_link_down() {
        let raw = RawTrapRecord::from_pairs(
            "r1",
            "UDP: [192.168.1.10]:161->[192.168.1.1]:162",
            [("1.3.6.1.2.1.1.3.0", "12345"), ("SNMPv2-MIB::snmpTrapOID.0", "linkDown")],
        );
        let event = Normalizer::default().normalize_at(&raw, fixed_time());

        assert_eq!(event.source_ip, "192.168.1.10");
        assert_eq!(event.uptime, "12345");
        assert_eq!(event.notification_oid, "linkDown");
        assert_eq!(event.notification_name, "linkDown");
        assert_eq!(event.severity, Severity::Error);
        assert_eq!(event.processed_binding_count, 2);
        assert_eq!(event.variable_bindings.len(), event.processed_binding_count);
    }

    #[test]
    fn malformed_pairs_become_unparsed_bindings() {
        let raw = RawTrapRecord {
            host: "r2".into(),
            source_address: String::new(),
            transport: String::new(),
            bindings: vec![
                RawBinding::Pair { oid: "".into(), value: "orphan value".into() },
                RawBinding::Pair { oid: "IF-MIB::ifIndex.3".into(), value: "3  ".into() },
                RawBinding::Unparsed("just-a-token".into()),
            ],
            line_count: 5,
        };
        let event = Normalizer::default().normalize_at(&raw, fixed_time());

        assert_eq!(event.variable_bindings[0], VariableBinding::new("UNPARSED.1", "orphan value"));
        assert_eq!(event.variable_bindings[1], VariableBinding::new("IF-MIB::ifIndex.3", "3"));
        assert_eq!(event.variable_bindings[2], VariableBinding::new("UNPARSED.3", "just-a-token"));
        assert_eq!(event.processed_binding_count, 3);
        assert_eq!(event.severity, Severity::Info);
        assert_eq!(event.notification_oid, "");
        assert_eq!(event.notification_name, "");
    }

    #[test]
    fn empty_input_still_produces_an_event() {
        let event = Normalizer::default().normalize(&RawTrapRecord::parse_handoff(""));
        assert_eq!(event.host, "");
        assert_eq!(event.processed_binding_count, 0);
        assert_eq!(event.severity, Severity::Info);
    }

    #[test]
    fn numeric_trap_oid_takes_the_symbolic_name() {
        let raw = RawTrapRecord::from_pairs(
            "r3",
            "UDP: [10.1.1.1]:1024->[10.1.1.2]:162",
            [(".1.3.6.1.6.3.1.1.4.1.0", ".1.3.6.1.6.3.1.1.5.5")],
        );
        let event = Normalizer::default().normalize_at(&raw, fixed_time());
        assert_eq!(event.notification_oid, ".1.3.6.1.6.3.1.1.5.5");
        assert_eq!(event.notification_name, "authenticationFailure");
        assert_eq!(event.severity, Severity::Critical);
    }

    #[test]
    fn unresolved_iso_rendering_is_classified() {
        let raw = RawTrapRecord::from_pairs(
            "r5",
            "UDP: [10.1.1.7]:1024->[10.1.1.2]:162",
            [("iso.3.6.1.6.3.1.1.4.1.0", "iso.3.6.1.6.3.1.1.5.5")],
        );
        let event = Normalizer::default().normalize_at(&raw, fixed_time());
        assert_eq!(event.notification_oid, "iso.3.6.1.6.3.1.1.5.5");
        assert_eq!(event.notification_name, "authenticationFailure");
        assert_eq!(event.severity, Severity::Critical);
    }

    #[test]
    fn default_normalizer_honours_the_configured_alarm_binding() {
        let raw = RawTrapRecord::from_pairs(
            "dsr2",
            "UDP: [10.2.0.2]:161->[10.2.0.9]:162",
            [
                ("SNMPv2-MIB::snmpTrapOID.0", "SNMPv2-MIB::linkUp"),
                ("EAGLEXGDSR-MIB::eagleXgDsrAlarmSeverity", "critical"),
            ],
        );
        let event = Normalizer::default().normalize_at(&raw, fixed_time());
        assert_eq!(event.severity, Severity::Critical);
    }

    #[test]
    fn transport_without_address_falls_back_to_source_address() {
        let mut raw = RawTrapRecord::from_pairs("r4", "callback", Vec::<(String, String)>::new());
        raw.source_address = "10.9.9.9".into();
        let event = Normalizer::default().normalize_at(&raw, fixed_time());
        assert_eq!(event.source_ip, "10.9.9.9");
    }

    #[test]
    fn alarm_binding_overrides_the_table() {
        let normalizer = Normalizer::new(&NormalizerConfig::default());
        let raw = RawTrapRecord::from_pairs(
            "dsr1",
            "UDP: [10.2.0.1]:161->[10.2.0.9]:162",
            [
                ("SNMPv2-MIB::snmpTrapOID.0", "EAGLEXGDSR-MIB::eagleXgDsrAlarmNotify"),
                ("EAGLEXGDSR-MIB::eagleXgDsrAlarmSeverity", "2"),
            ],
        );
        let event = normalizer.normalize_at(&raw, fixed_time());
        assert_eq!(event.notification_name, "eagleXgDsrAlarmNotify");
        assert_eq!(event.severity, Severity::Error);
    }

    #[test]
    fn renormalizing_is_deterministic() {
        let raw = RawTrapRecord::parse_handoff(
            "r1\nUDP: [10.0.0.5]:161->[10.0.0.2]:162\nSNMPv2-MIB::snmpTrapOID.0 coldStart\n",
        );
        let normalizer = Normalizer::default();
        let first = normalizer.normalize_at(&raw, fixed_time());
        let second = normalizer.normalize_at(&raw, fixed_time());
        assert_eq!(first, second);
        assert_eq!(first.severity, Severity::Warning);
    }
}
