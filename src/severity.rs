//! Severity classification for SNMP notifications
//!
//! The generic traps of SNMPv2-MIB are classified through a static table.
//! Vendor alarm bindings can override the table when configured.

use crate::event::Severity;

/// One well-known notification, addressable by numeric OID or symbolic name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownNotification {
    pub numeric: &'static str,
    pub symbol: &'static str,
    pub severity: Severity,
}

pub const SEVERITY_TABLE: &[KnownNotification] = &[
    KnownNotification { numeric: "1.3.6.1.6.3.1.1.5.1", symbol: "coldStart", severity: Severity::Warning },
    KnownNotification { numeric: "1.3.6.1.6.3.1.1.5.2", symbol: "warmStart", severity: Severity::Info },
    KnownNotification { numeric: "1.3.6.1.6.3.1.1.5.3", symbol: "linkDown", severity: Severity::Error },
    KnownNotification { numeric: "1.3.6.1.6.3.1.1.5.4", symbol: "linkUp", severity: Severity::Info },
    KnownNotification { numeric: "1.3.6.1.6.3.1.1.5.5", symbol: "authenticationFailure", severity: Severity::Critical },
    KnownNotification { numeric: "1.3.6.1.6.3.1.1.5.6", symbol: "egpNeighborLoss", severity: Severity::Warning },
];

/// Find the table entry for a notification OID in either numeric or symbolic form.
///
/// Matches on a component boundary, so `1.3.6.1.6.3.1.1.5.3`,
/// `.1.3.6.1.6.3.1.1.5.3`, `iso.3.6.1.6.3.1.1.5.3`, `linkDown`,
/// `IF-MIB::linkDown`, `SNMPv2-MIB.linkDown` and `SNMPv2-MIB::linkDown.0`
/// all resolve. Numeric and symbolic forms are checked against the same
/// entry, so neither wins over the other.
pub fn lookup(notification_oid: &str) -> Option<&'static KnownNotification> {
    let trimmed = notification_oid.trim();
    if trimmed.is_empty() {
        return None;
    }

    let numeric = trimmed.trim_start_matches('.');
    let numeric = numeric.strip_suffix(".0").unwrap_or(numeric);
    let numeric = match numeric.strip_prefix("iso.") {
        Some(rest) => format!("1.{}", rest),
        None => numeric.to_string(),
    };
    let name = short_name(trimmed);
    let symbolic = name.rsplit('.').next().unwrap_or(name);

    SEVERITY_TABLE.iter().find(|entry| {
        ends_on_component(&numeric, entry.numeric) || ends_on_component(symbolic, entry.symbol)
    })
}

/// `value` is `suffix` or ends with `.suffix`.
fn ends_on_component(value: &str, suffix: &str) -> bool {
    match value.strip_suffix(suffix) {
        Some("") => true,
        Some(head) => head.ends_with('.'),
        None => false,
    }
}

/// Classify a notification by the static table; unknown notifications are `info`.
pub fn classify(notification_oid: &str) -> Severity {
    lookup(notification_oid)
        .map(|entry| entry.severity)
        .unwrap_or_default()
}

/// Map a vendor alarm-severity binding value onto the severity enum.
///
/// Both the numeric codes and their names are accepted (`1`..`5`,
/// critical/major/minor/info/clear).
pub fn from_alarm_value(value: &str) -> Severity {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "critical" => Severity::Critical,
        "2" | "major" => Severity::Error,
        "3" | "minor" => Severity::Warning,
        "4" | "info" | "5" | "clear" => Severity::Info,
        _ => Severity::Info,
    }
}

/// Strip the MIB module prefix (everything up to the last `::`) and a trailing `.0`.
pub fn short_name(oid: &str) -> &str {
    let name = match oid.rfind("::") {
        Some(pos) => &oid[pos + 2..],
        None => oid,
    };
    name.strip_suffix(".0").unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_traps_classify_by_numeric_oid() {
        assert_eq!(classify("1.3.6.1.6.3.1.1.5.3"), Severity::Error);
        assert_eq!(classify("1.3.6.1.6.3.1.1.5.1"), Severity::Warning);
        assert_eq!(classify("1.3.6.1.6.3.1.1.5.5"), Severity::Critical);
        assert_eq!(classify(".1.3.6.1.6.3.1.1.5.4"), Severity::Info);
    }

    #[test]
    fn symbolic_and_numeric_forms_resolve_to_the_same_entry() {
        for entry in SEVERITY_TABLE {
            let by_number = lookup(entry.numeric).unwrap();
            let by_symbol = lookup(entry.symbol).unwrap();
            let qualified = lookup(&format!("SNMPv2-MIB::{}", entry.symbol)).unwrap();
            assert_eq!(by_number, by_symbol);
            assert_eq!(by_symbol, qualified);
        }
    }

    #[test]
    fn unknown_or_empty_notifications_are_info() {
        assert_eq!(classify("1.3.6.1.4.1.9.9.41.2.0.1"), Severity::Info);
        assert_eq!(classify("CISCO-SYSLOG-MIB::clogMessageGenerated"), Severity::Info);
        assert_eq!(classify(""), Severity::Info);
        // a numeric prefix of a known OID is not a match
        assert_eq!(classify("1.3.6.1.6.3.1.1.5"), Severity::Info);
    }

    #[test]
    fn unresolved_and_dotted_renderings_still_classify() {
        assert_eq!(classify("iso.3.6.1.6.3.1.1.5.3"), Severity::Error);
        assert_eq!(classify("iso.3.6.1.6.3.1.1.5.5"), Severity::Critical);
        assert_eq!(classify("SNMPv2-MIB.linkDown"), Severity::Error);
        assert_eq!(classify("SNMPv2-MIB.authenticationFailure.0"), Severity::Critical);
        // a different arc ending in the same digits is not a match
        assert_eq!(classify("1.3.6.1.6.3.1.1.5.13"), Severity::Info);
        assert_eq!(classify("XlinkDown"), Severity::Info);
    }

    #[test]
    fn alarm_values_accept_codes_and_names() {
        assert_eq!(from_alarm_value("1"), Severity::Critical);
        assert_eq!(from_alarm_value("Major"), Severity::Error);
        assert_eq!(from_alarm_value("3"), Severity::Warning);
        assert_eq!(from_alarm_value("clear"), Severity::Info);
        assert_eq!(from_alarm_value("bogus"), Severity::Info);
    }

    #[test]
    fn short_name_strips_module_and_index() {
        assert_eq!(short_name("SNMPv2-MIB::snmpTrapOID.0"), "snmpTrapOID");
        assert_eq!(short_name("IF-MIB::linkDown"), "linkDown");
        assert_eq!(short_name("linkDown"), "linkDown");
        assert_eq!(short_name("1.3.6.1.4.1.9.0"), "1.3.6.1.4.1.9");
    }
}
