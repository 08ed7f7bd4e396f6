//! Check severity levels and their passive-check wire encoding.

use serde::{Deserialize, Serialize};

/// Severity of a metric or check.
///
/// The derived ordering is the *aggregation precedence* used when combining
/// metric states into an overall check state: `Critical` dominates
/// `Warning`, which dominates `Unknown`, which dominates `Ok`. Note that
/// this is distinct from the numeric wire encoding (see [`Severity::code`]),
/// where UNKNOWN is 3.
///
/// # Examples
///
/// ```
/// use checkwatch::Severity;
///
/// let sev: Severity = "warning".parse().unwrap();
/// assert_eq!(sev, Severity::Warning);
/// assert!(Severity::Critical > Severity::Warning);
/// assert!(Severity::Warning > Severity::Unknown);
/// assert_eq!(Severity::Unknown.code(), 3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Unknown,
    Warning,
    Critical,
}

impl Severity {
    /// Numeric status code understood by Nagios/Centreon-style hosts:
    /// 0=OK, 1=WARNING, 2=CRITICAL, 3=UNKNOWN.
    pub fn code(&self) -> u8 {
        match self {
            Severity::Ok => 0,
            Severity::Warning => 1,
            Severity::Critical => 2,
            Severity::Unknown => 3,
        }
    }

    /// True for states that indicate a problem with metric values
    /// (WARNING or CRITICAL). UNKNOWN is absence of data, not abnormality.
    pub fn is_abnormal(&self) -> bool {
        matches!(self, Severity::Warning | Severity::Critical)
    }

    /// Uppercase name as it appears in report messages.
    pub fn name(&self) -> &'static str {
        match self {
            Severity::Ok => "OK",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
            Severity::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ok" => Ok(Severity::Ok),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            "unknown" => Ok(Severity::Unknown),
            _ => Err(format!("unknown severity: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregation_precedence() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Unknown);
        assert!(Severity::Unknown > Severity::Ok);
    }

    #[test]
    fn test_wire_codes() {
        assert_eq!(Severity::Ok.code(), 0);
        assert_eq!(Severity::Warning.code(), 1);
        assert_eq!(Severity::Critical.code(), 2);
        assert_eq!(Severity::Unknown.code(), 3);
    }

    #[test]
    fn test_parse_roundtrip() {
        for sev in [
            Severity::Ok,
            Severity::Warning,
            Severity::Critical,
            Severity::Unknown,
        ] {
            let parsed: Severity = sev.to_string().parse().unwrap();
            assert_eq!(parsed, sev);
        }
    }

    #[test]
    fn test_abnormal() {
        assert!(!Severity::Ok.is_abnormal());
        assert!(!Severity::Unknown.is_abnormal());
        assert!(Severity::Warning.is_abnormal());
        assert!(Severity::Critical.is_abnormal());
    }
}
