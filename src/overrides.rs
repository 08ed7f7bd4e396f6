//! Global metric overrides.
//!
//! Operators can temporarily exclude metrics from evaluation without
//! touching any check definition. An override pattern is either an exact
//! metric name or a prefix wildcard like `"building.hvac.*"`, which matches
//! every metric whose leading dot-separated components are exactly
//! `building.hvac`.

use thiserror::Error;

/// Error parsing an override pattern.
#[derive(Debug, Error)]
#[error("invalid pattern {pattern:?}: {reason}")]
pub struct PatternParseError {
    pattern: String,
    reason: &'static str,
}

impl PatternParseError {
    fn new(pattern: &str, reason: &'static str) -> Self {
        Self {
            pattern: pattern.to_string(),
            reason,
        }
    }
}

const WILDCARD: &str = "*";

/// A single metric name pattern: exact or prefix-wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricPattern {
    Exact(String),
    /// Stored with a trailing dot (`"a.b."`) so matching is a plain
    /// prefix test that cannot match `a.bc.d`.
    Prefix(String),
}

impl MetricPattern {
    /// Parse a pattern. The wildcard may only appear as the entire last
    /// component (`a.b.*`); anything else is rejected.
    pub fn parse(pattern: &str) -> Result<Self, PatternParseError> {
        let components: Vec<&str> = pattern.split('.').collect();

        if components.iter().any(|c| c.is_empty()) {
            return Err(PatternParseError::new(
                pattern,
                "metric names must have non-empty components separated by '.'",
            ));
        }

        let (last, prefix) = components.split_last().expect("split always yields one");
        if *last == WILDCARD {
            if prefix.is_empty() {
                return Err(PatternParseError::new(
                    pattern,
                    "wildcard needs at least one leading component",
                ));
            }
            if prefix.iter().any(|c| c.contains(WILDCARD)) {
                return Err(PatternParseError::new(
                    pattern,
                    "wildcard can only appear in the last component",
                ));
            }
            let mut joined = prefix.join(".");
            joined.push('.');
            Ok(MetricPattern::Prefix(joined))
        } else if components.iter().any(|c| c.contains(WILDCARD)) {
            Err(PatternParseError::new(
                pattern,
                "wildcard can only match a whole component",
            ))
        } else {
            Ok(MetricPattern::Exact(pattern.to_string()))
        }
    }

    pub fn matches(&self, metric: &str) -> bool {
        match self {
            MetricPattern::Exact(name) => name == metric,
            MetricPattern::Prefix(prefix) => metric.starts_with(prefix.as_str()),
        }
    }
}

/// The hot-swappable set of ignored-metric patterns.
///
/// A metric matching any entry is excluded from aggregation entirely: it
/// contributes no severity and its timeout watchdog is suspended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideSet {
    patterns: Vec<MetricPattern>,
}

impl OverrideSet {
    /// An empty set that ignores nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a list of pattern strings from the `overrides.ignored_metrics`
    /// configuration section.
    pub fn parse(patterns: &[String]) -> Result<Self, PatternParseError> {
        let patterns = patterns
            .iter()
            .map(|p| MetricPattern::parse(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Whether `metric` is currently overridden (ignored).
    pub fn is_ignored(&self, metric: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(metric))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let pat = MetricPattern::parse("room.temp").unwrap();
        assert!(pat.matches("room.temp"));
        assert!(!pat.matches("room.temperature"));
        assert!(!pat.matches("room"));
    }

    #[test]
    fn test_prefix_match_whole_components_only() {
        let pat = MetricPattern::parse("santa.*").unwrap();
        assert!(pat.matches("santa.location.latitude"));
        assert!(pat.matches("santa.sleigh"));
        assert!(!pat.matches("santa"));
        assert!(!pat.matches("santabarbara.weather"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(MetricPattern::parse("").is_err());
        assert!(MetricPattern::parse("a..b").is_err());
        assert!(MetricPattern::parse("a.*.b").is_err());
        assert!(MetricPattern::parse("a.b*").is_err());
        assert!(MetricPattern::parse("*").is_err());
        assert!(MetricPattern::parse("a.").is_err());
    }

    #[test]
    fn test_override_set() {
        let set = OverrideSet::parse(&[
            "santa.*".to_string(),
            "room.temp".to_string(),
        ])
        .unwrap();
        assert!(set.is_ignored("santa.location.latitude"));
        assert!(set.is_ignored("room.temp"));
        assert!(!set.is_ignored("room.humidity"));
        assert!(OverrideSet::empty().is_ignored("anything") == false);
    }
}
