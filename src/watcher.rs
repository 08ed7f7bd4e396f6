//! Per-metric value evaluation and arrival-timeout watchdogs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::EffectiveCheckConfig;
use crate::severity::Severity;

/// Numeric thresholds for a metric value.
///
/// Severity is CRITICAL outside the critical band, WARNING outside the
/// warning band, OK in between. Bound ordering is validated at
/// configuration time (see [`crate::config`]); this type assumes it holds.
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    pub warning_below: f64,
    pub warning_above: f64,
    pub critical_below: f64,
    pub critical_above: f64,
}

impl Thresholds {
    /// Build from optional bounds; `None` if no bound is configured at all,
    /// in which case values never need to be decoded.
    pub fn from_config(config: &EffectiveCheckConfig) -> Option<Self> {
        if !config.has_thresholds() {
            return None;
        }
        Some(Self {
            warning_below: config.warning_below.unwrap_or(f64::NEG_INFINITY),
            warning_above: config.warning_above.unwrap_or(f64::INFINITY),
            critical_below: config.critical_below.unwrap_or(f64::NEG_INFINITY),
            critical_above: config.critical_above.unwrap_or(f64::INFINITY),
        })
    }

    pub fn evaluate(&self, value: f64) -> Severity {
        if value < self.critical_below || value > self.critical_above {
            Severity::Critical
        } else if value < self.warning_below || value > self.warning_above {
            Severity::Warning
        } else {
            Severity::Ok
        }
    }

    /// Human-readable description of the abnormal range for a severity,
    /// used in report messages: `"below 10 or above 40"`.
    pub fn describe_range(&self, severity: Severity) -> Option<String> {
        let (low, high) = match severity {
            Severity::Warning => (self.warning_below, self.warning_above),
            Severity::Critical => (self.critical_below, self.critical_above),
            _ => return None,
        };
        match (low.is_finite(), high.is_finite()) {
            (false, false) => None,
            (true, false) => Some(format!("below {low}")),
            (false, true) => Some(format!("above {high}")),
            (true, true) => Some(format!("below {low} or above {high}")),
        }
    }
}

/// Outcome of feeding one event into a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Event accepted; watcher state may have changed.
    Accepted,
    /// Event had a non-monotonic timestamp and was discarded whole.
    Rejected,
}

/// Watches a single metric: evaluates values against thresholds, filters
/// ignored values, and tracks the arrival-timeout watchdog.
///
/// Watchers do not own timers; the engine loop polls [`deadline`] and calls
/// [`fire_deadline`] when it expires, so tearing down the owning check
/// inherently cancels the watchdog.
///
/// [`deadline`]: MetricWatcher::deadline
/// [`fire_deadline`]: MetricWatcher::fire_deadline
#[derive(Debug)]
pub struct MetricWatcher {
    name: String,
    thresholds: Option<Thresholds>,
    ignored_values: Vec<f64>,
    timeout: Option<Duration>,

    last_timestamp: Option<DateTime<Utc>>,
    /// Threshold state from the last accepted event; UNKNOWN before any.
    state: Severity,
    timed_out: bool,
    /// Armed wall-clock watchdog; disarmed after firing until the next
    /// accepted event, so an expired watchdog cannot fire twice.
    deadline: Option<Instant>,
}

impl MetricWatcher {
    pub fn new(
        name: String,
        thresholds: Option<Thresholds>,
        ignored_values: Vec<f64>,
        timeout: Option<Duration>,
    ) -> Self {
        // The watchdog runs from startup: a metric that never delivers
        // anything must still time out.
        let deadline = timeout.map(|t| Instant::now() + t);
        Self {
            name,
            thresholds,
            ignored_values,
            timeout,
            last_timestamp: None,
            state: Severity::Unknown,
            timed_out: false,
            deadline,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A watcher with neither thresholds nor a timeout never contributes.
    pub fn is_inert(&self) -> bool {
        self.thresholds.is_none() && self.timeout.is_none()
    }

    pub fn thresholds(&self) -> Option<&Thresholds> {
        self.thresholds.as_ref()
    }

    /// Threshold state from the last accepted event.
    pub fn state(&self) -> Severity {
        self.state
    }

    /// Replace the threshold state, used when check plugins adjust the
    /// verdict for a value.
    pub fn set_state(&mut self, state: Severity) {
        self.state = state;
    }

    /// Feed one `(timestamp, value)` event. A `None` value is a
    /// timeout-only tick: it bumps the watchdog without value evaluation.
    pub fn observe(&mut self, timestamp: DateTime<Utc>, value: Option<f64>) -> Observation {
        if let Some(last) = self.last_timestamp {
            if timestamp <= last {
                trace!(
                    metric = %self.name,
                    %timestamp,
                    last_accepted = %last,
                    "discarding non-monotonic event"
                );
                return Observation::Rejected;
            }

            // Gap detection on the events' own timestamps: a hole wider
            // than the timeout means values were missing, even if they
            // arrive in a late burst.
            if let Some(timeout) = self.timeout {
                let gap_exceeded = (timestamp - last)
                    .to_std()
                    .map(|gap| gap > timeout)
                    .unwrap_or(false);
                if gap_exceeded {
                    debug!(
                        metric = %self.name,
                        %timestamp,
                        last_accepted = %last,
                        "gap between values exceeds timeout"
                    );
                }
                self.timed_out = gap_exceeded;
            }
        } else {
            self.timed_out = false;
        }

        self.last_timestamp = Some(timestamp);
        if let Some(timeout) = self.timeout {
            self.deadline = Some(Instant::now() + timeout);
        }

        match (value, &self.thresholds) {
            (Some(v), Some(thresholds)) => {
                if v.is_nan() || self.ignored_values.iter().any(|iv| *iv == v) {
                    // Ignored values count as received but carry no
                    // abnormal severity.
                    self.state = Severity::Ok;
                } else {
                    self.state = thresholds.evaluate(v);
                }
            }
            (_, None) => {
                // Timeout-only watcher: any accepted event is a sign of
                // life.
                self.state = Severity::Ok;
            }
            (None, Some(_)) => {
                // Value-less tick on a threshold watcher: bumps the
                // watchdog, threshold state unchanged.
            }
        }

        Observation::Accepted
    }

    /// The armed watchdog deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Expire the watchdog. The WARNING contribution persists until the
    /// next accepted event.
    pub fn fire_deadline(&mut self) {
        self.timed_out = true;
        self.deadline = None;
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    /// Last accepted timestamp; `None` if no value was ever received.
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_timestamp
    }

    /// Current severity contribution, or `None` for inert watchers.
    pub fn contribution(&self) -> Option<Severity> {
        if self.is_inert() {
            return None;
        }
        let timeout_state = if self.timed_out {
            Severity::Warning
        } else {
            Severity::Ok
        };
        Some(self.state.max(timeout_state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn thresholds(wb: f64, wa: f64, cb: f64, ca: f64) -> Thresholds {
        Thresholds {
            warning_below: wb,
            warning_above: wa,
            critical_below: cb,
            critical_above: ca,
        }
    }

    #[test]
    fn test_threshold_bands() {
        let t = thresholds(10.0, 40.0, 0.0, 50.0);
        assert_eq!(t.evaluate(25.0), Severity::Ok);
        assert_eq!(t.evaluate(5.0), Severity::Warning);
        assert_eq!(t.evaluate(45.0), Severity::Warning);
        assert_eq!(t.evaluate(-1.0), Severity::Critical);
        assert_eq!(t.evaluate(55.0), Severity::Critical);
        // Band edges are inclusive on the OK side.
        assert_eq!(t.evaluate(10.0), Severity::Ok);
        assert_eq!(t.evaluate(40.0), Severity::Ok);
    }

    #[test]
    fn test_describe_range() {
        let t = thresholds(10.0, 40.0, f64::NEG_INFINITY, 50.0);
        assert_eq!(
            t.describe_range(Severity::Warning).unwrap(),
            "below 10 or above 40"
        );
        assert_eq!(t.describe_range(Severity::Critical).unwrap(), "above 50");
        assert_eq!(t.describe_range(Severity::Ok), None);
    }

    #[test]
    fn test_room_temp_scenario() {
        let t = thresholds(f64::NEG_INFINITY, 40.0, f64::NEG_INFINITY, 50.0);
        let mut w = MetricWatcher::new("room.temp".into(), Some(t), vec![], None);
        let mut states = Vec::new();
        for (i, value) in [35.0, 45.0, 55.0].into_iter().enumerate() {
            assert_eq!(w.observe(ts(i as i64), Some(value)), Observation::Accepted);
            states.push(w.contribution().unwrap());
        }
        assert_eq!(
            states,
            vec![Severity::Ok, Severity::Warning, Severity::Critical]
        );
    }

    #[test]
    fn test_non_monotonic_events_rejected() {
        let t = thresholds(f64::NEG_INFINITY, 40.0, f64::NEG_INFINITY, 50.0);
        let mut w = MetricWatcher::new("m".into(), Some(t), vec![], None);
        assert_eq!(w.observe(ts(10), Some(35.0)), Observation::Accepted);
        assert_eq!(w.contribution(), Some(Severity::Ok));

        // Stale and duplicate timestamps change nothing.
        assert_eq!(w.observe(ts(9), Some(99.0)), Observation::Rejected);
        assert_eq!(w.observe(ts(10), Some(99.0)), Observation::Rejected);
        assert_eq!(w.contribution(), Some(Severity::Ok));
        assert_eq!(w.last_timestamp(), Some(ts(10)));
    }

    #[test]
    fn test_nan_and_ignored_values_are_ok_but_accepted() {
        let t = thresholds(f64::NEG_INFINITY, 40.0, f64::NEG_INFINITY, 50.0);
        let mut w = MetricWatcher::new("m".into(), Some(t), vec![0.0], None);
        w.observe(ts(1), Some(45.0));
        assert_eq!(w.contribution(), Some(Severity::Warning));

        // NaN clears the abnormal state and counts as received.
        w.observe(ts(2), Some(f64::NAN));
        assert_eq!(w.contribution(), Some(Severity::Ok));
        assert_eq!(w.last_timestamp(), Some(ts(2)));

        // Exact ignore-set match behaves the same.
        w.observe(ts(3), Some(55.0));
        assert_eq!(w.contribution(), Some(Severity::Critical));
        w.observe(ts(4), Some(0.0));
        assert_eq!(w.contribution(), Some(Severity::Ok));
    }

    #[test]
    fn test_starts_unknown() {
        let t = thresholds(f64::NEG_INFINITY, 40.0, f64::NEG_INFINITY, 50.0);
        let w = MetricWatcher::new("m".into(), Some(t), vec![], None);
        assert_eq!(w.contribution(), Some(Severity::Unknown));
    }

    #[test]
    fn test_inert_watcher_contributes_nothing() {
        let w = MetricWatcher::new("m".into(), None, vec![], None);
        assert!(w.is_inert());
        assert_eq!(w.contribution(), None);
        assert_eq!(w.deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_arming_and_expiry() {
        let timeout = Duration::from_secs(60);
        let mut w = MetricWatcher::new("m".into(), None, vec![], Some(timeout));
        // Armed from construction, before any value arrives.
        assert!(w.deadline().is_some());
        assert_eq!(w.contribution(), Some(Severity::Unknown));

        w.observe(ts(0), Some(1.0));
        assert_eq!(w.contribution(), Some(Severity::Ok));

        w.fire_deadline();
        assert_eq!(w.contribution(), Some(Severity::Warning));
        assert_eq!(w.deadline(), None);

        // The next accepted event recovers and re-arms.
        w.observe(ts(30), Some(1.0));
        assert_eq!(w.contribution(), Some(Severity::Ok));
        assert!(w.deadline().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_time_gap_detection() {
        let timeout = Duration::from_secs(60);
        let mut w = MetricWatcher::new("m".into(), None, vec![], Some(timeout));
        w.observe(ts(0), Some(1.0));
        assert!(!w.is_timed_out());

        // A late burst after a 100s hole in metric time is flagged at
        // arrival of the second event.
        w.observe(ts(100), Some(1.0));
        assert!(w.is_timed_out());
        assert_eq!(w.contribution(), Some(Severity::Warning));

        // A consecutive pair within the timeout clears the flag.
        w.observe(ts(130), Some(1.0));
        assert!(!w.is_timed_out());
        assert_eq!(w.contribution(), Some(Severity::Ok));
    }

    #[tokio::test(start_paused = true)]
    async fn test_value_less_tick_bumps_watchdog_only() {
        let t = thresholds(f64::NEG_INFINITY, 40.0, f64::NEG_INFINITY, 50.0);
        let mut w = MetricWatcher::new(
            "m".into(),
            Some(t),
            vec![],
            Some(Duration::from_secs(60)),
        );
        w.observe(ts(0), Some(45.0));
        assert_eq!(w.contribution(), Some(Severity::Warning));

        let before = w.deadline().unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        w.observe(ts(10), None);
        // Threshold state untouched, watchdog pushed out.
        assert_eq!(w.contribution(), Some(Severity::Warning));
        assert!(w.deadline().unwrap() > before);
    }
}
