//! A named check: a set of metric watchers aggregated into one reported
//! severity.
//!
//! A `Check` is driven entirely by the engine loop: metric events, watchdog
//! expirations and resend deadlines all arrive as synchronous method calls.
//! Because a check owns no tasks or timers of its own, dropping it from the
//! engine's registry is a complete teardown: nothing can fire afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::debug;

use crate::config::{ConfigError, EffectiveCheckConfig};
use crate::duration::format_duration;
use crate::overrides::OverrideSet;
use crate::plugin::{self, CheckPlugin};
use crate::postprocess::Postprocessor;
use crate::severity::Severity;
use crate::watcher::{MetricWatcher, Observation, Thresholds};

/// A report decision made by a check: severity plus explanatory message.
/// The engine wraps it with the reporting host and check name.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub severity: Severity,
    pub message: String,
}

pub struct Check {
    name: String,
    /// Canonical serialization of the effective config this was built
    /// from; reconfiguration keeps the check only on an exact match.
    fingerprint: String,

    watchers: BTreeMap<String, MetricWatcher>,
    plugins: BTreeMap<String, Box<dyn CheckPlugin>>,
    /// Metrics requested by plugins beyond the watched set.
    extra_metrics: BTreeSet<String>,

    postprocessor: Postprocessor,
    timeout: Option<Duration>,
    resend_interval: Duration,

    raw_state: Severity,
    stabilized_state: Severity,
    last_reported: Option<Severity>,
    next_resend: Instant,
    /// High-water mark of accepted metric timestamps. All postprocessor
    /// observations are stamped from this, so watchdog and override
    /// evaluations never mix wall clock into the metric-time window.
    latest_timestamp: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Check {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Check")
            .field("name", &self.name)
            .field("metrics", &self.watchers.keys().collect::<Vec<_>>())
            .field("raw_state", &self.raw_state)
            .field("stabilized_state", &self.stabilized_state)
            .finish_non_exhaustive()
    }
}

impl Check {
    /// Build a check from its effective configuration. Fails if any plugin
    /// cannot be constructed; the failure is confined to this check.
    pub fn new(name: &str, config: &EffectiveCheckConfig) -> Result<Self, ConfigError> {
        let thresholds = Thresholds::from_config(config);

        let watchers = config
            .metrics
            .iter()
            .map(|metric| {
                (
                    metric.clone(),
                    MetricWatcher::new(
                        metric.clone(),
                        thresholds.clone(),
                        config.ignore.clone(),
                        config.timeout,
                    ),
                )
            })
            .collect();

        let mut plugins: BTreeMap<String, Box<dyn CheckPlugin>> = BTreeMap::new();
        for (plugin_name, doc) in &config.plugins {
            let plugin = plugin::build(&doc.kind, &doc.config, &config.metrics).map_err(
                |source| ConfigError::Plugin {
                    check: name.to_string(),
                    plugin: plugin_name.clone(),
                    source,
                },
            )?;
            plugins.insert(plugin_name.clone(), plugin);
        }

        let extra_metrics = plugins
            .values()
            .flat_map(|p| p.extra_metrics())
            .filter(|m| !config.metrics.contains(m))
            .collect();

        Ok(Self {
            name: name.to_string(),
            fingerprint: config.fingerprint(),
            watchers,
            plugins,
            extra_metrics,
            postprocessor: Postprocessor::from_policy(&config.postprocessing),
            timeout: config.timeout,
            resend_interval: config.resend_interval,
            raw_state: Severity::Unknown,
            stabilized_state: Severity::Unknown,
            last_reported: None,
            next_resend: Instant::now() + config.resend_interval,
            latest_timestamp: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn stabilized_state(&self) -> Severity {
        self.stabilized_state
    }

    /// The metrics this check wants delivered, watched and extra alike.
    pub fn subscribed_metrics(&self) -> impl Iterator<Item = &str> {
        self.watchers
            .keys()
            .map(String::as_str)
            .chain(self.extra_metrics.iter().map(String::as_str))
    }

    pub fn watches(&self, metric: &str) -> bool {
        self.watchers.contains_key(metric)
    }

    pub fn wants_extra(&self, metric: &str) -> bool {
        self.extra_metrics.contains(metric)
    }

    /// Feed one metric event. Returns a report decision if the stabilized
    /// state changed.
    ///
    /// Overridden metrics still update their watcher (so their history is
    /// intact when the override is lifted) but are excluded from
    /// aggregation and deadlines by the override filter.
    pub fn observe(
        &mut self,
        metric: &str,
        timestamp: DateTime<Utc>,
        value: Option<f64>,
        overrides: &OverrideSet,
    ) -> Option<Emission> {
        if self.extra_metrics.contains(metric) {
            if let Some(value) = value {
                for plugin in self.plugins.values_mut() {
                    plugin.on_extra_metric(metric, timestamp, value);
                }
            }
            return None;
        }

        let watcher = self.watchers.get_mut(metric)?;
        if watcher.observe(timestamp, value) == Observation::Rejected {
            return None;
        }
        self.latest_timestamp = Some(match self.latest_timestamp {
            Some(latest) => latest.max(timestamp),
            None => timestamp,
        });

        // Plugins adjust the severity of each accepted value; the worst
        // adjusted result replaces the threshold verdict.
        if let Some(value) = value {
            if !self.plugins.is_empty() {
                let base = watcher.state();
                let adjusted = self
                    .plugins
                    .values_mut()
                    .map(|p| p.check(metric, timestamp, value, base))
                    .max()
                    .unwrap_or(base);
                watcher.set_state(adjusted);
            }
        }

        self.evaluate(self.observation_time(), overrides)
    }

    /// Expire every due watchdog. Returns a report decision if the
    /// stabilized state changed as a result.
    pub fn expire_watchdogs(
        &mut self,
        now: Instant,
        overrides: &OverrideSet,
    ) -> Option<Emission> {
        let mut fired = false;
        for watcher in self.watchers.values_mut() {
            if overrides.is_ignored(watcher.name()) {
                continue;
            }
            if watcher.deadline().is_some_and(|d| d <= now) {
                debug!(
                    check = %self.name,
                    metric = %watcher.name(),
                    timeout = %format_duration(self.timeout.unwrap_or_default()),
                    "metric timed out"
                );
                watcher.fire_deadline();
                fired = true;
            }
        }

        if fired {
            self.evaluate(self.observation_time(), overrides)
        } else {
            None
        }
    }

    /// Re-aggregate under a changed override set. Emits if the stabilized
    /// state moved, e.g. after the only abnormal metric was silenced.
    pub fn reassess(&mut self, overrides: &OverrideSet) -> Option<Emission> {
        self.evaluate(self.observation_time(), overrides)
    }

    /// Observation timestamp for evaluations not triggered by a metric
    /// event. Before any accepted event there is no metric time yet;
    /// MIN_UTC sorts before everything and is pruned by the first real
    /// observation.
    fn observation_time(&self) -> DateTime<Utc> {
        self.latest_timestamp.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Re-aggregate raw state, run postprocessing, and decide whether the
    /// stabilized state warrants a report.
    fn evaluate(&mut self, at: DateTime<Utc>, overrides: &OverrideSet) -> Option<Emission> {
        let raw = self.aggregate(overrides);
        self.raw_state = raw;

        let stabilized = self.postprocessor.process(raw, at);
        let old = self.stabilized_state;
        self.stabilized_state = stabilized;

        if self.last_reported != Some(stabilized) {
            debug!(
                check = %self.name,
                old = %old,
                new = %stabilized,
                "check changed state"
            );
            Some(self.emit(overrides))
        } else {
            None
        }
    }

    /// Worst severity over all non-overridden, non-inert watchers.
    ///
    /// A check whose metrics are all overridden (or all inert) aggregates
    /// to OK: the operator silenced it deliberately.
    fn aggregate(&self, overrides: &OverrideSet) -> Severity {
        self.watchers
            .values()
            .filter(|w| !overrides.is_ignored(w.name()))
            .filter_map(|w| w.contribution())
            .max()
            .unwrap_or(Severity::Ok)
    }

    /// Whether the periodic resend is due.
    pub fn resend_due(&self, now: Instant) -> bool {
        now >= self.next_resend
    }

    /// Emit the current stabilized state unconditionally (heartbeat path).
    pub fn heartbeat(&mut self, overrides: &OverrideSet) -> Emission {
        debug!(check = %self.name, state = %self.stabilized_state, "heartbeat");
        self.emit(overrides)
    }

    fn emit(&mut self, overrides: &OverrideSet) -> Emission {
        let severity = self.stabilized_state;
        self.last_reported = Some(severity);
        self.next_resend = Instant::now() + self.resend_interval;
        Emission {
            severity,
            message: self.format_message(severity, overrides),
        }
    }

    /// Earliest pending deadline: the resend timer or any non-suspended
    /// watchdog.
    pub fn next_deadline(&self, overrides: &OverrideSet) -> Instant {
        self.watchers
            .values()
            .filter(|w| !overrides.is_ignored(w.name()))
            .filter_map(|w| w.deadline())
            .fold(self.next_resend, Instant::min)
    }

    fn format_message(&self, severity: Severity, overrides: &OverrideSet) -> String {
        if severity == Severity::Ok {
            return "all metrics are OK".to_string();
        }

        let active: Vec<&MetricWatcher> = self
            .watchers
            .values()
            .filter(|w| !overrides.is_ignored(w.name()) && !w.is_inert())
            .collect();

        let mut header = Vec::new();
        let mut details = Vec::new();

        let timed_out: Vec<&&MetricWatcher> =
            active.iter().filter(|w| w.is_timed_out()).collect();
        if let (Some(timeout), false) = (self.timeout, timed_out.is_empty()) {
            header.push(format!(
                "{} metric(s) timed out after {}",
                timed_out.len(),
                format_duration(timeout)
            ));
            for watcher in &timed_out {
                let detail = match watcher.last_timestamp() {
                    Some(ts) => format!("last value at {}", ts.to_rfc3339()),
                    None => "no values received".to_string(),
                };
                details.push(format!("{}: {}", watcher.name(), detail));
            }
        }

        for state in [Severity::Unknown, Severity::Critical, Severity::Warning] {
            let in_state: Vec<&str> = active
                .iter()
                .filter(|w| w.state() == state && !w.is_timed_out())
                .map(|w| w.name())
                .collect();
            if in_state.is_empty() {
                continue;
            }

            let mut part = format!("{} metric(s) are {}", in_state.len(), state.name());
            if let Some(range) = active
                .first()
                .and_then(|w| w.thresholds())
                .and_then(|t| t.describe_range(state))
            {
                part.push_str(&format!(" ({range})"));
            }
            header.push(part);
            details.push(format!("{}:", state.name()));
            details.extend(in_state.iter().map(|m| m.to_string()));
        }

        if header.is_empty() {
            // Raw states recovered already but postprocessing still holds
            // the previous severity.
            return format!("overall state is {}", severity.name());
        }

        format!("{}\n{}", header.join(", "), details.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckDocument;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn build_check(json: serde_json::Value) -> Check {
        let doc: CheckDocument = serde_json::from_value(json).unwrap();
        let effective = doc.resolve("TEST", Duration::from_secs(180)).unwrap();
        Check::new("TEST", &effective).unwrap()
    }

    fn no_overrides() -> OverrideSet {
        OverrideSet::empty()
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_progression_reports_changes_only() {
        let mut check = build_check(serde_json::json!({
            "metrics": ["room.temp"],
            "warning_above": 40.0,
            "critical_above": 50.0
        }));
        let ov = no_overrides();

        let e = check.observe("room.temp", ts(0), Some(35.0), &ov).unwrap();
        assert_eq!(e.severity, Severity::Ok);
        assert_eq!(e.message, "all metrics are OK");

        // Unchanged severity: no report.
        assert!(check.observe("room.temp", ts(1), Some(36.0), &ov).is_none());

        let e = check.observe("room.temp", ts(2), Some(45.0), &ov).unwrap();
        assert_eq!(e.severity, Severity::Warning);
        assert!(e.message.contains("1 metric(s) are WARNING"));
        assert!(e.message.contains("above 40"));
        assert!(e.message.contains("room.temp"));

        let e = check.observe("room.temp", ts(3), Some(55.0), &ov).unwrap();
        assert_eq!(e.severity, Severity::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worst_of_aggregation() {
        let mut check = build_check(serde_json::json!({
            "metrics": ["a", "b"],
            "warning_above": 40.0,
            "critical_above": 50.0
        }));
        let ov = no_overrides();

        // One metric reporting, the other silent: UNKNOWN overall, and
        // the very first evaluation reports it.
        let e = check.observe("a", ts(0), Some(35.0), &ov).unwrap();
        assert_eq!(e.severity, Severity::Unknown);
        assert_eq!(check.stabilized_state(), Severity::Unknown);

        let e = check.observe("b", ts(1), Some(35.0), &ov).unwrap();
        assert_eq!(e.severity, Severity::Ok);

        let e = check.observe("a", ts(2), Some(60.0), &ov).unwrap();
        assert_eq!(e.severity, Severity::Critical);

        // WARNING on b does not lower the aggregate below CRITICAL.
        assert!(check.observe("b", ts(3), Some(45.0), &ov).is_none());
        assert_eq!(check.stabilized_state(), Severity::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_excludes_metric_from_aggregation() {
        let mut check = build_check(serde_json::json!({
            "metrics": ["santa.location.latitude", "room.temp"],
            "warning_above": 40.0
        }));
        let ov = no_overrides();
        check.observe("room.temp", ts(0), Some(30.0), &ov);

        // Latitude has no data: UNKNOWN while not overridden.
        assert_eq!(check.stabilized_state(), Severity::Unknown);

        let ov = OverrideSet::parse(&["santa.*".to_string()]).unwrap();
        let e = check.observe("room.temp", ts(1), Some(30.0), &ov).unwrap();
        assert_eq!(e.severity, Severity::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_metrics_overridden_is_ok() {
        let mut check = build_check(serde_json::json!({
            "metrics": ["a.x", "a.y"],
            "warning_above": 40.0
        }));
        let ov = OverrideSet::parse(&["a.*".to_string()]).unwrap();
        let e = check.observe("a.x", ts(0), Some(99.0), &ov).unwrap();
        assert_eq!(e.severity, Severity::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_expiry_emits_warning() {
        let mut check = build_check(serde_json::json!({
            "metrics": ["m"],
            "timeout": "1min"
        }));
        let ov = no_overrides();
        let e = check.observe("m", ts(0), Some(1.0), &ov).unwrap();
        assert_eq!(e.severity, Severity::Ok);

        tokio::time::advance(Duration::from_secs(61)).await;
        let e = check
            .expire_watchdogs(Instant::now(), &ov)
            .expect("watchdog must fire");
        assert_eq!(e.severity, Severity::Warning);
        assert!(e.message.contains("timed out after 1min"));
        assert!(e.message.contains("last value at"));

        // Already fired: nothing further to expire.
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(check.expire_watchdogs(Instant::now(), &ov).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_suspended_for_overridden_metric() {
        let mut check = build_check(serde_json::json!({
            "metrics": ["m"],
            "timeout": "1min"
        }));
        let ov = OverrideSet::parse(&["m".to_string()]).unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(check.expire_watchdogs(Instant::now(), &ov).is_none());
        // The suspended watchdog does not schedule a wakeup either.
        assert_eq!(check.next_deadline(&ov), check.next_resend);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_received_metric_times_out() {
        let mut check = build_check(serde_json::json!({
            "metrics": ["m"],
            "timeout": "1min"
        }));
        let ov = no_overrides();
        tokio::time::advance(Duration::from_secs(61)).await;
        let e = check.expire_watchdogs(Instant::now(), &ov).unwrap();
        assert_eq!(e.severity, Severity::Warning);
        assert!(e.message.contains("no values received"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_deadline_reset_by_report() {
        let mut check = build_check(serde_json::json!({
            "metrics": ["m"],
            "warning_above": 40.0,
            "resend_interval": "60s"
        }));
        let ov = no_overrides();
        assert!(!check.resend_due(Instant::now()));

        tokio::time::advance(Duration::from_secs(45)).await;
        // Change-triggered report pushes the resend deadline out.
        check.observe("m", ts(0), Some(1.0), &ov).unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!check.resend_due(Instant::now()));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(check.resend_due(Instant::now()));
        let e = check.heartbeat(&ov);
        assert_eq!(e.severity, Severity::Ok);
        assert!(!check.resend_due(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_fail_policy_masks_transients() {
        let mut check = build_check(serde_json::json!({
            "metrics": ["m"],
            "warning_above": 40.0,
            "transition_postprocessing": { "type": "soft_fail", "max_fail_count": 2 }
        }));
        let ov = no_overrides();
        check.observe("m", ts(0), Some(1.0), &ov).unwrap();

        assert!(check.observe("m", ts(1), Some(99.0), &ov).is_none());
        assert!(check.observe("m", ts(2), Some(99.0), &ov).is_none());
        let e = check.observe("m", ts(3), Some(99.0), &ov).unwrap();
        assert_eq!(e.severity, Severity::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_window_stays_in_metric_time() {
        let mut check = build_check(serde_json::json!({
            "metrics": ["m"],
            "warning_above": 40.0,
            "transition_postprocessing": { "type": "debounce", "window": "60s" }
        }));
        let ov = no_overrides();

        // Evaluations not triggered by data (override churn, watchdogs)
        // must not inject wall-clock stamps into the debounce window.
        check.reassess(&ov);

        for i in 0..7i64 {
            check.observe("m", ts(100 + i * 5), Some(99.0), &ov);
        }
        assert_eq!(check.stabilized_state(), Severity::Warning);
        check.reassess(&ov);

        // Much later in metric time the abnormal burst has left the
        // trailing window entirely, so a run of OKs recovers.
        for i in 0..5i64 {
            check.observe("m", ts(1000 + i * 10), Some(1.0), &ov);
        }
        assert_eq!(check.stabilized_state(), Severity::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plugin_adjusts_severity() {
        let mut check = build_check(serde_json::json!({
            "metrics": ["m"],
            "warning_above": 40.0,
            "plugins": {
                "powered_down": {
                    "type": "ignore_value_range",
                    "config": { "low": 90.0, "high": 100.0 }
                }
            }
        }));
        let ov = no_overrides();
        check.observe("m", ts(0), Some(1.0), &ov).unwrap();

        // 95 is above warning_above but inside the plugin's ignore band.
        assert!(check.observe("m", ts(1), Some(95.0), &ov).is_none());
        assert_eq!(check.stabilized_state(), Severity::Ok);

        let e = check.observe("m", ts(2), Some(80.0), &ov).unwrap();
        assert_eq!(e.severity, Severity::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_plugin_config_fails_check_construction() {
        let doc: CheckDocument = serde_json::from_value(serde_json::json!({
            "metrics": ["m"],
            "plugins": { "nope": { "type": "does_not_exist" } }
        }))
        .unwrap();
        let effective = doc.resolve("BROKEN", Duration::from_secs(180)).unwrap();
        assert!(matches!(
            Check::new("BROKEN", &effective),
            Err(ConfigError::Plugin { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fingerprint_tracks_effective_config() {
        let doc: CheckDocument = serde_json::from_value(serde_json::json!({
            "metrics": ["m"],
            "warning_above": 40.0
        }))
        .unwrap();
        let a = Check::new(
            "C",
            &doc.resolve("C", Duration::from_secs(180)).unwrap(),
        )
        .unwrap();
        let b = Check::new(
            "C",
            &doc.resolve("C", Duration::from_secs(180)).unwrap(),
        )
        .unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
