//! Check-result post-processing plugins.
//!
//! Plugins let a check adjust the severity of individual values beyond
//! plain thresholds. They are selected by a `type` key in a check's
//! `plugins` table and constructed through a static in-process registry
//! (no dynamic code loading). If several plugins adjust the same value,
//! the worst resulting severity wins.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::trace;

use crate::severity::Severity;

/// Errors constructing a plugin for a check.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("unknown plugin type {0:?}")]
    UnknownType(String),

    #[error("invalid plugin config: {0}")]
    InvalidConfig(#[from] serde_json::Error),

    #[error("invalid plugin config: {0}")]
    Rejected(String),
}

/// A post-processing capability attached to one check.
///
/// `check` is called for every accepted value of every monitored metric,
/// after threshold evaluation, and may return an adjusted severity. A
/// plugin may additionally declare extra metrics it wants to see; their
/// values are delivered via `on_extra_metric` but never evaluated or
/// watchdog-tracked themselves.
pub trait CheckPlugin: Send + Sync + std::fmt::Debug {
    fn check(
        &mut self,
        metric: &str,
        timestamp: DateTime<Utc>,
        value: f64,
        current: Severity,
    ) -> Severity;

    fn extra_metrics(&self) -> Vec<String> {
        Vec::new()
    }

    fn on_extra_metric(&mut self, _metric: &str, _timestamp: DateTime<Utc>, _value: f64) {}
}

/// Construct a plugin by registry type name.
///
/// `metrics` is the owning check's metric set, available so plugins can
/// scope themselves; the built-ins do not need it.
pub fn build(
    kind: &str,
    config: &serde_json::Value,
    _metrics: &BTreeSet<String>,
) -> Result<Box<dyn CheckPlugin>, PluginError> {
    match kind {
        "ignore_value_range" => Ok(Box::new(IgnoreValueRange::from_config(config)?)),
        other => Err(PluginError::UnknownType(other.to_string())),
    }
}

/// Forces OK for values inside `[low, high]`, leaving others untouched.
///
/// Useful for sensors with a known-benign band that would otherwise trip a
/// threshold, e.g. a current reading that legitimately drops to zero when
/// a device is powered down.
#[derive(Debug)]
struct IgnoreValueRange {
    low: f64,
    high: f64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IgnoreValueRangeConfig {
    low: Option<f64>,
    high: Option<f64>,
}

impl IgnoreValueRange {
    fn from_config(config: &serde_json::Value) -> Result<Self, PluginError> {
        let config: IgnoreValueRangeConfig = serde_json::from_value(config.clone())?;
        let low = config.low.unwrap_or(f64::NEG_INFINITY);
        let high = config.high.unwrap_or(f64::INFINITY);
        if low > high {
            return Err(PluginError::Rejected(format!(
                "ignore range boundaries must not cross (low={low}, high={high})"
            )));
        }
        Ok(Self { low, high })
    }
}

impl CheckPlugin for IgnoreValueRange {
    fn check(
        &mut self,
        metric: &str,
        timestamp: DateTime<Utc>,
        value: f64,
        current: Severity,
    ) -> Severity {
        if self.low <= value && value <= self.high {
            trace!(
                metric,
                %timestamp,
                value,
                "ignoring value in [{}, {}]",
                self.low,
                self.high
            );
            Severity::Ok
        } else {
            current
        }
    }
}
