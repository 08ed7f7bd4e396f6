//! Configuration document types, validation and effective-config resolution.
//!
//! The configuration is a JSON (or TOML) document describing the reporting
//! host, a global resend interval, the override section and the set of
//! checks. Deserialization produces the raw [`Document`]; each check is then
//! resolved into an [`EffectiveCheckConfig`], which has all inherited values
//! filled in and the legacy debounce field folded into the postprocessing
//! policy. The effective config is what checks are built from and what
//! reconfiguration compares (see [`EffectiveCheckConfig::fingerprint`]).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::duration;
use crate::overrides::PatternParseError;

/// Resend interval used by checks that configure none, when the document
/// also has no global one.
pub const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_secs(180);

/// Errors rejecting a configuration document or a single check in it.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("check {check:?}: \"metrics\" must be a non-empty list of metric names")]
    EmptyMetrics { check: String },

    #[error(
        "check {check:?}: thresholds must satisfy \
         critical_below <= warning_below < warning_above <= critical_above \
         (got critical=({critical_below}, {critical_above}), \
         warning=({warning_below}, {warning_above}))"
    )]
    ThresholdOrdering {
        check: String,
        warning_below: f64,
        warning_above: f64,
        critical_below: f64,
        critical_above: f64,
    },

    #[error("check {check:?}: unknown postprocessing policy {kind:?}")]
    UnknownPostprocessing { check: String, kind: String },

    #[error("check {check:?}: policy {kind:?} requires field {field:?}")]
    MissingPostprocessingField {
        check: String,
        kind: String,
        field: &'static str,
    },

    #[error("check {check:?}: debounce window must be a positive duration")]
    EmptyDebounceWindow { check: String },

    #[error("check {check:?}: plugin {plugin:?}: {source}")]
    Plugin {
        check: String,
        plugin: String,
        source: crate::plugin::PluginError,
    },

    #[error("invalid override list: {0}")]
    Overrides(#[from] PatternParseError),
}

/// The raw configuration document, as deserialized from the config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Document {
    /// Host name under which reports are filed on the monitoring host.
    /// Resolved once at startup if absent.
    pub reporting_host: Option<String>,

    /// Global default resend interval, inherited by checks without one.
    #[serde(default, with = "duration::optional")]
    pub resend_interval: Option<Duration>,

    #[serde(default)]
    pub overrides: OverridesSection,

    #[serde(default)]
    pub checks: BTreeMap<String, CheckDocument>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverridesSection {
    /// Patterns (exact names or `prefix.*`) of metrics to exclude globally.
    #[serde(default)]
    pub ignored_metrics: Vec<String>,
}

/// One check as written in the configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckDocument {
    pub metrics: Vec<String>,

    pub warning_below: Option<f64>,
    pub warning_above: Option<f64>,
    pub critical_below: Option<f64>,
    pub critical_above: Option<f64>,

    /// Values to treat as "no abnormal severity" (NaN is always ignored).
    pub ignore: Option<Vec<f64>>,

    /// Arrival timeout per metric; expiry contributes WARNING.
    #[serde(default, with = "duration::optional")]
    pub timeout: Option<Duration>,

    #[serde(default, with = "duration::optional")]
    pub resend_interval: Option<Duration>,

    /// Legacy sugar for `transition_postprocessing: { type: "debounce" }`.
    /// Ignored when an explicit policy object is present.
    #[serde(default, with = "duration::optional")]
    pub transition_debounce_window: Option<Duration>,

    pub transition_postprocessing: Option<PostprocessingDocument>,

    #[serde(default)]
    pub plugins: BTreeMap<String, PluginDocument>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostprocessingDocument {
    #[serde(rename = "type")]
    pub kind: String,

    /// Debounce only; falls back to `transition_debounce_window`, then 30s.
    #[serde(default, with = "duration::optional")]
    pub window: Option<Duration>,

    /// `ignore_short_transitions` only.
    #[serde(default, with = "duration::optional")]
    pub minimum_duration: Option<Duration>,

    /// `soft_fail` only.
    pub max_fail_count: Option<u32>,
}

/// One plugin entry under a check's `plugins` table. The `type` key selects
/// a statically registered plugin (see [`crate::plugin`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PluginDocument {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub config: serde_json::Value,
}

/// Resolved transition postprocessing policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PostprocessingPolicy {
    None,
    Debounce {
        #[serde(with = "duration::exact")]
        window: Duration,
    },
    IgnoreShortTransitions {
        #[serde(with = "duration::exact")]
        minimum_duration: Duration,
    },
    SoftFail { max_fail_count: u32 },
}

/// Default debounce window when the policy is selected without one.
const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_secs(30);

/// A check's configuration with every inherited or defaulted value
/// resolved. Two checks behave identically if and only if their effective
/// configurations serialize identically.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveCheckConfig {
    pub metrics: BTreeSet<String>,
    pub warning_below: Option<f64>,
    pub warning_above: Option<f64>,
    pub critical_below: Option<f64>,
    pub critical_above: Option<f64>,
    pub ignore: Vec<f64>,
    #[serde(with = "duration::optional")]
    pub timeout: Option<Duration>,
    #[serde(with = "duration::exact")]
    pub resend_interval: Duration,
    pub postprocessing: PostprocessingPolicy,
    pub plugins: BTreeMap<String, PluginDocument>,
}

impl EffectiveCheckConfig {
    /// Canonical serialized form, used to decide whether a running check
    /// can be kept across reconfiguration. All maps are ordered, so the
    /// output is deterministic.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).expect("effective config serializes")
    }

    pub fn has_thresholds(&self) -> bool {
        self.warning_below.is_some()
            || self.warning_above.is_some()
            || self.critical_below.is_some()
            || self.critical_above.is_some()
    }
}

impl CheckDocument {
    /// Resolve this check against the document-level defaults, validating
    /// everything that can be validated without constructing the check.
    pub fn resolve(
        &self,
        name: &str,
        global_resend_interval: Duration,
    ) -> Result<EffectiveCheckConfig, ConfigError> {
        if self.metrics.is_empty() {
            return Err(ConfigError::EmptyMetrics {
                check: name.to_string(),
            });
        }

        validate_threshold_ordering(
            name,
            self.warning_below,
            self.warning_above,
            self.critical_below,
            self.critical_above,
        )?;

        let postprocessing = self.resolve_postprocessing(name)?;

        Ok(EffectiveCheckConfig {
            metrics: self.metrics.iter().cloned().collect(),
            warning_below: self.warning_below,
            warning_above: self.warning_above,
            critical_below: self.critical_below,
            critical_above: self.critical_above,
            ignore: self.ignore.clone().unwrap_or_default(),
            timeout: self.timeout,
            resend_interval: self.resend_interval.unwrap_or(global_resend_interval),
            postprocessing,
            plugins: self.plugins.clone(),
        })
    }

    fn resolve_postprocessing(&self, name: &str) -> Result<PostprocessingPolicy, ConfigError> {
        let Some(doc) = &self.transition_postprocessing else {
            // Legacy field alone selects debouncing.
            return Ok(match self.transition_debounce_window {
                Some(window) if window.is_zero() => {
                    return Err(ConfigError::EmptyDebounceWindow {
                        check: name.to_string(),
                    })
                }
                Some(window) => PostprocessingPolicy::Debounce { window },
                None => PostprocessingPolicy::None,
            });
        };

        if self.transition_debounce_window.is_some() {
            warn!(
                check = name,
                "both transition_postprocessing and transition_debounce_window \
                 are set; the explicit policy wins"
            );
        }

        match doc.kind.as_str() {
            "debounce" => {
                let window = doc
                    .window
                    .or(self.transition_debounce_window)
                    .unwrap_or(DEFAULT_DEBOUNCE_WINDOW);
                if window.is_zero() {
                    return Err(ConfigError::EmptyDebounceWindow {
                        check: name.to_string(),
                    });
                }
                Ok(PostprocessingPolicy::Debounce { window })
            }
            "ignore_short_transitions" => {
                let minimum_duration = doc.minimum_duration.ok_or_else(|| {
                    ConfigError::MissingPostprocessingField {
                        check: name.to_string(),
                        kind: doc.kind.clone(),
                        field: "minimum_duration",
                    }
                })?;
                Ok(PostprocessingPolicy::IgnoreShortTransitions { minimum_duration })
            }
            "soft_fail" => {
                let max_fail_count = doc.max_fail_count.ok_or_else(|| {
                    ConfigError::MissingPostprocessingField {
                        check: name.to_string(),
                        kind: doc.kind.clone(),
                        field: "max_fail_count",
                    }
                })?;
                Ok(PostprocessingPolicy::SoftFail { max_fail_count })
            }
            other => Err(ConfigError::UnknownPostprocessing {
                check: name.to_string(),
                kind: other.to_string(),
            }),
        }
    }
}

fn validate_threshold_ordering(
    name: &str,
    warning_below: Option<f64>,
    warning_above: Option<f64>,
    critical_below: Option<f64>,
    critical_above: Option<f64>,
) -> Result<(), ConfigError> {
    // Absent bounds default outward so they never constrain.
    let wb = warning_below.unwrap_or(f64::NEG_INFINITY);
    let wa = warning_above.unwrap_or(f64::INFINITY);
    let cb = critical_below.unwrap_or(f64::NEG_INFINITY);
    let ca = critical_above.unwrap_or(f64::INFINITY);

    if cb <= wb && wb < wa && wa <= ca {
        Ok(())
    } else {
        Err(ConfigError::ThresholdOrdering {
            check: name.to_string(),
            warning_below: wb,
            warning_above: wa,
            critical_below: cb,
            critical_above: ca,
        })
    }
}

impl Document {
    /// Load a configuration document from a JSON or TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;
        let document: Document = settings.try_deserialize()?;
        Ok(document)
    }

    /// The document-level resend interval, with the built-in fallback.
    pub fn global_resend_interval(&self) -> Duration {
        self.resend_interval.unwrap_or(DEFAULT_RESEND_INTERVAL)
    }
}
