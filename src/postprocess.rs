//! Stabilization of raw check severities.
//!
//! The raw severity stream of a check can flap: a sensor wobbling around a
//! threshold, a brief spike, a single corrupt sample. Each check may
//! configure one policy that filters its raw stream into a stabilized one
//! before anything is reported.

use std::collections::VecDeque;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::debug;

use crate::config::PostprocessingPolicy;
use crate::severity::Severity;

/// Stateful filter applied to one check's raw severity stream.
#[derive(Debug)]
pub enum Postprocessor {
    /// Raw severities pass through unchanged.
    None,
    Debounce(Debouncer),
    IgnoreShortTransitions(ShortTransitionFilter),
    SoftFail(SoftFailFilter),
}

impl Postprocessor {
    pub fn from_policy(policy: &PostprocessingPolicy) -> Self {
        match policy {
            PostprocessingPolicy::None => Postprocessor::None,
            PostprocessingPolicy::Debounce { window } => {
                Postprocessor::Debounce(Debouncer::new(clamp_chrono(*window)))
            }
            PostprocessingPolicy::IgnoreShortTransitions { minimum_duration } => {
                Postprocessor::IgnoreShortTransitions(ShortTransitionFilter::new(clamp_chrono(
                    *minimum_duration,
                )))
            }
            PostprocessingPolicy::SoftFail { max_fail_count } => {
                Postprocessor::SoftFail(SoftFailFilter::new(*max_fail_count))
            }
        }
    }

    /// Feed one raw observation, returning the stabilized severity.
    pub fn process(&mut self, raw: Severity, at: DateTime<Utc>) -> Severity {
        let stabilized = match self {
            Postprocessor::None => raw,
            Postprocessor::Debounce(d) => d.process(raw, at),
            Postprocessor::IgnoreShortTransitions(f) => f.process(raw, at),
            Postprocessor::SoftFail(f) => f.process(raw),
        };
        if stabilized != raw {
            debug!(%raw, %stabilized, "postprocessor adjusted severity");
        }
        stabilized
    }
}

fn clamp_chrono(d: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::MAX)
}

/// Majority vote over a trailing time window.
///
/// The stabilized severity is abnormal only while a strict majority of the
/// observations in the window are abnormal; it is then the worst abnormal
/// severity present. Otherwise it reverts to OK. Adds up to `window` of
/// latency to alerting and to recovery alike.
#[derive(Debug)]
pub struct Debouncer {
    window: ChronoDuration,
    observations: VecDeque<(DateTime<Utc>, Severity)>,
}

impl Debouncer {
    fn new(window: ChronoDuration) -> Self {
        Self {
            window,
            observations: VecDeque::new(),
        }
    }

    fn process(&mut self, raw: Severity, at: DateTime<Utc>) -> Severity {
        self.observations.push_back((at, raw));

        // Observations arrive roughly ordered but timeout firings use wall
        // clock; prune against the newest time seen, never backwards.
        let newest = self
            .observations
            .iter()
            .map(|(t, _)| *t)
            .max()
            .expect("just pushed");
        // checked_sub: the window may exceed the representable range
        // below `newest` (e.g. the pre-data MIN_UTC stamp), in which
        // case nothing can be older than the cutoff anyway.
        if let Some(cutoff) = newest.checked_sub_signed(self.window) {
            while self
                .observations
                .front()
                .is_some_and(|(t, _)| *t < cutoff)
            {
                self.observations.pop_front();
            }
        }

        let abnormal: Vec<Severity> = self
            .observations
            .iter()
            .filter(|(_, s)| s.is_abnormal())
            .map(|(_, s)| *s)
            .collect();

        if abnormal.len() * 2 > self.observations.len() {
            abnormal.into_iter().max().expect("non-empty")
        } else {
            Severity::Ok
        }
    }
}

/// Suppresses excursions shorter than a minimum duration.
///
/// A transition away from the previously stabilized severity is only
/// accepted once the new raw severity has persisted (in observation time)
/// for at least the minimum duration.
#[derive(Debug)]
pub struct ShortTransitionFilter {
    minimum_duration: ChronoDuration,
    stabilized: Severity,
    current_raw: Severity,
    raw_since: Option<DateTime<Utc>>,
}

impl ShortTransitionFilter {
    fn new(minimum_duration: ChronoDuration) -> Self {
        Self {
            minimum_duration,
            stabilized: Severity::Unknown,
            current_raw: Severity::Unknown,
            raw_since: None,
        }
    }

    fn process(&mut self, raw: Severity, at: DateTime<Utc>) -> Severity {
        let since = match self.raw_since {
            Some(since) if raw == self.current_raw => since,
            _ => {
                self.current_raw = raw;
                self.raw_since = Some(at);
                at
            }
        };

        if raw != self.stabilized && at - since >= self.minimum_duration {
            self.stabilized = raw;
        }
        self.stabilized
    }
}

/// Tolerates a bounded number of consecutive non-OK observations.
///
/// The first `max_fail_count` consecutive non-OK raw observations are
/// masked by the preceding stabilized severity; the next one propagates,
/// and propagation holds until an OK observation resets the counter.
#[derive(Debug)]
pub struct SoftFailFilter {
    max_fail_count: u32,
    consecutive_bad: u32,
    stabilized: Severity,
}

impl SoftFailFilter {
    fn new(max_fail_count: u32) -> Self {
        Self {
            max_fail_count,
            consecutive_bad: 0,
            stabilized: Severity::Unknown,
        }
    }

    fn process(&mut self, raw: Severity) -> Severity {
        if raw == Severity::Ok {
            self.consecutive_bad = 0;
            self.stabilized = Severity::Ok;
        } else if self.consecutive_bad >= self.max_fail_count {
            self.stabilized = raw;
        } else {
            self.consecutive_bad += 1;
            debug!(
                %raw,
                masked_by = %self.stabilized,
                consecutive_bad = self.consecutive_bad,
                "soft-fail masking bad observation"
            );
        }
        self.stabilized
    }
}
