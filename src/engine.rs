//! The engine loop: routes metric events to checks, drives watchdog and
//! resend deadlines, and applies live reconfiguration.
//!
//! All check state lives on one task. The loop selects between the event
//! channel and a sleep until the earliest pending deadline; checks own
//! their deadlines as plain instants, so there are no timer tasks to
//! cancel and removing a check from the registry silences it completely.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use crate::check::{Check, Emission};
use crate::config::Document;
use crate::overrides::OverrideSet;
use crate::report::{Report, ReportSink};

/// Everything the engine reacts to.
#[derive(Debug)]
pub enum EngineEvent {
    /// One metric observation; `value: None` is a timeout-only tick.
    Data {
        metric: String,
        timestamp: DateTime<Utc>,
        value: Option<f64>,
    },
    /// Replace the configuration (checks and overrides alike).
    Reconfigure(Document),
    /// Replace only the override set; running checks are untouched.
    UpdateOverrides(OverrideSet),
    /// Drain and stop.
    Shutdown,
}

/// Cloneable handle for feeding events into a running engine.
pub type EngineHandle = mpsc::UnboundedSender<EngineEvent>;

pub struct Engine {
    host: String,
    checks: BTreeMap<String, Check>,
    overrides: OverrideSet,
    /// metric name -> names of checks subscribed to it.
    routes: HashMap<String, Vec<String>>,
    sink: Arc<dyn ReportSink>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
}

impl Engine {
    /// Build an engine from the initial configuration. Unlike a reload,
    /// startup fails hard on any invalid check.
    pub fn new(
        host: String,
        document: &Document,
        sink: Arc<dyn ReportSink>,
    ) -> anyhow::Result<(Self, EngineHandle)> {
        let overrides = OverrideSet::parse(&document.overrides.ignored_metrics)?;

        let global_resend = document.global_resend_interval();
        let mut checks = BTreeMap::new();
        for (name, doc) in &document.checks {
            let effective = doc.resolve(name, global_resend)?;
            checks.insert(name.clone(), Check::new(name, &effective)?);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut engine = Self {
            host,
            checks,
            overrides,
            routes: HashMap::new(),
            sink,
            events: rx,
        };
        engine.rebuild_routes();
        info!(
            host = %engine.host,
            checks = engine.checks.len(),
            "engine configured"
        );
        Ok((engine, tx))
    }

    fn rebuild_routes(&mut self) {
        self.routes.clear();
        for (name, check) in &self.checks {
            for metric in check.subscribed_metrics() {
                self.routes
                    .entry(metric.to_string())
                    .or_default()
                    .push(name.clone());
            }
        }
    }

    /// Run until the channel closes or a `Shutdown` event arrives.
    pub async fn run(mut self) {
        loop {
            let deadline = self.earliest_deadline();
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(EngineEvent::Data { metric, timestamp, value }) => {
                        self.dispatch(&metric, timestamp, value).await;
                    }
                    Some(EngineEvent::Reconfigure(document)) => {
                        self.apply_reload(&document).await;
                    }
                    Some(EngineEvent::UpdateOverrides(overrides)) => {
                        self.apply_overrides(overrides).await;
                    }
                    Some(EngineEvent::Shutdown) | None => {
                        info!("engine shutting down");
                        break;
                    }
                },
                _ = sleep_until_opt(deadline) => {
                    self.on_deadline().await;
                }
            }
        }
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.checks
            .values()
            .map(|c| c.next_deadline(&self.overrides))
            .min()
    }

    async fn dispatch(&mut self, metric: &str, timestamp: DateTime<Utc>, value: Option<f64>) {
        let Some(names) = self.routes.get(metric) else {
            trace!(%metric, "event for unrouted metric");
            return;
        };

        let mut emissions = Vec::new();
        for name in names {
            if let Some(check) = self.checks.get_mut(name) {
                if let Some(emission) =
                    check.observe(metric, timestamp, value, &self.overrides)
                {
                    emissions.push((name.clone(), emission));
                }
            }
        }
        for (name, emission) in emissions {
            self.submit(&name, emission).await;
        }
    }

    /// Fire due watchdogs and due resends across all checks.
    async fn on_deadline(&mut self) {
        let now = Instant::now();
        let mut emissions = Vec::new();
        for (name, check) in &mut self.checks {
            if let Some(emission) = check.expire_watchdogs(now, &self.overrides) {
                emissions.push((name.clone(), emission));
            } else if check.resend_due(now) {
                emissions.push((name.clone(), check.heartbeat(&self.overrides)));
            }
        }
        for (name, emission) in emissions {
            self.submit(&name, emission).await;
        }
    }

    async fn submit(&self, check: &str, emission: Emission) {
        let report = Report::new(&self.host, check, emission.severity, emission.message);
        debug!(%check, severity = %report.severity, "submitting report");
        self.sink.submit(report).await;
    }

    /// Apply a reloaded configuration.
    ///
    /// Checks whose effective configuration is byte-identical keep their
    /// instance and all history; changed or new checks are rebuilt from
    /// scratch (starting UNKNOWN); absent checks are dropped. An invalid
    /// check is rejected alone: its previous instance, if any, keeps
    /// running.
    async fn apply_reload(&mut self, document: &Document) {
        match OverrideSet::parse(&document.overrides.ignored_metrics) {
            Ok(overrides) => self.apply_overrides(overrides).await,
            Err(err) => {
                error!(%err, "invalid override patterns in reload, keeping previous set")
            }
        }

        let global_resend = document.global_resend_interval();
        let mut next = BTreeMap::new();
        for (name, doc) in &document.checks {
            let effective = match doc.resolve(name, global_resend) {
                Ok(effective) => effective,
                Err(err) => {
                    error!(check = %name, %err, "rejecting invalid check");
                    if let Some(previous) = self.checks.remove(name) {
                        next.insert(name.clone(), previous);
                    }
                    continue;
                }
            };

            match self.checks.remove(name) {
                Some(previous) if previous.fingerprint() == effective.fingerprint() => {
                    trace!(check = %name, "configuration unchanged, keeping state");
                    next.insert(name.clone(), previous);
                }
                previous => {
                    if previous.is_some() {
                        info!(check = %name, "configuration changed, rebuilding");
                    } else {
                        info!(check = %name, "new check");
                    }
                    match Check::new(name, &effective) {
                        Ok(check) => {
                            next.insert(name.clone(), check);
                        }
                        Err(err) => {
                            error!(check = %name, %err, "rejecting invalid check");
                            if let Some(previous) = previous {
                                next.insert(name.clone(), previous);
                            }
                        }
                    }
                }
            }
        }

        for name in self.checks.keys() {
            info!(check = %name, "check removed");
        }
        self.checks = next;
        self.rebuild_routes();
    }

    /// Swap the override set and reassess every check against it.
    async fn apply_overrides(&mut self, overrides: OverrideSet) {
        if self.overrides == overrides {
            return;
        }
        info!(patterns = overrides.len(), "override set updated");
        self.overrides = overrides;

        let mut emissions = Vec::new();
        for (name, check) in &mut self.checks {
            if let Some(emission) = check.reassess(&self.overrides) {
                emissions.push((name.clone(), emission));
            }
        }
        for (name, emission) in emissions {
            self.submit(&name, emission).await;
        }
    }
}

/// Sleep until the deadline, or forever when no deadline is pending.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
