//! # checkwatch
//!
//! A bridge from a streaming metric bus to a passive-check monitoring
//! host. Metric values are evaluated against per-check thresholds and
//! arrival timeouts, aggregated worst-of per check, stabilized by
//! transition postprocessing, and submitted as passive service reports.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   events    ┌───────────────────────────────┐
//! │  source   │───────────▶│            engine             │
//! │ (NDJSON)  │            │  ┌───────┐  ┌───────────────┐ │
//! └──────────┘            │  │ check │─▶│  postprocess  │ │
//! ┌──────────┐  reloads   │  │watcher│  └───────┬───────┘ │
//! │  config   │───────────▶│  └───────┘          │        │
//! └──────────┘            └──────────────────────┼────────┘
//!                                                 ▼
//!                                          ┌──────────┐
//!                                          │   sink    │
//!                                          │ (reports) │
//!                                          └──────────┘
//! ```
//!
//! - **[`config`]**: configuration document, validation, and the effective
//!   per-check configuration used for reload comparison
//! - **[`engine`]**: the single event loop owning all check state
//! - **[`check`]**: worst-of aggregation, report messages, resend state
//! - **[`watcher`]**: per-metric thresholds and timeout watchdogs
//! - **[`postprocess`]**: debounce, short-transition filtering, soft-fail
//! - **[`overrides`]**: pattern-based metric silencing
//! - **[`plugin`]**: per-check severity adjustment hooks
//! - **[`report`]**: report types and sinks
//! - **[`source`]**: newline-delimited JSON event ingestion

pub mod check;
pub mod config;
pub mod duration;
pub mod engine;
pub mod overrides;
pub mod plugin;
pub mod postprocess;
pub mod report;
pub mod severity;
pub mod source;
pub mod watcher;

pub use check::Check;
pub use config::Document;
pub use engine::{Engine, EngineEvent, EngineHandle};
pub use overrides::OverrideSet;
pub use report::{JsonLineSink, Report, ReportSink};
pub use severity::Severity;
pub use source::StreamSource;
