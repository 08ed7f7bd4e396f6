//! Finished check reports and the delivery boundary.
//!
//! The engine only decides *what* to report and *when*; delivery to the
//! monitoring host is behind the [`ReportSink`] trait and is
//! fire-and-forget: a failed submission is the sink's problem and never
//! rolls back engine state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::severity::Severity;

/// One passive-check result, immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    /// Host name under which the result is filed on the monitoring host.
    pub host: String,
    /// The check (service) name.
    pub service: String,
    pub severity: Severity,
    pub message: String,
    /// When the engine emitted this report.
    pub emitted_at: DateTime<Utc>,
}

impl Report {
    pub fn new(host: &str, service: &str, severity: Severity, message: String) -> Self {
        Self {
            host: host.to_string(),
            service: service.to_string(),
            severity,
            message,
            emitted_at: Utc::now(),
        }
    }
}

/// Accepts finished reports for delivery.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Submit a report. Must not block the engine beyond the hand-off;
    /// delivery failures are logged by the sink, not surfaced.
    async fn submit(&self, report: Report);
}

/// Forwards reports over an mpsc channel, for embedding and tests.
#[derive(Debug)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<Report>,
}

impl ChannelSink {
    /// Create a sink and the receiving end for its reports.
    pub fn create() -> (Self, mpsc::UnboundedReceiver<Report>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl ReportSink for ChannelSink {
    async fn submit(&self, report: Report) {
        if self.sender.send(report).is_err() {
            warn!("report receiver dropped; discarding report");
        }
    }
}

/// Wire form written by [`JsonLineSink`]: the report plus the numeric
/// status code passive-check hosts expect (0=OK, 1=WARNING, 2=CRITICAL,
/// 3=UNKNOWN).
#[derive(Serialize)]
struct WireReport<'a> {
    host: &'a str,
    service: &'a str,
    severity: Severity,
    code: u8,
    message: &'a str,
    emitted_at: DateTime<Utc>,
}

/// Writes reports as newline-delimited JSON to any async writer.
///
/// This is the binary's default sink; an external forwarder (e.g. a
/// send_nsca wrapper) consumes the stream.
#[derive(Debug)]
pub struct JsonLineSink<W> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLineSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ReportSink for JsonLineSink<W> {
    async fn submit(&self, report: Report) {
        let wire = WireReport {
            host: &report.host,
            service: &report.service,
            severity: report.severity,
            code: report.severity.code(),
            message: &report.message,
            emitted_at: report.emitted_at,
        };
        let mut line = match serde_json::to_vec(&wire) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize report");
                return;
            }
        };
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(&line).await {
            warn!(error = %e, service = %report.service, "failed to write report");
        } else if let Err(e) = writer.flush().await {
            warn!(error = %e, "failed to flush report stream");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::create();
        let report = Report::new("host", "CHECK", Severity::Warning, "msg".into());
        sink.submit(report.clone()).await;
        assert_eq!(rx.recv().await.unwrap(), report);
    }

    #[tokio::test]
    async fn test_json_line_sink_writes_ndjson() {
        let mut buf = Vec::new();
        {
            let sink = JsonLineSink::new(&mut buf);
            sink.submit(Report::new("h", "A", Severity::Critical, "bad".into()))
                .await;
            sink.submit(Report::new("h", "B", Severity::Ok, "fine".into()))
                .await;
        }
        let lines: Vec<&str> = std::str::from_utf8(&buf)
            .unwrap()
            .lines()
            .collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["service"], "A");
        assert_eq!(first["severity"], "critical");
        assert_eq!(first["code"], 2);

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["code"], 0);
    }
}
