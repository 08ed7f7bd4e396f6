//! Metric event ingestion from an async byte stream.
//!
//! Reads newline-delimited JSON events (`{"metric": ..., "timestamp":
//! RFC 3339, "value": number|null}`) from any async reader, stdin and TCP
//! connections alike, and forwards them into the engine's event channel.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{EngineEvent, EngineHandle};

/// One metric observation as it appears on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricEvent {
    pub metric: String,
    pub timestamp: DateTime<Utc>,
    /// `null` is a timeout-only tick: a sign of life without a value.
    pub value: Option<f64>,
}

/// Reads events from an async byte stream and feeds a running engine.
///
/// Malformed lines are logged and skipped; the stream keeps going. The
/// background task ends at EOF, on a read error, or when the engine is
/// gone.
#[derive(Debug)]
pub struct StreamSource {
    task: JoinHandle<()>,
}

impl StreamSource {
    pub fn spawn<R>(reader: R, engine: EngineHandle, description: &str) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let description = description.to_string();
        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        info!(source = %description, "input stream closed");
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<MetricEvent>(trimmed) {
                            Ok(event) => {
                                debug!(
                                    metric = %event.metric,
                                    value = ?event.value,
                                    "received event"
                                );
                                let sent = engine.send(EngineEvent::Data {
                                    metric: event.metric,
                                    timestamp: event.timestamp,
                                    value: event.value,
                                });
                                if sent.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(source = %description, %err, "discarding malformed line");
                            }
                        }
                    }
                    Err(err) => {
                        warn!(source = %description, %err, "read error, stopping source");
                        break;
                    }
                }
            }
        });

        Self { task }
    }

    /// Whether the reader task has ended (EOF, error, or engine gone).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the stream to end.
    pub async fn closed(self) {
        let _ = self.task.await;
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::sync::mpsc;

    fn channel() -> (EngineHandle, mpsc::UnboundedReceiver<EngineEvent>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn test_forwards_events_in_order() {
        let data = concat!(
            r#"{"metric": "room.temp", "timestamp": "2024-01-01T00:00:00Z", "value": 35.0}"#,
            "\n",
            r#"{"metric": "room.temp", "timestamp": "2024-01-01T00:00:10Z", "value": null}"#,
            "\n",
        );
        let (handle, mut events) = channel();
        let source = StreamSource::spawn(Cursor::new(data.to_string()), handle, "test");
        source.closed().await;

        let EngineEvent::Data { metric, value, .. } = events.recv().await.unwrap() else {
            panic!("expected data event");
        };
        assert_eq!(metric, "room.temp");
        assert_eq!(value, Some(35.0));

        let EngineEvent::Data { value, .. } = events.recv().await.unwrap() else {
            panic!("expected data event");
        };
        assert_eq!(value, None);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let data = concat!(
            "not json\n",
            r#"{"metric": "m", "timestamp": "not a timestamp", "value": 1.0}"#,
            "\n",
            "\n",
            r#"{"metric": "m", "timestamp": "2024-01-01T00:00:00Z", "value": 1.0}"#,
            "\n",
        );
        let (handle, mut events) = channel();
        StreamSource::spawn(Cursor::new(data.to_string()), handle, "test")
            .closed()
            .await;

        // Only the final, valid line makes it through.
        assert!(matches!(
            events.recv().await,
            Some(EngineEvent::Data { .. })
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_stream_ends_cleanly() {
        let (handle, mut events) = channel();
        StreamSource::spawn(Cursor::new(String::new()), handle, "test")
            .closed()
            .await;
        assert!(events.try_recv().is_err());
    }
}
