//! User-facing event stream.
//!
//! Every pipeline stage reports what it is about to do and how it went through
//! an [`EventSink`]. The host decides how to render events; the core only
//! produces the message text.

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub timestamp: DateTime<Local>,
    pub severity: Severity,
    pub message: String,
}

#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, severity: Severity, message: impl Into<String>) {
        let event = Event {
            timestamp: Local::now(),
            severity,
            message: message.into(),
        };
        debug!(severity = severity.as_str(), message = %event.message, "Event");
        // A host that stopped listening must not break the pipeline.
        let _ = self.tx.send(event);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(Severity::Info, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.emit(Severity::Success, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(Severity::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(Severity::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_arrive_in_order_with_severity() {
        let (sink, mut rx) = EventSink::channel();
        sink.info("first");
        sink.error("second");

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.severity, Severity::Info);
        assert_eq!(first.message, "first");
        assert_eq!(second.severity, Severity::Error);
        assert!(second.timestamp >= first.timestamp);
    }

    #[test]
    fn emitting_after_receiver_dropped_is_harmless() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.warning("nobody listens");
    }

    #[test]
    fn severity_serializes_lowercase() {
        let json = serde_json::to_string(&Severity::Success).unwrap();
        assert_eq!(json, "\"success\"");
    }
}
