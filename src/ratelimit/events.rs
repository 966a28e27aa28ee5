//! Observability events emitted by the rate limiter.

use serde::Serialize;
use tracing::{error, info, warn};

/// What happened to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The request was denied because the window quota is used up
    Exceeded,
    /// The request was admitted and counted
    Admitted,
    /// The store failed and the request was admitted
    Error,
}

/// A structured rate limit event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitEvent {
    pub kind: EventKind,
    pub request_type: String,
    pub identifier: String,
    /// Counter value observed (exceeded) or after the increment (admitted)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RateLimitEvent {
    pub fn exceeded(
        request_type: &str,
        identifier: &str,
        current_count: u64,
        max_requests: u64,
    ) -> Self {
        Self {
            kind: EventKind::Exceeded,
            request_type: request_type.to_string(),
            identifier: identifier.to_string(),
            current_count: Some(current_count),
            max_requests: Some(max_requests),
            message: None,
        }
    }

    pub fn admitted(
        request_type: &str,
        identifier: &str,
        current_count: u64,
        max_requests: u64,
    ) -> Self {
        Self {
            kind: EventKind::Admitted,
            request_type: request_type.to_string(),
            identifier: identifier.to_string(),
            current_count: Some(current_count),
            max_requests: Some(max_requests),
            message: None,
        }
    }

    pub fn error(request_type: &str, identifier: &str, message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Error,
            request_type: request_type.to_string(),
            identifier: identifier.to_string(),
            current_count: None,
            max_requests: None,
            message: Some(message.into()),
        }
    }
}

/// Receives rate limit events.
///
/// Sinks are called inline on the request path and should not block.
pub trait EventSink: Send + Sync {
    fn record(&self, event: RateLimitEvent);
}

/// Sink that forwards events to `tracing`.
///
/// Exceeded events are logged at `warn`, admitted at `info`, errors at `error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: RateLimitEvent) {
        match event.kind {
            EventKind::Exceeded => warn!(
                request_type = %event.request_type,
                identifier = %event.identifier,
                current_count = event.current_count,
                max_requests = event.max_requests,
                "Rate limit exceeded for {} by {}",
                event.request_type,
                event.identifier
            ),
            EventKind::Admitted => info!(
                request_type = %event.request_type,
                identifier = %event.identifier,
                current_count = event.current_count,
                max_requests = event.max_requests,
                "Request allowed for {} by {}",
                event.request_type,
                event.identifier
            ),
            EventKind::Error => error!(
                request_type = %event.request_type,
                identifier = %event.identifier,
                error = event.message.as_deref().unwrap_or_default(),
                "Counter store error, admitting request"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_event_constructors() {
        let event = RateLimitEvent::exceeded("api", "u1", 3, 3);
        assert_eq!(event.kind, EventKind::Exceeded);
        assert_eq!(event.current_count, Some(3));
        assert_eq!(event.max_requests, Some(3));
        assert!(event.message.is_none());

        let event = RateLimitEvent::error("api", "u1", "connection refused");
        assert_eq!(event.kind, EventKind::Error);
        assert_eq!(event.message.as_deref(), Some("connection refused"));
        assert!(event.current_count.is_none());
    }

    #[test]
    fn test_event_serializes_without_empty_fields() {
        let event = RateLimitEvent::admitted("login", "10.0.0.1", 1, 5);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["kind"], "admitted");
        assert_eq!(json["request_type"], "login");
        assert_eq!(json["current_count"], 1);
        assert!(json.get("message").is_none());
    }

    /// In-memory log writer shared with a scoped subscriber.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn lines(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock())
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    #[test]
    fn test_tracing_sink_logs_each_kind_at_its_level() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let sink = TracingSink;
            sink.record(RateLimitEvent::admitted("api", "u1", 1, 3));
            sink.record(RateLimitEvent::exceeded("api", "u1", 3, 3));
            sink.record(RateLimitEvent::error("api", "u1", "timed out"));
        });

        let lines = logs.lines();
        assert_eq!(lines.len(), 3, "{:?}", lines);

        assert!(lines[0].contains("INFO"));
        assert!(lines[0].contains("Request allowed for api by u1"));
        assert!(lines[0].contains("current_count=1"));
        assert!(lines[0].contains("max_requests=3"));

        assert!(lines[1].contains("WARN"));
        assert!(lines[1].contains("Rate limit exceeded for api by u1"));
        assert!(lines[1].contains("current_count=3"));

        assert!(lines[2].contains("ERROR"));
        assert!(lines[2].contains("Counter store error, admitting request"));
        assert!(lines[2].contains("timed out"));
        assert!(lines[2].contains("identifier=u1"));
    }
}
