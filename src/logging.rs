//! Buffered probe event log.
//!
//! Stream boxes must never wait on logging, so events go through a bounded
//! queue and are dropped when it is full.

use crate::model::{CheckResult, ErrType, Severity, Stream};

use std::time::Duration;
use tokio::sync::mpsc;

const QUEUE_SIZE: usize = 1024;

/// One noteworthy probe outcome.
#[derive(Debug, Clone)]
pub struct Event {
    pub severity: Severity,
    pub group: String,
    pub stream: String,
    pub uri: String,
    pub err: ErrType,
    pub http_code: u16,
    pub content_length: i64,
    pub elapsed: Duration,
}

impl Event {
    pub fn new(severity: Severity, stream: &Stream, result: &CheckResult) -> Self {
        Self {
            severity,
            group: stream.group.clone(),
            stream: stream.name.clone(),
            uri: result.uri.clone(),
            err: result.err_type,
            http_code: result.http_code,
            content_length: result.content_length,
            elapsed: result.elapsed,
        }
    }
}

/// Sending side of the event log.
#[derive(Clone)]
pub struct EventLog {
    tx: mpsc::Sender<Event>,
}

impl EventLog {
    /// Spawn the writer task.
    pub fn spawn() -> Self {
        let (log, rx) = Self::channel(QUEUE_SIZE);
        tokio::spawn(run_writer(rx));
        log
    }

    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue an event. Returns false when it was dropped.
    pub fn log(&self, severity: Severity, stream: &Stream, result: &CheckResult) -> bool {
        self.tx.try_send(Event::new(severity, stream, result)).is_ok()
    }
}

async fn run_writer(mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        write(&event);
    }
}

fn write(e: &Event) {
    let elapsed_ms = e.elapsed.as_millis() as u64;
    match e.severity {
        Severity::Critical | Severity::Error => tracing::error!(
            group = %e.group,
            stream = %e.stream,
            uri = %e.uri,
            err = %e.err,
            http_code = e.http_code,
            content_length = e.content_length,
            elapsed_ms,
            "{}",
            e.err.describe()
        ),
        Severity::Warning => tracing::warn!(
            group = %e.group,
            stream = %e.stream,
            uri = %e.uri,
            err = %e.err,
            http_code = e.http_code,
            elapsed_ms,
            "{}",
            e.err.describe()
        ),
        Severity::Info => tracing::debug!(
            group = %e.group,
            stream = %e.stream,
            err = %e.err,
            elapsed_ms,
            "{}",
            e.err.describe()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StreamType;
    use crate::test_support::stream;

    #[tokio::test]
    async fn test_full_queue_drops() {
        let (log, mut rx) = EventLog::channel(2);
        let s = stream("http://a/", StreamType::Http);
        let result = CheckResult::failed(&s.uri, ErrType::Refused);

        assert!(log.log(Severity::Critical, &s, &result));
        assert!(log.log(Severity::Critical, &s, &result));
        assert!(!log.log(Severity::Critical, &s, &result));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.err, ErrType::Refused);
        assert_eq!(event.group, "group");
        assert!(log.log(Severity::Warning, &s, &result));
    }
}
