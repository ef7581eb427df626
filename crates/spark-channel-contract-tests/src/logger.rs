//! A recording [`Logger`] test double, so tests can assert on what the core
//! chose to log (e.g. that a handler error triggered exactly one
//! `channel.handler_error` record) without depending on a concrete logging
//! backend.

use std::sync::Arc;

use spin::Mutex;

use spark_channel_core::observability::{LogRecord, LogSeverity, Logger};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggedRecord {
    pub severity: LogSeverity,
    pub target: &'static str,
    pub message: String,
}

#[derive(Default)]
pub struct RecordingLogger {
    records: Mutex<Vec<LoggedRecord>>,
}

impl RecordingLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<LoggedRecord> {
        self.records.lock().clone()
    }

    pub fn count_at_least(&self, severity: LogSeverity) -> usize {
        self.records.lock().iter().filter(|r| r.severity >= severity).count()
    }
}

impl Logger for RecordingLogger {
    fn log(&self, record: &LogRecord<'_>) {
        self.records.lock().push(LoggedRecord {
            severity: record.severity,
            target: record.target,
            message: std::fmt::format(record.message),
        });
    }
}
