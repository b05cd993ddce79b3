use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::runner::result::TestStatus;

/// Where a log entry or failure happened.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum Location {
    SessionSetup,
    SessionTeardown,
    SuiteSetup(String),
    SuiteTeardown(String),
    Test(String),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionSetup => write!(f, "session setup"),
            Self::SessionTeardown => write!(f, "session teardown"),
            Self::SuiteSetup(path) => write!(f, "setup of suite '{path}'"),
            Self::SuiteTeardown(path) => write!(f, "teardown of suite '{path}'"),
            Self::Test(path) => write!(f, "test '{path}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// A lifecycle transition, as seen by external reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    RunStart,
    RunEnd,
    SessionSetupStart,
    SessionSetupEnd,
    SessionTeardownStart,
    SessionTeardownEnd,
    SuiteStart { suite: String },
    SuiteEnd { suite: String },
    SuiteSetupStart { suite: String },
    SuiteSetupEnd { suite: String },
    SuiteTeardownStart { suite: String },
    SuiteTeardownEnd { suite: String },
    TestStart { test: String },
    TestEnd { test: String, status: TestStatus },
    TestSkipped { test: String, reason: String },
    TestDisabled { test: String },
    Log {
        location: Location,
        level: LogLevel,
        message: String,
    },
}

/// Receives every lifecycle event of a run, from any worker thread.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Keeps events in memory, in emission order.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for EventLog {
    fn on_event(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_event(&self, event: &Event) {
        match event {
            Event::Log {
                location,
                level,
                message,
            } => match level {
                LogLevel::Info => info!(%location, "{message}"),
                LogLevel::Warn => warn!(%location, "{message}"),
                LogLevel::Error => error!(%location, "{message}"),
            },
            Event::TestEnd { test, status } => info!(test = %test, %status, "test finished"),
            Event::TestSkipped { test, reason } => info!(test = %test, %reason, "test skipped"),
            Event::TestDisabled { test } => info!(test = %test, "test disabled"),
            other => debug!(event = ?other, "lifecycle event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_display() {
        assert_eq!(Location::SessionSetup.to_string(), "session setup");
        assert_eq!(
            Location::SuiteTeardown("a.b".into()).to_string(),
            "teardown of suite 'a.b'"
        );
        assert_eq!(Location::Test("a.t".into()).to_string(), "test 'a.t'");
    }

    #[test]
    fn event_log_keeps_order() {
        let log = EventLog::new();
        log.on_event(&Event::RunStart);
        log.on_event(&Event::SuiteStart { suite: "a".into() });
        assert_eq!(log.len(), 2);
        assert_eq!(log.events()[1], Event::SuiteStart { suite: "a".into() });
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_string(&Event::TestEnd {
            test: "a.t".into(),
            status: TestStatus::Passed,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"test_end","test":"a.t","status":"passed"}"#);
        let json = serde_json::to_string(&Event::Log {
            location: Location::SuiteSetup("a".into()),
            level: LogLevel::Error,
            message: "boom".into(),
        })
        .unwrap();
        assert!(json.contains(r#""location":{"kind":"suite_setup","path":"a"}"#), "{json}");
    }
}
