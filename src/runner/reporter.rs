use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::runner::events::{Event, EventSink, Location, LogLevel};
use crate::runner::result::{TestRecord, TestStatus};

/// Records failures per location and test outcomes, and forwards events to
/// the sink.
pub struct Reporter {
    sink: Arc<dyn EventSink>,
    failed: Mutex<HashSet<Location>>,
    records: Mutex<Vec<TestRecord>>,
}

impl Reporter {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            failed: Mutex::new(HashSet::new()),
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn emit(&self, event: Event) {
        self.sink.on_event(&event);
    }

    /// Log at `location`; an error-level entry marks it failed.
    pub fn log(&self, location: &Location, level: LogLevel, message: String) {
        if level == LogLevel::Error {
            self.mark_failed(location);
        }
        self.emit(Event::Log {
            location: location.clone(),
            level,
            message,
        });
    }

    pub fn log_error(&self, location: &Location, message: impl Into<String>) {
        self.log(location, LogLevel::Error, message.into());
    }

    pub fn mark_failed(&self, location: &Location) {
        self.failed.lock().insert(location.clone());
    }

    pub fn is_successful(&self, location: &Location) -> bool {
        !self.failed.lock().contains(location)
    }

    /// Failed locations other than tests.
    pub fn failed_setup_locations(&self) -> usize {
        self.failed
            .lock()
            .iter()
            .filter(|l| !matches!(l, Location::Test(_)))
            .count()
    }

    pub fn test_finished(&self, path: &str, status: TestStatus) {
        self.record(path, status, None);
        self.emit(Event::TestEnd {
            test: path.to_owned(),
            status,
        });
    }

    pub fn test_skipped(&self, path: &str, reason: &str) {
        self.record(path, TestStatus::Skipped, Some(reason.to_owned()));
        self.emit(Event::TestSkipped {
            test: path.to_owned(),
            reason: reason.to_owned(),
        });
    }

    pub fn test_disabled(&self, path: &str) {
        self.record(path, TestStatus::Disabled, None);
        self.emit(Event::TestDisabled {
            test: path.to_owned(),
        });
    }

    fn record(&self, path: &str, status: TestStatus, reason: Option<String>) {
        self.records.lock().push(TestRecord {
            path: path.to_owned(),
            status,
            reason,
        });
    }

    /// Test records in completion order.
    pub fn records(&self) -> Vec<TestRecord> {
        self.records.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::events::EventLog;

    #[test]
    fn error_log_marks_location_failed() {
        let log = Arc::new(EventLog::new());
        let reporter = Reporter::new(log.clone());
        let location = Location::SuiteSetup("s".into());
        reporter.log(&location, LogLevel::Info, "fine".into());
        assert!(reporter.is_successful(&location));
        reporter.log_error(&location, "broken");
        assert!(!reporter.is_successful(&location));
        assert!(reporter.is_successful(&Location::SessionSetup));
        assert_eq!(reporter.failed_setup_locations(), 1);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_outcomes_are_recorded_and_emitted() {
        let log = Arc::new(EventLog::new());
        let reporter = Reporter::new(log.clone());
        reporter.test_finished("s.t1", TestStatus::Passed);
        reporter.test_skipped("s.t2", "nope");
        reporter.test_disabled("s.t3");
        let records = reporter.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].reason.as_deref(), Some("nope"));
        assert_eq!(
            log.events()[2],
            Event::TestDisabled {
                test: "s.t3".into()
            }
        );
    }
}
