use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Final status of one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    Disabled,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestRecord {
    pub path: String,
    pub status: TestStatus,
    /// Skip reason, if skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The complete result of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub duration: Duration,
    pub tests: Vec<TestRecord>,
    pub summary: RunSummary,
    /// Setup/teardown locations that reported a failure.
    pub failed_locations: usize,
}

impl RunResult {
    /// No failed test and no failed setup or teardown.
    pub fn success(&self) -> bool {
        self.summary.failed == 0 && self.failed_locations == 0
    }

    pub fn test(&self, path: &str) -> Option<&TestRecord> {
        self.tests.iter().find(|t| t.path == path)
    }

    pub fn status_of(&self, path: &str) -> Option<TestStatus> {
        self.test(path).map(|t| t.status)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub disabled: usize,
}

impl RunSummary {
    pub fn from_records(records: &[TestRecord]) -> Self {
        let mut summary = Self {
            total: records.len(),
            ..Self::default()
        };
        for r in records {
            match r.status {
                TestStatus::Passed => summary.passed += 1,
                TestStatus::Failed => summary.failed += 1,
                TestStatus::Skipped => summary.skipped += 1,
                TestStatus::Disabled => summary.disabled += 1,
            }
        }
        summary
    }
}
