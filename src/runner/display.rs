use crate::runner::events::{Event, LogLevel};
use crate::runner::result::{RunResult, TestStatus};

/// Format a status label for terminal output.
fn status_label(status: TestStatus) -> &'static str {
    match status {
        TestStatus::Passed => "PASSED",
        TestStatus::Failed => "FAILED",
        TestStatus::Skipped => "SKIPPED",
        TestStatus::Disabled => "DISABLED",
    }
}

/// Format a lifecycle event as one terminal line, or `None` for events that
/// are not shown.
pub fn format_event(event: &Event) -> Option<String> {
    let line = match event {
        Event::SuiteStart { suite } => format!("{suite}:"),
        Event::TestEnd { test, status } => format!("  [{}] {test}", status_label(*status)),
        Event::TestSkipped { test, reason } => {
            format!("  [{}] {test}\n         → {reason}", status_label(TestStatus::Skipped))
        }
        Event::TestDisabled { test } => format!("  [{}] {test}", status_label(TestStatus::Disabled)),
        Event::Log {
            location,
            level: LogLevel::Error,
            message,
        } => format!("  ERROR in {location}: {message}"),
        _ => return None,
    };
    Some(line)
}

/// Format the final summary after all tests complete.
pub fn format_summary(result: &RunResult) -> String {
    let duration_secs = result.duration.as_secs_f64();
    let summary = &result.summary;
    let mut parts = Vec::new();

    if summary.passed > 0 {
        parts.push(format!("{} passed", summary.passed));
    }
    if summary.failed > 0 {
        parts.push(format!("{} failed", summary.failed));
    }
    if summary.skipped > 0 {
        parts.push(format!("{} skipped", summary.skipped));
    }
    if summary.disabled > 0 {
        parts.push(format!("{} disabled", summary.disabled));
    }
    if parts.is_empty() {
        parts.push("0 tests".into());
    }

    let mut line = format!("\nResults: {} ({:.1}s)", parts.join(", "), duration_secs);
    if result.failed_locations > 0 {
        line.push_str(&format!(
            "\n{} setup/teardown location(s) reported errors",
            result.failed_locations
        ));
    }
    line
}

/// Format the run header line.
pub fn format_run_header(suites: usize, workers: usize) -> String {
    format!("Running {suites} suite(s) on {workers} worker(s)...\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::events::Location;
    use crate::runner::result::RunSummary;
    use std::time::Duration;

    fn result(summary: RunSummary, millis: u64) -> RunResult {
        RunResult {
            duration: Duration::from_millis(millis),
            tests: vec![],
            summary,
            failed_locations: 0,
        }
    }

    #[test]
    fn display_test_end_format() {
        let output = format_event(&Event::TestEnd {
            test: "auth.login".into(),
            status: TestStatus::Passed,
        })
        .unwrap();
        assert_eq!(output, "  [PASSED] auth.login");
    }

    #[test]
    fn display_skipped_with_reason() {
        let output = format_event(&Event::TestSkipped {
            test: "auth.logout".into(),
            reason: "Cannot execute this test: all tests have been aborted".into(),
        })
        .unwrap();
        assert!(output.contains("[SKIPPED]"));
        assert!(output.contains("→ Cannot execute this test"));
    }

    #[test]
    fn display_error_log_only() {
        let location = Location::SuiteSetup("auth".into());
        let error = format_event(&Event::Log {
            location: location.clone(),
            level: LogLevel::Error,
            message: "db down".into(),
        });
        assert_eq!(error.as_deref(), Some("  ERROR in setup of suite 'auth': db down"));
        let info = format_event(&Event::Log {
            location,
            level: LogLevel::Info,
            message: "connecting".into(),
        });
        assert_eq!(info, None);
        assert_eq!(format_event(&Event::RunStart), None);
    }

    #[test]
    fn display_summary_all_passed() {
        let output = format_summary(&result(
            RunSummary {
                total: 4,
                passed: 4,
                ..RunSummary::default()
            },
            2000,
        ));
        assert!(output.contains("4 passed"));
        assert!(!output.contains("failed"));
        assert!(output.contains("2.0s"));
    }

    #[test]
    fn display_summary_with_failures() {
        let output = format_summary(&result(
            RunSummary {
                total: 5,
                passed: 1,
                failed: 1,
                skipped: 2,
                disabled: 1,
            },
            3500,
        ));
        assert!(output.contains("1 passed"));
        assert!(output.contains("1 failed"));
        assert!(output.contains("2 skipped"));
        assert!(output.contains("1 disabled"));
        assert!(output.contains("3.5s"));
    }

    #[test]
    fn display_summary_empty_run() {
        let output = format_summary(&result(RunSummary::default(), 0));
        assert!(output.contains("0 tests"));
    }

    #[test]
    fn display_run_header_format() {
        assert_eq!(
            format_run_header(2, 4),
            "Running 2 suite(s) on 4 worker(s)...\n"
        );
    }
}
