use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::info;

use crate::tree::CallError;

/// Skip reason for the remaining tests of an aborted suite.
pub const SUITE_ABORTED: &str = "the tests of this test suite have been aborted";

/// Skip reason once the whole run is aborted.
pub const ALL_TESTS_ABORTED: &str = "all tests have been aborted";

/// What the run should do after a callable returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    SkipSuite(String),
    AbortRun(String),
}

impl Flow {
    pub fn from_call(error: &CallError) -> Self {
        match error {
            CallError::Failed(_) => Self::Continue,
            CallError::AbortSuite(reason) => Self::SkipSuite(reason.clone()),
            CallError::AbortRun(reason) => Self::AbortRun(reason.clone()),
        }
    }
}

#[derive(Debug, Default)]
struct AbortState {
    suites: HashSet<String>,
    run: Option<String>,
}

/// Run-wide abort state, shared by every task of one run.
#[derive(Debug, Default)]
pub struct RunContext {
    stop_on_failure: bool,
    state: Mutex<AbortState>,
}

impl RunContext {
    pub fn new(stop_on_failure: bool) -> Self {
        Self {
            stop_on_failure,
            state: Mutex::default(),
        }
    }

    pub fn stop_on_failure(&self) -> bool {
        self.stop_on_failure
    }

    pub fn abort_suite(&self, path: &str) {
        if self.state.lock().suites.insert(path.to_owned()) {
            info!(suite = path, "suite aborted");
        }
    }

    /// Sub-suites of an aborted suite are not affected.
    pub fn is_suite_aborted(&self, path: &str) -> bool {
        self.state.lock().suites.contains(path)
    }

    /// Abort the run; the first reason wins.
    pub fn abort_run(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if state.run.is_none() {
            let reason = reason.into();
            info!(%reason, "run aborted");
            state.run = Some(reason);
        }
    }

    pub fn is_run_aborted(&self) -> bool {
        self.state.lock().run.is_some()
    }

    pub fn run_abort_reason(&self) -> Option<String> {
        self.state.lock().run.clone()
    }

    /// Abort the remaining tests of the run after a failure, if configured to.
    pub fn handle_failure(&self) {
        if self.stop_on_failure {
            self.abort_run(ALL_TESTS_ABORTED);
        }
    }

    /// Apply the outcome of a callable that ran inside `suite`.
    pub fn apply(&self, flow: &Flow, suite: &str) {
        match flow {
            Flow::Continue => {}
            Flow::SkipSuite(message) => {
                info!(suite, %message, "aborting the tests of the suite");
                self.abort_suite(suite);
            }
            Flow::AbortRun(message) => {
                info!(suite, %message, "aborting all tests");
                self.abort_run(ALL_TESTS_ABORTED);
            }
        }
    }

    /// Why a test of `suite` cannot start, if it cannot.
    pub fn skip_reason(&self, suite: &str) -> Option<String> {
        self.run_abort_reason()
            .or_else(|| self.is_suite_aborted(suite).then(|| SUITE_ABORTED.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suite_abort_is_per_suite() {
        let ctx = RunContext::new(false);
        ctx.abort_suite("a.b");
        assert!(ctx.is_suite_aborted("a.b"));
        assert!(!ctx.is_suite_aborted("a.b.c"));
        assert!(!ctx.is_suite_aborted("a"));
        assert_eq!(ctx.skip_reason("a.b").as_deref(), Some(SUITE_ABORTED));
        assert_eq!(ctx.skip_reason("a"), None);
    }

    #[test]
    fn first_run_abort_reason_wins() {
        let ctx = RunContext::new(false);
        assert!(!ctx.is_run_aborted());
        ctx.abort_run("first");
        ctx.abort_run("second");
        assert_eq!(ctx.run_abort_reason().as_deref(), Some("first"));
        assert_eq!(ctx.skip_reason("any").as_deref(), Some("first"));
    }

    #[test]
    fn failure_aborts_only_with_stop_on_failure() {
        let relaxed = RunContext::new(false);
        relaxed.handle_failure();
        assert!(!relaxed.is_run_aborted());

        let strict = RunContext::new(true);
        strict.handle_failure();
        assert_eq!(strict.run_abort_reason().as_deref(), Some(ALL_TESTS_ABORTED));
    }

    #[test]
    fn flow_from_call_error() {
        let ctx = RunContext::new(false);
        let flow = Flow::from_call(&CallError::abort_suite("enough"));
        assert_eq!(flow, Flow::SkipSuite("enough".into()));
        ctx.apply(&flow, "s");
        assert!(ctx.is_suite_aborted("s"));
        assert_eq!(Flow::from_call(&CallError::failed("x")), Flow::Continue);
        ctx.apply(&Flow::from_call(&CallError::abort_run("stop")), "s");
        assert!(ctx.is_run_aborted());
    }

    #[test]
    fn abort_messages_do_not_replace_skip_reasons() {
        let ctx = RunContext::new(false);
        ctx.apply(&Flow::SkipSuite("quota exceeded".into()), "s");
        assert_eq!(ctx.skip_reason("s").as_deref(), Some(SUITE_ABORTED));

        ctx.apply(&Flow::AbortRun("database gone".into()), "s");
        assert_eq!(ctx.run_abort_reason().as_deref(), Some(ALL_TESTS_ABORTED));
        assert_eq!(ctx.skip_reason("other").as_deref(), Some(ALL_TESTS_ABORTED));
    }
}
