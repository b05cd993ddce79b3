//! Running setup steps and their teardowns at one location.

use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::fixture::{FixtureError, FixturePair};
use crate::runner::context::{Flow, RunContext};
use crate::runner::events::Location;
use crate::runner::reporter::Reporter;
use crate::task::WorkerId;
use crate::task::scheduler::panic_message;
use crate::tree::{CallError, CallResult};

pub(crate) type Teardown = Box<dyn FnOnce() -> CallResult + Send>;

pub(crate) type Setup<'a> = Box<dyn FnOnce() -> CallResult + 'a>;

/// A setup action and the teardown that undoes it.
pub(crate) struct Step<'a> {
    pub setup: Option<Setup<'a>>,
    pub teardown: Option<Teardown>,
}

impl<'a> Step<'a> {
    pub fn fixture(pair: FixturePair, worker: WorkerId) -> Self {
        let teardown_pair = pair.clone();
        Self {
            setup: Some(Box::new(move || pair.setup(worker).map_err(fixture_error))),
            teardown: Some(Box::new(move || teardown_pair.teardown().map_err(fixture_error))),
        }
    }
}

pub(crate) fn fixture_error(error: FixtureError) -> CallError {
    CallError::Failed(error.to_string())
}

/// Run `f`, turning a panic into a failure.
pub(crate) fn guarded<F: FnOnce() -> CallResult>(f: F) -> CallResult {
    catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(CallError::Failed(panic_message(payload))))
}

/// One location of the run, with the suite its callables belong to.
pub(crate) struct Site<'a> {
    pub reporter: &'a Reporter,
    pub context: &'a RunContext,
    pub location: Location,
    pub suite: &'a str,
}

impl Site<'_> {
    /// Record a failed call: log it here and apply its flow to the run.
    pub fn fail(&self, error: &CallError) {
        self.reporter.log_error(&self.location, error.to_string());
        self.context.apply(&Flow::from_call(error), self.suite);
    }

    /// Run `f` guarded, recording its failure. Returns whether it succeeded.
    pub fn call<F: FnOnce() -> CallResult>(&self, f: F) -> bool {
        match guarded(f) {
            Ok(()) => true,
            Err(e) => {
                self.fail(&e);
                false
            }
        }
    }

    pub fn is_successful(&self) -> bool {
        self.reporter.is_successful(&self.location)
    }

    /// Run setups in order until one fails or leaves the location failed.
    ///
    /// Returns the teardowns of the steps that completed, in setup order,
    /// and whether every step completed.
    pub fn run_setups(&self, steps: Vec<Step<'_>>) -> (Vec<Teardown>, bool) {
        let mut teardowns = Vec::new();
        for step in steps {
            if let Some(setup) = step.setup
                && !(self.call(setup) && self.is_successful())
            {
                return (teardowns, false);
            }
            if let Some(teardown) = step.teardown {
                teardowns.push(teardown);
            }
        }
        (teardowns, true)
    }

    /// Run teardowns last-first; a failure does not stop the others.
    pub fn run_teardowns(&self, teardowns: Vec<Teardown>) {
        for teardown in teardowns.into_iter().rev() {
            self.call(teardown);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::runner::events::EventLog;

    fn recorder(journal: &Arc<Mutex<Vec<String>>>, entry: &str, fail: bool) -> Teardown {
        let journal = Arc::clone(journal);
        let entry = entry.to_owned();
        Box::new(move || {
            journal.lock().push(entry);
            if fail {
                Err(CallError::failed("teardown broke"))
            } else {
                Ok(())
            }
        })
    }

    fn step<'a>(setup: Setup<'a>, teardown: Teardown) -> Step<'a> {
        Step {
            setup: Some(setup),
            teardown: Some(teardown),
        }
    }

    #[test]
    fn failed_setup_keeps_earlier_teardowns_only() {
        let reporter = Reporter::new(Arc::new(EventLog::new()));
        let context = RunContext::new(false);
        let site = Site {
            reporter: &reporter,
            context: &context,
            location: Location::SuiteSetup("s".into()),
            suite: "s",
        };
        let journal = Arc::new(Mutex::new(Vec::new()));
        let (teardowns, completed) = site.run_setups(vec![
            step(Box::new(|| Ok(())), recorder(&journal, "first", false)),
            step(
                Box::new(|| Err(CallError::failed("nope"))),
                recorder(&journal, "second", false),
            ),
            step(Box::new(|| Ok(())), recorder(&journal, "third", false)),
        ]);
        assert!(!completed);
        assert_eq!(teardowns.len(), 1);
        assert!(!site.is_successful());
        site.run_teardowns(teardowns);
        assert_eq!(*journal.lock(), vec!["first"]);
    }

    #[test]
    fn teardowns_run_in_reverse_despite_failures() {
        let reporter = Reporter::new(Arc::new(EventLog::new()));
        let context = RunContext::new(false);
        let site = Site {
            reporter: &reporter,
            context: &context,
            location: Location::SuiteTeardown("s".into()),
            suite: "s",
        };
        let journal = Arc::new(Mutex::new(Vec::new()));
        site.run_teardowns(vec![
            recorder(&journal, "a", false),
            recorder(&journal, "b", true),
            recorder(&journal, "c", false),
        ]);
        assert_eq!(*journal.lock(), vec!["c", "b", "a"]);
        assert!(!site.is_successful());
    }

    #[test]
    fn panic_is_a_failure() {
        let reporter = Reporter::new(Arc::new(EventLog::new()));
        let context = RunContext::new(false);
        let site = Site {
            reporter: &reporter,
            context: &context,
            location: Location::Test("s.t".into()),
            suite: "s",
        };
        assert!(!site.call(|| panic!("kaboom")));
        assert!(!site.is_successful());
    }

    #[test]
    fn abort_suite_error_marks_suite() {
        let reporter = Reporter::new(Arc::new(EventLog::new()));
        let context = RunContext::new(false);
        let site = Site {
            reporter: &reporter,
            context: &context,
            location: Location::SuiteSetup("s".into()),
            suite: "s",
        };
        site.fail(&CallError::abort_suite("enough"));
        assert!(context.is_suite_aborted("s"));
    }
}
