//! Translation of a suite forest into the task graph of one run.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::fixture::{FixtureArgs, FixtureError, FixtureRegistry, ScheduledFixtures};
use crate::graph::analysis::find_cycle;
use crate::graph::builder;
use crate::runner::context::RunContext;
use crate::runner::events::{Event, Location};
use crate::runner::reporter::Reporter;
use crate::runner::result::TestStatus;
use crate::runner::steps::{Setup, Site, Step, Teardown, fixture_error};
use crate::task::{SkipReason, Task, TaskError, TaskGraph, TaskId, WorkerId};
use crate::tree::{CallContext, Hook, Suite, Test, TestHook};

/// Problems found while building the task graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("test '{test}' depends on unknown test '{dependency}'")]
    UnknownDependency { test: String, dependency: String },
    #[error("test '{test}' depends on disabled test '{dependency}'")]
    DisabledDependency { test: String, dependency: String },
    #[error("circular dependency between tests: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),
    #[error(transparent)]
    Fixture(#[from] FixtureError),
}

/// What every task of a run shares.
pub struct TaskEnv {
    pub registry: Arc<FixtureRegistry>,
    pub reporter: Arc<Reporter>,
    pub force_disabled: bool,
}

type SharedTeardowns = Arc<Mutex<Vec<Teardown>>>;

fn skip_message(reason: &str) -> String {
    format!("Cannot execute this test: {reason}")
}

/// Build the task graph of a run.
///
/// `session` is the session fixture set, already chained to the pre-run set.
pub fn build_tasks(
    suites: &[Suite],
    env: &Arc<TaskEnv>,
    session: &Arc<ScheduledFixtures>,
) -> Result<TaskGraph<RunContext>, ValidationError> {
    let mut builder = Builder {
        graph: TaskGraph::new(),
        env: Arc::clone(env),
        session: Arc::clone(session),
        session_setup: None,
        tests: Vec::new(),
    };

    let session_teardowns = SharedTeardowns::default();
    if !session.is_empty() {
        builder.session_setup = Some(builder.graph.add(SessionSetupTask {
            env: Arc::clone(env),
            fixtures: Arc::clone(session),
            teardowns: Arc::clone(&session_teardowns),
        }));
    }

    let mut top_ends = Vec::new();
    for suite in suites {
        top_ends.push(builder.add_suite(suite, None)?);
    }

    if let Some(setup) = builder.session_setup {
        let teardown = builder.graph.add(SessionTeardownTask {
            env: Arc::clone(env),
            teardowns: session_teardowns,
        });
        builder.graph.depends_on_completion(teardown, setup);
        for end in top_ends {
            builder.graph.depends_on_completion(teardown, end);
        }
    }

    builder.link_explicit_dependencies()?;
    debug!(tasks = builder.graph.len(), "task graph built");
    Ok(builder.graph)
}

struct TestEntry {
    id: TaskId,
    path: String,
    disabled: bool,
    depends_on: Vec<String>,
}

struct Builder {
    graph: TaskGraph<RunContext>,
    env: Arc<TaskEnv>,
    session: Arc<ScheduledFixtures>,
    session_setup: Option<TaskId>,
    tests: Vec<TestEntry>,
}

impl Builder {
    /// Add the tasks of `suite` and its sub-suites. Returns the suite-end
    /// task.
    fn add_suite(&mut self, suite: &Suite, parent_begin: Option<TaskId>) -> Result<TaskId, ValidationError> {
        let path = suite.path().to_owned();
        let fixtures =
            self.env
                .registry
                .scheduled_for_suite(suite, &self.session, self.env.force_disabled)?;

        let teardowns = SharedTeardowns::default();
        let needs_init =
            !fixtures.is_empty() || !suite.inject.is_empty() || suite.setup_suite().is_some();

        // Without an init task the begin task arms the teardown hook. A suite
        // that never begins has nothing to tear down.
        let begin = self.graph.add(SuiteBeginTask {
            env: Arc::clone(&self.env),
            path: path.clone(),
            teardown: if needs_init { None } else { suite.teardown_suite().cloned() },
            teardowns: Arc::clone(&teardowns),
        });
        if let Some(setup) = self.session_setup {
            self.graph.depends_on_success(begin, setup);
        }
        if let Some(parent) = parent_begin {
            self.graph.depends_on_success(begin, parent);
        }

        let init = if needs_init {
            let id = self.graph.add(SuiteInitTask {
                env: Arc::clone(&self.env),
                path: path.clone(),
                fixtures: Arc::clone(&fixtures),
                setup: suite.setup_suite().cloned(),
                teardown: suite.teardown_suite().cloned(),
                teardowns: Arc::clone(&teardowns),
            });
            self.graph.depends_on_success(id, begin);
            Some(id)
        } else {
            None
        };
        let gate = init.unwrap_or(begin);

        let mut test_ids = Vec::new();
        for test in suite.tests() {
            let id = self.graph.add(TestTask {
                env: Arc::clone(&self.env),
                test: test.clone(),
                suite: path.clone(),
                inject: suite.inject.clone(),
                setup_test: suite.setup_test().cloned(),
                teardown_test: suite.teardown_test().cloned(),
                fixtures: Arc::clone(&fixtures),
            });
            self.graph.depends_on_success(id, gate);
            self.tests.push(TestEntry {
                id,
                path: test.path().to_owned(),
                disabled: test.disabled,
                depends_on: test.depends_on.clone(),
            });
            test_ids.push(id);
        }

        let teardown = if init.is_some() || suite.teardown_suite().is_some() {
            let id = self.graph.add(SuiteTeardownTask {
                env: Arc::clone(&self.env),
                path: path.clone(),
                teardowns,
            });
            if let Some(init) = init {
                self.graph.depends_on_completion(id, init);
            }
            for &test in &test_ids {
                self.graph.depends_on_completion(id, test);
            }
            Some(id)
        } else {
            None
        };

        let mut sub_ends = Vec::new();
        for sub in suite.suites() {
            sub_ends.push(self.add_suite(sub, Some(begin))?);
        }

        let end = self.graph.add(SuiteEndTask {
            env: Arc::clone(&self.env),
            path,
        });
        let completion = std::iter::once(begin)
            .chain(init)
            .chain(test_ids)
            .chain(teardown)
            .chain(sub_ends);
        for dep in completion {
            self.graph.depends_on_completion(end, dep);
        }
        Ok(end)
    }

    /// Validate the explicit test dependencies, then wire them as
    /// success-gated edges.
    fn link_explicit_dependencies(&mut self) -> Result<(), ValidationError> {
        let positions: HashMap<&str, usize> = self
            .tests
            .iter()
            .enumerate()
            .map(|(i, t)| (t.path.as_str(), i))
            .collect();

        let mut edges = Vec::new();
        for (index, entry) in self.tests.iter().enumerate() {
            for dependency in &entry.depends_on {
                let Some(&target) = positions.get(dependency.as_str()) else {
                    return Err(ValidationError::UnknownDependency {
                        test: entry.path.clone(),
                        dependency: dependency.clone(),
                    });
                };
                if self.tests[target].disabled && !self.env.force_disabled {
                    return Err(ValidationError::DisabledDependency {
                        test: entry.path.clone(),
                        dependency: dependency.clone(),
                    });
                }
                edges.push((index, target));
            }
        }
        if edges.is_empty() {
            return Ok(());
        }

        let dg = builder::build(self.tests.iter().map(|t| t.path.clone()), edges.clone());
        if let Some(cycle) = find_cycle(&dg) {
            return Err(ValidationError::CircularDependency(cycle));
        }

        for (from, to) in edges {
            let (task, dependency) = (self.tests[from].id, self.tests[to].id);
            self.graph.depends_on_success(task, dependency);
        }
        Ok(())
    }
}

fn suite_teardown_hook(hook: Hook, reporter: &Arc<Reporter>, path: &str, worker: WorkerId) -> Teardown {
    let reporter = Arc::clone(reporter);
    let location = Location::SuiteTeardown(path.to_owned());
    Box::new(move || hook.call(&CallContext::new(FixtureArgs::new(), worker, &location, &reporter)))
}

fn test_hook(hook: TestHook, reporter: &Arc<Reporter>, test: &Test, worker: WorkerId) -> Teardown {
    let reporter = Arc::clone(reporter);
    let location = Location::Test(test.path().to_owned());
    let name = test.name.clone();
    Box::new(move || hook(&CallContext::new(FixtureArgs::new(), worker, &location, &reporter), &name))
}

/// Run `teardowns` at `location` between the given events. Returns false
/// if there was nothing to tear down.
fn tear_down(
    reporter: &Reporter,
    context: &RunContext,
    teardowns: &SharedTeardowns,
    location: Location,
    suite: &str,
    events: (Event, Event),
) -> bool {
    let teardowns = std::mem::take(&mut *teardowns.lock());
    if teardowns.is_empty() {
        return false;
    }
    let (start, end) = events;
    reporter.emit(start);
    let site = Site {
        reporter,
        context,
        location,
        suite,
    };
    site.run_teardowns(teardowns);
    reporter.emit(end);
    if !site.is_successful() {
        context.handle_failure();
    }
    true
}

struct SessionSetupTask {
    env: Arc<TaskEnv>,
    fixtures: Arc<ScheduledFixtures>,
    teardowns: SharedTeardowns,
}

impl Task<RunContext> for SessionSetupTask {
    fn label(&self) -> String {
        "session setup".to_string()
    }

    fn run(&self, context: &RunContext, worker: WorkerId) -> Result<(), TaskError> {
        let reporter = &self.env.reporter;
        reporter.emit(Event::SessionSetupStart);
        let site = Site {
            reporter,
            context,
            location: Location::SessionSetup,
            suite: "",
        };
        let steps = self
            .fixtures
            .setup_teardown_pairs()
            .into_iter()
            .map(|pair| Step::fixture(pair, worker))
            .collect();
        let (teardowns, completed) = site.run_setups(steps);
        *self.teardowns.lock() = teardowns;
        reporter.emit(Event::SessionSetupEnd);

        if completed {
            Ok(())
        } else {
            context.abort_run(crate::runner::context::ALL_TESTS_ABORTED);
            Err(TaskError::failure("session setup failed"))
        }
    }
}

struct SessionTeardownTask {
    env: Arc<TaskEnv>,
    teardowns: SharedTeardowns,
}

impl SessionTeardownTask {
    fn tear_down(&self, context: &RunContext) -> bool {
        tear_down(
            &self.env.reporter,
            context,
            &self.teardowns,
            Location::SessionTeardown,
            "",
            (Event::SessionTeardownStart, Event::SessionTeardownEnd),
        )
    }
}

impl Task<RunContext> for SessionTeardownTask {
    fn label(&self) -> String {
        "session teardown".to_string()
    }

    fn run(&self, context: &RunContext, _: WorkerId) -> Result<(), TaskError> {
        if self.tear_down(context) {
            Ok(())
        } else {
            Err(TaskError::Skipped("nothing to tear down".to_string()))
        }
    }

    fn skip(&self, context: &RunContext, _: &SkipReason) -> Result<(), TaskError> {
        self.tear_down(context);
        Ok(())
    }
}

struct SuiteBeginTask {
    env: Arc<TaskEnv>,
    path: String,
    /// Teardown hook of a suite that has no init task.
    teardown: Option<Hook>,
    teardowns: SharedTeardowns,
}

impl Task<RunContext> for SuiteBeginTask {
    fn label(&self) -> String {
        format!("beginning of suite '{}'", self.path)
    }

    fn run(&self, context: &RunContext, worker: WorkerId) -> Result<(), TaskError> {
        self.env.reporter.emit(Event::SuiteStart {
            suite: self.path.clone(),
        });
        let armed = self
            .teardown
            .as_ref()
            .filter(|_| context.run_abort_reason().is_none());
        if let Some(hook) = armed {
            self.teardowns.lock().push(suite_teardown_hook(
                hook.clone(),
                &self.env.reporter,
                &self.path,
                worker,
            ));
        }
        Ok(())
    }

    fn skip(&self, _: &RunContext, _: &SkipReason) -> Result<(), TaskError> {
        self.env.reporter.emit(Event::SuiteStart {
            suite: self.path.clone(),
        });
        Ok(())
    }
}

struct SuiteInitTask {
    env: Arc<TaskEnv>,
    path: String,
    fixtures: Arc<ScheduledFixtures>,
    setup: Option<Hook>,
    teardown: Option<Hook>,
    teardowns: SharedTeardowns,
}

impl Task<RunContext> for SuiteInitTask {
    fn label(&self) -> String {
        format!("setup of suite '{}'", self.path)
    }

    fn run(&self, context: &RunContext, worker: WorkerId) -> Result<(), TaskError> {
        if let Some(reason) = context.run_abort_reason() {
            return Err(TaskError::Skipped(reason));
        }
        let reporter = &self.env.reporter;
        let site = Site {
            reporter,
            context,
            location: Location::SuiteSetup(self.path.clone()),
            suite: &self.path,
        };

        let mut steps: Vec<Step<'_>> = self
            .fixtures
            .setup_teardown_pairs()
            .into_iter()
            .map(|pair| Step::fixture(pair, worker))
            .collect();
        let fixtures = &self.fixtures;
        let location = &site.location;
        let setup = self.setup.as_ref().map(|hook| -> Setup<'_> {
            Box::new(move || {
                let args = fixtures.get_many(&hook.params, worker).map_err(fixture_error)?;
                hook.call(&CallContext::new(args, worker, location, reporter))
            })
        });
        let teardown = self
            .teardown
            .clone()
            .map(|hook| suite_teardown_hook(hook, reporter, &self.path, worker));
        if setup.is_some() || teardown.is_some() {
            steps.push(Step { setup, teardown });
        }

        let has_setup = steps.iter().any(|s| s.setup.is_some());
        if has_setup {
            reporter.emit(Event::SuiteSetupStart {
                suite: self.path.clone(),
            });
        }
        let (teardowns, completed) = site.run_setups(steps);
        *self.teardowns.lock() = teardowns;
        if has_setup {
            reporter.emit(Event::SuiteSetupEnd {
                suite: self.path.clone(),
            });
        }

        if completed {
            Ok(())
        } else {
            context.abort_suite(&self.path);
            context.handle_failure();
            Err(TaskError::failure(format!(
                "setup of suite '{}' failed",
                self.path
            )))
        }
    }
}

struct TestTask {
    env: Arc<TaskEnv>,
    test: Test,
    suite: String,
    inject: Vec<String>,
    setup_test: Option<TestHook>,
    teardown_test: Option<TestHook>,
    fixtures: Arc<ScheduledFixtures>,
}

impl TestTask {
    fn is_disabled(&self) -> bool {
        self.test.disabled && !self.env.force_disabled
    }

    /// Setup hook, fixtures, test body, teardowns. Returns whether the test
    /// location is still successful.
    fn execute(&self, site: &Site<'_>, worker: WorkerId) -> bool {
        let reporter = &self.env.reporter;
        let fixtures = match self
            .env
            .registry
            .scheduled_for_test(&self.test.params, &self.fixtures)
        {
            Ok(set) => set,
            Err(e) => {
                site.fail(&fixture_error(e));
                return false;
            }
        };

        let mut steps = Vec::new();
        let location = &site.location;
        let name = self.test.name.as_str();
        let setup = self.setup_test.as_ref().map(|hook| -> Setup<'_> {
            Box::new(move || hook(&CallContext::new(FixtureArgs::new(), worker, location, reporter), name))
        });
        let teardown = self
            .teardown_test
            .clone()
            .map(|hook| test_hook(hook, reporter, &self.test, worker));
        if setup.is_some() || teardown.is_some() {
            steps.push(Step { setup, teardown });
        }
        steps.extend(
            fixtures
                .setup_teardown_pairs()
                .into_iter()
                .map(|pair| Step::fixture(pair, worker)),
        );

        let (teardowns, completed) = site.run_setups(steps);
        if completed {
            let names: Vec<&String> = self.test.params.iter().chain(&self.inject).collect();
            site.call(|| {
                let args = fixtures.get_many(&names, worker).map_err(fixture_error)?;
                self.test
                    .call(&CallContext::new(args, worker, location, reporter))
            });
        }
        site.run_teardowns(teardowns);
        site.is_successful()
    }
}

impl Task<RunContext> for TestTask {
    fn label(&self) -> String {
        format!("test '{}'", self.test.path())
    }

    fn run(&self, context: &RunContext, worker: WorkerId) -> Result<(), TaskError> {
        let reporter = &self.env.reporter;
        let path = self.test.path();
        if self.is_disabled() {
            reporter.test_disabled(path);
            return Ok(());
        }
        if let Some(reason) = context.skip_reason(&self.suite) {
            reporter.test_skipped(path, &skip_message(&reason));
            return Err(TaskError::Skipped(reason));
        }

        reporter.emit(Event::TestStart {
            test: path.to_owned(),
        });
        let site = Site {
            reporter,
            context,
            location: Location::Test(path.to_owned()),
            suite: &self.suite,
        };
        if self.execute(&site, worker) {
            reporter.test_finished(path, TestStatus::Passed);
            Ok(())
        } else {
            reporter.test_finished(path, TestStatus::Failed);
            context.handle_failure();
            Err(TaskError::failure(format!("test '{path}' failed")))
        }
    }

    fn skip(&self, context: &RunContext, reason: &SkipReason) -> Result<(), TaskError> {
        let path = self.test.path();
        if self.is_disabled() {
            self.env.reporter.test_disabled(path);
            return Ok(());
        }
        let reason = context
            .skip_reason(&self.suite)
            .unwrap_or_else(|| reason.to_string());
        self.env.reporter.test_skipped(path, &skip_message(&reason));
        Ok(())
    }
}

struct SuiteTeardownTask {
    env: Arc<TaskEnv>,
    path: String,
    teardowns: SharedTeardowns,
}

impl SuiteTeardownTask {
    fn tear_down(&self, context: &RunContext) -> bool {
        tear_down(
            &self.env.reporter,
            context,
            &self.teardowns,
            Location::SuiteTeardown(self.path.clone()),
            &self.path,
            (
                Event::SuiteTeardownStart {
                    suite: self.path.clone(),
                },
                Event::SuiteTeardownEnd {
                    suite: self.path.clone(),
                },
            ),
        )
    }
}

impl Task<RunContext> for SuiteTeardownTask {
    fn label(&self) -> String {
        format!("teardown of suite '{}'", self.path)
    }

    fn run(&self, context: &RunContext, _: WorkerId) -> Result<(), TaskError> {
        if self.tear_down(context) {
            Ok(())
        } else {
            Err(TaskError::Skipped("nothing to tear down".to_string()))
        }
    }

    fn skip(&self, context: &RunContext, _: &SkipReason) -> Result<(), TaskError> {
        self.tear_down(context);
        Ok(())
    }
}

struct SuiteEndTask {
    env: Arc<TaskEnv>,
    path: String,
}

impl Task<RunContext> for SuiteEndTask {
    fn label(&self) -> String {
        format!("end of suite '{}'", self.path)
    }

    fn run(&self, _: &RunContext, _: WorkerId) -> Result<(), TaskError> {
        self.env.reporter.emit(Event::SuiteEnd {
            suite: self.path.clone(),
        });
        Ok(())
    }

    fn skip(&self, _: &RunContext, _: &SkipReason) -> Result<(), TaskError> {
        self.env.reporter.emit(Event::SuiteEnd {
            suite: self.path.clone(),
        });
        Ok(())
    }
}
