//! The test tree: suites, tests, hooks, and the contract of user callables.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::fixture::FixtureArgs;
use crate::fixture::registry::push_unique;
use crate::runner::events::{Location, LogLevel};
use crate::runner::reporter::Reporter;
use crate::task::WorkerId;

/// How a user callable ends when it does not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The callable failed; the failure is logged at its location.
    #[error("{0}")]
    Failed(String),
    /// Abort the remaining tests of the enclosing suite.
    #[error("{0}")]
    AbortSuite(String),
    /// Abort every remaining test of the run.
    #[error("{0}")]
    AbortRun(String),
}

impl CallError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn abort_suite(message: impl Into<String>) -> Self {
        Self::AbortSuite(message.into())
    }

    pub fn abort_run(message: impl Into<String>) -> Self {
        Self::AbortRun(message.into())
    }
}

pub type CallResult = Result<(), CallError>;

/// What a test, hook, or fixture sees while it runs.
pub struct CallContext<'a> {
    args: FixtureArgs,
    worker: WorkerId,
    location: &'a Location,
    reporter: &'a Reporter,
}

impl<'a> CallContext<'a> {
    pub(crate) fn new(
        args: FixtureArgs,
        worker: WorkerId,
        location: &'a Location,
        reporter: &'a Reporter,
    ) -> Self {
        Self {
            args,
            worker,
            location,
            reporter,
        }
    }

    /// Fixture value bound to parameter `name`.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, CallError> {
        self.args.get(name)
    }

    pub fn args(&self) -> &FixtureArgs {
        &self.args
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn location(&self) -> &Location {
        self.location
    }

    pub fn log_info(&self, message: impl Into<String>) {
        self.reporter
            .log(self.location, LogLevel::Info, message.into());
    }

    pub fn log_warn(&self, message: impl Into<String>) {
        self.reporter
            .log(self.location, LogLevel::Warn, message.into());
    }

    /// Log an error; this marks the current location as failed.
    pub fn log_error(&self, message: impl Into<String>) {
        self.reporter
            .log(self.location, LogLevel::Error, message.into());
    }
}

pub type Callable = Arc<dyn Fn(&CallContext<'_>) -> CallResult + Send + Sync>;

/// Per-test hooks receive the name of the test they wrap.
pub type TestHook = Arc<dyn Fn(&CallContext<'_>, &str) -> CallResult + Send + Sync>;

/// Suite-level setup or teardown callable.
#[derive(Clone)]
pub struct Hook {
    pub params: Vec<String>,
    func: Callable,
}

impl Hook {
    pub fn new<P, F>(params: P, func: F) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        F: Fn(&CallContext<'_>) -> CallResult + Send + Sync + 'static,
    {
        Self {
            params: params.into_iter().map(Into::into).collect(),
            func: Arc::new(func),
        }
    }

    pub fn call(&self, ctx: &CallContext<'_>) -> CallResult {
        (self.func)(ctx)
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct Test {
    pub name: String,
    pub description: Option<String>,
    /// Fixture names the test function takes.
    pub params: Vec<String>,
    /// Paths of tests that must pass before this one runs.
    pub depends_on: Vec<String>,
    pub disabled: bool,
    path: String,
    func: Callable,
}

impl Test {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&CallContext<'_>) -> CallResult + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            path: name.clone(),
            name,
            description: None,
            params: Vec::new(),
            depends_on: Vec::new(),
            disabled: false,
            func: Arc::new(func),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_params<P>(mut self, params: P) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
    {
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    pub fn with_dependencies<P>(mut self, paths: P) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
    {
        self.depends_on.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Dotted path from the top-level suite, e.g. `suite.sub.test`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn call(&self, ctx: &CallContext<'_>) -> CallResult {
        (self.func)(ctx)
    }
}

impl fmt::Debug for Test {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Test")
            .field("path", &self.path)
            .field("params", &self.params)
            .field("depends_on", &self.depends_on)
            .field("disabled", &self.disabled)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct Suite {
    pub name: String,
    pub description: Option<String>,
    /// Fixtures bound into every test of the suite without being test params.
    pub inject: Vec<String>,
    path: String,
    tests: Vec<Test>,
    suites: Vec<Suite>,
    setup_suite: Option<Hook>,
    teardown_suite: Option<Hook>,
    setup_test: Option<TestHook>,
    teardown_test: Option<TestHook>,
}

impl Suite {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            path: name.clone(),
            name,
            description: None,
            inject: Vec::new(),
            tests: Vec::new(),
            suites: Vec::new(),
            setup_suite: None,
            teardown_suite: None,
            setup_test: None,
            teardown_test: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_inject<P>(mut self, names: P) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
    {
        self.inject.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_test(mut self, mut test: Test) -> Self {
        test.path = format!("{}.{}", self.path, test.name);
        self.tests.push(test);
        self
    }

    pub fn with_suite(mut self, mut suite: Suite) -> Self {
        suite.rebase(&self.path);
        self.suites.push(suite);
        self
    }

    pub fn with_setup_suite<P, F>(mut self, params: P, func: F) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        F: Fn(&CallContext<'_>) -> CallResult + Send + Sync + 'static,
    {
        self.setup_suite = Some(Hook::new(params, func));
        self
    }

    pub fn with_teardown_suite<F>(mut self, func: F) -> Self
    where
        F: Fn(&CallContext<'_>) -> CallResult + Send + Sync + 'static,
    {
        self.teardown_suite = Some(Hook::new(Vec::<String>::new(), func));
        self
    }

    pub fn with_setup_test<F>(mut self, func: F) -> Self
    where
        F: Fn(&CallContext<'_>, &str) -> CallResult + Send + Sync + 'static,
    {
        self.setup_test = Some(Arc::new(func));
        self
    }

    pub fn with_teardown_test<F>(mut self, func: F) -> Self
    where
        F: Fn(&CallContext<'_>, &str) -> CallResult + Send + Sync + 'static,
    {
        self.teardown_test = Some(Arc::new(func));
        self
    }

    fn rebase(&mut self, parent: &str) {
        self.path = format!("{parent}.{}", self.name);
        for test in &mut self.tests {
            test.path = format!("{}.{}", self.path, test.name);
        }
        let path = self.path.clone();
        for sub in &mut self.suites {
            sub.rebase(&path);
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tests(&self) -> &[Test] {
        &self.tests
    }

    pub fn suites(&self) -> &[Suite] {
        &self.suites
    }

    pub fn setup_suite(&self) -> Option<&Hook> {
        self.setup_suite.as_ref()
    }

    pub fn teardown_suite(&self) -> Option<&Hook> {
        self.teardown_suite.as_ref()
    }

    pub fn setup_test(&self) -> Option<&TestHook> {
        self.setup_test.as_ref()
    }

    pub fn teardown_test(&self) -> Option<&TestHook> {
        self.teardown_test.as_ref()
    }

    /// Fixtures used at suite level: setup hook params, then injected names.
    pub fn suite_fixtures(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(hook) = &self.setup_suite {
            for param in &hook.params {
                push_unique(&mut names, param.clone());
            }
        }
        for name in &self.inject {
            push_unique(&mut names, name.clone());
        }
        names
    }

    /// Fixtures used at this level: suite fixtures then test params.
    pub fn level_fixtures(&self, include_disabled: bool) -> Vec<String> {
        let mut names = self.suite_fixtures();
        for test in self
            .tests
            .iter()
            .filter(|t| include_disabled || !t.disabled)
        {
            for param in &test.params {
                push_unique(&mut names, param.clone());
            }
        }
        names
    }

    /// Fixtures used at this level and in every sub-suite.
    pub fn fixtures_used(&self, include_disabled: bool) -> Vec<String> {
        let mut names = self.level_fixtures(include_disabled);
        for sub in &self.suites {
            for name in sub.fixtures_used(include_disabled) {
                push_unique(&mut names, name);
            }
        }
        names
    }

    /// Every test of this suite and its sub-suites, depth first.
    pub fn all_tests(&self) -> Vec<&Test> {
        let mut tests: Vec<&Test> = self.tests.iter().collect();
        for sub in &self.suites {
            tests.extend(sub.all_tests());
        }
        tests
    }

    pub fn find_test(&self, path: &str) -> Option<&Test> {
        self.all_tests().into_iter().find(|t| t.path == path)
    }
}

impl fmt::Debug for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suite")
            .field("path", &self.path)
            .field("inject", &self.inject)
            .field("tests", &self.tests)
            .field("suites", &self.suites)
            .field("setup_suite", &self.setup_suite)
            .field("teardown_suite", &self.teardown_suite)
            .field("setup_test", &self.setup_test.is_some())
            .field("teardown_test", &self.teardown_test.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &CallContext<'_>) -> CallResult {
        Ok(())
    }

    #[test]
    fn paths_follow_nesting() {
        let suite = Suite::new("outer")
            .with_test(Test::new("t1", noop))
            .with_suite(
                Suite::new("inner")
                    .with_test(Test::new("t2", noop))
                    .with_suite(Suite::new("deep").with_test(Test::new("t3", noop))),
            );
        let paths: Vec<&str> = suite.all_tests().iter().map(|t| t.path()).collect();
        assert_eq!(paths, vec!["outer.t1", "outer.inner.t2", "outer.inner.deep.t3"]);
        assert_eq!(suite.suites()[0].suites()[0].path(), "outer.inner.deep");
        assert!(suite.find_test("outer.inner.t2").is_some());
        assert!(suite.find_test("inner.t2").is_none());
    }

    #[test]
    fn level_fixtures_skip_disabled_tests_unless_asked() {
        let suite = Suite::new("s")
            .with_setup_suite(["db"], noop)
            .with_inject(["cache", "db"])
            .with_test(Test::new("t1", noop).with_params(["user", "db"]))
            .with_test(Test::new("t2", noop).with_params(["tmp"]).disabled());
        assert_eq!(suite.suite_fixtures(), vec!["db", "cache"]);
        assert_eq!(suite.level_fixtures(false), vec!["db", "cache", "user"]);
        assert_eq!(suite.level_fixtures(true), vec!["db", "cache", "user", "tmp"]);
    }

    #[test]
    fn call_error_messages() {
        assert_eq!(CallError::failed("boom").to_string(), "boom");
        assert_eq!(
            CallError::abort_suite("stop"),
            CallError::AbortSuite("stop".into())
        );
    }
}
