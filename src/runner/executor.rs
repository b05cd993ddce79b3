use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::fixture::{FixtureRegistry, ScheduledFixtures};
use crate::runner::context::RunContext;
use crate::runner::error::RunError;
use crate::runner::events::{Event, EventSink, TracingSink};
use crate::runner::reporter::Reporter;
use crate::runner::result::{RunResult, RunSummary};
use crate::runner::steps::{Teardown, fixture_error, guarded};
use crate::runner::tasks::{TaskEnv, build_tasks};
use crate::task::{SchedulerOptions, TaskState, WorkerId, run_tasks};
use crate::tree::Suite;

/// Configuration for a test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Number of worker threads (1 = sequential).
    pub max_parallelism: usize,
    /// Abort the remaining tests after the first failure.
    pub stop_on_failure: bool,
    /// Run disabled tests as if they were enabled.
    pub force_disabled: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 1,
            stop_on_failure: false,
            force_disabled: false,
        }
    }
}

impl RunConfig {
    /// Parse a YAML mapping; missing keys take their default.
    pub fn from_yaml_str(source: &str) -> Result<Self, RunError> {
        let config: Self =
            serde_yaml::from_str(source).map_err(|e| RunError::InvalidConfig(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    pub fn check(&self) -> Result<(), RunError> {
        if self.max_parallelism == 0 {
            return Err(RunError::InvalidConfig(
                "max_parallelism must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// The main test runner. Sets up pre-run fixtures, builds the task graph
/// and runs it on the worker pool, then collects the results.
pub struct TestRunner {
    config: RunConfig,
    sink: Arc<dyn EventSink>,
    interrupt: Option<Arc<AtomicBool>>,
}

impl TestRunner {
    /// Create a runner that reports lifecycle events through `tracing`.
    pub fn new(config: RunConfig) -> Self {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    /// Create a runner with an explicit event sink (useful for testing).
    pub fn with_sink(config: RunConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            sink,
            interrupt: None,
        }
    }

    /// Abort every task not yet started once `flag` is raised.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Execute the suites. This is the primary entry point.
    ///
    /// 1. Validate the registry and the fixtures used by the suites
    /// 2. Set up pre-run fixtures on the calling thread
    /// 3. Build and run the task graph
    /// 4. Tear down pre-run fixtures
    /// 5. Collect and return results
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] if validation fails, a pre-run fixture fails,
    /// or task execution ends abnormally.
    pub fn run(&self, suites: &[Suite], registry: FixtureRegistry) -> Result<RunResult, RunError> {
        let start = Instant::now();
        self.config.check()?;

        // 1. Validate
        registry.validate()?;
        registry.check_fixtures_in_suites(suites)?;
        let registry = Arc::new(registry);
        let reporter = Arc::new(Reporter::new(Arc::clone(&self.sink)));

        // 2. Pre-run fixtures
        let pre_run = registry.scheduled_for_pre_run(suites, self.config.force_disabled)?;
        let pre_run_teardowns = setup_pre_run(&pre_run)?;

        // 3. Task graph
        let outcome = self.execute(suites, &registry, &reporter, &pre_run);

        // 4. Pre-run teardown
        let teardown_errors = teardown_pre_run(pre_run_teardowns);
        outcome?;
        if !teardown_errors.is_empty() {
            return Err(RunError::PreRun(teardown_errors));
        }

        // 5. Build result
        let tests = reporter.records();
        let summary = RunSummary::from_records(&tests);
        let result = RunResult {
            duration: start.elapsed(),
            tests,
            summary,
            failed_locations: reporter.failed_setup_locations(),
        };
        info!(
            passed = result.summary.passed,
            failed = result.summary.failed,
            skipped = result.summary.skipped,
            "run finished"
        );
        Ok(result)
    }

    fn execute(
        &self,
        suites: &[Suite],
        registry: &Arc<FixtureRegistry>,
        reporter: &Arc<Reporter>,
        pre_run: &Arc<ScheduledFixtures>,
    ) -> Result<(), RunError> {
        let session =
            registry.scheduled_for_session(suites, pre_run, self.config.force_disabled)?;
        let env = Arc::new(TaskEnv {
            registry: Arc::clone(registry),
            reporter: Arc::clone(reporter),
            force_disabled: self.config.force_disabled,
        });
        let graph = build_tasks(suites, &env, &session)?;

        let context = RunContext::new(self.config.stop_on_failure);
        let options = SchedulerOptions::new(self.config.max_parallelism)
            .with_interrupt(self.interrupt.clone());

        reporter.emit(Event::RunStart);
        let states = run_tasks(&graph, &context, &options, |_| context.run_abort_reason());
        reporter.emit(Event::RunEnd);

        let states = states?;
        let failed = states.iter().filter(|s| **s == TaskState::Failed).count();
        debug!(tasks = states.len(), failed, "task graph completed");
        Ok(())
    }
}

/// Set up every pre-run fixture in order. On failure, tear down those
/// already set up and report everything that went wrong.
fn setup_pre_run(pre_run: &Arc<ScheduledFixtures>) -> Result<Vec<Teardown>, RunError> {
    let mut teardowns: Vec<Teardown> = Vec::new();
    for pair in pre_run.setup_teardown_pairs() {
        let name = pair.name().to_owned();
        if let Err(e) = guarded(|| pair.setup(WorkerId::MAIN).map_err(fixture_error)) {
            warn!(fixture = %name, error = %e, "pre-run fixture failed");
            let mut errors = vec![e.to_string()];
            errors.extend(teardown_pre_run(teardowns));
            return Err(RunError::PreRun(errors));
        }
        teardowns.push(Box::new(move || pair.teardown().map_err(fixture_error)));
    }
    Ok(teardowns)
}

fn teardown_pre_run(teardowns: Vec<Teardown>) -> Vec<String> {
    teardowns
        .into_iter()
        .rev()
        .filter_map(|teardown| guarded(teardown).err())
        .map(|e| e.to_string())
        .collect()
}
