use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use super::{SchedulerError, SkipReason, Task, TaskError, TaskGraph, TaskId, TaskState, WorkerId};

/// Skip reason used when the interruption flag is raised.
pub const INTERRUPTED: &str = "all tests have been interrupted by the user";

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_parallelism: usize,
    /// Raised from outside to abort all unstarted work and return
    /// [`SchedulerError::Interrupted`].
    pub interrupt: Option<Arc<AtomicBool>>,
}

impl SchedulerOptions {
    pub fn new(max_parallelism: usize) -> Self {
        Self {
            max_parallelism,
            interrupt: None,
        }
    }

    pub fn with_interrupt(mut self, flag: Option<Arc<AtomicBool>>) -> Self {
        self.interrupt = flag;
        self
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::new(1)
    }
}

/// A task that just finished running, as shown to the watchdog.
#[derive(Debug, Clone)]
pub struct CompletedTask {
    pub id: TaskId,
    pub label: String,
    pub state: TaskState,
}

/// Execute every task of `graph` on a pool of `max_parallelism` workers.
///
/// Returns the terminal state of each task, indexed by [`TaskId::index`].
/// `watchdog` is called on the scheduling thread after each completion; a
/// returned reason skips every task not yet started.
pub fn run_tasks<C, W>(
    graph: &TaskGraph<C>,
    context: &C,
    options: &SchedulerOptions,
    watchdog: W,
) -> Result<Vec<TaskState>, SchedulerError>
where
    C: Sync + ?Sized,
    W: FnMut(&CompletedTask) -> Option<String>,
{
    if options.max_parallelism == 0 {
        return Err(SchedulerError::InvalidParallelism);
    }
    graph.check_dependencies()?;

    info!(
        tasks = graph.len(),
        workers = options.max_parallelism,
        "starting task execution"
    );

    let mut run = Run::new(graph, context, watchdog);

    let workers = options.max_parallelism.min(graph.len().max(1));

    thread::scope(|scope| {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<TaskId>();
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<(TaskId, Result<(), TaskError>)>();

        for index in 0..workers {
            let jobs = job_rx.clone();
            let done = done_tx.clone();
            let worker = WorkerId::new(index);
            scope.spawn(move || {
                for id in jobs.iter() {
                    let result = execute(graph.task(id), context, worker);
                    if done.send((id, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(done_tx);

        loop {
            run.settle();
            run.dispatch(&job_tx, workers);

            if run.running == 0 {
                if !run.all_terminal() {
                    run.strand_remaining();
                }
                break;
            }

            match done_rx.recv_timeout(POLL_INTERVAL) {
                Ok((id, result)) => run.complete(id, result),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    run.errors.push("worker pool stopped unexpectedly".to_string());
                    run.strand_remaining();
                    break;
                }
            }

            if options.interrupted() && !run.interrupted {
                warn!("task execution interrupted");
                run.interrupted = true;
                run.abort(INTERRUPTED.to_string());
            }
        }
        drop(job_tx);
    });

    if run.interrupted {
        return Err(SchedulerError::Interrupted(INTERRUPTED.to_string()));
    }
    if !run.errors.is_empty() {
        return Err(SchedulerError::TasksExecutionFailure(run.errors));
    }
    debug!("task execution finished");
    Ok(run.states)
}

struct Run<'a, C: ?Sized, W> {
    graph: &'a TaskGraph<C>,
    context: &'a C,
    watchdog: W,
    states: Vec<TaskState>,
    /// Reason each inline-skipped task was skipped, inherited by dependents.
    skip_reasons: Vec<Option<SkipReason>>,
    abort: Option<String>,
    interrupted: bool,
    running: usize,
    errors: Vec<String>,
}

impl<'a, C, W> Run<'a, C, W>
where
    C: ?Sized,
    W: FnMut(&CompletedTask) -> Option<String>,
{
    fn new(graph: &'a TaskGraph<C>, context: &'a C, watchdog: W) -> Self {
        Self {
            graph,
            context,
            watchdog,
            states: vec![TaskState::Pending; graph.len()],
            skip_reasons: vec![None; graph.len()],
            abort: None,
            interrupted: false,
            running: 0,
            errors: Vec::new(),
        }
    }

    fn state(&self, id: TaskId) -> TaskState {
        self.states[id.index()]
    }

    fn all_terminal(&self) -> bool {
        self.states.iter().all(|s| s.is_terminal())
    }

    fn dependencies_terminal(&self, id: TaskId) -> bool {
        self.graph
            .dependencies(id)
            .all(|dep| self.state(dep).is_terminal())
    }

    fn abort(&mut self, reason: String) {
        if self.abort.is_none() {
            info!(%reason, "aborting all tasks not yet started");
            self.abort = Some(reason);
        }
    }

    /// Skip, on this thread, every pending task whose dependencies are all
    /// terminal and that can no longer run. Repeats until nothing changes,
    /// since a skip may settle further dependents.
    fn settle(&mut self) {
        loop {
            let mut progressed = false;
            for id in self.graph.ids() {
                if self.state(id) != TaskState::Pending || !self.dependencies_terminal(id) {
                    continue;
                }
                if let Some(reason) = self.skip_reason(id) {
                    self.skip(id, reason);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn skip_reason(&self, id: TaskId) -> Option<SkipReason> {
        let blocker = self
            .graph
            .success_deps(id)
            .iter()
            .copied()
            .find(|dep| self.state(*dep) != TaskState::Succeeded);
        match blocker {
            Some(dep) => Some(
                self.skip_reasons[dep.index()]
                    .clone()
                    .unwrap_or_else(|| SkipReason::Dependency {
                        task: self.graph.label(dep),
                    }),
            ),
            None => self.abort.clone().map(SkipReason::Aborted),
        }
    }

    fn skip(&mut self, id: TaskId, reason: SkipReason) {
        let task = self.graph.task(id);
        debug!(task = %task.label(), %reason, "skipping task");
        self.states[id.index()] = TaskState::Skipped;
        let result = catch_unwind(AssertUnwindSafe(|| task.skip(self.context, &reason)))
            .unwrap_or_else(|payload| Err(TaskError::Unexpected(panic_message(payload))));
        if let Err(e) = result {
            error!(task = %task.label(), error = %e, "task skip failed");
            self.errors.push(format!("{}: {e}", task.label()));
        }
        self.skip_reasons[id.index()] = Some(reason);
    }

    /// Submit runnable tasks, most dependencies first, up to the free slots.
    fn dispatch(&mut self, jobs: &Sender<TaskId>, workers: usize) {
        if self.abort.is_some() {
            return;
        }
        let mut runnable: Vec<TaskId> = self
            .graph
            .ids()
            .filter(|&id| {
                self.state(id) == TaskState::Pending
                    && self.dependencies_terminal(id)
                    && self
                        .graph
                        .success_deps(id)
                        .iter()
                        .all(|dep| self.state(*dep) == TaskState::Succeeded)
            })
            .collect();
        runnable.sort_by_key(|&id| std::cmp::Reverse(self.graph.dependencies(id).count()));

        let free = workers.saturating_sub(self.running);
        for id in runnable.into_iter().take(free) {
            debug!(task = %self.graph.label(id), "submitting task");
            if jobs.send(id).is_err() {
                self.errors
                    .push(format!("{}: could not be submitted", self.graph.label(id)));
                self.states[id.index()] = TaskState::Failed;
                continue;
            }
            self.states[id.index()] = TaskState::Running;
            self.running += 1;
        }
    }

    fn complete(&mut self, id: TaskId, result: Result<(), TaskError>) {
        self.running -= 1;
        let label = self.graph.label(id);
        let state = match result {
            Ok(()) => TaskState::Succeeded,
            Err(TaskError::Failure(failure)) => {
                debug!(task = %label, %failure, "task failed");
                TaskState::Failed
            }
            Err(TaskError::Skipped(reason)) => {
                debug!(task = %label, %reason, "task skipped itself");
                TaskState::Skipped
            }
            Err(TaskError::Unexpected(message)) => {
                error!(task = %label, %message, "unexpected task error");
                self.errors.push(format!("{label}: {message}"));
                TaskState::Failed
            }
        };
        self.states[id.index()] = state;

        let completed = CompletedTask { id, label, state };
        if let Some(reason) = (self.watchdog)(&completed) {
            self.abort(reason);
        }
    }

    /// Tasks still pending once nothing runs can never start: mark them
    /// skipped so the run terminates.
    fn strand_remaining(&mut self) {
        let reason = self
            .abort
            .clone()
            .unwrap_or_else(|| "task could not be scheduled".to_string());
        for id in self.graph.ids() {
            if !self.state(id).is_terminal() {
                self.skip(id, SkipReason::Aborted(reason.clone()));
            }
        }
    }
}

fn execute<C: ?Sized>(task: &dyn Task<C>, context: &C, worker: WorkerId) -> Result<(), TaskError> {
    catch_unwind(AssertUnwindSafe(|| task.run(context, worker)))
        .unwrap_or_else(|payload| Err(TaskError::Unexpected(panic_message(payload))))
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Journal {
        entries: Mutex<Vec<String>>,
    }

    impl Journal {
        fn push(&self, entry: String) {
            self.entries.lock().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.entries.lock().clone()
        }
    }

    enum Behavior {
        Pass,
        Fail,
        Panic,
    }

    struct Mock {
        name: &'static str,
        behavior: Behavior,
    }

    impl Mock {
        fn pass(name: &'static str) -> Self {
            Self {
                name,
                behavior: Behavior::Pass,
            }
        }

        fn fail(name: &'static str) -> Self {
            Self {
                name,
                behavior: Behavior::Fail,
            }
        }
    }

    impl Task<Journal> for Mock {
        fn label(&self) -> String {
            self.name.to_string()
        }

        fn run(&self, journal: &Journal, _: WorkerId) -> Result<(), TaskError> {
            journal.push(format!("run {}", self.name));
            match self.behavior {
                Behavior::Pass => Ok(()),
                Behavior::Fail => Err(TaskError::failure("failed")),
                Behavior::Panic => panic!("boom"),
            }
        }

        fn skip(&self, journal: &Journal, reason: &SkipReason) -> Result<(), TaskError> {
            journal.push(format!("skip {}: {reason}", self.name));
            Ok(())
        }
    }

    fn run(graph: &TaskGraph<Journal>, journal: &Journal) -> Vec<TaskState> {
        run_tasks(graph, journal, &SchedulerOptions::default(), |_| None).unwrap()
    }

    #[test]
    fn runs_in_dependency_order() {
        let mut graph = TaskGraph::new();
        let a = graph.add(Mock::pass("a"));
        let b = graph.add(Mock::pass("b"));
        let c = graph.add(Mock::pass("c"));
        graph.depends_on_success(c, b);
        graph.depends_on_success(b, a);
        let journal = Journal::default();
        let states = run(&graph, &journal);
        assert_eq!(journal.entries(), vec!["run a", "run b", "run c"]);
        assert!(states.iter().all(|s| *s == TaskState::Succeeded));
    }

    #[test]
    fn failure_skips_success_dependents_transitively() {
        let mut graph = TaskGraph::new();
        let a = graph.add(Mock::fail("a"));
        let b = graph.add(Mock::pass("b"));
        let c = graph.add(Mock::pass("c"));
        graph.depends_on_success(b, a);
        graph.depends_on_success(c, b);
        let journal = Journal::default();
        let states = run(&graph, &journal);
        assert_eq!(
            states,
            vec![TaskState::Failed, TaskState::Skipped, TaskState::Skipped]
        );
        assert_eq!(
            journal.entries(),
            vec!["run a", "skip b: a did not succeed", "skip c: a did not succeed"]
        );
    }

    #[test]
    fn completion_dependency_runs_after_failure() {
        let mut graph = TaskGraph::new();
        let a = graph.add(Mock::fail("a"));
        let cleanup = graph.add(Mock::pass("cleanup"));
        graph.depends_on_completion(cleanup, a);
        let journal = Journal::default();
        let states = run(&graph, &journal);
        assert_eq!(states, vec![TaskState::Failed, TaskState::Succeeded]);
    }

    #[test]
    fn most_dependencies_run_first() {
        let mut graph = TaskGraph::new();
        let root = graph.add(Mock::pass("root"));
        let other = graph.add(Mock::pass("other"));
        let few = graph.add(Mock::pass("few"));
        let many = graph.add(Mock::pass("many"));
        graph.depends_on_success(few, root);
        graph.depends_on_success(many, root);
        graph.depends_on_completion(many, other);
        graph.depends_on_completion(other, root);
        let journal = Journal::default();
        run(&graph, &journal);
        assert_eq!(
            journal.entries(),
            vec!["run root", "run other", "run many", "run few"]
        );
    }

    #[test]
    fn watchdog_aborts_unstarted_tasks() {
        let mut graph = TaskGraph::new();
        graph.add(Mock::fail("a"));
        graph.add(Mock::pass("b"));
        let journal = Journal::default();
        let states = run_tasks(&graph, &journal, &SchedulerOptions::default(), |done| {
            (done.state == TaskState::Failed).then(|| "stop".to_string())
        })
        .unwrap();
        assert_eq!(states, vec![TaskState::Failed, TaskState::Skipped]);
        assert_eq!(journal.entries(), vec!["run a", "skip b: stop"]);
    }

    #[test]
    fn panics_are_aggregated() {
        let mut graph = TaskGraph::new();
        graph.add(Mock {
            name: "bad",
            behavior: Behavior::Panic,
        });
        graph.add(Mock::pass("good"));
        let journal = Journal::default();
        let err = run_tasks(&graph, &journal, &SchedulerOptions::default(), |_| None).unwrap_err();
        match err {
            SchedulerError::TasksExecutionFailure(errors) => {
                assert_eq!(errors, vec!["bad: panicked: boom".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(journal.entries().contains(&"run good".to_string()));
    }

    #[test]
    fn cycle_is_rejected_before_running() {
        let mut graph = TaskGraph::new();
        let a = graph.add(Mock::pass("a"));
        let b = graph.add(Mock::pass("b"));
        graph.depends_on_success(a, b);
        graph.depends_on_completion(b, a);
        let journal = Journal::default();
        let err = run_tasks(&graph, &journal, &SchedulerOptions::default(), |_| None).unwrap_err();
        assert!(matches!(err, SchedulerError::CircularDependency(_)));
        assert!(journal.entries().is_empty());
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let graph = TaskGraph::<Journal>::new();
        let journal = Journal::default();
        let err = run_tasks(&graph, &journal, &SchedulerOptions::new(0), |_| None).unwrap_err();
        assert_eq!(err, SchedulerError::InvalidParallelism);
    }

    #[test]
    fn empty_graph_completes() {
        let graph = TaskGraph::<Journal>::new();
        let journal = Journal::default();
        assert!(run(&graph, &journal).is_empty());
    }

    #[test]
    fn raised_interrupt_skips_everything() {
        let mut graph = TaskGraph::new();
        let a = graph.add(Mock::pass("a"));
        let b = graph.add(Mock::pass("b"));
        graph.depends_on_success(b, a);
        let flag = Arc::new(AtomicBool::new(true));
        let journal = Journal::default();
        let options = SchedulerOptions::new(1).with_interrupt(Some(flag));
        let err = run_tasks(&graph, &journal, &options, |_| None).unwrap_err();
        assert_eq!(err, SchedulerError::Interrupted(INTERRUPTED.to_string()));
        assert_eq!(
            journal.entries(),
            vec!["run a".to_string(), format!("skip b: {INTERRUPTED}")]
        );
    }
}
