//! Task model: units of work with success- and completion-gated
//! dependencies.

pub mod scheduler;

mod error;

use std::fmt;

use crate::graph::analysis::{find_cycle, has_cycle};
use crate::graph::builder::{self, DependencyGraph};

pub use error::{SchedulerError, TaskError, TaskFailure};
pub use scheduler::{CompletedTask, SchedulerOptions, run_tasks};

/// Identifies the thread a task or fixture runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(usize);

impl WorkerId {
    /// The thread driving the run itself (pre-run fixtures, scheduling loop).
    pub const MAIN: WorkerId = WorkerId(usize::MAX);

    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::MAIN {
            write!(f, "main")
        } else {
            write!(f, "worker-{}", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(usize);

impl TaskId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Why the scheduler skipped a task instead of running it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A success-gated dependency failed or was skipped.
    Dependency { task: String },
    /// The watchdog or an interruption aborted all unstarted work.
    Aborted(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dependency { task } => write!(f, "{task} did not succeed"),
            Self::Aborted(reason) => write!(f, "{reason}"),
        }
    }
}

/// A schedulable unit of work run against a shared context `C`.
pub trait Task<C: ?Sized>: Send + Sync {
    /// Human-readable name, used in skip reasons and error reports.
    fn label(&self) -> String;

    fn run(&self, context: &C, worker: WorkerId) -> Result<(), TaskError>;

    /// Called on the scheduling thread in place of `run`.
    fn skip(&self, _context: &C, _reason: &SkipReason) -> Result<(), TaskError> {
        Ok(())
    }
}

struct TaskNode<C: ?Sized> {
    task: Box<dyn Task<C>>,
    success_deps: Vec<TaskId>,
    completion_deps: Vec<TaskId>,
}

/// The tasks of one run and the dependencies between them.
pub struct TaskGraph<C: ?Sized> {
    nodes: Vec<TaskNode<C>>,
}

impl<C: ?Sized> Default for TaskGraph<C> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

impl<C: ?Sized> TaskGraph<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<T: Task<C> + 'static>(&mut self, task: T) -> TaskId {
        self.nodes.push(TaskNode {
            task: Box::new(task),
            success_deps: Vec::new(),
            completion_deps: Vec::new(),
        });
        TaskId(self.nodes.len() - 1)
    }

    /// `task` runs only if `dependency` succeeds.
    ///
    /// # Panics
    ///
    /// Panics if `task` was not created by this graph.
    pub fn depends_on_success(&mut self, task: TaskId, dependency: TaskId) {
        let deps = &mut self.nodes[task.0].success_deps;
        if !deps.contains(&dependency) {
            deps.push(dependency);
        }
    }

    /// `task` waits for `dependency` to finish, whatever its outcome.
    ///
    /// # Panics
    ///
    /// Panics if `task` was not created by this graph.
    pub fn depends_on_completion(&mut self, task: TaskId, dependency: TaskId) {
        let deps = &mut self.nodes[task.0].completion_deps;
        if !deps.contains(&dependency) {
            deps.push(dependency);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = TaskId> + use<C> {
        (0..self.nodes.len()).map(TaskId)
    }

    pub fn task(&self, id: TaskId) -> &dyn Task<C> {
        self.nodes[id.0].task.as_ref()
    }

    pub fn label(&self, id: TaskId) -> String {
        self.nodes[id.0].task.label()
    }

    pub fn success_deps(&self, id: TaskId) -> &[TaskId] {
        &self.nodes[id.0].success_deps
    }

    pub fn completion_deps(&self, id: TaskId) -> &[TaskId] {
        &self.nodes[id.0].completion_deps
    }

    /// Both kinds of dependency.
    pub fn dependencies(&self, id: TaskId) -> impl Iterator<Item = TaskId> + '_ {
        let node = &self.nodes[id.0];
        node.success_deps
            .iter()
            .chain(node.completion_deps.iter())
            .copied()
    }

    /// The dependency graph over task labels, both edge kinds included.
    pub fn dependency_graph(&self) -> DependencyGraph {
        let labels = self.nodes.iter().map(|n| n.task.label());
        let edges = self.ids().flat_map(|id| {
            self.dependencies(id)
                .map(move |dep| (id.0, dep.0))
                .collect::<Vec<_>>()
        });
        builder::build(labels, edges)
    }

    /// Fail if the tasks' dependencies, of either kind, form a cycle.
    pub fn check_dependencies(&self) -> Result<(), SchedulerError> {
        let dg = self.dependency_graph();
        if has_cycle(&dg) {
            return Err(SchedulerError::CircularDependency(
                find_cycle(&dg).unwrap_or_default(),
            ));
        }
        Ok(())
    }
}
