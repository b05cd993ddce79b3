use thiserror::Error;

/// An expected, ordinary task failure: its dependents are skipped, nothing
/// more.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TaskFailure {
    message: String,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// What a task's `run` or `skip` reports when it does not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error(transparent)]
    Failure(#[from] TaskFailure),
    /// The task declined to run; its dependents are skipped too.
    #[error("skipped: {0}")]
    Skipped(String),
    /// Anything else, including panics; aggregated after the run.
    #[error("{0}")]
    Unexpected(String),
}

impl TaskError {
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(TaskFailure::new(message))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("circular dependency between tasks: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),
    #[error("unexpected errors during task execution:\n{}", .0.join("\n"))]
    TasksExecutionFailure(Vec<String>),
    #[error("{0}")]
    Interrupted(String),
    #[error("max_parallelism must be at least 1")]
    InvalidParallelism,
}
