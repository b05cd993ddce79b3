use thiserror::Error;

use crate::fixture::FixtureError;
use crate::runner::tasks::ValidationError;
use crate::task::SchedulerError;

/// Error from the runner orchestration layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Fixture(#[from] FixtureError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("pre-run fixtures failed:\n{}", .0.join("\n"))]
    PreRun(Vec<String>),
}
