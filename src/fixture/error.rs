use thiserror::Error;

/// Errors raised by the fixture registry and scheduled fixture sets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FixtureError {
    /// The registry or a consumer of it is invalid.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    /// No scope instance in the chain owns the requested fixture.
    #[error("lookup error: {0}")]
    Lookup(String),
    /// A setup/teardown call arrived in the wrong lifecycle state.
    #[error("internal error: {0}")]
    Internal(String),
    /// The provider reported a failure.
    #[error("fixture '{fixture}' setup failed: {message}")]
    Setup { fixture: String, message: String },
    /// The release action reported a failure.
    #[error("fixture '{fixture}' teardown failed: {message}")]
    Teardown { fixture: String, message: String },
}
