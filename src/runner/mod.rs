pub mod context;
pub mod display;
pub mod error;
pub mod events;
pub mod executor;
pub mod reporter;
pub mod result;
pub(crate) mod steps;
pub mod tasks;

pub use error::RunError;
pub use events::{Event, EventLog, EventSink, Location, LogLevel, TracingSink};
pub use executor::{RunConfig, TestRunner};
pub use result::{RunResult, RunSummary, TestRecord, TestStatus};
