//! Fixture resolution and concurrent task scheduling for a test runner.
//!
//! A run takes a forest of [`tree::Suite`]s and a [`fixture::FixtureRegistry`],
//! builds one task per lifecycle step, and executes the tasks on a bounded
//! worker pool through [`task::run_tasks`].

pub mod catalog;
pub mod cli;
pub mod fixture;
pub mod graph;
pub mod runner;
pub mod task;
pub mod tree;

pub use fixture::{Fixture, FixtureArgs, FixtureError, FixtureRegistry, Provided, Scope};
pub use runner::{RunConfig, RunError, RunResult, TestRunner};
pub use tree::{CallContext, CallError, CallResult, Suite, Test};
