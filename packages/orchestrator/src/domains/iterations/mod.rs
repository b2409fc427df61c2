//! Iterations: one provider run per page range of a session.

pub mod executor;
pub mod fetch;

pub use executor::{ExecutorConfig, IterationExecutor, IterationReport};
pub use fetch::{drain_run, Drained, RunCursor};
