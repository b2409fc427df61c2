//! Kernel module - infrastructure traits and dependencies.

pub mod deps;
pub mod test_dependencies;
pub mod traits;

pub use deps::{OrchestratorDeps, ParseHubAdapter};
pub use test_dependencies::MockScrapingProvider;
pub use traits::*;
