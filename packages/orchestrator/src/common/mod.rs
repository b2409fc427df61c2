pub mod entity_ids;
pub mod error;
pub mod id;

pub use entity_ids::*;
pub use error::{OrchestratorError, Result};
