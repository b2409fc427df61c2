pub mod checkpoint;
pub mod iteration;
pub mod record;
pub mod session;

pub use checkpoint::RunCheckpoint;
pub use iteration::{Iteration, IterationStatus};
pub use record::ResultRecord;
pub use session::{Session, SessionStatus};
