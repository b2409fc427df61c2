//! Session actions - operator-facing operations and the control loop

mod cancel_session;
mod control_loop;
mod create_session;
mod export;
mod progress;

pub use cancel_session::cancel_session;
pub use control_loop::{ControlLoopConfig, CycleSummary, SessionControlLoop, SessionStep};
pub use create_session::{create_session, CreateSession};
pub use export::export_session;
pub use progress::{format_eta, get_progress, IterationProgress, SessionProgress};
