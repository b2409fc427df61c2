//! Recovery domain: deciding when a provider run needs a recovery run,
//! starting it, and the project-wide monitor that watches for stalls.

pub mod detector;
pub mod models;
pub mod monitor;
pub mod policy;

pub use detector::{RecoveryDecision, RecoveryDetector, RecoveryRequest};
pub use models::{RecoveryOperation, RecoveryReason, RecoveryStatus};
pub use monitor::{MonitorAction, MonitoringStatus, ProjectCheck, ProjectMonitor};
pub use policy::{RecoveryPolicy, RunObservation, SuspicionPolicy};
