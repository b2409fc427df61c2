pub mod recovery_operation;

pub use recovery_operation::{RecoveryOperation, RecoveryReason, RecoveryStatus};
