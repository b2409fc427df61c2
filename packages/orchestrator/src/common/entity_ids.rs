//! Typed ids for every persisted entity.

pub use super::id::Id;

/// Marker type for scraping sessions (campaigns).
pub struct Session;

/// Marker type for iterations (one provider run per page range).
pub struct Iteration;

/// Marker type for stall-recovery operations.
pub struct RecoveryOperation;

/// Marker type for deduplicated result records.
pub struct ResultRecord;

pub type SessionId = Id<Session>;

pub type IterationId = Id<Iteration>;

pub type RecoveryOperationId = Id<RecoveryOperation>;

pub type RecordId = Id<ResultRecord>;
