//! Sessions: scraping campaigns, their iterations and ingested records.

pub mod activities;
pub mod models;
pub mod store;
pub mod stores;

pub use activities::*;
pub use models::{Iteration, IterationStatus, ResultRecord, RunCheckpoint, Session, SessionStatus};
pub use store::SessionStore;
