// Business domains
pub mod consolidation;
pub mod iterations;
pub mod pagination;
pub mod recovery;
pub mod sessions;
