// Incremental Scraping Orchestrator - Core
//
// Drives multi-page scraping campaigns on an external provider: a control
// loop advances each session one page range at a time, an executor polls the
// provider run and ingests records as they appear, and the recovery detector
// restarts stalled runs from the page after the last one scraped.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;

pub use config::*;
