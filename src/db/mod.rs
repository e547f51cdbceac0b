//! Database module for streamwatch.
//!
//! Provides SQLite storage for check history, analyzer checkpoints and reports.

mod store;

pub use store::*;
