//! stonks-watcher: periodic marketplace price refresh and stonks computation.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod backend;
pub mod categories;
pub mod config;
pub mod engine;
pub mod marketplace;
pub mod status;
pub mod types;
