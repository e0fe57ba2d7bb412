//! Incremental song table enrichment - shared modules for the CLI.

pub mod batch;
pub mod language;
pub mod lookup;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod reconcile;
pub mod safety;
pub mod spotify;
pub mod store;
