//! Persisted session state for the scribe generation pipeline.
//!
//! The store owns the data model surfaced to the rest of the product:
//! generation sessions, outlines, sections, the global summary lineage,
//! and coherence reports. Writes come exclusively from the coordinator;
//! any number of readers may poll for progress.

pub mod config;
pub mod models;
pub mod queries;
pub mod store;

pub use store::{Store, StoreError};
