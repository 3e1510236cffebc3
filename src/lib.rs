//! Chunked indexing pipeline for marketplace crawler dumps.
//!
//! The core is `pipeline`: a two-phase, chunked, state-machine-driven
//! ingestion engine that deduplicates dictionary entries and SKUs through
//! `resolver`, bulk-writes version facts through `store::loader`, and guards
//! idempotent re-entry through `dump`. Everything else (`config`, `error`,
//! `metrics`, `item_source`) is the ambient stack a deployable binary needs
//! around that core.

pub mod config;
pub mod dump;
pub mod error;
pub mod item_source;
pub mod metrics;
pub mod pipeline;
pub mod resolver;
pub mod store;
