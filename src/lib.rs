//! Crash-safe persistence for topic graphs and phase-enforced workflow state.
//!
//! Many short-lived processes read and mutate the same small JSON documents.
//! Everything funnels through [`store`]: advisory locks coordinate access and
//! temp-file-and-rename replaces documents atomically. On top of that sit
//! the graph validators, backups, integrity repair, workflow tracking, and
//! the enforcement and bypass policy.
pub mod backup;
pub mod bypass;
pub mod config;
pub mod enforcement;
pub mod error;
pub mod graph;
pub mod integrity;
pub mod paths;
pub mod store;
pub mod workflow;

pub use error::{Result, StoreError};
