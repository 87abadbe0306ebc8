//! Metrics for the courier delivery pipeline.
//!
//! This crate centralizes metric names and re-exports the `metrics` facade
//! macros. Recording is a no-op until the host installs a recorder, so the
//! pipeline crates can emit metrics unconditionally behind their `metrics`
//! cargo feature.

mod definitions;

pub use definitions::*;

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
