//! Inbound message intake pipeline.
//!
//! Segments arriving from a transport are stored durably and acknowledged
//! before anything else happens, then reassembled, filtered and handed to a
//! delivery sink by a small four-state actor. A boot-time recovery scan
//! re-drives whatever a previous process stored but never delivered, and
//! sweeps out fragment groups that can no longer complete.

mod config;
mod delivery;
mod error;
mod handler;
mod lease;
pub mod reassembly;
mod recovery;

pub use {
    config::IntakeConfig,
    delivery::{CompletedMessage, DeliverySink},
    error::{Error, Result},
    handler::{IngressOutcome, IntakeHandle, IntakeHandler},
    lease::{CountingLease, LivenessLease, NoopLease},
    recovery::RecoveryScanner,
};
