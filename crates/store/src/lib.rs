//! Durable storage for inbound message segments.
//!
//! Segments are appended to a SQLite-backed table as soon as they arrive so
//! that nothing is lost if the process dies between acknowledging a segment
//! to the transport and delivering the finished message. Rows are soft-deleted
//! after delivery (kept for duplicate detection) and physically removed only
//! by the expiry sweep or by explicit replacement during deduplication.

mod error;
mod segment;
mod store;

pub use {
    error::{Error, Result},
    segment::{DeletePredicate, GroupKey, Segment, StoredSegment},
    store::{FinalizeMode, GroupRow, InsertOutcome, SegmentStore},
};
