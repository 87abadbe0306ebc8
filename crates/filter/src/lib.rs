//! Pluggable filtering for fully reassembled messages.
//!
//! Before a message is handed to delivery it is offered to every registered
//! [`FilterService`] concurrently. Each service returns a bitmask [`Verdict`];
//! the fan-out ORs the verdicts together and resolves exactly once, either
//! when the last service answers or when the deadline forces the stragglers
//! to an allow. A service that errors never blocks delivery.

mod fanout;
mod verdict;

pub use {
    fanout::{DEFAULT_FILTER_TIMEOUT, FilterFanout, FilterRequest, FilterService},
    verdict::Verdict,
};
