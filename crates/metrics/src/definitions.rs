//! Metric name definitions.
//!
//! Centralizing the names keeps dashboards stable and documents what the
//! pipeline emits.

/// Intake state machine metrics
pub mod intake {
    /// Total segments accepted into the durable store
    pub const SEGMENTS_ACCEPTED_TOTAL: &str = "courier_intake_segments_accepted_total";
    /// Total segments rejected as duplicates
    pub const SEGMENTS_DUPLICATE_TOTAL: &str = "courier_intake_segments_duplicate_total";
    /// Total segments that failed with a store error
    pub const SEGMENTS_ERROR_TOTAL: &str = "courier_intake_segments_error_total";
    /// Total completed messages delivered to consumers
    pub const MESSAGES_DELIVERED_TOTAL: &str = "courier_intake_messages_delivered_total";
    /// Total completed messages dropped by a filter verdict
    pub const MESSAGES_DROPPED_TOTAL: &str = "courier_intake_messages_dropped_total";
    /// Delivery duration in seconds, fan-out included
    pub const DELIVERY_DURATION_SECONDS: &str = "courier_intake_delivery_duration_seconds";
}

/// Filter fan-out metrics
pub mod filter {
    /// Total fan-outs started
    pub const FANOUTS_TOTAL: &str = "courier_filter_fanouts_total";
    /// Total fan-outs force-completed by the safety timeout
    pub const TIMEOUTS_TOTAL: &str = "courier_filter_timeouts_total";
    /// Total individual service errors treated as the default verdict
    pub const SERVICE_ERRORS_TOTAL: &str = "courier_filter_service_errors_total";
}

/// Recovery scan metrics
pub mod recovery {
    /// Total messages re-dispatched by the boot-time scan
    pub const MESSAGES_DISPATCHED_TOTAL: &str = "courier_recovery_messages_dispatched_total";
    /// Total expired incomplete groups purged by the scan
    pub const GROUPS_EXPIRED_TOTAL: &str = "courier_recovery_groups_expired_total";
    /// Total rows removed by the expiry sweep
    pub const ROWS_PURGED_TOTAL: &str = "courier_recovery_rows_purged_total";
}
