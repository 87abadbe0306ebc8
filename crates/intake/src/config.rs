use std::time::Duration;

use serde::Deserialize;

/// Per-instance settings for the intake pipeline. Durations are milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntakeConfig {
    /// Transport format tag this handler instance serves. Segments carry the
    /// tag of the transport that produced them; the boot-time recovery scan
    /// routes stored rows to the handler whose tag matches.
    pub format: String,
    /// How long the liveness lease is held after the pipeline goes idle, so
    /// downstream consumers have time to take their own.
    pub lease_grace_ms: u64,
    /// Deadline for the filter fan-out before stragglers are forced to allow.
    pub filter_timeout_ms: u64,
    /// Stored fragments older than this are expired by the recovery sweep.
    pub segment_expiry_ms: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            format: String::new(),
            lease_grace_ms: 3_000,
            filter_timeout_ms: 600_000,
            segment_expiry_ms: 7 * 24 * 60 * 60 * 1_000,
        }
    }
}

impl IntakeConfig {
    #[must_use]
    pub fn lease_grace(&self) -> Duration {
        Duration::from_millis(self.lease_grace_ms)
    }

    #[must_use]
    pub fn filter_timeout(&self) -> Duration {
        Duration::from_millis(self.filter_timeout_ms)
    }

    #[must_use]
    pub fn segment_expiry(&self) -> Duration {
        Duration::from_millis(self.segment_expiry_ms)
    }
}
