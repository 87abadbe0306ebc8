use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    courier_store::{DeletePredicate, FinalizeMode, GroupKey, SegmentStore, StoredSegment},
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use courier_metrics::{counter, recovery as recovery_metrics};

use crate::{IntakeConfig, IntakeHandle, Result};

/// Boot-time scan that re-drives stored but undelivered messages.
///
/// Runs at most once per process. Single-fragment rows are dispatched no
/// matter how old they are; multi-fragment groups are dispatched when every
/// fragment is present, and groups that are both incomplete and older than
/// the expiry age are purged. Each recovered message is routed to the target
/// handler whose transport format tag matches the stored rows. When the scan
/// is done every handler is told that storage is ready.
pub struct RecoveryScanner {
    store: SegmentStore,
    targets: Vec<IntakeHandle>,
    expiry: Duration,
    ran: AtomicBool,
}

impl RecoveryScanner {
    #[must_use]
    pub fn new(store: SegmentStore, targets: Vec<IntakeHandle>, config: &IntakeConfig) -> Self {
        Self {
            store,
            targets,
            expiry: config.segment_expiry(),
            ran: AtomicBool::new(false),
        }
    }

    /// Scan the store, dispatch what is deliverable, purge what has expired.
    pub async fn run_once(&self) -> Result<()> {
        if self.ran.swap(true, Ordering::AcqRel) {
            debug!("recovery scan already ran, skipping");
            self.signal_ready();
            return Ok(());
        }
        info!("scanning store for undelivered messages");
        let cutoff = now_ms() - self.expiry.as_millis() as i64;

        let mut seen: HashMap<GroupKey, i64> = HashMap::new();
        let mut expired: HashSet<GroupKey> = HashSet::new();
        let mut dispatched = 0_u64;

        for stored in self.store.pending().await? {
            if stored.segment.is_single() {
                self.dispatch(stored);
                dispatched += 1;
                continue;
            }
            let key = stored.segment.group_key();
            match seen.get(&key).copied() {
                None => {
                    seen.insert(key.clone(), 1);
                    if stored.segment.timestamp_ms < cutoff {
                        // Purged later unless the remaining fragments turn up.
                        expired.insert(key);
                    }
                },
                Some(count) => {
                    if count + 1 == stored.segment.total_count {
                        debug!(
                            address = %stored.segment.display_address,
                            total = stored.segment.total_count,
                            "found complete multi-fragment message"
                        );
                        expired.remove(&key);
                        self.dispatch(stored);
                        dispatched += 1;
                    } else {
                        seen.insert(key, count + 1);
                    }
                },
            }
        }

        for key in expired {
            let rows = self
                .store
                .finalize(&DeletePredicate::ByGroup(key.clone()), FinalizeMode::Purge)
                .await?;
            warn!(
                address = %key.address,
                total = key.total_count,
                rows,
                "purged expired incomplete message"
            );
            #[cfg(feature = "metrics")]
            {
                counter!(recovery_metrics::GROUPS_EXPIRED_TOTAL).increment(1);
                counter!(recovery_metrics::ROWS_PURGED_TOTAL).increment(rows);
            }
        }

        info!(dispatched, "recovery scan finished");
        self.signal_ready();
        Ok(())
    }

    fn dispatch(&self, stored: StoredSegment) {
        let Some(target) = self
            .targets
            .iter()
            .find(|target| target.format() == stored.segment.format)
        else {
            warn!(
                format = %stored.segment.format,
                row_id = stored.row_id,
                "no intake handler serves this transport format, leaving rows in place"
            );
            return;
        };
        #[cfg(feature = "metrics")]
        counter!(recovery_metrics::MESSAGES_DISPATCHED_TOTAL).increment(1);
        if target.dispatch(stored).is_err() {
            warn!("intake handler stopped during the recovery scan");
        }
    }

    fn signal_ready(&self) {
        for target in &self.targets {
            if target.storage_ready().is_err() {
                warn!(format = target.format(), "intake handler stopped before storage ready");
            }
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
