use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    tokio::sync::oneshot,
    tracing::{debug, warn},
};

#[cfg(feature = "metrics")]
use courier_metrics::{counter, filter as filter_metrics};

use crate::Verdict;

/// How long the fan-out waits before forcing unanswered services to an allow.
pub const DEFAULT_FILTER_TIMEOUT: Duration = Duration::from_secs(600);

/// A reassembled message as offered to filter services.
#[derive(Debug, Clone)]
pub struct FilterRequest {
    /// Payloads of every fragment, in sequence order.
    pub payloads: Arc<Vec<Vec<u8>>>,
    /// Application port the message was addressed to, if any.
    pub dest_port: Option<i64>,
}

/// An external service consulted about each inbound message.
#[async_trait]
pub trait FilterService: Send + Sync {
    /// Stable name used in logs.
    fn name(&self) -> &str;

    /// Judge the message. Errors are treated as an allow.
    async fn filter(&self, request: FilterRequest) -> anyhow::Result<Verdict>;
}

/// Runs every registered service concurrently and resolves a combined verdict
/// exactly once, even when the deadline and a late answer race.
#[derive(Clone)]
pub struct FilterFanout {
    services: Vec<Arc<dyn FilterService>>,
    timeout: Duration,
}

impl FilterFanout {
    #[must_use]
    pub fn new(services: Vec<Arc<dyn FilterService>>) -> Self {
        Self {
            services,
            timeout: DEFAULT_FILTER_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Offer `request` to every service and wait for the combined verdict.
    ///
    /// Returns [`Verdict::ALLOW`] immediately when no services are
    /// registered. A service that errors contributes an allow; a service
    /// that outlives the deadline is forced to an allow and its eventual
    /// answer is discarded.
    pub async fn run(&self, request: FilterRequest) -> Verdict {
        if self.services.is_empty() {
            return Verdict::ALLOW;
        }
        #[cfg(feature = "metrics")]
        counter!(filter_metrics::FANOUTS_TOTAL).increment(1);

        let (tx, mut rx) = oneshot::channel();
        let aggregation = Arc::new(Aggregation::new(self.services.len(), tx));

        for (slot, service) in self.services.iter().enumerate() {
            let service = Arc::clone(service);
            let aggregation = Arc::clone(&aggregation);
            let request = request.clone();
            tokio::spawn(async move {
                let verdict = match service.filter(request).await {
                    Ok(verdict) => {
                        debug!(service = service.name(), ?verdict, "filter answered");
                        verdict
                    },
                    Err(error) => {
                        warn!(
                            service = service.name(),
                            error = %error,
                            "filter service failed, treating as allow"
                        );
                        #[cfg(feature = "metrics")]
                        counter!(filter_metrics::SERVICE_ERRORS_TOTAL).increment(1);
                        Verdict::ALLOW
                    },
                };
                aggregation.complete(slot, verdict);
            });
        }

        tokio::select! {
            verdict = &mut rx => verdict.unwrap_or(Verdict::ALLOW),
            () = tokio::time::sleep(self.timeout) => {
                warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "filter deadline expired, forcing unanswered services to allow"
                );
                #[cfg(feature = "metrics")]
                counter!(filter_metrics::TIMEOUTS_TOTAL).increment(1);
                aggregation.force_remaining();
                rx.await.unwrap_or(Verdict::ALLOW)
            },
        }
    }
}

/// Shared completion state for one fan-out round.
///
/// Each service owns one slot; the first completion of a slot counts, any
/// later one is ignored. The sender fires when the pending count hits zero.
struct Aggregation {
    slots: Vec<AtomicBool>,
    pending: AtomicUsize,
    verdict: AtomicU32,
    tx: Mutex<Option<oneshot::Sender<Verdict>>>,
}

impl Aggregation {
    fn new(count: usize, tx: oneshot::Sender<Verdict>) -> Self {
        Self {
            slots: (0..count).map(|_| AtomicBool::new(false)).collect(),
            pending: AtomicUsize::new(count),
            verdict: AtomicU32::new(Verdict::ALLOW.bits()),
            tx: Mutex::new(Some(tx)),
        }
    }

    fn complete(&self, slot: usize, verdict: Verdict) {
        if self.slots[slot].swap(true, Ordering::AcqRel) {
            // Already counted, either answered twice or forced at the deadline.
            return;
        }
        self.verdict.fetch_or(verdict.bits(), Ordering::AcqRel);
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(tx) = tx {
                let _ = tx.send(Verdict::from_bits(self.verdict.load(Ordering::Acquire)));
            }
        }
    }

    fn force_remaining(&self) {
        for slot in 0..self.slots.len() {
            self.complete(slot, Verdict::ALLOW);
        }
    }
}
