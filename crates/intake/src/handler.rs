use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use {
    courier_filter::{FilterFanout, FilterRequest, FilterService},
    courier_store::{
        DeletePredicate, FinalizeMode, InsertOutcome, Segment, SegmentStore, StoredSegment,
    },
    tokio::sync::{mpsc, oneshot},
    tracing::{debug, error, info},
};

#[cfg(feature = "metrics")]
use courier_metrics::{counter, histogram, intake as intake_metrics};

use crate::{CompletedMessage, DeliverySink, Error, IntakeConfig, LivenessLease, Result, reassembly};

/// Deliveries that take longer than this are logged as errors.
const SLOW_DELIVERY_THRESHOLD: Duration = Duration::from_secs(5);

/// Transport acknowledgement for a submitted segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressOutcome {
    /// Stored durably; the sender must not retransmit.
    Handled,
    /// Already delivered earlier; the sender must not retransmit.
    Duplicate,
    /// Not stored; the sender may retransmit.
    GenericError,
}

enum Event {
    Segment {
        segment: Segment,
        done: oneshot::Sender<IngressOutcome>,
    },
    Dispatch(StoredSegment),
    StorageReady,
    DeliveryComplete { delivered: bool },
    ReturnToIdle,
    ReleaseLease,
    Shutdown,
}

impl Event {
    fn kind(&self) -> &'static str {
        match self {
            Self::Segment { .. } => "segment",
            Self::Dispatch(_) => "dispatch",
            Self::StorageReady => "storage_ready",
            Self::DeliveryComplete { .. } => "delivery_complete",
            Self::ReturnToIdle => "return_to_idle",
            Self::ReleaseLease => "release_lease",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Storage is not ready yet; all work is deferred.
    Startup,
    /// Nothing to do; the liveness lease is released after a grace period.
    Idle,
    /// Storing segments and checking for completed messages.
    Delivering,
    /// A delivery is outstanding; further dispatches wait for its outcome.
    Waiting,
}

/// The message in flight while the handler sits in the waiting state.
struct InFlight {
    delete: DeletePredicate,
    dest_port: Option<i64>,
    timestamp_ms: i64,
    fragment_count: usize,
    started: Instant,
}

/// Cloneable front door to a running [`IntakeHandler`].
#[derive(Clone)]
pub struct IntakeHandle {
    tx: mpsc::UnboundedSender<Event>,
    format: Arc<str>,
}

impl IntakeHandle {
    /// Transport format tag this handler serves.
    #[must_use]
    pub fn format(&self) -> &str {
        &self.format
    }

    /// Submit a segment and wait for the acknowledgement to send upstream.
    pub async fn submit(&self, segment: Segment) -> IngressOutcome {
        let (done, ack) = oneshot::channel();
        if self.tx.send(Event::Segment { segment, done }).is_err() {
            return IngressOutcome::GenericError;
        }
        ack.await.unwrap_or(IngressOutcome::GenericError)
    }

    /// Re-drive a stored segment through reassembly, without an ack.
    pub fn dispatch(&self, stored: StoredSegment) -> Result<()> {
        self.tx
            .send(Event::Dispatch(stored))
            .map_err(|_| Error::HandlerClosed)
    }

    /// Signal that durable storage is available; leaves the startup state.
    pub fn storage_ready(&self) -> Result<()> {
        self.tx
            .send(Event::StorageReady)
            .map_err(|_| Error::HandlerClosed)
    }

    /// Stop the handler task. Pending events are discarded.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Event::Shutdown);
    }
}

/// Four-state actor that owns the intake pipeline for one transport.
///
/// Segments are stored and acknowledged as soon as they arrive, in whichever
/// state. Completed messages are delivered one at a time: while one is
/// outstanding the handler waits in [`State::Waiting`] and defers further
/// dispatches, replaying them in arrival order once the outcome lands.
pub struct IntakeHandler {
    store: SegmentStore,
    fanout: FilterFanout,
    sink: Arc<dyn DeliverySink>,
    lease: Arc<dyn LivenessLease>,
    config: IntakeConfig,
    tx: mpsc::WeakUnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    state: State,
    deferred: VecDeque<Event>,
    replay: VecDeque<Event>,
    /// Zero until the first delivery completes, so an empty backlog at boot
    /// does not hold the lease.
    lease_grace: Duration,
    in_flight: Option<InFlight>,
}

impl IntakeHandler {
    /// Start the handler task and return a handle to it.
    ///
    /// The handler starts in [`State::Startup`] holding the lease; nothing is
    /// processed until [`IntakeHandle::storage_ready`] is signalled.
    pub fn spawn(
        store: SegmentStore,
        services: Vec<Arc<dyn FilterService>>,
        sink: Arc<dyn DeliverySink>,
        lease: Arc<dyn LivenessLease>,
        config: IntakeConfig,
    ) -> IntakeHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let fanout = FilterFanout::new(services).with_timeout(config.filter_timeout());
        let format: Arc<str> = config.format.as_str().into();
        lease.acquire();
        let handler = Self {
            store,
            fanout,
            sink,
            lease,
            config,
            tx: tx.downgrade(),
            rx,
            state: State::Startup,
            deferred: VecDeque::new(),
            replay: VecDeque::new(),
            lease_grace: Duration::ZERO,
            in_flight: None,
        };
        tokio::spawn(handler.run());
        IntakeHandle { tx, format }
    }

    async fn run(mut self) {
        debug!("intake handler started");
        loop {
            let event = match self.replay.pop_front() {
                Some(event) => event,
                None => match self.rx.recv().await {
                    Some(event) => event,
                    None => {
                        debug!("all intake handles dropped, stopping");
                        break;
                    },
                },
            };
            if matches!(event, Event::Shutdown) {
                info!("intake handler shutting down");
                break;
            }
            match self.state {
                State::Startup => self.handle_startup(event),
                State::Idle => self.handle_idle(event),
                State::Delivering => self.handle_delivering(event).await,
                State::Waiting => self.handle_waiting(event).await,
            }
        }
    }

    // ── Per-state event handling ─────────────────────────────────────────────

    fn handle_startup(&mut self, event: Event) {
        match event {
            Event::Segment { .. } | Event::Dispatch(_) => self.defer(event),
            Event::StorageReady => {
                info!("storage ready, accepting segments");
                self.transition(State::Idle);
            },
            other => self.unexpected(other),
        }
    }

    fn handle_idle(&mut self, event: Event) {
        match event {
            Event::Segment { .. } | Event::Dispatch(_) => {
                self.defer(event);
                self.transition(State::Delivering);
            },
            Event::ReleaseLease => self.lease.release(),
            Event::ReturnToIdle => {},
            Event::StorageReady => debug!("storage ready signalled while already accepting"),
            other => self.unexpected(other),
        }
    }

    async fn handle_delivering(&mut self, event: Event) {
        match event {
            Event::Segment { segment, done } => {
                self.store_segment(segment, done).await;
                self.post(Event::ReturnToIdle);
            },
            Event::Dispatch(stored) => match reassembly::try_complete(&self.store, &stored).await {
                Ok(Some(message)) => {
                    self.start_delivery(message);
                    self.transition(State::Waiting);
                },
                Ok(None) => {
                    debug!(row_id = stored.row_id, "message not yet complete");
                    self.post(Event::ReturnToIdle);
                },
                Err(error) => {
                    error!(error = %error, row_id = stored.row_id, "reassembly failed");
                    self.post(Event::ReturnToIdle);
                },
            },
            Event::ReturnToIdle => self.transition(State::Idle),
            // Decrements the acquire from a previous pass through idle.
            Event::ReleaseLease => self.lease.release(),
            Event::StorageReady => debug!("storage ready signalled while already accepting"),
            other => self.unexpected(other),
        }
    }

    async fn handle_waiting(&mut self, event: Event) {
        match event {
            Event::Segment { segment, done } => {
                self.store_segment(segment, done).await;
                self.post(Event::ReturnToIdle);
            },
            Event::Dispatch(stored) => {
                if let Some(in_flight) = &self.in_flight {
                    debug!(
                        row_id = stored.row_id,
                        pending_fragments = in_flight.fragment_count,
                        pending_port = ?in_flight.dest_port,
                        pending_timestamp_ms = in_flight.timestamp_ms,
                        "deferring dispatch behind outstanding delivery"
                    );
                }
                self.defer(Event::Dispatch(stored));
            },
            Event::DeliveryComplete { delivered } => {
                self.finish_delivery(delivered).await;
                self.post(Event::ReturnToIdle);
                self.transition(State::Delivering);
            },
            // Not ready to go idle until the delivery outcome lands.
            Event::ReturnToIdle => {},
            Event::ReleaseLease => self.lease.release(),
            Event::StorageReady => debug!("storage ready signalled while already accepting"),
            other => self.unexpected(other),
        }
    }

    // ── Actions ──────────────────────────────────────────────────────────────

    async fn store_segment(&mut self, segment: Segment, done: oneshot::Sender<IngressOutcome>) {
        let outcome = match self.store.insert(&segment).await {
            Ok(InsertOutcome::Accepted(stored)) => {
                #[cfg(feature = "metrics")]
                counter!(intake_metrics::SEGMENTS_ACCEPTED_TOTAL).increment(1);
                self.post(Event::Dispatch(stored));
                IngressOutcome::Handled
            },
            Ok(InsertOutcome::Duplicate) => {
                #[cfg(feature = "metrics")]
                counter!(intake_metrics::SEGMENTS_DUPLICATE_TOTAL).increment(1);
                IngressOutcome::Duplicate
            },
            Err(error) => {
                error!(error = %error, "failed to store segment");
                #[cfg(feature = "metrics")]
                counter!(intake_metrics::SEGMENTS_ERROR_TOTAL).increment(1);
                IngressOutcome::GenericError
            },
        };
        let _ = done.send(outcome);
    }

    fn start_delivery(&mut self, message: reassembly::ReassembledMessage) {
        let payloads = Arc::new(message.payloads);
        self.in_flight = Some(InFlight {
            delete: message.delete,
            dest_port: message.dest_port,
            timestamp_ms: message.timestamp_ms,
            fragment_count: payloads.len(),
            started: Instant::now(),
        });

        let request = FilterRequest {
            payloads: Arc::clone(&payloads),
            dest_port: message.dest_port,
        };
        let fanout = self.fanout.clone();
        let sink = Arc::clone(&self.sink);
        let Some(tx) = self.tx.upgrade() else { return };
        tokio::spawn(async move {
            let verdict = fanout.run(request).await;
            let delivered = if verdict.should_drop() {
                info!(address = %message.address, "message dropped by filter verdict");
                #[cfg(feature = "metrics")]
                counter!(intake_metrics::MESSAGES_DROPPED_TOTAL).increment(1);
                false
            } else {
                let completed = CompletedMessage {
                    payloads,
                    format: message.format,
                    dest_port: message.dest_port,
                    address: message.address,
                    timestamp_ms: message.timestamp_ms,
                    priority: message.priority,
                    verdict,
                };
                match sink.deliver(completed).await {
                    Ok(()) => {
                        #[cfg(feature = "metrics")]
                        counter!(intake_metrics::MESSAGES_DELIVERED_TOTAL).increment(1);
                        true
                    },
                    Err(error) => {
                        error!(error = %error, "delivery sink failed");
                        false
                    },
                }
            };
            let _ = tx.send(Event::DeliveryComplete { delivered });
        });
    }

    async fn finish_delivery(&mut self, delivered: bool) {
        let Some(in_flight) = self.in_flight.take() else {
            error!("delivery completion with nothing in flight");
            debug_assert!(false, "delivery completion with nothing in flight");
            return;
        };
        let elapsed = in_flight.started.elapsed();
        if elapsed >= SLOW_DELIVERY_THRESHOLD {
            error!(
                elapsed_ms = elapsed.as_millis() as u64,
                "slow delivery completion"
            );
        }
        #[cfg(feature = "metrics")]
        histogram!(intake_metrics::DELIVERY_DURATION_SECONDS).record(elapsed.as_secs_f64());

        // Dropped and failed deliveries finalize too; retransmits were already
        // refused at the ack, so holding the rows would only wedge the group.
        if let Err(error) = self
            .store
            .finalize(&in_flight.delete, FinalizeMode::MarkDelivered)
            .await
        {
            error!(error = %error, "failed to finalize delivered message");
        }
        debug!(delivered, elapsed_ms = elapsed.as_millis() as u64, "delivery complete");
    }

    // ── State machine plumbing ───────────────────────────────────────────────

    fn transition(&mut self, next: State) {
        debug!(from = ?self.state, to = ?next, "state transition");
        match self.state {
            // Leaving idle means there is work; hold the lease until idle again.
            State::Idle => self.lease.acquire(),
            // Give downstream consumers time to take their own lease.
            State::Waiting => self.lease_grace = self.config.lease_grace(),
            _ => {},
        }
        self.state = next;
        while let Some(event) = self.deferred.pop_front() {
            self.replay.push_back(event);
        }
        if next == State::Idle {
            self.schedule_lease_release();
        }
    }

    fn defer(&mut self, event: Event) {
        debug!(state = ?self.state, event = event.kind(), "deferring event");
        self.deferred.push_back(event);
    }

    fn post(&self, event: Event) {
        if let Some(tx) = self.tx.upgrade() {
            let _ = tx.send(event);
        }
    }

    fn schedule_lease_release(&self) {
        let grace = self.lease_grace;
        let Some(tx) = self.tx.upgrade() else { return };
        tokio::spawn(async move {
            if !grace.is_zero() {
                tokio::time::sleep(grace).await;
            }
            let _ = tx.send(Event::ReleaseLease);
        });
    }

    fn unexpected(&mut self, event: Event) {
        error!(state = ?self.state, event = event.kind(), "unhandled event in this state");
        debug_assert!(false, "unhandled event in this state");
    }
}

#[cfg(test)]
mod tests {
    use {async_trait::async_trait, courier_filter::Verdict, tokio::time::timeout};

    use super::*;

    struct ChannelSink {
        tx: mpsc::UnboundedSender<CompletedMessage>,
        delay: Duration,
    }

    #[async_trait]
    impl DeliverySink for ChannelSink {
        async fn deliver(&self, message: CompletedMessage) -> anyhow::Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.tx.send(message)?;
            Ok(())
        }
    }

    struct DropFilter;

    #[async_trait]
    impl FilterService for DropFilter {
        fn name(&self) -> &str {
            "drop"
        }

        async fn filter(&self, _request: FilterRequest) -> anyhow::Result<Verdict> {
            Ok(Verdict::DROP)
        }
    }

    struct Pipeline {
        handle: IntakeHandle,
        delivered: mpsc::UnboundedReceiver<CompletedMessage>,
        lease: Arc<crate::CountingLease>,
        store: SegmentStore,
    }

    async fn pipeline(services: Vec<Arc<dyn FilterService>>, sink_delay: Duration) -> Pipeline {
        let store = SegmentStore::connect("sqlite::memory:").await.unwrap();
        let (tx, delivered) = mpsc::unbounded_channel();
        let lease = Arc::new(crate::CountingLease::new());
        let config = IntakeConfig {
            format: "text".into(),
            lease_grace_ms: 20,
            ..IntakeConfig::default()
        };
        let handle = IntakeHandler::spawn(
            store.clone(),
            services,
            Arc::new(ChannelSink {
                tx,
                delay: sink_delay,
            }),
            Arc::clone(&lease) as Arc<dyn LivenessLease>,
            config,
        );
        Pipeline {
            handle,
            delivered,
            lease,
            store,
        }
    }

    fn single(payload: &[u8]) -> Segment {
        Segment::single("text", payload.to_vec(), 1_000, None, "+15550001", "+15550001")
    }

    fn single_from(address: &str, payload: &[u8]) -> Segment {
        Segment::single("text", payload.to_vec(), 1_000, None, address, address)
    }

    fn part(sequence: i64, payload: &[u8]) -> Segment {
        Segment::concatenated(
            "text",
            payload.to_vec(),
            1_000,
            None,
            "+15550001",
            "+15550001",
            7,
            sequence,
            2,
        )
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<CompletedMessage>) -> CompletedMessage {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("delivery channel closed")
    }

    #[tokio::test]
    async fn test_startup_defers_until_storage_ready() {
        let mut p = pipeline(Vec::new(), Duration::ZERO).await;

        let handle = p.handle.clone();
        let pending = tokio::spawn(async move { handle.submit(single(b"early")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished(), "segment was handled before storage was ready");

        p.handle.storage_ready().unwrap();
        assert_eq!(pending.await.unwrap(), IngressOutcome::Handled);
        assert_eq!(recv(&mut p.delivered).await.payloads[0], b"early");
    }

    #[tokio::test]
    async fn test_single_segment_end_to_end() {
        let mut p = pipeline(Vec::new(), Duration::ZERO).await;
        p.handle.storage_ready().unwrap();

        assert_eq!(p.handle.submit(single(b"hi")).await, IngressOutcome::Handled);
        let message = recv(&mut p.delivered).await;
        assert_eq!(*message.payloads, vec![b"hi".to_vec()]);
        assert_eq!(message.format, "text");
        assert_eq!(message.address, "+15550001");
        assert!(!message.verdict.should_drop());
    }

    #[tokio::test]
    async fn test_redelivery_is_acked_as_duplicate() {
        let mut p = pipeline(Vec::new(), Duration::ZERO).await;
        p.handle.storage_ready().unwrap();

        assert_eq!(p.handle.submit(single(b"hi")).await, IngressOutcome::Handled);
        recv(&mut p.delivered).await;
        assert_eq!(
            p.handle.submit(single(b"hi")).await,
            IngressOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_multipart_delivers_once_complete() {
        let mut p = pipeline(Vec::new(), Duration::ZERO).await;
        p.handle.storage_ready().unwrap();

        assert_eq!(p.handle.submit(part(2, b"b")).await, IngressOutcome::Handled);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(p.delivered.try_recv().is_err(), "delivered before all fragments arrived");

        assert_eq!(p.handle.submit(part(1, b"a")).await, IngressOutcome::Handled);
        let message = recv(&mut p.delivered).await;
        assert_eq!(*message.payloads, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn test_filter_drop_suppresses_and_finalizes() {
        let mut p =
            pipeline(vec![Arc::new(DropFilter) as Arc<dyn FilterService>], Duration::ZERO).await;
        p.handle.storage_ready().unwrap();

        assert_eq!(p.handle.submit(single(b"spam")).await, IngressOutcome::Handled);
        // The drop still finalizes the rows, so a retransmit is a duplicate.
        let outcome = loop {
            match p.handle.submit(single(b"spam")).await {
                IngressOutcome::Handled => tokio::time::sleep(Duration::from_millis(10)).await,
                other => break other,
            }
        };
        assert_eq!(outcome, IngressOutcome::Duplicate);
        assert!(p.delivered.try_recv().is_err(), "dropped message reached the sink");
    }

    #[tokio::test]
    async fn test_dispatches_defer_behind_outstanding_delivery() {
        let mut p = pipeline(Vec::new(), Duration::from_millis(100)).await;
        p.handle.storage_ready().unwrap();

        assert_eq!(
            p.handle.submit(single_from("+15550001", b"one")).await,
            IngressOutcome::Handled
        );
        assert_eq!(
            p.handle.submit(single_from("+15550002", b"two")).await,
            IngressOutcome::Handled
        );

        assert_eq!(recv(&mut p.delivered).await.payloads[0], b"one");
        assert_eq!(recv(&mut p.delivered).await.payloads[0], b"two");
    }

    #[tokio::test]
    async fn test_lease_released_after_going_idle() {
        let mut p = pipeline(Vec::new(), Duration::ZERO).await;
        p.handle.storage_ready().unwrap();

        assert_eq!(p.handle.submit(single(b"hi")).await, IngressOutcome::Handled);
        recv(&mut p.delivered).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        while p.lease.held() != 0 {
            assert!(Instant::now() < deadline, "lease still held after delivery");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_storage_ready_twice_is_harmless() {
        let mut p = pipeline(Vec::new(), Duration::ZERO).await;
        p.handle.storage_ready().unwrap();
        p.handle.storage_ready().unwrap();

        assert_eq!(p.handle.submit(single(b"hi")).await, IngressOutcome::Handled);
        recv(&mut p.delivered).await;
    }

    #[tokio::test]
    async fn test_delivered_rows_are_finalized() {
        let mut p = pipeline(Vec::new(), Duration::ZERO).await;
        p.handle.storage_ready().unwrap();

        p.handle.submit(part(1, b"a")).await;
        p.handle.submit(part(2, b"b")).await;
        recv(&mut p.delivered).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if p.store.pending().await.unwrap().is_empty() {
                break;
            }
            assert!(Instant::now() < deadline, "rows not finalized after delivery");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_an_error() {
        let p = pipeline(Vec::new(), Duration::ZERO).await;
        p.handle.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            p.handle.submit(single(b"late")).await,
            IngressOutcome::GenericError
        );
        assert!(matches!(
            p.handle.storage_ready(),
            Err(Error::HandlerClosed)
        ));
    }
}
