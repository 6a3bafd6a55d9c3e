//! Frame delivery sink: the capture pipeline's callback target
//!
//! The sink turns "frame available" and "frame dropped" events into
//! [`FrameBuffer`] handles and [`DropRecord`]s, numbers them, and forwards
//! them to the registered consumer callbacks in arrival order.
//!
//! Under [`DispatchPolicy::Inline`] (the default) consumer callbacks run on
//! the producer thread, so a slow consumer stalls capture for as long as it
//! takes. [`DispatchPolicy::HandOff`] moves delivery to a worker thread and
//! bounds the time spent on the producer thread.

pub mod accountant;
pub mod diagnostics;
mod dispatch;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use crossbeam::sync::ShardedLock;
use crossbeam::utils::CachePadded;
use tracing::{debug, info, instrument, trace, warn};

use crate::capture::{
    CaptureSession, ConnectionInfo, DropReason, FrameBuffer, SampleTarget, SourceDescriptor,
    Timestamp,
};
use crate::error::{Error, Result};
use crate::{DispatchPolicy, SinkConfig};

pub use accountant::{DropAccountant, DropRecord, DropSnapshot};
pub use diagnostics::{CallbackKind, DeliveryFault, Diagnostics, TracingDiagnostics};

use dispatch::HandOff;

/// Consumer frame callback. Takes ownership of the frame; returning (or
/// panicking) without keeping it releases it.
pub type FrameCallback = dyn Fn(FrameBuffer) -> color_eyre::Result<()> + Send + Sync;

/// Consumer drop callback.
pub type DropCallback = dyn Fn(DropRecord) -> color_eyre::Result<()> + Send + Sync;

/// Delivery counters for the current session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Frames handed to the frame callback, including ones it faulted on.
    pub frames_delivered: u64,
    pub drops_delivered: u64,
    pub consumer_faults: u64,
    /// Frames released at teardown without reaching the consumer.
    pub frames_discarded: u64,
    /// Frames released because no frame callback was registered.
    pub frames_unclaimed: u64,
}

#[derive(Default)]
struct Counters {
    frames_delivered: AtomicU64,
    drops_delivered: AtomicU64,
    consumer_faults: AtomicU64,
    frames_discarded: AtomicU64,
    frames_unclaimed: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        for counter in [
            &self.frames_delivered,
            &self.drops_delivered,
            &self.consumer_faults,
            &self.frames_discarded,
            &self.frames_unclaimed,
        ] {
            counter.store(0, Ordering::Release);
        }
    }
}

/// State reachable from both the producer thread and the hand-off worker.
pub(crate) struct Shared {
    frame_callback: ArcSwapOption<Box<FrameCallback>>,
    drop_callback: ArcSwapOption<Box<DropCallback>>,
    accountant: DropAccountant,
    diagnostics: Arc<dyn Diagnostics>,
    stats: CachePadded<Counters>,
}

impl Shared {
    pub(crate) fn new(diagnostics: Arc<dyn Diagnostics>) -> Self {
        Self {
            frame_callback: ArcSwapOption::empty(),
            drop_callback: ArcSwapOption::empty(),
            accountant: DropAccountant::new(),
            diagnostics,
            stats: CachePadded::new(Counters::default()),
        }
    }

    pub(crate) fn deliver_frame(&self, frame: FrameBuffer) {
        let Some(callback) = self.frame_callback.load_full() else {
            trace!(sequence = frame.sequence(), "no frame callback, releasing");
            self.stats.frames_unclaimed.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let sequence = frame.sequence();
        let connection = frame.connection().ok().cloned();
        let started = Instant::now();

        self.stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
        let outcome = diagnostics::guarded(|| (**callback)(frame));

        metrics::counter!("framesink_frames_delivered_total").increment(1);
        metrics::histogram!("framesink_frame_callback_us")
            .record(started.elapsed().as_micros() as f64);

        if let Err(message) = outcome {
            self.report(CallbackKind::Frame, sequence, connection, message);
        }
    }

    pub(crate) fn deliver_drop(&self, record: DropRecord) {
        let Some(callback) = self.drop_callback.load_full() else {
            return;
        };

        let sequence = record.sequence;
        let connection = record.connection.clone();

        self.stats.drops_delivered.fetch_add(1, Ordering::Relaxed);
        if let Err(message) = diagnostics::guarded(|| (**callback)(record)) {
            self.report(CallbackKind::Drop, sequence, Some(connection), message);
        }
    }

    pub(crate) fn discard_frame(&self, frame: FrameBuffer) {
        trace!(sequence = frame.sequence(), "discarding frame at teardown");
        self.stats.frames_discarded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("framesink_frames_discarded_total").increment(1);
        drop(frame);
    }

    fn report(
        &self,
        kind: CallbackKind,
        sequence: u64,
        connection: Option<ConnectionInfo>,
        message: String,
    ) {
        self.stats.consumer_faults.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("framesink_consumer_faults_total").increment(1);

        let fault = DeliveryFault {
            kind,
            connection: connection.unwrap_or_else(|| ConnectionInfo::new(0, "unknown")),
            error: Error::ConsumerFault { sequence, message },
        };
        // Panics in the diagnostics sink stop here too.
        if diagnostics::guarded(|| {
            self.diagnostics.report(&fault);
            Ok(())
        })
        .is_err()
        {
            warn!(sequence, "diagnostics sink panicked");
        }
    }
}

struct ActiveSession {
    connection: ConnectionInfo,
    handoff: Option<HandOff>,
}

/// The callback target registered with a capture session.
///
/// Events are expected one at a time from a single producer thread, which
/// is how capture pipelines call their delegates; sequence numbers follow
/// arrival order.
///
/// Consumer callbacks must not call [`detach`](Self::detach): it waits for
/// the running callback to finish and would deadlock. The queries
/// (`is_attached`, `drop_snapshot`, `delivery_stats`) never touch the session
/// lock and are safe to call from a callback.
pub struct DeliverySink {
    config: SinkConfig,
    shared: Arc<Shared>,
    next_sequence: AtomicU64,
    /// Mirrors `session.is_some()`, readable without the lock.
    attached: AtomicBool,
    session: ShardedLock<Option<ActiveSession>>,
}

impl DeliverySink {
    /// Sink that reports consumer faults through `tracing`.
    pub fn new(config: SinkConfig) -> Arc<Self> {
        Self::with_diagnostics(config, Arc::new(TracingDiagnostics))
    }

    pub fn with_diagnostics(config: SinkConfig, diagnostics: Arc<dyn Diagnostics>) -> Arc<Self> {
        Arc::new(Self {
            config,
            shared: Arc::new(Shared::new(diagnostics)),
            next_sequence: AtomicU64::new(1),
            attached: AtomicBool::new(false),
            session: ShardedLock::new(None),
        })
    }

    /// Sink configured from the process-wide [`CONFIG`](crate::CONFIG).
    pub fn from_global_config() -> Arc<Self> {
        Self::new(crate::CONFIG.load().sink.clone())
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        self.config.dispatch
    }

    /// Replace the frame callback. The previous one keeps running for any
    /// delivery already in progress.
    pub fn set_frame_callback<F>(&self, callback: F)
    where
        F: Fn(FrameBuffer) -> color_eyre::Result<()> + Send + Sync + 'static,
    {
        let callback: Box<FrameCallback> = Box::new(callback);
        self.shared.frame_callback.store(Some(Arc::new(callback)));
    }

    pub fn set_drop_callback<F>(&self, callback: F)
    where
        F: Fn(DropRecord) -> color_eyre::Result<()> + Send + Sync + 'static,
    {
        let callback: Box<DropCallback> = Box::new(callback);
        self.shared.drop_callback.store(Some(Arc::new(callback)));
    }

    pub fn clear_frame_callback(&self) {
        self.shared.frame_callback.store(None);
    }

    pub fn clear_drop_callback(&self) {
        self.shared.drop_callback.store(None);
    }

    pub fn drop_snapshot(&self) -> DropSnapshot {
        self.shared.accountant.snapshot()
    }

    pub fn delivery_stats(&self) -> DeliveryStats {
        let stats = &self.shared.stats;
        DeliveryStats {
            frames_delivered: stats.frames_delivered.load(Ordering::Acquire),
            drops_delivered: stats.drops_delivered.load(Ordering::Acquire),
            consumer_faults: stats.consumer_faults.load(Ordering::Acquire),
            frames_discarded: stats.frames_discarded.load(Ordering::Acquire),
            frames_unclaimed: stats.frames_unclaimed.load(Ordering::Acquire),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Start a session: reset counters and sequence numbers, start the
    /// hand-off worker if configured, then bind to `session`.
    #[instrument(skip_all, fields(connection = %session.connection()))]
    pub fn attach(self: &Arc<Self>, session: &dyn CaptureSession) -> Result<()> {
        {
            let mut state = self.session.write().unwrap_or_else(PoisonError::into_inner);
            if state.is_some() {
                return Err(Error::AlreadyAttached);
            }

            self.next_sequence.store(1, Ordering::Release);
            self.shared.accountant.reset();
            self.shared.stats.reset();

            let connection = session.connection();
            let handoff = match self.config.dispatch {
                DispatchPolicy::Inline => None,
                DispatchPolicy::HandOff => Some(HandOff::spawn(
                    self.shared.clone(),
                    self.config.handoff_capacity,
                    self.config.worker_core,
                    &connection,
                )?),
            };
            *state = Some(ActiveSession {
                connection,
                handoff,
            });
            self.attached.store(true, Ordering::Release);
        }

        let target: Arc<dyn SampleTarget> = self.clone();
        session.set_target(Some(target));
        info!(policy = ?self.config.dispatch, "sink attached");
        Ok(())
    }

    /// Unbind from `session` and tear the delivery path down.
    ///
    /// Returns once no consumer callback is running or can start, and every
    /// frame still owned by the sink (queued for the hand-off worker or in
    /// the middle of delivery) has been delivered or released. Frames a
    /// consumer chose to keep stay alive until the consumer drops them.
    #[instrument(skip_all)]
    pub fn detach(&self, session: &dyn CaptureSession) -> Result<()> {
        if !self.is_attached() {
            return Err(Error::NotAttached);
        }
        session.set_target(None);
        self.teardown()
    }

    fn teardown(&self) -> Result<()> {
        // Taking the write side waits out any delivery in progress on the
        // producer thread.
        let active = {
            let mut state = self.session.write().unwrap_or_else(PoisonError::into_inner);
            self.attached.store(false, Ordering::Release);
            state.take().ok_or(Error::NotAttached)?
        };

        if let Some(mut handoff) = active.handoff {
            handoff.shutdown(self.config.teardown);
        }

        let stats = self.delivery_stats();
        info!(
            connection = %active.connection,
            delivered = stats.frames_delivered,
            discarded = stats.frames_discarded,
            dropped = self.drop_snapshot().total(),
            "sink detached"
        );
        Ok(())
    }

    fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::AcqRel)
    }

    fn dispatch_drop(&self, active: &ActiveSession, record: DropRecord) {
        self.shared.accountant.record(&record);
        match &active.handoff {
            None => self.shared.deliver_drop(record),
            Some(handoff) => handoff.enqueue_drop(record),
        }
    }
}

impl SampleTarget for DeliverySink {
    fn on_frame_available(
        &self,
        source: SourceDescriptor,
        timestamp: Timestamp,
        connection: &ConnectionInfo,
    ) {
        let state = self.session.read().unwrap_or_else(PoisonError::into_inner);
        let Some(active) = state.as_ref() else {
            trace!("frame arrived while detached, releasing");
            return;
        };

        let sequence = self.next_sequence();
        let frame = match FrameBuffer::create(source, timestamp, sequence, connection.clone()) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(sequence, %err, "malformed frame, reporting as drop");
                let record = DropRecord {
                    timestamp,
                    sequence,
                    reason: DropReason::Unknown,
                    connection: connection.clone(),
                };
                self.dispatch_drop(active, record);
                return;
            }
        };

        let Some(handoff) = &active.handoff else {
            self.shared.deliver_frame(frame);
            return;
        };

        if let Err(frame) = handoff.try_enqueue_frame(frame) {
            debug!(sequence, "hand-off queue refused frame");
            drop(frame);
            let record = DropRecord {
                timestamp,
                sequence,
                reason: DropReason::ConsumerTooSlow,
                connection: connection.clone(),
            };
            self.dispatch_drop(active, record);
        }
    }

    fn on_frame_dropped(&self, timestamp: Timestamp, connection: &ConnectionInfo, reason: DropReason) {
        let state = self.session.read().unwrap_or_else(PoisonError::into_inner);
        let Some(active) = state.as_ref() else {
            trace!(%reason, "drop arrived while detached");
            return;
        };

        let record = DropRecord {
            timestamp,
            sequence: self.next_sequence(),
            reason,
            connection: connection.clone(),
        };
        trace!(sequence = record.sequence, %reason, "frame dropped upstream");
        self.dispatch_drop(active, record);
    }
}

impl Drop for DeliverySink {
    fn drop(&mut self) {
        if self.is_attached() {
            let _ = self.teardown();
        }
    }
}
