#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use framesink::capture::{
    CaptureSession, ConnectionInfo, DropReason, FourCc, HeapPool, PixelFormat, SampleTarget,
    SourceDescriptor, Timestamp,
};
use framesink::sink::DeliveryFault;
use framesink::{DeliverySink, FrameBuffer};

pub const WIDTH: u32 = 4;
pub const HEIGHT: u32 = 2;

/// Hand-driven capture session. Each call plays one producer-thread
/// callback into whatever target is bound.
pub struct MockSession {
    connection: ConnectionInfo,
    target: Mutex<Option<Arc<dyn SampleTarget>>>,
    pool: Arc<HeapPool>,
    clock: AtomicU64,
}

impl MockSession {
    pub fn new(pool_capacity: usize) -> Self {
        Self {
            connection: ConnectionInfo::new(7, "mock"),
            target: Mutex::new(None),
            pool: HeapPool::new(pool_capacity, PixelFormat::Nv12.frame_len(WIDTH, HEIGHT)),
            clock: AtomicU64::new(1),
        }
    }

    pub fn pool(&self) -> &Arc<HeapPool> {
        &self.pool
    }

    pub fn is_bound(&self) -> bool {
        self.target.lock().unwrap().is_some()
    }

    /// Deliver an NV12 frame, or report pool exhaustion like a real
    /// pipeline would. Returns whether a frame went out.
    pub fn frame(&self) -> bool {
        self.frame_with(PixelFormat::Nv12.fourcc())
    }

    pub fn frame_with(&self, fourcc: FourCc) -> bool {
        let Some(target) = self.target() else {
            return false;
        };
        let timestamp = self.tick();
        match self.descriptor(fourcc) {
            Some(source) => {
                target.on_frame_available(source, timestamp, &self.connection);
                true
            }
            None => {
                target.on_frame_dropped(timestamp, &self.connection, DropReason::BufferPoolExhausted);
                false
            }
        }
    }

    pub fn drop_frame(&self, reason: DropReason) {
        if let Some(target) = self.target() {
            target.on_frame_dropped(self.tick(), &self.connection, reason);
        }
    }

    pub fn descriptor(&self, fourcc: FourCc) -> Option<SourceDescriptor> {
        let storage = self.pool.acquire()?;
        Some(SourceDescriptor::new(
            fourcc,
            WIDTH,
            HEIGHT,
            PixelFormat::Nv12.plane_layouts(WIDTH, HEIGHT),
            storage,
        ))
    }

    pub fn tick(&self) -> Timestamp {
        Timestamp::from_nanos(self.clock.fetch_add(1, Ordering::Relaxed) * 1_000_000)
    }

    fn target(&self) -> Option<Arc<dyn SampleTarget>> {
        self.target.lock().unwrap().clone()
    }
}

impl CaptureSession for MockSession {
    fn connection(&self) -> ConnectionInfo {
        self.connection.clone()
    }

    fn set_target(&self, target: Option<Arc<dyn SampleTarget>>) {
        *self.target.lock().unwrap() = target;
    }
}

/// What a consumer saw, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Frame(u64),
    Drop(u64, DropReason),
}

impl Seen {
    pub fn sequence(&self) -> u64 {
        match self {
            Seen::Frame(seq) | Seen::Drop(seq, _) => *seq,
        }
    }
}

/// Register callbacks that log every event into the returned list.
pub fn record(sink: &DeliverySink) -> Arc<Mutex<Vec<Seen>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));

    let frames = seen.clone();
    sink.set_frame_callback(move |frame: FrameBuffer| {
        frames.lock().unwrap().push(Seen::Frame(frame.sequence()));
        Ok(())
    });

    let drops = seen.clone();
    sink.set_drop_callback(move |record| {
        drops.lock().unwrap().push(Seen::Drop(record.sequence, record.reason));
        Ok(())
    });

    seen
}

/// Diagnostics that keep every reported fault as `(kind, sequence)`.
pub fn fault_log() -> (
    Arc<Mutex<Vec<(framesink::sink::CallbackKind, u64)>>>,
    Arc<dyn framesink::sink::Diagnostics>,
) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink_log = log.clone();
    let diagnostics: Arc<dyn framesink::sink::Diagnostics> =
        Arc::new(move |fault: &DeliveryFault| {
            sink_log.lock().unwrap().push((fault.kind, fault.sequence()));
        });
    (log, diagnostics)
}

pub fn assert_all_released(pool: &HeapPool) {
    let stats = pool.stats();
    assert_eq!(stats.outstanding(), 0, "leaked buffers: {stats:?}");
    assert_eq!(stats.double_recycles, 0, "double release: {stats:?}");
}
