//! Synthetic capture source driving a producer thread at a fixed frame rate

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tracing::{debug, info, instrument};

use crate::capture::frame::{PixelFormat, PlaneLayout, Timestamp};
use crate::capture::pool::HeapPool;
use crate::capture::source::{
    CaptureSession, ConnectionInfo, DropReason, SampleTarget, SourceDescriptor,
};
use crate::error::{Error, Result};
use crate::CaptureConfig;

type TargetSlot = ArcSwapOption<Arc<dyn SampleTarget>>;

/// Capture session producing gradient test frames from a [`HeapPool`].
///
/// It behaves like a real pipeline towards its target: frames arrive on a
/// dedicated producer thread, an empty pool is reported as
/// [`DropReason::BufferPoolExhausted`], ticks missed while the target was
/// blocking the thread are reported as [`DropReason::ConsumerTooSlow`], and
/// stopping reports [`DropReason::PipelineStopped`].
pub struct SyntheticSource {
    config: CaptureConfig,
    connection: ConnectionInfo,
    pool: Arc<HeapPool>,
    planes: Vec<PlaneLayout>,
    target: Arc<TargetSlot>,
    running: Arc<AtomicBool>,
    producer: Option<JoinHandle<()>>,
}

impl SyntheticSource {
    pub fn new(config: CaptureConfig, connection: ConnectionInfo) -> Result<Self> {
        if config.fps == 0 {
            return Err(Error::InvalidConfig("frame rate must be non-zero".into()));
        }
        if config.width == 0 || config.height == 0 {
            return Err(Error::InvalidConfig(format!(
                "bad frame size {}x{}",
                config.width, config.height
            )));
        }

        let planes = config.format.plane_layouts(config.width, config.height);
        let frame_len = config.format.frame_len(config.width, config.height);
        let width = config.width as usize;
        let pool = HeapPool::with_fill(config.buffer_count as usize, frame_len, |slot, buf| {
            for (i, px) in buf.iter_mut().enumerate() {
                *px = ((i % width.max(1)) + slot * 16) as u8;
            }
        });

        Ok(Self {
            config,
            connection,
            pool,
            planes,
            target: Arc::new(ArcSwapOption::empty()),
            running: Arc::new(AtomicBool::new(false)),
            producer: None,
        })
    }

    pub fn pool(&self) -> &Arc<HeapPool> {
        &self.pool
    }

    pub fn format(&self) -> PixelFormat {
        self.config.format
    }

    /// True once the producer thread has exited (or was never started).
    pub fn is_finished(&self) -> bool {
        self.producer.as_ref().map_or(true, JoinHandle::is_finished)
    }

    #[instrument(skip(self), fields(connection = %self.connection))]
    pub fn start(&mut self) -> Result<()> {
        if self.producer.is_some() {
            return Err(Error::AlreadyStarted);
        }

        self.running.store(true, Ordering::Release);
        let producer = Producer {
            interval: Duration::from_secs_f64(1.0 / self.config.fps as f64),
            frame_limit: self.config.frame_limit,
            format: self.config.format,
            width: self.config.width,
            height: self.config.height,
            planes: self.planes.clone(),
            pool: self.pool.clone(),
            target: self.target.clone(),
            running: self.running.clone(),
            connection: self.connection.clone(),
        };

        let handle = thread::Builder::new()
            .name(format!("capture-{}", self.connection.session()))
            .spawn(move || producer.run())
            .map_err(Error::WorkerSpawn)?;
        self.producer = Some(handle);

        info!(
            "Synthetic capture started: {}x{} {:?} @ {} fps, {} buffers",
            self.config.width,
            self.config.height,
            self.config.format,
            self.config.fps,
            self.pool.capacity()
        );
        Ok(())
    }

    /// Stop the producer thread and tell a bound target the pipeline stopped.
    #[instrument(skip(self), fields(connection = %self.connection))]
    pub fn stop(&mut self) -> Result<()> {
        let producer = self.producer.take().ok_or(Error::NotStarted)?;
        self.running.store(false, Ordering::Release);
        if producer.join().is_err() {
            tracing::warn!("capture producer panicked");
        }

        if let Some(target) = self.target.load_full() {
            target.on_frame_dropped(self.now(), &self.connection, DropReason::PipelineStopped);
        }
        info!("Synthetic capture stopped");
        Ok(())
    }

    fn now(&self) -> Timestamp {
        Timestamp::from_duration(monotonic_epoch().elapsed())
    }
}

impl CaptureSession for SyntheticSource {
    fn connection(&self) -> ConnectionInfo {
        self.connection.clone()
    }

    fn set_target(&self, target: Option<Arc<dyn SampleTarget>>) {
        self.target.store(target.map(Arc::new));
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(producer) = self.producer.take() {
            let _ = producer.join();
        }
    }
}

struct Producer {
    interval: Duration,
    frame_limit: Option<u64>,
    format: PixelFormat,
    width: u32,
    height: u32,
    planes: Vec<PlaneLayout>,
    pool: Arc<HeapPool>,
    target: Arc<TargetSlot>,
    running: Arc<AtomicBool>,
    connection: ConnectionInfo,
}

impl Producer {
    fn run(self) {
        let epoch = monotonic_epoch();
        let mut next_tick = Instant::now();
        let mut ticks = 0u64;

        while self.should_continue(ticks) {
            let now = Instant::now();
            if next_tick > now {
                thread::sleep(next_tick - now);
            }
            let timestamp = Timestamp::from_duration(epoch.elapsed());
            next_tick += self.interval;
            ticks += 1;

            let Some(target) = self.target.load_full() else {
                continue;
            };

            match self.pool.acquire() {
                Some(storage) => {
                    let source = SourceDescriptor::new(
                        self.format.fourcc(),
                        self.width,
                        self.height,
                        self.planes.clone(),
                        storage,
                    );
                    target.on_frame_available(source, timestamp, &self.connection);
                }
                None => {
                    target.on_frame_dropped(timestamp, &self.connection, DropReason::BufferPoolExhausted)
                }
            }

            // Ticks that passed while the target held this thread.
            let now = Instant::now();
            while now >= next_tick + self.interval && self.should_continue(ticks) {
                let missed = Timestamp::from_duration(next_tick.duration_since(epoch));
                target.on_frame_dropped(missed, &self.connection, DropReason::ConsumerTooSlow);
                next_tick += self.interval;
                ticks += 1;
            }
        }

        debug!(ticks, "capture producer exiting");
    }

    fn should_continue(&self, ticks: u64) -> bool {
        self.running.load(Ordering::Acquire) && self.frame_limit.map_or(true, |limit| ticks < limit)
    }
}

/// Process-wide origin for synthetic timestamps, so they stay monotonic
/// across sources and restarts.
fn monotonic_epoch() -> Instant {
    static EPOCH: once_cell::sync::OnceCell<Instant> = once_cell::sync::OnceCell::new();
    *EPOCH.get_or_init(Instant::now)
}
