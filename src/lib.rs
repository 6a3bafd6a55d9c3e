//! Frame delivery and buffer-lifecycle core.
//!
//! A capture pipeline calls into a [`DeliverySink`] through the
//! [`SampleTarget`](capture::SampleTarget) trait. The sink wraps each
//! delivered sample in a [`FrameBuffer`] that leases one slot of the
//! pipeline's buffer pool and gives it back exactly once, turns drop
//! notifications into [`DropRecord`]s counted by a lock-free accountant, and
//! forwards both to consumer callbacks in sequence order.

pub mod capture;
pub mod error;
pub mod sink;

use std::path::Path;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use capture::{ConnectionInfo, DropReason, FrameBuffer, PixelFormat, Timestamp};
pub use error::{Error, Result};
pub use sink::{DeliverySink, DeliveryStats, DropRecord, DropSnapshot};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Prefix of environment overrides, e.g. `FRAMESINK__SINK__DISPATCH=hand-off`.
pub const ENV_PREFIX: &str = "FRAMESINK";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub sink: SinkConfig,
    pub demo: DemoConfig,
}

/// Synthetic capture source settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Stop after this many frame ticks; run until stopped if unset.
    pub frame_limit: Option<u64>,
}

/// Where consumer callbacks run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchPolicy {
    /// On the producer thread. The producer is blocked for as long as the
    /// consumer callback takes.
    #[default]
    Inline,
    /// On a dedicated worker fed by a single FIFO queue.
    HandOff,
}

/// What detaching does with frames still queued for the hand-off worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TeardownMode {
    /// Deliver them before returning.
    #[default]
    Drain,
    /// Release them without calling the consumer.
    Discard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub dispatch: DispatchPolicy,
    /// Frames allowed in the hand-off queue (including the one being
    /// consumed) before new frames are dropped as consumer-too-slow.
    pub handoff_capacity: usize,
    pub teardown: TeardownMode,
    /// CPU core to pin the hand-off worker to.
    pub worker_core: Option<usize>,
}

/// Knobs for the demo binary's consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Simulated processing time per frame.
    pub consumer_work_ms: u64,
    /// Keep every Nth frame past its callback (0 = never).
    pub retain_every: u64,
    pub retain_ms: u64,
    pub report_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Nv12,
            buffer_count: 4,
            frame_limit: None,
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchPolicy::Inline,
            handoff_capacity: 3,
            teardown: TeardownMode::Drain,
            worker_core: None,
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            consumer_work_ms: 20,
            retain_every: 10,
            retain_ms: 250,
            report_interval_ms: 1000,
        }
    }
}

impl Config {
    /// Defaults, overlaid by an optional TOML file, overlaid by
    /// `FRAMESINK__<SECTION>__<KEY>` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }
}
