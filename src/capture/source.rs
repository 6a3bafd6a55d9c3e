//! Interface between the capture pipeline and the delivery core

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capture::frame::{FourCc, PlaneLayout, Timestamp};
use crate::capture::pool::PooledStorage;

/// Opaque session/stream identifier, passed through to consumers untouched.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionInfo {
    session: u64,
    stream: Arc<str>,
}

impl ConnectionInfo {
    pub fn new(session: u64, stream: impl Into<Arc<str>>) -> Self {
        Self {
            session,
            stream: stream.into(),
        }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.stream, self.session)
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One delivered sample: leased storage plus the format and geometry the
/// pipeline claims for it. Nothing has been validated yet.
///
/// Dropping a descriptor returns its storage to the pool.
#[derive(Debug)]
pub struct SourceDescriptor {
    pub fourcc: FourCc,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<PlaneLayout>,
    pub storage: PooledStorage,
}

impl SourceDescriptor {
    pub fn new(
        fourcc: FourCc,
        width: u32,
        height: u32,
        planes: Vec<PlaneLayout>,
        storage: PooledStorage,
    ) -> Self {
        Self {
            fourcc,
            width,
            height,
            planes,
            storage,
        }
    }
}

/// Why the pipeline could not deliver a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DropReason {
    BufferPoolExhausted,
    ConsumerTooSlow,
    PipelineStopped,
    Unknown,
}

impl DropReason {
    pub const ALL: [DropReason; 4] = [
        DropReason::BufferPoolExhausted,
        DropReason::ConsumerTooSlow,
        DropReason::PipelineStopped,
        DropReason::Unknown,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            DropReason::BufferPoolExhausted => 0,
            DropReason::ConsumerTooSlow => 1,
            DropReason::PipelineStopped => 2,
            DropReason::Unknown => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::BufferPoolExhausted => "buffer-pool-exhausted",
            DropReason::ConsumerTooSlow => "consumer-too-slow",
            DropReason::PipelineStopped => "pipeline-stopped",
            DropReason::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback target a capture pipeline delivers into.
///
/// Both entry points are invoked on the pipeline's producer thread, one at a
/// time and in arrival order. Implementations must not panic back into the
/// caller.
pub trait SampleTarget: Send + Sync {
    fn on_frame_available(
        &self,
        source: SourceDescriptor,
        timestamp: Timestamp,
        connection: &ConnectionInfo,
    );

    fn on_frame_dropped(&self, timestamp: Timestamp, connection: &ConnectionInfo, reason: DropReason);
}

/// The capture session a target binds to.
pub trait CaptureSession {
    fn connection(&self) -> ConnectionInfo;

    /// Bind (`Some`) or unbind (`None`) the session's callback target.
    fn set_target(&self, target: Option<Arc<dyn SampleTarget>>);
}
