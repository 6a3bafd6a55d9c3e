pub mod frame;
pub mod pool;
pub mod source;
pub mod synthetic;

pub use frame::{FourCc, FrameBuffer, FrameMetadata, PixelFormat, Plane, PlaneLayout, Timestamp};
pub use pool::{BufferPool, HeapPool, PoolStats, PoolTicket, PooledStorage};
pub use source::{CaptureSession, ConnectionInfo, DropReason, SampleTarget, SourceDescriptor};
pub use synthetic::SyntheticSource;
