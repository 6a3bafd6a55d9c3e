use thiserror::Error;

use crate::capture::FourCc;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level crate error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The source descriptor carried a pixel format code we don't know.
    #[error("unrecognised pixel format {fourcc}")]
    InvalidFormat { fourcc: FourCc },

    /// The descriptor's plane layout doesn't fit its format or its storage.
    #[error("invalid plane layout: {0}")]
    InvalidLayout(String),

    #[error("plane index {index} out of range (format has {planes} planes)")]
    OutOfRange { index: usize, planes: usize },

    #[error("frame {sequence} accessed after release")]
    UseAfterRelease { sequence: u64 },

    #[error("consumer callback failed on event {sequence}: {message}")]
    ConsumerFault { sequence: u64, message: String },

    #[error("capture already started")]
    AlreadyStarted,

    #[error("capture not started")]
    NotStarted,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("sink already attached to a session")]
    AlreadyAttached,

    #[error("sink not attached to a session")]
    NotAttached,

    #[error("failed to spawn hand-off worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
