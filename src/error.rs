use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that stop the whole bridge.
///
/// Anything scoped to a single client is reported as a [`CloseReason`]
/// instead and never reaches this type.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("TUN device '{name}' unavailable: {source}")]
    DeviceUnavailable {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind local channel at {}: {source}", path.display())]
    ChannelBindFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("TUN device I/O failed: {0}")]
    DeviceIo(#[source] io::Error),

    #[error("poll failed: {0}")]
    Poll(#[from] nix::Error),

    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    #[error("failed to read config {}: {source}", path.display())]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl BridgeError {
    pub fn config(reason: impl Into<String>) -> Self {
        BridgeError::Config {
            reason: reason.into(),
        }
    }
}

/// Framing violations. Both are fatal to the session that sent them.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame length {len} exceeds maximum of {max}", max = crate::codec::MAX_FRAME_LEN)]
    TooLarge { len: usize },

    #[error("zero-length frame")]
    Empty,
}

/// Why a client session was torn down.
#[derive(Error, Debug)]
pub enum CloseReason {
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("protocol violation: {0}")]
    Protocol(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("socket hang-up")]
    HangUp,
}
