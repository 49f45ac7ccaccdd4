use std::{io, path::PathBuf};

use locsim_common::device::DeviceIdentifier;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceIdentifier),
    #[error("Handshake with {udid} failed: {reason}")]
    HandshakeFailed {
        udid: DeviceIdentifier,
        reason: String,
    },
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),
}

/// Failure reported by a remote control session or image mounter.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Request refused: {0}")]
    Refused(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum FileServiceError {
    #[error("Path already exists")]
    AlreadyExists,
    #[error("Path not found")]
    NotFound,
    #[error("Request refused: {0}")]
    Refused(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Service {name} unavailable: {reason}")]
    ServiceUnavailable { name: String, reason: String },
    #[error("Connecting to service {name} failed: {source}")]
    ServiceConnectFailed {
        name: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum InfoError {
    #[error("Value unavailable: {0}")]
    ValueUnavailable(&'static str),
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

#[derive(Debug, Error)]
pub enum SpoofError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("Partial write: sent {sent} of {expected} bytes")]
    PartialWrite { sent: usize, expected: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Emulator rejected the location request")]
    EmulatorRejected,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("Device OS version unavailable")]
    VersionUnavailable,
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("Local file {} missing: {source}", path.display())]
    LocalFileMissing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    #[error("Mount rejected ({code}): {message}")]
    MountRejected { code: i64, message: String },
    #[error("Provisioning cancelled")]
    Cancelled,
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("File service error: {0}")]
    FileService(#[from] FileServiceError),
    #[error("No developer disk image installed for {os} {version}")]
    ImageNotInstalled { os: String, version: String },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("Bridge request timed out")]
    Timeout,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame truncated")]
    Truncated,
    #[error("Unknown command {0}")]
    UnknownCommand(u32),
    #[error("Coordinate is not valid text")]
    InvalidText,
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
}
