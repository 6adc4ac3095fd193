//! Error types for the Bluetooth PCM bridge

use thiserror::Error;

/// Main error type for the bridge
#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control-channel protocol errors.
///
/// These always fail the in-progress operation and are never retried
/// internally, except the remote-closed-endpoint case during stream start
/// (see `Session::start`).
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Receive timed out")]
    Timeout,

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unexpected message {got:?} while waiting for {expected:?}")]
    UnexpectedMessage {
        expected: crate::ipc::message::MessageName,
        got: crate::ipc::message::MessageName,
    },

    #[error("Remote reported errno {errno} for {name:?}")]
    Remote {
        name: crate::ipc::message::MessageName,
        errno: i32,
    },

    #[error("Service socket error: {0}")]
    Socket(String),
}

impl ProtocolError {
    /// True when the remote side closed the stream endpoint and the caller
    /// should fall back to a full reopen on its next attempt.
    pub fn is_endpoint_closed(&self) -> bool {
        matches!(self, ProtocolError::Remote { errno, .. } if *errno == libc::EAGAIN)
    }
}

/// Data-channel transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Underrun detected: the synthesized hardware pointer overtook the
    /// application pointer. The stream has been stopped.
    #[error("Broken pipe: hardware pointer passed application pointer")]
    Underrun,

    #[error("Data socket disconnected")]
    Disconnected,

    #[error("Short transfer unit: expected {expected} bytes, got {got}")]
    SizeMismatch { expected: usize, got: usize },

    /// The socket was not writable and the overrun policy forbids dropping.
    #[error("Transmit would block")]
    WouldBlock,

    #[error("Capture over the encoded transport is unsupported")]
    Unsupported,

    #[error("Data socket IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Codec adapter errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("No codec installed for the encoded transport")]
    Missing,

    #[error("Unsupported parameter: {0}")]
    UnsupportedParameter(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Encoder produced no output for a full block")]
    EmptyBlock,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("Missing remote device address")]
    MissingDevice,

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Result type alias for the bridge
pub type Result<T> = std::result::Result<T, Error>;
