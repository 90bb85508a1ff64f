//! Error taxonomy for the relay session engine
//!
//! Each class maps to one recovery policy:
//!
//! | Error            | Effect on the session                                |
//! |------------------|------------------------------------------------------|
//! | `DecodeError`    | connection-fatal, runs the teardown/retry path       |
//! | `EncodeError`    | the send is rejected, session keeps running          |
//! | `ProtocolError`  | logged, message dropped (unknown command is fatal)   |
//! | `TransportError` | teardown, pairing state cleared, retry armed         |
//! | `ConfigError`    | fatal at startup, nothing connects                   |

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reassembling or decoding frames from the relay
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A field declares more bytes than the frame still holds
    #[error("truncated {field}: need {needed} bytes, {available} available")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    /// Frame header announces a body above the frame limit
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Frame header length disagrees with the bytes supplied
    #[error("frame length mismatch: header says {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Bytes left over after the last field of a known message type
    #[error("{0} trailing bytes after message fields")]
    TrailingBytes(usize),

    /// List payload ends in a partial record
    #[error("malformed list: {0}")]
    MalformedList(String),

    /// A string field is not valid UTF-8
    #[error("field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    /// A field parsed but holds a value outside its domain
    #[error("invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// Errors raised while encoding an outbound message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// A variable-length field exceeds its wire capacity
    #[error("field {field} too long: {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// Encoded body exceeds the frame limit
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Well-formed messages that make no sense in the routing-token sub-protocol
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty routing token")]
    EmptyToken,

    #[error("{command}: expected {expected} arguments, got {got}")]
    ArgumentCount {
        command: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{command}: invalid argument {value:?}")]
    InvalidArgument {
        command: &'static str,
        value: String,
    },

    #[error("no paired tunnel with pairing id {0:?}")]
    UnknownPairing(String),

    /// The reply to this command would not fit on the wire
    #[error("{command}: reply cannot be encoded: {source}")]
    Unanswerable {
        command: &'static str,
        source: EncodeError,
    },

    /// Command name outside the sub-protocol; treated as connection-fatal
    #[error("unknown routing command {0:?}")]
    UnknownCommand(String),
}

impl ProtocolError {
    /// Whether the connection can keep running after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::UnknownCommand(_))
    }
}

/// Failures of the upstream connection
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("cannot resolve {0}")]
    Resolve(String),

    #[error("invalid server name {0:?}")]
    InvalidServerName(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed by peer")]
    Closed,
}

/// Configuration problems detected before connecting
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("mandatory setting {0} is missing")]
    Missing(&'static str),

    #[error("neither tunnels nor allowed ports specified")]
    NothingToDo,

    #[error("tunnel {index}: {reason}")]
    InvalidTunnel { index: usize, reason: &'static str },

    #[error("{0} must be a non-zero port")]
    ZeroPort(&'static str),

    #[error("timer {0} must be non-zero")]
    ZeroInterval(&'static str),
}

/// Umbrella error for session entry points
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// Whether this error must tear the upstream connection down
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            SessionError::Decode(_) | SessionError::Transport(_) => true,
            SessionError::Protocol(e) => e.is_fatal(),
            SessionError::Encode(_) => false,
        }
    }
}
