//! Error types and the call error taxonomy.
//!
//! Every failure that can end an operation is a [`TransportError`]. Peer health and
//! retry decisions never look at the error itself, only at its [`ErrorCode`] as
//! returned by [`classify`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error classification shared by error frames, peer health and retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The operation ran out of time.
    Timeout,
    /// The caller cancelled the operation.
    Cancelled,
    /// The callee is overloaded.
    Busy,
    /// The callee refused the call (no handler, no peer, too many pending).
    Declined,
    /// The callee failed in an unexpected way.
    UnexpectedError,
    /// The call itself was malformed.
    BadRequest,
    /// The link to the callee failed.
    NetworkError,
    /// The callee reports itself as unhealthy.
    Unhealthy,
    /// The frame stream violated the protocol; the connection is unusable.
    ProtocolError,
}

impl ErrorCode {
    /// Wire value of the code.
    pub fn as_u8(self) -> u8 {
        match self {
            ErrorCode::Timeout => 0x01,
            ErrorCode::Cancelled => 0x02,
            ErrorCode::Busy => 0x03,
            ErrorCode::Declined => 0x04,
            ErrorCode::UnexpectedError => 0x05,
            ErrorCode::BadRequest => 0x06,
            ErrorCode::NetworkError => 0x07,
            ErrorCode::Unhealthy => 0x08,
            ErrorCode::ProtocolError => 0xFF,
        }
    }

    /// Parses a wire value.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x01 => Some(ErrorCode::Timeout),
            0x02 => Some(ErrorCode::Cancelled),
            0x03 => Some(ErrorCode::Busy),
            0x04 => Some(ErrorCode::Declined),
            0x05 => Some(ErrorCode::UnexpectedError),
            0x06 => Some(ErrorCode::BadRequest),
            0x07 => Some(ErrorCode::NetworkError),
            0x08 => Some(ErrorCode::Unhealthy),
            0xFF => Some(ErrorCode::ProtocolError),
            _ => None,
        }
    }

    /// Canonical name of the code.
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Timeout => "Timeout",
            ErrorCode::Cancelled => "Cancelled",
            ErrorCode::Busy => "Busy",
            ErrorCode::Declined => "Declined",
            ErrorCode::UnexpectedError => "UnexpectedError",
            ErrorCode::BadRequest => "BadRequest",
            ErrorCode::NetworkError => "NetworkError",
            ErrorCode::Unhealthy => "Unhealthy",
            ErrorCode::ProtocolError => "ProtocolError",
        }
    }

    /// Whether an error of this class says something about the callee's health.
    ///
    /// Client-side faults (bad requests, cancellation) and explicit unhealthy
    /// answers do not count against a peer.
    pub fn is_health_symptom(self) -> bool {
        match self {
            ErrorCode::Timeout
            | ErrorCode::Busy
            | ErrorCode::Declined
            | ErrorCode::UnexpectedError
            | ErrorCode::NetworkError
            | ErrorCode::ProtocolError => true,
            ErrorCode::BadRequest | ErrorCode::Cancelled | ErrorCode::Unhealthy => false,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which side tore a connection down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOrigin {
    /// This process closed the connection.
    Local,
    /// The remote end or the network failed it.
    Remote,
}

impl fmt::Display for ResetOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetOrigin::Local => f.write_str("local close"),
            ResetOrigin::Remote => f.write_str("remote failure"),
        }
    }
}

/// Errors produced by the transport core.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No peer in the pool could take the call.
    #[error("no peer available")]
    NoPeerAvailable,

    /// The address cannot be dialed.
    #[error("invalid peer address {addr}: {reason}")]
    InvalidPeerAddress {
        /// Address as given.
        addr: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A config value failed validation.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Which value and why.
        reason: String,
    },

    /// One attempt outlived its TTL.
    #[error("request {id} timed out after {elapsed_ms}ms (ttl {timeout_ms}ms)")]
    RequestTimeout {
        /// Operation id of the attempt.
        id: u32,
        /// Time the attempt was in flight.
        elapsed_ms: u64,
        /// TTL the attempt was sent with.
        timeout_ms: u64,
    },

    /// The whole retrying request ran out of budget.
    #[error("request deadline exceeded after {elapsed_ms}ms (timeout {timeout_ms}ms, {attempts} attempts)")]
    DeadlineExceeded {
        /// Time since the request started.
        elapsed_ms: u64,
        /// Total budget.
        timeout_ms: u64,
        /// Attempts made within the budget.
        attempts: usize,
    },

    /// The connection missed the handshake deadline or went silent.
    #[error("connection to {addr} timed out: {reason}")]
    ConnectionTimeout {
        /// Remote address.
        addr: String,
        /// What timed out.
        reason: String,
    },

    /// The connection was torn down with operations outstanding.
    #[error("connection to {addr} reset by {origin}: {cause}")]
    ConnectionReset {
        /// Remote address.
        addr: String,
        /// Side that caused the reset.
        origin: ResetOrigin,
        /// The error that ended the connection.
        cause: String,
    },

    /// The connection no longer accepts new work.
    #[error("connection to {addr} is closing")]
    ConnectionClosing {
        /// Remote address.
        addr: String,
    },

    /// The underlying socket closed.
    #[error("socket closed ({origin}): {reason}")]
    SocketClosed {
        /// Side that closed it.
        origin: ResetOrigin,
        /// Close reason.
        reason: String,
    },

    /// Dialing or I/O against a remote failed.
    #[error("network error talking to {addr}: {source}")]
    Network {
        /// Remote address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The remote broke the frame protocol.
    #[error("protocol error: {reason}")]
    Protocol {
        /// What was violated.
        reason: String,
    },

    /// A frame on the wire exceeded the size cap.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Encoded size.
        size: usize,
        /// Cap that was exceeded.
        max: usize,
    },

    /// A call or response would not fit in a frame; only that call fails.
    #[error("request too large: {size} bytes (max {max})")]
    RequestTooLarge {
        /// Encoded size of the first frame.
        size: usize,
        /// Frame size cap.
        max: usize,
    },

    /// Bincode could not encode or decode a frame.
    #[error("codec error: {0}")]
    Codec(String),

    /// The remote answered with an error frame.
    #[error("{code} error from {remote} for request {id}: {message}")]
    ErrorFrame {
        /// Error class sent by the remote.
        code: ErrorCode,
        /// Operation id the error answers.
        id: u32,
        /// Remote address.
        remote: String,
        /// Remote's message.
        message: String,
    },

    /// The resend sanity bound was hit.
    #[error("retry limit {limit} exceeded after {attempts} attempts in {elapsed_ms}ms (tried {tried:?})")]
    RetryLimitExceeded {
        /// Configured retry limit.
        limit: u32,
        /// Attempts made.
        attempts: usize,
        /// Time spent.
        elapsed_ms: u64,
        /// Peers tried, in order.
        tried: Vec<String>,
    },

    /// A front-door limit rejected the call.
    #[error("rate limited: {scope}")]
    RateLimited {
        /// Limit that was hit.
        scope: String,
    },

    /// The channel or peer was closed locally.
    #[error("channel closed")]
    ChannelClosed,

    /// Unattributed I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Error used when this process closes a connection on purpose.
    pub fn local_close() -> Self {
        TransportError::SocketClosed {
            origin: ResetOrigin::Local,
            reason: "local close".to_string(),
        }
    }

    /// Which side caused a connection-ending error.
    pub fn reset_origin(&self) -> ResetOrigin {
        match self {
            TransportError::SocketClosed { origin, .. }
            | TransportError::ConnectionReset { origin, .. } => *origin,
            TransportError::ChannelClosed => ResetOrigin::Local,
            _ => ResetOrigin::Remote,
        }
    }

    /// Shorthand for [`classify`].
    pub fn code(&self) -> Option<ErrorCode> {
        classify(self)
    }
}

/// Maps an error onto the call error taxonomy.
///
/// Returns `None` for errors that have no stable classification; callers surface
/// those verbatim instead of acting on them.
pub fn classify(err: &TransportError) -> Option<ErrorCode> {
    match err {
        TransportError::ErrorFrame { code, .. } => Some(*code),
        TransportError::NoPeerAvailable
        | TransportError::ChannelClosed => Some(ErrorCode::Declined),
        TransportError::RateLimited { .. } => Some(ErrorCode::Busy),
        TransportError::RequestTimeout { .. }
        | TransportError::DeadlineExceeded { .. }
        | TransportError::ConnectionTimeout { .. } => Some(ErrorCode::Timeout),
        TransportError::InvalidPeerAddress { .. }
        | TransportError::InvalidConfig { .. }
        | TransportError::RequestTooLarge { .. } => Some(ErrorCode::BadRequest),
        TransportError::Protocol { .. }
        | TransportError::FrameTooLarge { .. }
        | TransportError::Codec(_) => Some(ErrorCode::ProtocolError),
        TransportError::ConnectionReset { .. }
        | TransportError::ConnectionClosing { .. }
        | TransportError::SocketClosed { .. }
        | TransportError::Network { .. }
        | TransportError::Io(_) => Some(ErrorCode::NetworkError),
        TransportError::RetryLimitExceeded { .. } => None,
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TransportError>;
