//! Error types for the BitChat protocol core.
//!
//! Errors raised while processing inbound traffic are recovered where they
//! occur (the packet is dropped and logged). Only errors from explicit
//! operations such as sending or initiating a handshake reach the caller.

use thiserror::Error;

/// Core error type for BitChat operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The packet could not be decoded. Dropped, never retried.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// The packet could not be encoded, typically because it is too large.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The Noise handshake was aborted. The session must be discarded.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A single transport failed. Other transports are unaffected.
    #[error("transport error: {0}")]
    Transport(String),

    /// A signature or acknowledgement references a sender we do not know.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// Cryptographic operation failed.
    /// Details are intentionally vague to prevent oracle attacks.
    #[error("cryptographic operation failed")]
    Crypto(String),

    /// Key validation failed.
    #[error("invalid key material")]
    InvalidKey(String),

    /// Identity could not be created or restored.
    #[error("identity error: {0}")]
    Identity(String),

    /// Configuration value out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Storage operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A unicast was requested to a peer without an established session.
    #[error("peer not connected: {0}")]
    NotConnected(String),

    /// A cipher ran out of nonces. The session must be torn down.
    #[error("nonce space exhausted")]
    NonceExhausted,

    /// The peer is blocked.
    #[error("peer is blocked: {0}")]
    Blocked(String),

    /// The engine task is gone.
    #[error("engine channel closed")]
    ChannelClosed,
}

/// Result type alias using BitChat's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error is handled by silently dropping the offending packet.
    pub fn should_silent_drop(&self) -> bool {
        matches!(
            self,
            Error::MalformedPacket(_)
                | Error::Crypto(_)
                | Error::UnknownPeer(_)
                | Error::Blocked(_)
                | Error::InvalidKey(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
