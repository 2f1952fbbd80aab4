//! Typed error hierarchy: one enum per component family, composed into
//! [`EngineError`] at the engine boundary.

use thiserror::Error;

use crate::frame::PeerId;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("truncated input: needed {needed} bytes, had {have}")]
    TruncatedInput { needed: usize, have: usize },
    #[error("unknown wire version {0}")]
    UnknownVersion(u8),
    #[error("unknown frame type {0}")]
    UnknownType(u8),
    #[error("route path too long: {0} entries, max 32")]
    PathTooLong(usize),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no channel available for peer {0}")]
    Unavailable(PeerId),
    #[error("timed out acquiring a channel for peer {0}")]
    Timeout(PeerId),
}

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("encryption failed for peer {0}")]
    EncryptFailed(PeerId),
    #[error("decryption failed for peer {0}")]
    DecryptFailed(PeerId),
    #[error("no session key for peer {0}")]
    MissingKey(PeerId),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send failed to peer {0}")]
    SendFailed(PeerId),
    #[error("peer {0} not found")]
    PeerNotFound(PeerId),
    #[error("session error with peer {0}")]
    SessionError(PeerId),
}

#[derive(Debug, Error)]
pub enum RobustError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error(transparent)]
    Robust(#[from] RobustError),
    #[error("system unavailable: {0}")]
    SystemUnavailable(String),
    #[error("configuration error: {0}")]
    Config(String),
}
