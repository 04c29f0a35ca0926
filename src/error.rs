use crate::protocol::MessageKind;
use std::io;
use thiserror::Error;

/// Errors surfaced by the connection core.
///
/// Most transient conditions (replay, stale timestamps, queue overflow)
/// are swallowed and accounted in [`crate::stats::CoreStats`]; only
/// failures a caller can act on are reported here.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Identity error: {0}")]
    Identity(#[from] crate::identity::IdentityError),
    #[error("Malformed wire data: {0}")]
    Wire(&'static str),
    #[error("Message too large for transport ({size} > {limit})")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("Send queue full")]
    QueueFull,
    #[error("No session with peer")]
    NotConnected,
    #[error("No transport can reach the peer")]
    NoTransport,
    #[error("Transport not ready")]
    TransportNotReady,
    #[error("Transport failed: {0}")]
    TransportFailed(String),
    #[error("No session key established")]
    NoSessionKey,
    #[error("Decryption failed")]
    DecryptFailed,
    #[error("Handler rejected part of kind {0}")]
    HandlerRejected(MessageKind),
    /// Boot-time failures, the only kind that terminates the daemon.
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Core is shutting down")]
    Shutdown,
}

pub type CoreResult<T> = Result<T, CoreError>;
