use thiserror::Error;

use crate::message::Role;

/// Errors surfaced by the relay, the dispatcher, and the endpoint client.
///
/// Variants whose `Display` text travels inside an error envelope keep the
/// exact wire wording (`no such action: ...`, `already have a sender`,
/// `relay slots full`).
#[derive(Debug, Error)]
pub enum Error {
    /// The peer closed the stream.
    #[error("connection closed")]
    ConnectionClosed,

    /// Any other transport failure while framing or connecting.
    #[error("read error: {0}")]
    Io(#[from] std::io::Error),

    /// Dial exceeded the connect timeout.
    #[error("connect timeout")]
    ConnectTimeout,

    /// PAKE finish failed or an AEAD tag did not verify.
    #[error("authentication failed")]
    Auth,

    /// Sealing a frame failed.
    #[error("encryption failed")]
    Encrypt,

    /// Envelope or body could not be decoded.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Message named an action nothing is registered for.
    #[error("no such action: {0}")]
    UnknownAction(String),

    /// The state cursor is not a state in the graph.
    #[error("unknown state")]
    UnknownState,

    /// The requested transition is not permitted from the current state.
    #[error("invalid next state")]
    InvalidNextState,

    /// The requested slot role is already occupied.
    #[error("already have a {0}")]
    RoleTaken(Role),

    /// Both slots of the relay are occupied.
    #[error("relay slots full")]
    SlotsFull,

    /// Encryption was enabled before a session key was set.
    #[error("no encryption key")]
    NoEncryptionKey,

    /// A reply carried a different action than the protocol step expects.
    #[error("expected {expected} message, got {got}")]
    UnexpectedAction { expected: String, got: String },

    /// The peer reported an error through the envelope.
    #[error("remote error: {0}")]
    Remote(String),

    /// Shutdown was observed. Never reported to the peer.
    #[error("cancelled")]
    Cancelled,
}
