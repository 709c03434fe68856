//! # Error Types
//!
//! Errors are split into two tiers:
//!
//! | Tier | Type | Effect on the session |
//! |------|------|-----------------------|
//! | Local | [`SessionError`] | Returned to the caller, session state untouched |
//! | Fatal | [`ProtocolError`] | Emitted as `PeerEvent::Error`, session closed |
//!
//! A remote that violates the protocol cannot be trusted to continue
//! correctly, so every [`ProtocolError`] raised while serving a remote
//! request closes the session unconditionally.

use thiserror::Error;

/// Violations committed by the remote side of a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Peer sent invalid PXP message")]
    InvalidFrame,

    #[error("Peer sent unknown PXP message: \"{0}\"")]
    UnknownCommand(String),

    #[error("Peer sent invalid payload for \"{0}\"")]
    InvalidPayload(String),

    #[error("Peer sent a reply for unknown request {0}")]
    UnexpectedReply(u32),

    #[error("Peer sent \"{0}\" without expecting a reply")]
    MissingRequestId(String),

    #[error("Peer has an invalid protocol version.theirs={theirs}, ours={ours}")]
    VersionMismatch { theirs: u32, ours: u32 },

    #[error("Peer does not have any networks in common.")]
    NoCommonNetworks,

    #[error("Peer requested an unknown network:\"{0}\"")]
    UnknownNetwork(String),

    #[error("Peer requested unknown candidate: id={0}")]
    UnknownCandidate(String),

    #[error("Peer tried to connect to network \"{0}\" twice")]
    DuplicateConnect(String),

    #[error("discovery provider for network \"{network}\" failed: {reason}")]
    Discovery { network: String, reason: String },

    #[error("failed to open channel \"{name}\" for peer request: {reason}")]
    ChannelFailed { name: String, reason: String },

    #[error("relay connector for candidate {candidate} did not yield a stream: {reason}")]
    Connector { candidate: String, reason: String },
}

/// Every failure surfaced by the public API.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("must specify an array of supported networks")]
    NoNetworks,

    #[error("Peer tried to connect for unsupported network \"{0}\"")]
    UnsupportedNetwork(String),

    #[error("Already connected for network \"{0}\"")]
    AlreadyConnected(String),

    #[error("Can only upgrade relayed connections")]
    NotRelayed,

    #[error("Peer is not accepting relayed connections")]
    NotAccepting,

    #[error("Peer sent invalid response to \"{0}\"")]
    InvalidResponse(&'static str),

    /// Failure string returned by the remote in a reply.
    #[error("{0}")]
    Remote(String),

    #[error("session is closed")]
    Closed,

    #[error("failed to open channel \"{name}\": {source}")]
    Channel {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("control channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Codec(#[from] bincode::Error),

    #[error("CSPRNG unavailable: {0}")]
    Rng(#[from] getrandom::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    /// Returns the protocol violation behind this error, if any.
    pub fn as_protocol(&self) -> Option<&ProtocolError> {
        match self {
            SessionError::Protocol(err) => Some(err),
            _ => None,
        }
    }
}
