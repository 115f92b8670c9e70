//! Agent error types.

use kite_network::{Name, NetworkError, SecurityError};

/// Errors surfaced by the mobility agents.
///
/// Only [`MobilityError::Registration`] is fatal to an agent; everything
/// else concerns a single attempt and leaves the agent operational.
#[derive(Debug, thiserror::Error)]
pub enum MobilityError {
    /// The fabric refused the agent's prefix at start time.
    #[error("Registration failed: {0}")]
    Registration(#[source] NetworkError),

    /// The agent is idle.
    #[error("Agent not started")]
    NotStarted,

    /// A previous update request has not resolved yet.
    #[error("An update request is already in flight")]
    UpdateInFlight,

    /// The outbound message could not be signed.
    #[error("Signing failed: {0}")]
    Signing(#[from] SecurityError),

    /// A mobility message could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The agent options are unusable.
    #[error("Invalid options: {0}")]
    Options(#[from] OptionsError),
}

/// Encoding errors for update requests and acknowledgments.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("query carries no update request parameters")]
    MissingParameters,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The query name disagrees with the prefixes inside the request.
    #[error("query name {actual} does not match request for {expected}")]
    NameMismatch { expected: Name, actual: Name },

    /// The request is addressed to another rendezvous prefix.
    #[error("request targets rendezvous {actual}, this service owns {expected}")]
    ForeignRendezvous { expected: Name, actual: Name },

    /// Announcements must expire after a positive duration.
    #[error("announcement expiration must be positive")]
    ZeroExpiration,
}

/// Problems with [`crate::ProducerOptions`] or [`crate::RendezvousOptions`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OptionsError {
    #[error("no prefix pair configured")]
    NoPrefixPair,

    #[error("no rendezvous prefix configured")]
    NoPrefix,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}
