//! Network and security error types.

use std::time::Duration;

use crate::name::Name;

/// Errors that can occur while talking to the forwarding fabric.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// The fabric refused to hand a prefix to this face.
    #[error("Failed to register prefix {prefix}: {reason}")]
    Registration { prefix: Name, reason: String },

    /// A transport-level error (WebSocket connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The face was closed or its fabric went away.
    #[error("Face closed")]
    FaceClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the key chain.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    /// No signing key is held for the requested identity.
    #[error("Unknown signing identity: {0}")]
    UnknownIdentity(Name),

    /// Stored key material could not be decoded.
    #[error("Invalid key material for {identity}: {reason}")]
    InvalidKey { identity: Name, reason: String },

    /// A key chain or trust policy file could not be read or written.
    #[error("Key storage error: {0}")]
    Storage(String),

    /// The packet could not be encoded for signing.
    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// Reason a packet failed the trust policy.
///
/// The rendezvous service never sends these to the requester; they exist
/// for local logging only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The packet carries no signature.
    #[error("packet is not signed")]
    Unsigned,

    /// The key locator names no trust anchor.
    #[error("no trust anchor for signer {0}")]
    UnknownSigner(Name),

    /// The signature does not verify against the anchor's key.
    #[error("signature does not verify")]
    BadSignature,

    /// No rule covers the packet name.
    #[error("no trust rule covers {0}")]
    NoMatchingRule(Name),

    /// The signer is not allowed to make the claim carried in the packet.
    #[error("signer {signer} may not sign for {claimed}")]
    SignerMismatch { signer: Name, claimed: Name },

    /// The packet parameters could not be decoded.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// The signature is older than the policy allows.
    #[error("signature is older than {max_age:?}")]
    Expired { max_age: Duration },
}
