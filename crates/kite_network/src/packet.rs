//! Packet protocol: named queries and the responses that satisfy them.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SecurityError;
use crate::name::Name;
use crate::security::Signer;
use crate::serde_helpers::{duration_ms, hex_bytes};

/// Lifetime applied to queries that do not set one.
pub const DEFAULT_QUERY_LIFETIME: Duration = Duration::from_millis(4000);

/// Signature block attached to a signed packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    /// Identity whose key produced the signature.
    pub key_locator: Name,
    /// When the signature was made.
    pub signed_at: DateTime<Utc>,
    /// Raw Ed25519 signature bytes.
    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
}

impl SignatureInfo {
    /// The exact bytes covered by a signature: the packet's signed portion
    /// followed by the key locator and signing time.
    pub fn signable_bytes(portion: &[u8], key_locator: &Name, signed_at: DateTime<Utc>) -> Vec<u8> {
        let mut bytes = portion.to_vec();
        bytes.push(0);
        bytes.extend_from_slice(key_locator.to_uri().as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(signed_at.to_rfc3339().as_bytes());
        bytes
    }
}

/// A request for named data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub name: Name,
    /// Random value the fabric uses to tell retransmissions apart.
    pub nonce: u32,
    /// How long the fabric keeps the query pending before timing it out.
    #[serde(with = "duration_ms")]
    pub lifetime: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_parameters: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureInfo>,
}

#[derive(Serialize)]
struct QuerySignedPortion<'a> {
    name: &'a Name,
    app_parameters: &'a Option<serde_json::Value>,
}

impl Query {
    /// Create an unsigned query with a fresh nonce and the default lifetime.
    pub fn new(name: Name) -> Self {
        Self {
            name,
            nonce: rand::random(),
            lifetime: DEFAULT_QUERY_LIFETIME,
            app_parameters: None,
            signature: None,
        }
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn with_app_parameters(mut self, params: serde_json::Value) -> Self {
        self.app_parameters = Some(params);
        self
    }

    /// Bytes covered by the signature (name and parameters).
    pub fn signed_portion(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&QuerySignedPortion {
            name: &self.name,
            app_parameters: &self.app_parameters,
        })
    }

    /// Sign the query in place under `identity`.
    pub fn sign(&mut self, signer: &dyn Signer, identity: &Name) -> Result<(), SecurityError> {
        let portion = self
            .signed_portion()
            .map_err(|e| SecurityError::Encoding(e.to_string()))?;
        self.signature = Some(signer.sign(&portion, identity)?);
        Ok(())
    }

    /// Full wire encoding of the query, signature included.
    pub fn wire_encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn wire_decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Named data returned in answer to a [`Query`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub name: Name,
    #[serde(with = "hex_bytes")]
    pub content: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureInfo>,
}

#[derive(Serialize)]
struct ResponseSignedPortion<'a> {
    name: &'a Name,
    #[serde(with = "hex_bytes")]
    content: &'a [u8],
}

impl Response {
    pub fn new(name: Name, content: Vec<u8>) -> Self {
        Self {
            name,
            content,
            signature: None,
        }
    }

    /// Whether this response answers `query`. Responses carry the query's
    /// exact name.
    pub fn satisfies(&self, query: &Query) -> bool {
        self.name == query.name
    }

    pub fn signed_portion(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&ResponseSignedPortion {
            name: &self.name,
            content: &self.content,
        })
    }

    /// Sign the response in place under `identity`.
    pub fn sign(&mut self, signer: &dyn Signer, identity: &Name) -> Result<(), SecurityError> {
        let portion = self
            .signed_portion()
            .map_err(|e| SecurityError::Encoding(e.to_string()))?;
        self.signature = Some(signer.sign(&portion, identity)?);
        Ok(())
    }
}

/// Why the fabric refused to forward a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NackReason {
    /// No registration covers the query name.
    NoRoute,
    /// The fabric is overloaded.
    Congestion,
    /// A query with the same nonce is already pending.
    Duplicate,
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NackReason::NoRoute => write!(f, "no route"),
            NackReason::Congestion => write!(f, "congestion"),
            NackReason::Duplicate => write!(f, "duplicate"),
        }
    }
}

/// Result of expressing a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Response { response: Response },
    Nack { reason: NackReason },
    Timeout,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
