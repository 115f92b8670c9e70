//! Mobility messages: update requests, acknowledgments and announcements.
//!
//! An update request travels as a signed [`Query`] named
//! `<rendezvous-prefix>/kite/<producer-suffix>` whose parameters carry the
//! JSON-encoded [`UpdateRequest`]. The acknowledgment is the [`Response`] to
//! that query with a JSON-encoded [`Acknowledgment`] as content.

use std::time::Duration;

use kite_network::serde_helpers::{duration_ms, option_duration_ms};
use kite_network::{Name, Query, Response};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Name component separating the rendezvous prefix from the producer
/// suffix in update request names.
pub const KITE_MARKER: &str = "kite";

/// Expiration applied when a request does not ask for one.
pub const DEFAULT_ANNOUNCEMENT_EXPIRATION: Duration = Duration::from_millis(1000);

/// A rendezvous prefix and the producer suffix registered under it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrefixPair {
    pub rendezvous_prefix: Name,
    pub producer_suffix: Name,
}

impl PrefixPair {
    pub fn new(rendezvous_prefix: Name, producer_suffix: Name) -> Self {
        Self {
            rendezvous_prefix,
            producer_suffix,
        }
    }

    /// The producer's full reachable name: rendezvous prefix ⧺ suffix.
    pub fn producer_prefix(&self) -> Name {
        self.rendezvous_prefix.join(&self.producer_suffix)
    }
}

/// A producer's request to (re)bind its prefix at the rendezvous point.
///
/// Requests carry no sequence number, so a replayed request cannot be told
/// apart from a fresh one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub rendezvous_prefix: Name,
    pub producer_suffix: Name,
    #[serde(
        default,
        rename = "requested_expiration_ms",
        with = "option_duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub requested_expiration: Option<Duration>,
}

impl UpdateRequest {
    pub fn new(pair: &PrefixPair, requested_expiration: Option<Duration>) -> Self {
        Self {
            rendezvous_prefix: pair.rendezvous_prefix.clone(),
            producer_suffix: pair.producer_suffix.clone(),
            requested_expiration,
        }
    }

    pub fn producer_prefix(&self) -> Name {
        self.rendezvous_prefix.join(&self.producer_suffix)
    }

    /// `<rendezvous-prefix>/kite/<producer-suffix>`
    pub fn query_name(&self) -> Name {
        self.rendezvous_prefix
            .append(KITE_MARKER)
            .join(&self.producer_suffix)
    }

    /// The expiration the rendezvous service grants: the requested one when
    /// it is positive, the default otherwise.
    pub fn granted_expiration(&self) -> Duration {
        match self.requested_expiration {
            Some(d) if !d.is_zero() => d,
            _ => DEFAULT_ANNOUNCEMENT_EXPIRATION,
        }
    }

    /// Encode as an unsigned query with the given lifetime.
    pub fn to_query(&self, lifetime: Duration) -> Result<Query, CodecError> {
        let params = serde_json::to_value(self)?;
        Ok(Query::new(self.query_name())
            .with_lifetime(lifetime)
            .with_app_parameters(params))
    }

    /// Decode from a query, checking that its name matches the prefixes it
    /// carries.
    pub fn from_query(query: &Query) -> Result<Self, CodecError> {
        let params = query
            .app_parameters
            .as_ref()
            .ok_or(CodecError::MissingParameters)?;
        let request: Self = serde_json::from_value(params.clone())?;
        let expected = request.query_name();
        if query.name != expected {
            return Err(CodecError::NameMismatch {
                expected,
                actual: query.name.clone(),
            });
        }
        Ok(request)
    }
}

/// A time-bounded claim that `announced_name` is reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixAnnouncement {
    pub announced_name: Name,
    #[serde(rename = "expiration_ms", with = "duration_ms")]
    pub expiration: Duration,
}

impl PrefixAnnouncement {
    pub fn new(announced_name: Name, expiration: Duration) -> Result<Self, CodecError> {
        if expiration.is_zero() {
            return Err(CodecError::ZeroExpiration);
        }
        Ok(Self {
            announced_name,
            expiration,
        })
    }

    /// The announcement granted for an accepted request.
    pub fn for_request(request: &UpdateRequest) -> Self {
        Self {
            announced_name: request.producer_prefix(),
            expiration: request.granted_expiration(),
        }
    }
}

/// The rendezvous service's answer to an accepted update request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub announcement: PrefixAnnouncement,
}

impl Acknowledgment {
    pub fn new(announcement: PrefixAnnouncement) -> Self {
        Self { announcement }
    }

    /// Encode as the (unsigned) response to `query`.
    pub fn to_response(&self, query: &Query) -> Result<Response, CodecError> {
        let content = serde_json::to_vec(self)?;
        Ok(Response::new(query.name.clone(), content))
    }

    pub fn from_response(response: &Response) -> Result<Self, CodecError> {
        let ack: Self = serde_json::from_slice(&response.content)?;
        if ack.announcement.expiration.is_zero() {
            return Err(CodecError::ZeroExpiration);
        }
        Ok(ack)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
