//! Reachability probe.
//!
//! A consumer that expresses a query under a producer prefix and checks that
//! the answer is the producer's signed echo of that same query.

use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use kite_network::security::verify_response;
use kite_network::{Face, NackReason, Name, NetworkError, Outcome, Query};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Probe nacked: {0}")]
    Nacked(NackReason),

    #[error("Probe timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Response is not an echo of the probe: {0}")]
    NotAnEcho(String),

    #[error("Response signature does not verify")]
    BadSignature,

    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// A successful probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub name: Name,
    pub round_trip: Duration,
    /// Identity that signed the echo, if it was signed.
    pub signer: Option<Name>,
}

/// Probe `name` through `face`.
///
/// When `producer_key` is given the echo must carry a valid signature by it.
pub async fn probe(
    face: &dyn Face,
    name: Name,
    lifetime: Duration,
    producer_key: Option<&VerifyingKey>,
) -> Result<ProbeReport, ProbeError> {
    let query = Query::new(name.clone()).with_lifetime(lifetime);
    let nonce = query.nonce;
    let started = Instant::now();

    let response = match face.express(query).await? {
        Outcome::Response { response } => response,
        Outcome::Nack { reason } => return Err(ProbeError::Nacked(reason)),
        Outcome::Timeout => return Err(ProbeError::TimedOut(lifetime)),
    };
    let round_trip = started.elapsed();

    let echoed = Query::wire_decode(&response.content).map_err(|e| ProbeError::NotAnEcho(e.to_string()))?;
    if echoed.name != name || echoed.nonce != nonce {
        return Err(ProbeError::NotAnEcho(format!(
            "got {} with nonce {}",
            echoed.name, echoed.nonce
        )));
    }

    if let Some(key) = producer_key {
        if !verify_response(&response, key) {
            return Err(ProbeError::BadSignature);
        }
    }

    debug!("Probe {name} answered in {}ms", round_trip.as_millis());
    Ok(ProbeReport {
        name,
        round_trip,
        signer: response.signature.map(|s| s.key_locator),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
