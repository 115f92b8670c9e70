//! Kite Agents: producer mobility over a named-packet fabric.
//!
//! A mobile producer keeps itself reachable under
//! `<rendezvous-prefix>/<producer-suffix>` by sending signed update requests
//! to a rendezvous service, which validates them and acknowledges each
//! accepted one with a time-bounded prefix announcement.
//!
//! # Architecture
//!
//! - **Messages**: [`UpdateRequest`], [`Acknowledgment`] and
//!   [`PrefixAnnouncement`] encode onto queries and responses.
//! - **Agents**: [`MobileProducerAgent`] and [`RendezvousAgent`] are driven
//!   by their `step` / `run_until` methods on a single task; in-flight
//!   network work lives in a `JoinSet` that `stop` aborts.
//! - **Consumer**: [`probe`] checks that a producer prefix answers.

pub mod consumer;
pub mod error;
pub mod messages;
pub mod options;
pub mod producer;
pub mod rendezvous;
pub mod signal;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use consumer::{ProbeError, ProbeReport, probe};
pub use error::{CodecError, MobilityError, OptionsError};
pub use messages::{
    Acknowledgment, DEFAULT_ANNOUNCEMENT_EXPIRATION, KITE_MARKER, PrefixAnnouncement, PrefixPair,
    UpdateRequest,
};
pub use options::{ProducerOptions, RendezvousOptions, RetryPolicy};
pub use producer::{Binding, MobileProducerAgent, ProducerEvent, ProducerState};
pub use rendezvous::{RendezvousAgent, RendezvousEvent, RendezvousState};
pub use signal::Signal;
