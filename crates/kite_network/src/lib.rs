//! Kite Network: named-packet plumbing for producer mobility.
//!
//! This crate provides everything the mobility agents need from the
//! network: hierarchical names, signed query/response packets, faces onto a
//! forwarding fabric, and the signing and trust-policy machinery.
//!
//! # Architecture
//!
//! - **Names**: `/`-separated hierarchical names with prefix matching.
//! - **Packets**: queries pull named responses; both can carry an Ed25519
//!   signature naming the signing identity.
//! - **Faces**: [`Face`] is the application's attachment to the fabric.
//!   [`MemoryFabric`] is an in-process fabric; [`transport`] carries the
//!   same operations over WebSocket to a forwarder process.
//! - **Security**: [`KeyChain`] signs under named identities,
//!   [`TrustPolicy`] validates queries against anchors and rules.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use kite_network::{Face, MemoryFabric, Name, Query, Response};
//!
//! # async fn example() {
//! let fabric = MemoryFabric::new();
//! let producer = fabric.face();
//! let consumer = fabric.face();
//!
//! let mut registration = producer.register_prefix(&Name::parse("/a")).await.unwrap();
//! tokio::spawn(async move {
//!     while let Some(query) = registration.recv().await {
//!         let _ = producer.put(Response::new(query.name, b"hello".to_vec()));
//!     }
//! });
//!
//! let outcome = consumer.express(Query::new(Name::parse("/a/b"))).await.unwrap();
//! # }
//! ```

pub mod error;
pub mod face;
pub mod name;
pub mod packet;
pub mod security;
pub mod serde_helpers;
pub mod transport;
pub mod validator;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use error::{NetworkError, SecurityError, ValidationError};
pub use face::{Face, FabricStats, MemoryFabric, MemoryFace, PrefixRegistration, RegistrationId};
pub use name::Name;
pub use packet::{NackReason, Outcome, Query, Response, SignatureInfo};
pub use security::{KeyChain, Signer};
pub use transport::WsFace;
pub use validator::{NullValidator, SignerConstraint, TrustPolicy, Validator};
