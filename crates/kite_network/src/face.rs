//! Faces: an application's attachment to the forwarding fabric.
//!
//! A [`Face`] lets an application claim a name prefix (inbound queries under
//! it are delivered to a [`PrefixRegistration`]), answer those queries with
//! [`Response`]s, and express its own queries.
//!
//! [`MemoryFabric`] is an in-process fabric: every [`MemoryFace`] created from
//! it shares one route table and one pending-query table. The WebSocket
//! forwarder in [`crate::transport`] is built on top of it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::error::NetworkError;
use crate::name::Name;
use crate::packet::{NackReason, Outcome, Query, Response};

/// Identifier of a prefix registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistrationId(pub String);

impl RegistrationId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A claimed prefix and the stream of queries routed to it.
///
/// The stream ends once the registration is withdrawn.
#[derive(Debug)]
pub struct PrefixRegistration {
    id: RegistrationId,
    prefix: Name,
    queries: mpsc::UnboundedReceiver<Query>,
}

impl PrefixRegistration {
    pub fn new(id: RegistrationId, prefix: Name, queries: mpsc::UnboundedReceiver<Query>) -> Self {
        Self {
            id,
            prefix,
            queries,
        }
    }

    pub fn id(&self) -> &RegistrationId {
        &self.id
    }

    pub fn prefix(&self) -> &Name {
        &self.prefix
    }

    /// Wait for the next inbound query. Cancel safe.
    pub async fn recv(&mut self) -> Option<Query> {
        self.queries.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Query> {
        self.queries.try_recv().ok()
    }
}

/// Attachment point to the forwarding fabric.
#[async_trait]
pub trait Face: Send + Sync {
    /// Claim `prefix`. Fails if the fabric cannot hand it to this face.
    async fn register_prefix(&self, prefix: &Name) -> Result<PrefixRegistration, NetworkError>;

    /// Withdraw a registration. Unknown ids are ignored.
    fn unregister(&self, id: &RegistrationId);

    /// Send a response for a pending query. Never blocks.
    fn put(&self, response: Response) -> Result<(), NetworkError>;

    /// Express a query and wait for its outcome, bounded by the query
    /// lifetime.
    async fn express(&self, query: Query) -> Result<Outcome, NetworkError>;
}

// ---------------------------------------------------------------------------
// In-memory fabric
// ---------------------------------------------------------------------------

/// Counters exposed for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FabricStats {
    pub queries_forwarded: u64,
    pub responses_put: u64,
    pub responses_delivered: u64,
    pub nacks: u64,
    pub timeouts: u64,
}

struct Route {
    id: RegistrationId,
    prefix: Name,
    face: u64,
    tx: mpsc::UnboundedSender<Query>,
}

struct PendingQuery {
    token: u64,
    name: Name,
    nonce: u32,
    tx: oneshot::Sender<Response>,
}

/// Removes a pending-table entry when its `express` call ends, whether it
/// resolved, timed out or was dropped.
struct PendingGuard {
    state: Arc<Mutex<FabricState>>,
    token: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.state.lock().pending.retain(|p| p.token != self.token);
    }
}

#[derive(Default)]
struct FabricState {
    routes: Vec<Route>,
    pending: Vec<PendingQuery>,
    denied: Vec<Name>,
    stats: FabricStats,
}

/// In-process forwarding fabric shared by any number of [`MemoryFace`]s.
#[derive(Clone, Default)]
pub struct MemoryFabric {
    state: Arc<Mutex<FabricState>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new face.
    pub fn face(&self) -> MemoryFace {
        MemoryFace {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            fabric: self.clone(),
        }
    }

    /// Refuse registrations under `prefix`, as a misconfigured local
    /// forwarder would.
    pub fn deny_prefix(&self, prefix: Name) {
        self.state.lock().denied.push(prefix);
    }

    pub fn stats(&self) -> FabricStats {
        self.state.lock().stats
    }

    pub fn route_count(&self) -> usize {
        self.state.lock().routes.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}

/// A face attached to a [`MemoryFabric`].
pub struct MemoryFace {
    id: u64,
    fabric: MemoryFabric,
}

impl MemoryFace {
    /// Withdraw every registration held by this face.
    pub fn close(&self) {
        self.fabric.state.lock().routes.retain(|r| r.face != self.id);
    }
}

#[async_trait]
impl Face for MemoryFace {
    async fn register_prefix(&self, prefix: &Name) -> Result<PrefixRegistration, NetworkError> {
        let mut state = self.fabric.state.lock();

        if state.denied.iter().any(|d| d.is_prefix_of(prefix)) {
            return Err(NetworkError::Registration {
                prefix: prefix.clone(),
                reason: "refused by forwarder".to_string(),
            });
        }
        // Drop routes whose owners went away so their prefixes can be reclaimed.
        state.routes.retain(|r| !r.tx.is_closed());
        if state
            .routes
            .iter()
            .any(|r| r.prefix == *prefix && r.face != self.id)
        {
            return Err(NetworkError::Registration {
                prefix: prefix.clone(),
                reason: "already registered by another face".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = RegistrationId::generate();
        state.routes.push(Route {
            id: id.clone(),
            prefix: prefix.clone(),
            face: self.id,
            tx,
        });
        debug!("Face {} registered {prefix} ({id})", self.id);
        Ok(PrefixRegistration::new(id, prefix.clone(), rx))
    }

    fn unregister(&self, id: &RegistrationId) {
        let mut state = self.fabric.state.lock();
        let before = state.routes.len();
        state.routes.retain(|r| r.id != *id);
        if state.routes.len() < before {
            debug!("Face {} withdrew registration {id}", self.id);
        }
    }

    fn put(&self, response: Response) -> Result<(), NetworkError> {
        let mut state = self.fabric.state.lock();
        state.stats.responses_put += 1;

        let (matched, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
            .into_iter()
            .partition(|p| p.name == response.name);
        state.pending = rest;

        if matched.is_empty() {
            trace!("Dropping unsolicited response {}", response.name);
        }
        for pending in matched {
            if pending.tx.send(response.clone()).is_ok() {
                state.stats.responses_delivered += 1;
            }
        }
        Ok(())
    }

    async fn express(&self, query: Query) -> Result<Outcome, NetworkError> {
        let lifetime = query.lifetime;
        let token = self.fabric.next_id.fetch_add(1, Ordering::Relaxed);

        let rx = {
            let mut state = self.fabric.state.lock();

            if state
                .pending
                .iter()
                .any(|p| p.name == query.name && p.nonce == query.nonce)
            {
                state.stats.nacks += 1;
                return Ok(Outcome::Nack {
                    reason: NackReason::Duplicate,
                });
            }

            let route_tx = state
                .routes
                .iter()
                .filter(|r| r.face != self.id && !r.tx.is_closed())
                .filter(|r| r.prefix.is_prefix_of(&query.name))
                .max_by_key(|r| r.prefix.len())
                .map(|r| r.tx.clone());
            let Some(route_tx) = route_tx else {
                state.stats.nacks += 1;
                debug!("No route for {}", query.name);
                return Ok(Outcome::Nack {
                    reason: NackReason::NoRoute,
                });
            };

            let (tx, rx) = oneshot::channel();
            state.pending.push(PendingQuery {
                token,
                name: query.name.clone(),
                nonce: query.nonce,
                tx,
            });

            let name = query.name.clone();
            if route_tx.send(query).is_err() {
                state.pending.retain(|p| p.token != token);
                state.stats.nacks += 1;
                return Ok(Outcome::Nack {
                    reason: NackReason::NoRoute,
                });
            }
            state.stats.queries_forwarded += 1;
            trace!("Forwarded {name}");
            rx
        };
        let _pending = PendingGuard {
            state: Arc::clone(&self.fabric.state),
            token,
        };

        match tokio::time::timeout(lifetime, rx).await {
            Ok(Ok(response)) => Ok(Outcome::Response { response }),
            Ok(Err(_)) => Err(NetworkError::FaceClosed),
            Err(_) => {
                self.fabric.state.lock().stats.timeouts += 1;
                Ok(Outcome::Timeout)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_query_reaches_registered_prefix() {
        let fabric = MemoryFabric::new();
        let producer = fabric.face();
        let consumer = fabric.face();

        let mut reg = producer.register_prefix(&Name::parse("/a")).await.unwrap();
        let query = Query::new(Name::parse("/a/b"));

        let pending = tokio::spawn(async move { consumer.express(query).await });

        let received = reg.recv().await.unwrap();
        assert_eq!(received.name, Name::parse("/a/b"));
        producer
            .put(Response::new(received.name.clone(), b"hi".to_vec()))
            .unwrap();

        match pending.await.unwrap().unwrap() {
            Outcome::Response { response } => assert_eq!(response.content, b"hi"),
            other => panic!("Expected response, got {other:?}"),
        }
        assert_eq!(fabric.stats().responses_delivered, 1);
        assert_eq!(fabric.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_no_route_nack() {
        let fabric = MemoryFabric::new();
        let consumer = fabric.face();
        let outcome = consumer.express(Query::new(Name::parse("/nowhere"))).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Nack {
                reason: NackReason::NoRoute
            }
        );
        assert_eq!(fabric.stats().nacks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_query_times_out() {
        let fabric = MemoryFabric::new();
        let producer = fabric.face();
        let consumer = fabric.face();
        let _reg = producer.register_prefix(&Name::parse("/a")).await.unwrap();

        let query = Query::new(Name::parse("/a/x")).with_lifetime(Duration::from_millis(500));
        let outcome = consumer.express(query).await.unwrap();
        assert_eq!(outcome, Outcome::Timeout);
        assert_eq!(fabric.stats().timeouts, 1);
        assert_eq!(fabric.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_express_leaves_no_pending_entry() {
        let fabric = MemoryFabric::new();
        let producer = fabric.face();
        let mut reg = producer.register_prefix(&Name::parse("/rv")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..5 {
            let consumer = fabric.face();
            let query = Query::new(Name::parse(&format!("/rv/kite/p{i}"))).with_lifetime(Duration::from_secs(60));
            handles.push(tokio::spawn(async move { consumer.express(query).await }));
        }
        tokio::task::yield_now().await;
        assert_eq!(fabric.pending_count(), 5);

        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            assert!(handle.await.unwrap_err().is_cancelled());
        }
        assert_eq!(fabric.pending_count(), 0);

        let mut forwarded = 0;
        while reg.try_recv().is_some() {
            forwarded += 1;
        }
        assert_eq!(forwarded, 5);
    }

    #[tokio::test]
    async fn test_longest_prefix_match() {
        let fabric = MemoryFabric::new();
        let short = fabric.face();
        let long = fabric.face();
        let consumer = fabric.face();

        let mut short_reg = short.register_prefix(&Name::parse("/a")).await.unwrap();
        let mut long_reg = long.register_prefix(&Name::parse("/a/b")).await.unwrap();

        let query = Query::new(Name::parse("/a/b/c")).with_lifetime(Duration::from_millis(50));
        let _ = consumer.express(query).await.unwrap();

        assert!(long_reg.try_recv().is_some());
        assert!(short_reg.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails() {
        let fabric = MemoryFabric::new();
        let first = fabric.face();
        let second = fabric.face();

        let _reg = first.register_prefix(&Name::parse("/rv")).await.unwrap();
        let err = second.register_prefix(&Name::parse("/rv")).await.unwrap_err();
        assert!(matches!(err, NetworkError::Registration { .. }));
    }

    #[tokio::test]
    async fn test_denied_prefix_fails() {
        let fabric = MemoryFabric::new();
        fabric.deny_prefix(Name::parse("/forbidden"));
        let face = fabric.face();
        let err = face
            .register_prefix(&Name::parse("/forbidden/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Registration { .. }));
    }

    #[tokio::test]
    async fn test_unregister_ends_stream_and_frees_prefix() {
        let fabric = MemoryFabric::new();
        let first = fabric.face();
        let second = fabric.face();

        let mut reg = first.register_prefix(&Name::parse("/rv")).await.unwrap();
        first.unregister(reg.id());
        assert!(reg.recv().await.is_none());
        assert_eq!(fabric.route_count(), 0);

        assert!(second.register_prefix(&Name::parse("/rv")).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_registration_frees_prefix() {
        let fabric = MemoryFabric::new();
        let first = fabric.face();
        let second = fabric.face();

        let reg = first.register_prefix(&Name::parse("/rv")).await.unwrap();
        drop(reg);
        assert!(second.register_prefix(&Name::parse("/rv")).await.is_ok());
    }

    #[tokio::test]
    async fn test_unsolicited_response_is_counted_not_delivered() {
        let fabric = MemoryFabric::new();
        let face = fabric.face();
        face.put(Response::new(Name::parse("/x"), vec![])).unwrap();
        let stats = fabric.stats();
        assert_eq!(stats.responses_put, 1);
        assert_eq!(stats.responses_delivered, 0);
    }

    #[tokio::test]
    async fn test_face_does_not_route_to_itself() {
        let fabric = MemoryFabric::new();
        let face = fabric.face();
        let _reg = face.register_prefix(&Name::parse("/self")).await.unwrap();
        let outcome = face.express(Query::new(Name::parse("/self/x"))).await.unwrap();
        assert!(matches!(outcome, Outcome::Nack { .. }));
    }
}
