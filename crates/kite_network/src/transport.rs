//! WebSocket transport: forwarder server and client faces.
//!
//! A forwarder process hosts a [`MemoryFabric`] and accepts WebSocket
//! connections. Every connection gets its own [`MemoryFace`] on that fabric;
//! the remote side drives it with JSON [`Frame`]s. [`WsFace`] is the client
//! end and implements [`Face`], so agents run unchanged over a real link.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async};
use tracing::{debug, error, info, warn};

use crate::error::NetworkError;
use crate::face::{Face, MemoryFabric, MemoryFace, PrefixRegistration, RegistrationId};
use crate::name::Name;
use crate::packet::{NackReason, Outcome, Query, Response};

/// Extra time a client waits past the query lifetime for the forwarder's
/// own timeout verdict.
const OUTCOME_GRACE: Duration = Duration::from_secs(1);

/// A message on a forwarder link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Register {
        request_id: u64,
        prefix: Name,
    },
    Registered {
        request_id: u64,
        registration: RegistrationId,
    },
    RegisterFailed {
        request_id: u64,
        reason: String,
    },
    Unregister {
        registration: RegistrationId,
    },
    Express {
        request_id: u64,
        query: Query,
    },
    Outcome {
        request_id: u64,
        outcome: Outcome,
    },
    Incoming {
        registration: RegistrationId,
        query: Query,
    },
    Put {
        response: Response,
    },
}

impl Frame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ---------------------------------------------------------------------------
// Forwarder
// ---------------------------------------------------------------------------

/// Run a forwarder on `addr` until `shutdown` fires.
pub async fn start_forwarder(
    addr: SocketAddr,
    fabric: MemoryFabric,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), NetworkError> {
    let listener = TcpListener::bind(addr).await.map_err(NetworkError::Io)?;
    serve_forwarder(listener, fabric, shutdown).await
}

/// Run a forwarder on an already-bound listener.
pub async fn serve_forwarder(
    listener: TcpListener,
    fabric: MemoryFabric,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), NetworkError> {
    info!("Forwarder listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let face = fabric.face();
                        tokio::spawn(async move {
                            serve_link(stream, peer_addr, face).await;
                        });
                    }
                    Err(e) => {
                        error!("TCP accept failed: {e}");
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Forwarder shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Serve one application link until it closes.
async fn serve_link(stream: TcpStream, peer_addr: SocketAddr, face: MemoryFace) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket accept failed for {peer_addr}: {e}");
            return;
        }
    };
    debug!("Application link from {peer_addr}");

    let (mut sink, mut stream) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();

    // Writer.
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let json = match frame.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!("Cannot encode frame: {e}");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(json.into())).await {
                debug!("Write to {peer_addr} failed: {e}");
                break;
            }
        }
    });

    let face = Arc::new(face);

    // Read loop.
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                debug!("Application at {peer_addr} sent close");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!("Read error from {peer_addr}: {e}");
                break;
            }
        };

        let frame = match Frame::from_json(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Bad frame from {peer_addr}: {e}");
                continue;
            }
        };

        match frame {
            Frame::Register { request_id, prefix } => {
                match face.register_prefix(&prefix).await {
                    Ok(mut registration) => {
                        let id = registration.id().clone();
                        let _ = out_tx.send(Frame::Registered {
                            request_id,
                            registration: id.clone(),
                        });
                        let out_tx = out_tx.clone();
                        tokio::spawn(async move {
                            while let Some(query) = registration.recv().await {
                                let frame = Frame::Incoming {
                                    registration: id.clone(),
                                    query,
                                };
                                if out_tx.send(frame).is_err() {
                                    break;
                                }
                            }
                        });
                    }
                    Err(e) => {
                        let _ = out_tx.send(Frame::RegisterFailed {
                            request_id,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            Frame::Unregister { registration } => face.unregister(&registration),
            Frame::Express { request_id, query } => {
                let face = Arc::clone(&face);
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let outcome = face.express(query).await.unwrap_or_else(|e| {
                        warn!("Express failed on link {peer_addr}: {e}");
                        Outcome::Nack {
                            reason: NackReason::NoRoute,
                        }
                    });
                    let _ = out_tx.send(Frame::Outcome {
                        request_id,
                        outcome,
                    });
                });
            }
            Frame::Put { response } => {
                if let Err(e) = face.put(response) {
                    warn!("Put from {peer_addr} failed: {e}");
                }
            }
            other => warn!("Unexpected frame from {peer_addr}: {other:?}"),
        }
    }

    face.close();
    debug!("Application link from {peer_addr} closed");
}

// ---------------------------------------------------------------------------
// Client face
// ---------------------------------------------------------------------------

type PendingRegistrations =
    HashMap<u64, (Name, oneshot::Sender<Result<PrefixRegistration, String>>)>;

#[derive(Default)]
struct LinkState {
    registering: PendingRegistrations,
    expressing: HashMap<u64, oneshot::Sender<Outcome>>,
    registrations: HashMap<RegistrationId, mpsc::UnboundedSender<Query>>,
}

/// A [`Face`] connected to a remote forwarder over WebSocket.
pub struct WsFace {
    out_tx: mpsc::UnboundedSender<Frame>,
    state: Arc<Mutex<LinkState>>,
    next_request_id: AtomicU64,
}

impl WsFace {
    /// Connect to the forwarder at `addr` (`host:port` or a `ws://` URL).
    pub async fn connect(addr: &str) -> Result<Self, NetworkError> {
        let url = if addr.starts_with("ws://") || addr.starts_with("wss://") {
            addr.to_string()
        } else {
            format!("ws://{addr}")
        };

        let (ws_stream, _) = connect_async(&url)
            .await
            .map_err(|e| NetworkError::Transport(format!("Connect to {addr} failed: {e}")))?;
        let (mut sink, mut stream) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let state = Arc::new(Mutex::new(LinkState::default()));

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let json = match frame.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Cannot encode frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    debug!("Write to forwarder failed: {e}");
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        let reader_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => match Frame::from_json(&text) {
                        Ok(frame) => Self::dispatch(&reader_state, frame),
                        Err(e) => warn!("Bad frame from forwarder: {e}"),
                    },
                    Ok(Message::Close(_)) => {
                        debug!("Forwarder sent close");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Read error from forwarder: {e}");
                        break;
                    }
                }
            }
            // Dropping every sender wakes all waiters with a closed channel.
            *reader_state.lock() = LinkState::default();
        });

        info!("Connected to forwarder at {url}");
        Ok(Self {
            out_tx,
            state,
            next_request_id: AtomicU64::new(1),
        })
    }

    fn dispatch(state: &Mutex<LinkState>, frame: Frame) {
        let mut state = state.lock();
        match frame {
            Frame::Registered {
                request_id,
                registration,
            } => {
                if let Some((prefix, waiter)) = state.registering.remove(&request_id) {
                    let (tx, rx) = mpsc::unbounded_channel();
                    state.registrations.insert(registration.clone(), tx);
                    let _ = waiter.send(Ok(PrefixRegistration::new(registration, prefix, rx)));
                }
            }
            Frame::RegisterFailed { request_id, reason } => {
                if let Some((_, waiter)) = state.registering.remove(&request_id) {
                    let _ = waiter.send(Err(reason));
                }
            }
            Frame::Outcome {
                request_id,
                outcome,
            } => {
                if let Some(waiter) = state.expressing.remove(&request_id) {
                    let _ = waiter.send(outcome);
                }
            }
            Frame::Incoming {
                registration,
                query,
            } => {
                if let Some(tx) = state.registrations.get(&registration) {
                    let _ = tx.send(query);
                }
            }
            other => warn!("Unexpected frame from forwarder: {other:?}"),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, frame: Frame) -> Result<(), NetworkError> {
        self.out_tx.send(frame).map_err(|_| NetworkError::FaceClosed)
    }
}

#[async_trait]
impl Face for WsFace {
    async fn register_prefix(&self, prefix: &Name) -> Result<PrefixRegistration, NetworkError> {
        let request_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .registering
            .insert(request_id, (prefix.clone(), tx));
        self.send(Frame::Register {
            request_id,
            prefix: prefix.clone(),
        })?;

        match rx.await {
            Ok(Ok(registration)) => Ok(registration),
            Ok(Err(reason)) => Err(NetworkError::Registration {
                prefix: prefix.clone(),
                reason,
            }),
            Err(_) => Err(NetworkError::FaceClosed),
        }
    }

    fn unregister(&self, id: &RegistrationId) {
        self.state.lock().registrations.remove(id);
        let _ = self.send(Frame::Unregister {
            registration: id.clone(),
        });
    }

    fn put(&self, response: Response) -> Result<(), NetworkError> {
        self.send(Frame::Put { response })
    }

    async fn express(&self, query: Query) -> Result<Outcome, NetworkError> {
        let request_id = self.next_id();
        let wait = query.lifetime + OUTCOME_GRACE;
        let (tx, rx) = oneshot::channel();
        self.state.lock().expressing.insert(request_id, tx);
        self.send(Frame::Express { request_id, query })?;

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(NetworkError::FaceClosed),
            Err(_) => {
                self.state.lock().expressing.remove(&request_id);
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

    async fn spawn_forwarder(fabric: MemoryFabric) -> (SocketAddr, broadcast::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(async move {
            let _ = serve_forwarder(listener, fabric, shutdown_rx).await;
        });
        (addr, shutdown_tx)
    }

    #[test]
    fn test_frame_tagging() {
        let frame = Frame::Unregister {
            registration: RegistrationId("r1".to_string()),
        };
        let json = frame.to_json().unwrap();
        assert_eq!(json, r#"{"type":"unregister","registration":"r1"}"#);
        assert_eq!(Frame::from_json(&json).unwrap(), frame);
    }

    #[tokio::test]
    async fn test_query_over_forwarder() {
        let fabric = MemoryFabric::new();
        let (addr, shutdown_tx) = spawn_forwarder(fabric.clone()).await;

        let producer = WsFace::connect(&addr.to_string()).await.unwrap();
        let consumer = WsFace::connect(&format!("ws://{addr}")).await.unwrap();

        let mut reg = producer.register_prefix(&Name::parse("/a")).await.unwrap();
        assert_eq!(reg.prefix(), &Name::parse("/a"));

        let query = Query::new(Name::parse("/a/b")).with_lifetime(Duration::from_secs(2));
        let pending = tokio::spawn(async move { consumer.express(query).await });

        let received = tokio::time::timeout(Duration::from_secs(2), reg.recv())
            .await
            .unwrap()
            .unwrap();
        producer
            .put(Response::new(received.name, b"pong".to_vec()))
            .unwrap();

        match pending.await.unwrap().unwrap() {
            Outcome::Response { response } => assert_eq!(response.content, b"pong"),
            other => panic!("Expected response, got {other:?}"),
        }

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_remote_registration_conflict() {
        let fabric = MemoryFabric::new();
        let (addr, shutdown_tx) = spawn_forwarder(fabric.clone()).await;

        let first = WsFace::connect(&addr.to_string()).await.unwrap();
        let second = WsFace::connect(&addr.to_string()).await.unwrap();

        let _reg = first.register_prefix(&Name::parse("/rv")).await.unwrap();
        let err = second.register_prefix(&Name::parse("/rv")).await.unwrap_err();
        assert!(matches!(err, NetworkError::Registration { .. }));

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_remote_no_route() {
        let fabric = MemoryFabric::new();
        let (addr, shutdown_tx) = spawn_forwarder(fabric).await;

        let consumer = WsFace::connect(&addr.to_string()).await.unwrap();
        let outcome = consumer
            .express(Query::new(Name::parse("/nobody")))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Nack {
                reason: NackReason::NoRoute
            }
        );

        let _ = shutdown_tx.send(());
    }
}
