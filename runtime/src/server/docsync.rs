//! Bridge between document-sync sockets and a collaborative document engine.
//!
//! The engine is external; this module only fixes the transport contract it is handed
//! ([`SyncTransport`]) and ships [`RelaySyncEngine`], which forwards every update from one peer
//! to the other peers of the same document without merging or persisting anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Path;
use axum::response::Response;
use axum::routing::get;
use axum::{Extension, Router};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),
}

/// Bidirectional byte channel a sync engine serves one peer over.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn send(&self, update: Vec<u8>) -> Result<(), TransportError>;

    /// Next update from the peer; [`TransportError::Closed`] once it has gone away.
    async fn receive(&self) -> Result<Vec<u8>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait DocSyncEngine: Send + Sync {
    /// Serves one peer of `doc_name` until its transport closes.
    async fn serve(
        &self,
        transport: Arc<dyn SyncTransport>,
        doc_name: &str,
    ) -> Result<(), TransportError>;
}

/// [`SyncTransport`] over an axum WebSocket. Only binary frames carry updates.
pub struct WsSyncTransport {
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
    stream: tokio::sync::Mutex<SplitStream<WebSocket>>,
}

impl WsSyncTransport {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: tokio::sync::Mutex::new(sink),
            stream: tokio::sync::Mutex::new(stream),
        }
    }
}

#[async_trait]
impl SyncTransport for WsSyncTransport {
    async fn send(&self, update: Vec<u8>) -> Result<(), TransportError> {
        self.sink.lock().await.send(Message::Binary(update)).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(update))) => return Ok(update),
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.sink.lock().await.close().await?;
        Ok(())
    }
}

type PeerMap = HashMap<String, Vec<(u64, Arc<dyn SyncTransport>)>>;

/// Fan-out relay keyed by document name.
#[derive(Default)]
pub struct RelaySyncEngine {
    docs: Mutex<PeerMap>,
    next_peer: AtomicU64,
}

impl RelaySyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peer_count(&self, doc_name: &str) -> usize {
        self.lock().get(doc_name).map(Vec::len).unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, PeerMap> {
        self.docs.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn attach(&self, doc_name: &str, transport: Arc<dyn SyncTransport>) -> u64 {
        let peer = self.next_peer.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(doc_name.to_string())
            .or_default()
            .push((peer, transport));
        peer
    }

    fn detach(&self, doc_name: &str, peers: &[u64]) {
        let mut docs = self.lock();
        if let Some(attached) = docs.get_mut(doc_name) {
            attached.retain(|(peer, _)| !peers.contains(peer));
            if attached.is_empty() {
                docs.remove(doc_name);
            }
        }
    }

    fn others(&self, doc_name: &str, origin: u64) -> Vec<(u64, Arc<dyn SyncTransport>)> {
        self.lock()
            .get(doc_name)
            .map(|attached| {
                attached
                    .iter()
                    .filter(|(peer, _)| *peer != origin)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocSyncEngine for RelaySyncEngine {
    async fn serve(
        &self,
        transport: Arc<dyn SyncTransport>,
        doc_name: &str,
    ) -> Result<(), TransportError> {
        let origin = self.attach(doc_name, Arc::clone(&transport));
        debug!(doc = %doc_name, peer = origin, "sync peer attached");

        let result = loop {
            let update = match transport.receive().await {
                Ok(update) => update,
                Err(TransportError::Closed) => break Ok(()),
                Err(err) => break Err(err),
            };

            let mut dead = Vec::new();
            for (peer, other) in self.others(doc_name, origin) {
                if let Err(err) = other.send(update.clone()).await {
                    warn!(doc = %doc_name, peer, error = %err, "dropping sync peer after failed send");
                    dead.push(peer);
                }
            }
            if !dead.is_empty() {
                self.detach(doc_name, &dead);
            }
        };

        self.detach(doc_name, &[origin]);
        debug!(doc = %doc_name, peer = origin, "sync peer detached");
        result
    }
}

/// Build the document-sync router.
pub fn routes() -> Router {
    Router::new().route("/yjs/:room_id", get(doc_socket))
}

async fn doc_socket(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    Extension(engine): Extension<Arc<dyn DocSyncEngine>>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let transport: Arc<dyn SyncTransport> = Arc::new(WsSyncTransport::new(socket));
        info!(doc = %room_id, "document sync socket connected");
        if let Err(err) = engine.serve(Arc::clone(&transport), &room_id).await {
            warn!(doc = %room_id, error = %err, "document sync session ended with error");
        }
        let _ = transport.close().await;
    })
}
