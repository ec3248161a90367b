//! Who is currently connected, and how messages fan out to them.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use chatio::write_line;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opaque handle for one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u128);

impl ConnId {
    pub fn new() -> Self {
        let mut b = [0u8; 16];
        getrandom::getrandom(&mut b).expect("getrandom");
        Self(u128::from_be_bytes(b))
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// One authenticated, still-open connection.
///
/// The write half sits behind its own lock so concurrent broadcasts serialize
/// per target; the registry lock is never involved in a network write.
pub struct Conn {
    pub id: ConnId,
    pub username: String,
    pub peer: SocketAddr,
    writer: tokio::sync::Mutex<BoxedWriter>,
    disconnect_tx: tokio::sync::watch::Sender<bool>,
}

impl Conn {
    pub fn new(
        username: String,
        peer: SocketAddr,
        writer: BoxedWriter,
    ) -> (Arc<Self>, tokio::sync::watch::Receiver<bool>) {
        let (disconnect_tx, disconnect_rx) = tokio::sync::watch::channel(false);
        let conn = Arc::new(Self {
            id: ConnId::new(),
            username,
            peer,
            writer: tokio::sync::Mutex::new(writer),
            disconnect_tx,
        });
        (conn, disconnect_rx)
    }

    /// Write one framed message to this peer.
    pub async fn send_line(&self, line: &[u8]) -> std::io::Result<()> {
        let mut w = self.writer.lock().await;
        write_line(&mut *w, line).await
    }

    /// Best-effort close of the write half; errors are swallowed.
    pub async fn shutdown(&self) {
        let mut w = self.writer.lock().await;
        let _ = w.shutdown().await;
    }

    /// Ask the owning session to wind down (admin kick).
    pub fn request_disconnect(&self) {
        let _ = self.disconnect_tx.send(true);
    }
}

/// The single source of truth for currently connected users.
///
/// One lock covers register/unregister/snapshot; the raw map is never handed
/// out. Broadcast fan-out iterates a snapshot copy outside the lock.
#[derive(Default)]
pub struct Registry {
    conns: tokio::sync::Mutex<HashMap<ConnId, Arc<Conn>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly authenticated connection. Called once per session,
    /// immediately after the handshake accepts.
    pub async fn register(&self, conn: Arc<Conn>) {
        self.conns.lock().await.insert(conn.id, conn);
    }

    /// Remove a connection if still present, returning its username.
    ///
    /// Idempotent: the broadcaster's eviction path and the owning session's
    /// cleanup path may both call this for the same connection.
    pub async fn unregister(&self, id: ConnId) -> Option<String> {
        self.conns
            .lock()
            .await
            .remove(&id)
            .map(|c| c.username.clone())
    }

    /// Stable copy of every registered connection except `exclude`.
    pub async fn snapshot_excluding(&self, exclude: Option<ConnId>) -> Vec<Arc<Conn>> {
        let m = self.conns.lock().await;
        m.values()
            .filter(|c| Some(c.id) != exclude)
            .cloned()
            .collect()
    }

    pub async fn usernames(&self) -> Vec<String> {
        let m = self.conns.lock().await;
        let mut names: Vec<String> = m.values().map(|c| c.username.clone()).collect();
        names.sort();
        names
    }

    pub async fn find_by_username(&self, username: &str) -> Vec<Arc<Conn>> {
        let m = self.conns.lock().await;
        m.values()
            .filter(|c| c.username == username)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.conns.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Deliver one rendered message to every registered peer except `exclude`.
///
/// Exactly one write attempt per snapshot entry; a failed write never stops
/// the fan-out. Dead peers are shut down (best-effort) and unregistered after
/// the pass, inside this same call.
pub async fn broadcast(registry: &Registry, line: &str, exclude: Option<ConnId>) {
    let peers = registry.snapshot_excluding(exclude).await;
    let mut dead = Vec::new();
    for conn in peers {
        if let Err(e) = conn.send_line(line.as_bytes()).await {
            debug!(conn = %conn.id, username = %conn.username, err = %e, "write failed, pruning peer");
            dead.push(conn);
        }
    }
    for conn in dead {
        conn.shutdown().await;
        let _ = registry.unregister(conn.id).await;
    }
}
