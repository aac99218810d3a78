//! Broadcast gateway: fan-out of server events to live sockets.
//!
//! Two addressing modes:
//! - [`to_all`](BroadcastGateway::to_all) reaches every registered socket.
//! - [`to_room`](BroadcastGateway::to_room) reaches sockets whose identity is
//!   subscribed to the room channel. Channels are keyed by identity, so a
//!   reconnecting user's new socket is addressed without re-subscribing.
//!
//! Each event is encoded once and shared as `Arc<str>` across outboxes.
//! Outboxes are bounded; delivery uses `try_send`, so a slow socket drops
//! messages (counted in stats) instead of stalling state mutation or other
//! sockets. Per-socket FIFO order is preserved.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerEvent};
use crate::room::RoomId;

/// Identifier of one physical socket.
pub type ConnectionId = Uuid;

/// Sending half of a socket's outbox.
pub type Outbox = mpsc::Sender<Arc<str>>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_connections: usize,
    pub active_channels: usize,
}

/// Lock-free counters updated on the delivery path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

struct Connection {
    identity: String,
    outbox: Outbox,
}

pub struct BroadcastGateway {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    /// Room id → subscribed identities.
    channels: RwLock<HashMap<RoomId, HashSet<String>>>,
    /// Outbox capacity per socket.
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGateway {
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Register a socket and return the receiving end of its outbox.
    pub async fn register(&self, conn: ConnectionId, identity: &str) -> mpsc::Receiver<Arc<str>> {
        let (outbox, rx) = mpsc::channel(self.capacity);
        let mut connections = self.connections.write().await;
        connections.insert(
            conn,
            Connection {
                identity: identity.to_string(),
                outbox,
            },
        );
        rx
    }

    /// Forget a socket. Returns its identity if it was registered.
    pub async fn unregister(&self, conn: &ConnectionId) -> Option<String> {
        let mut connections = self.connections.write().await;
        connections.remove(conn).map(|c| c.identity)
    }

    /// Route room broadcasts to every socket of `identity`.
    pub async fn subscribe(&self, room_id: &str, identity: &str) {
        let mut channels = self.channels.write().await;
        channels
            .entry(room_id.to_string())
            .or_default()
            .insert(identity.to_string());
    }

    pub async fn unsubscribe(&self, room_id: &str, identity: &str) {
        let mut channels = self.channels.write().await;
        if let Some(members) = channels.get_mut(room_id) {
            members.remove(identity);
            if members.is_empty() {
                channels.remove(room_id);
            }
        }
    }

    /// Drop a room channel entirely (room deleted).
    pub async fn close_channel(&self, room_id: &str) {
        self.channels.write().await.remove(room_id);
    }

    /// Send to one socket only.
    pub async fn to_connection(
        &self,
        conn: &ConnectionId,
        event: &ServerEvent,
    ) -> Result<bool, ProtocolError> {
        let encoded: Arc<str> = event.encode()?.into();
        let connections = self.connections.read().await;
        Ok(match connections.get(conn) {
            Some(c) => self.deliver(conn, c, encoded),
            None => false,
        })
    }

    /// Send to every registered socket. Returns the number of sockets reached.
    pub async fn to_all(&self, event: &ServerEvent) -> Result<usize, ProtocolError> {
        let encoded: Arc<str> = event.encode()?.into();
        let connections = self.connections.read().await;
        let reached = connections
            .iter()
            .filter(|(id, c)| self.deliver(id, c, encoded.clone()))
            .count();
        Ok(reached)
    }

    /// Send to sockets whose identity is subscribed to `room_id`.
    pub async fn to_room(&self, room_id: &str, event: &ServerEvent) -> Result<usize, ProtocolError> {
        let encoded: Arc<str> = event.encode()?.into();
        let channels = self.channels.read().await;
        let Some(members) = channels.get(room_id) else {
            return Ok(0);
        };
        let connections = self.connections.read().await;
        let reached = connections
            .iter()
            .filter(|(_, c)| members.contains(&c.identity))
            .filter(|(id, c)| self.deliver(id, c, encoded.clone()))
            .count();
        Ok(reached)
    }

    fn deliver(&self, id: &ConnectionId, conn: &Connection, encoded: Arc<str>) -> bool {
        match conn.outbox.try_send(encoded) {
            Ok(()) => {
                self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Outbox full for {} ({id}), message dropped", conn.identity);
                false
            }
            // Socket task already gone; unregister is on its way.
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Identities subscribed to a room channel.
    pub async fn channel_members(&self, room_id: &str) -> Vec<String> {
        let channels = self.channels.read().await;
        channels
            .get(room_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> BroadcastStats {
        let active_connections = self.connections.read().await.len();
        let active_channels = self.channels.read().await.len();
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_connections,
            active_channels,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
