//! Realtime connection handles and registry.
//!
//! Each connection gets a bounded mpsc channel for backpressure; the receiver
//! is drained by the WebSocket write loop. Authorization state lives on the
//! handle so emitters can re-check membership at delivery time.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use hse_core::{Principal, Room};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::network::config::ConnectionConfig;

/// Unique identifier for a connection, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `Connecting → Authenticating → {Authorized | Rejected}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    /// An auth frame was received and is being verified.
    Authenticating,
    Authorized(Principal),
    /// Terminal. The connection is closed after the rejection frame.
    Rejected,
}

impl ConnectionState {
    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        match self {
            ConnectionState::Authorized(p) => Some(p),
            _ => None,
        }
    }
}

/// Message to be sent outbound to a connection.
#[derive(Debug)]
pub enum OutboundMessage {
    /// A `MsgPack`-encoded frame.
    Binary(Vec<u8>),
    /// A close frame with an optional reason.
    Close(Option<String>),
}

/// Error returned when sending a message to a connection fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    Timeout,
    /// The receiver was dropped.
    Disconnected,
}

#[derive(Debug)]
pub struct ConnectionMetadata {
    pub state: ConnectionState,
    /// Rooms this connection currently receives events for.
    pub rooms: HashSet<Room>,
    /// Refused subscribe attempts. Repeated refusals indicate probing.
    pub denied_subscriptions: u32,
    pub last_heartbeat: Instant,
}

impl Default for ConnectionMetadata {
    fn default() -> Self {
        Self {
            state: ConnectionState::Connecting,
            rooms: HashSet::new(),
            denied_subscriptions: 0,
            last_heartbeat: Instant::now(),
        }
    }
}

#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub tx: mpsc::Sender<OutboundMessage>,
    pub metadata: RwLock<ConnectionMetadata>,
    pub connected_at: Instant,
}

impl ConnectionHandle {
    /// Enqueues without blocking. `false` if the channel is full or closed.
    #[must_use]
    pub fn try_send(&self, msg: OutboundMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// # Errors
    ///
    /// `SendError::Timeout` if the channel stays full for `timeout`,
    /// `SendError::Disconnected` if the write loop has exited.
    pub async fn send_timeout(
        &self,
        msg: OutboundMessage,
        timeout: Duration,
    ) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.metadata.read().state.clone()
    }

    /// Whether this connection is authorized and joined to `room`.
    #[must_use]
    pub fn receives(&self, room: &Room) -> bool {
        let meta = self.metadata.read();
        matches!(meta.state, ConnectionState::Authorized(_)) && meta.rooms.contains(room)
    }
}

/// Thread-safe registry of all live realtime connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Connection IDs start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new connection in state `Connecting`.
    pub fn register(
        &self,
        config: &ConnectionConfig,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity);
        let handle = Arc::new(ConnectionHandle {
            id,
            tx,
            metadata: RwLock::new(ConnectionMetadata::default()),
            connected_at: Instant::now(),
        });
        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_channel_config() -> ConnectionConfig {
        ConnectionConfig {
            outbound_channel_capacity: 2,
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let registry = ConnectionRegistry::new();
        let config = ConnectionConfig::default();
        let (h1, _rx1) = registry.register(&config);
        let (h2, _rx2) = registry.register(&config);
        assert_eq!(h1.id, ConnectionId(1));
        assert_eq!(h2.id, ConnectionId(2));
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn new_connections_start_connecting() {
        let registry = ConnectionRegistry::new();
        let (h, _rx) = registry.register(&ConnectionConfig::default());
        assert_eq!(h.state(), ConnectionState::Connecting);
        assert!(!h.receives(&Room::Admin));
    }

    #[test]
    fn remove_and_get() {
        let registry = ConnectionRegistry::new();
        let (h, _rx) = registry.register(&ConnectionConfig::default());
        assert!(registry.get(h.id).is_some());
        assert!(registry.remove(h.id).is_some());
        assert!(registry.get(h.id).is_none());
        assert!(registry.remove(h.id).is_none());
    }

    #[test]
    fn try_send_respects_capacity() {
        let registry = ConnectionRegistry::new();
        let (h, _rx) = registry.register(&small_channel_config());
        assert!(h.try_send(OutboundMessage::Binary(vec![1])));
        assert!(h.try_send(OutboundMessage::Binary(vec![2])));
        assert!(!h.try_send(OutboundMessage::Binary(vec![3])));
    }

    #[test]
    fn dropped_receiver_disconnects() {
        let registry = ConnectionRegistry::new();
        let (h, rx) = registry.register(&ConnectionConfig::default());
        assert!(h.is_connected());
        drop(rx);
        assert!(!h.is_connected());
        assert!(!h.try_send(OutboundMessage::Binary(vec![1])));
    }

    #[tokio::test]
    async fn send_timeout_reports_disconnect() {
        let registry = ConnectionRegistry::new();
        let (h, rx) = registry.register(&ConnectionConfig::default());
        drop(rx);
        let result = h
            .send_timeout(OutboundMessage::Binary(vec![1]), Duration::from_secs(1))
            .await;
        assert_eq!(result, Err(SendError::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn send_timeout_reports_full_channel() {
        let registry = ConnectionRegistry::new();
        let (h, _rx) = registry.register(&small_channel_config());
        assert!(h.try_send(OutboundMessage::Binary(vec![1])));
        assert!(h.try_send(OutboundMessage::Binary(vec![2])));
        let result = h
            .send_timeout(OutboundMessage::Binary(vec![3]), Duration::from_millis(50))
            .await;
        assert_eq!(result, Err(SendError::Timeout));
    }
}
