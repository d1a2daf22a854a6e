#![forbid(unsafe_code)]

// Peer state - connection lifecycle, signaling metadata, and owned media.
//
// A peer has two views mutated by the same operations: the room-side entry
// (under the room's RwLock) carries what other peers may observe, and the
// media state (under its own per-peer Mutex) carries the engine handles.
// Lock order is room then media, never the reverse while both are held.

use crate::signaling::protocol::MediaSource;
use mediasoup::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use uuid::Uuid;

/// Connection lifecycle of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
}

impl PeerState {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerState::New => "new",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
        }
    }
}

/// Signaling metadata for one producer, kept on the room-side peer entry.
#[derive(Debug, Clone)]
pub struct ProducerEntry {
    pub kind: MediaKind,
    pub source: MediaSource,
    /// Mirrors the engine's pause state.
    pub paused: bool,
    /// Application-level mute flag, independent of `paused`.
    pub muted: bool,
}

/// A peer as the room sees it.
pub struct Peer {
    pub id: String,
    pub conn_id: Uuid,
    pub display_name: String,
    pub state: PeerState,
    /// Outbound frame channel; broadcasts `try_send` and never block.
    pub sender: mpsc::Sender<Arc<String>>,
    /// Producer metadata by producer id.
    pub producers: HashMap<String, ProducerEntry>,
    pub media: Arc<TokioMutex<PeerMedia>>,
}

impl Peer {
    pub fn new(
        id: String,
        conn_id: Uuid,
        display_name: String,
        sender: mpsc::Sender<Arc<String>>,
    ) -> Self {
        Self {
            id,
            conn_id,
            display_name,
            state: PeerState::New,
            sender,
            producers: HashMap::new(),
            media: Arc::new(TokioMutex::new(PeerMedia::default())),
        }
    }
}

/// A downlink stream bound to one upstream producer.
pub struct ConsumerRecord {
    pub consumer: Consumer,
    /// The upstream producer's owning peer.
    pub peer_id: String,
}

/// Engine handles owned by a peer. Handles close when dropped, so draining
/// these maps is what releases worker-side resources.
#[derive(Default)]
pub struct PeerMedia {
    pub send_transport: Option<WebRtcTransport>,
    pub recv_transport: Option<WebRtcTransport>,
    /// Producer handles by producer id.
    pub producers: HashMap<String, Producer>,
    /// Consumers keyed by the *upstream* producer id, so a producer-close
    /// event evicts in O(1).
    pub consumers: HashMap<String, ConsumerRecord>,
}

impl PeerMedia {
    /// Releases everything this peer holds: producers, then consumers, then
    /// transports. Idempotent; a second call finds nothing to drop.
    pub fn close_all(&mut self) {
        self.producers.clear();
        self.consumers.clear();
        self.send_transport.take();
        self.recv_transport.take();
    }
}

/// Stamped into every producer's `AppData` at creation so engine events that
/// only carry the producer (e.g. audio-level reports) can be attributed to
/// the owning peer.
#[derive(Debug, Clone)]
pub struct ProducerAppData {
    pub peer_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_are_lowercase() {
        assert_eq!(PeerState::New.as_str(), "new");
        assert_eq!(PeerState::Connecting.as_str(), "connecting");
        assert_eq!(PeerState::Connected.as_str(), "connected");
        assert_eq!(PeerState::Disconnected.as_str(), "disconnected");
    }

    #[test]
    fn new_peer_starts_empty() {
        let (tx, _rx) = mpsc::channel(4);
        let peer = Peer::new("p1".to_string(), Uuid::new_v4(), "A".to_string(), tx);
        assert_eq!(peer.state, PeerState::New);
        assert!(peer.producers.is_empty());
    }

    #[tokio::test]
    async fn close_all_is_idempotent() {
        let media = Arc::new(TokioMutex::new(PeerMedia::default()));
        let mut guard = media.lock().await;
        guard.close_all();
        guard.close_all();
        assert!(guard.producers.is_empty());
        assert!(guard.send_transport.is_none());
    }
}
