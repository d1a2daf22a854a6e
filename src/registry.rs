#![forbid(unsafe_code)]

// Session registry - process-wide indices for connections, peers, and rooms.
//
// All three mappings live behind one mutex and are mutated together, so a
// lookup from any viewpoint (connection, peer, room) observes the same
// binding. The lock is only ever held for synchronous map operations, never
// across await points; rooms themselves are async-locked separately.

use crate::error::{SignalError, SignalResult};
use crate::room::Room;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::RwLock as TokioRwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    peer_by_conn: HashMap<Uuid, String>,
    room_by_peer: HashMap<String, String>,
    rooms: HashMap<String, Arc<TokioRwLock<Room>>>,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Looks up a room by id.
    pub fn room(&self, room_id: &str) -> Option<Arc<TokioRwLock<Room>>> {
        self.lock().rooms.get(room_id).cloned()
    }

    /// Registers a newly materialized room. The caller serializes room
    /// creation, so an existing entry under the same id is a logic error.
    pub fn insert_room(&self, room_id: &str, room: Arc<TokioRwLock<Room>>) {
        let previous = self.lock().rooms.insert(room_id.to_string(), room);
        debug_assert!(previous.is_none(), "room id registered twice: {room_id}");
    }

    /// Drops a room from the index. Handles owned by the room close when the
    /// last `Arc` clone is released.
    pub fn remove_room(&self, room_id: &str) -> Option<Arc<TokioRwLock<Room>>> {
        self.lock().rooms.remove(room_id)
    }

    /// Binds connection→peer and peer→room in one step.
    ///
    /// # Errors
    /// `PeerIdTaken` if the peer id is bound anywhere, `Precondition` if the
    /// connection already joined as some other peer.
    pub fn bind_peer(&self, conn_id: Uuid, peer_id: &str, room_id: &str) -> SignalResult<()> {
        let mut inner = self.lock();
        if inner.room_by_peer.contains_key(peer_id) {
            return Err(SignalError::PeerIdTaken(peer_id.to_string()));
        }
        if inner.peer_by_conn.contains_key(&conn_id) {
            return Err(SignalError::Precondition(
                "Connection already joined a room".to_string(),
            ));
        }
        inner.peer_by_conn.insert(conn_id, peer_id.to_string());
        inner
            .room_by_peer
            .insert(peer_id.to_string(), room_id.to_string());
        Ok(())
    }

    /// Removes both peer-side bindings. Idempotent.
    pub fn unbind_peer(&self, conn_id: Uuid, peer_id: &str) {
        let mut inner = self.lock();
        inner.peer_by_conn.remove(&conn_id);
        inner.room_by_peer.remove(peer_id);
    }

    pub fn peer_for_conn(&self, conn_id: Uuid) -> Option<String> {
        self.lock().peer_by_conn.get(&conn_id).cloned()
    }

    pub fn room_for_peer(&self, peer_id: &str) -> Option<String> {
        self.lock().room_by_peer.get(peer_id).cloned()
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.lock().rooms.keys().cloned().collect()
    }

    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }

    pub fn peer_count(&self) -> usize {
        self.lock().room_by_peer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_rejects_duplicate_peer_id() {
        let registry = SessionRegistry::new();
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();

        registry.bind_peer(conn_a, "p1", "R").unwrap();
        let err = registry.bind_peer(conn_b, "p1", "R").unwrap_err();
        assert!(matches!(err, SignalError::PeerIdTaken(_)));

        // The failed bind left nothing behind for conn_b.
        assert_eq!(registry.peer_for_conn(conn_b), None);
    }

    #[test]
    fn bind_rejects_double_join_on_same_connection() {
        let registry = SessionRegistry::new();
        let conn = Uuid::new_v4();

        registry.bind_peer(conn, "p1", "R").unwrap();
        let err = registry.bind_peer(conn, "p2", "R").unwrap_err();
        assert!(matches!(err, SignalError::Precondition(_)));
        assert_eq!(registry.room_for_peer("p2"), None);
    }

    #[test]
    fn unbind_clears_both_indices() {
        let registry = SessionRegistry::new();
        let conn = Uuid::new_v4();

        registry.bind_peer(conn, "p1", "R").unwrap();
        assert_eq!(registry.peer_for_conn(conn).as_deref(), Some("p1"));
        assert_eq!(registry.room_for_peer("p1").as_deref(), Some("R"));
        assert_eq!(registry.peer_count(), 1);

        registry.unbind_peer(conn, "p1");
        assert_eq!(registry.peer_for_conn(conn), None);
        assert_eq!(registry.room_for_peer("p1"), None);
        assert_eq!(registry.peer_count(), 0);

        // Second unbind is a no-op.
        registry.unbind_peer(conn, "p1");
    }

    #[test]
    fn peer_id_reusable_after_unbind() {
        let registry = SessionRegistry::new();
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();

        registry.bind_peer(conn_a, "p1", "R").unwrap();
        registry.unbind_peer(conn_a, "p1");
        registry.bind_peer(conn_b, "p1", "S").unwrap();
        assert_eq!(registry.room_for_peer("p1").as_deref(), Some("S"));
    }
}
