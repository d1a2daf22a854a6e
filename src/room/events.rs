#![forbid(unsafe_code)]

// Room events - engine callbacks translated into messages.
//
// mediasoup invokes event handlers on its own threads, so callbacks only
// capture ids and push onto the room's channel; this task re-resolves the
// ids under the room lock and performs the mutation. A raced teardown simply
// fails the lookup and the event is dropped.

use super::Room;
use crate::signaling::protocol::Notification;
use std::sync::Weak;
use tokio::sync::mpsc;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, trace};

/// One loudness report entry from the audio-level observer.
#[derive(Debug, Clone)]
pub struct AudioVolume {
    pub peer_id: String,
    /// dBvo, negative; 0 is the loudest.
    pub volume: i8,
}

/// Engine-originated events for one room.
#[derive(Debug)]
pub enum RoomEvent {
    /// Periodic loudest-speaker report.
    Volumes(Vec<AudioVolume>),
    /// A producer's transport closed underneath it.
    ProducerTransportClosed { peer_id: String, producer_id: String },
    /// The upstream producer of one of `peer_id`'s consumers closed.
    ConsumerUpstreamClosed { peer_id: String, producer_id: String },
}

/// Consumes a room's event channel until the room is gone or the channel
/// closes (both happen when the room collapses).
pub(super) fn spawn_event_task(
    room: Weak<TokioRwLock<Room>>,
    mut events: mpsc::UnboundedReceiver<RoomEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(room_lock) = room.upgrade() else {
                break;
            };
            handle_event(&room_lock, event).await;
        }
        trace!("Room event task finished");
    });
}

async fn handle_event(room_lock: &TokioRwLock<Room>, event: RoomEvent) {
    match event {
        RoomEvent::Volumes(volumes) => {
            let broadcast = room_lock.read().await.recipients_all();
            for entry in volumes {
                // Delivered to everyone, speaker included, so UIs can
                // self-highlight.
                broadcast.send(&Notification::AudioLevel {
                    peer_id: entry.peer_id,
                    volume: f64::from(entry.volume),
                });
            }
        }

        RoomEvent::ProducerTransportClosed { peer_id, producer_id } => {
            let (known, media, broadcast) = {
                let mut room = room_lock.write().await;
                let Some(peer) = room.peers.get_mut(&peer_id) else {
                    return;
                };
                let known = peer.producers.remove(&producer_id).is_some();
                let media = peer.media.clone();
                (known, media, room.recipients_except(&peer_id))
            };
            media.lock().await.producers.remove(&producer_id);

            if known {
                debug!(
                    "Producer {} of peer {} evicted after transport close",
                    producer_id, peer_id
                );
                broadcast.send(&Notification::ProducerClosed {
                    peer_id: peer_id.clone(),
                    producer_id,
                });
            }
        }

        RoomEvent::ConsumerUpstreamClosed { peer_id, producer_id } => {
            let media = {
                let room = room_lock.read().await;
                match room.peers.get(&peer_id) {
                    Some(peer) => peer.media.clone(),
                    None => return,
                }
            };
            if media.lock().await.consumers.remove(&producer_id).is_some() {
                debug!(
                    "Consumer of producer {} evicted for peer {} (upstream closed)",
                    producer_id, peer_id
                );
            }
        }
    }
}
