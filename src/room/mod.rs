#![forbid(unsafe_code)]

// Room module - room/peer coordination and the operations behind every
// signaling request.
//
// Locking follows one discipline throughout: the registry mutex is only held
// for map operations, each room is behind its own tokio RwLock, and each
// peer's media behind its own tokio Mutex. Engine calls happen outside the
// room lock; a room lock may be held while taking a peer's media lock but
// never the other way around.

pub mod events;
pub mod peer;

pub use peer::{ConsumerRecord, Peer, PeerMedia, PeerState, ProducerAppData, ProducerEntry};

use crate::error::{SignalError, SignalResult};
use crate::media::{MediaWorker, TransportInfo};
use crate::metrics::ServerMetrics;
use crate::registry::SessionRegistry;
use crate::signaling::protocol::{
    MediaSource, Notification, PeerSummary, ProducerSummary, TransportDirection,
};
use events::{AudioVolume, RoomEvent};
use mediasoup::prelude::*;
use mediasoup::rtp_observer::{RtpObserver, RtpObserverAddProducerOptions};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A room: one router, one audio-level observer, and the peers in it.
pub struct Room {
    pub id: String,
    pub router: Router,
    pub audio_observer: AudioLevelObserver,
    pub peers: HashMap<String, Peer>,
    /// Set under the write lock when the last peer leaves; a join that
    /// observes this retries against a freshly materialized room.
    pub closed: bool,
    events: mpsc::UnboundedSender<RoomEvent>,
    metrics: ServerMetrics,
}

impl Room {
    fn new(
        id: String,
        router: Router,
        audio_observer: AudioLevelObserver,
        events: mpsc::UnboundedSender<RoomEvent>,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            id,
            router,
            audio_observer,
            peers: HashMap::new(),
            closed: false,
            events,
            metrics,
        }
    }

    pub fn event_sender(&self) -> mpsc::UnboundedSender<RoomEvent> {
        self.events.clone()
    }

    /// Snapshots every peer except `except` as a broadcast recipient set.
    /// Callers take the snapshot under the room lock and deliver after
    /// releasing it.
    pub fn recipients_except(&self, except: &str) -> Broadcast {
        self.snapshot_recipients(Some(except))
    }

    /// Snapshots every peer as a broadcast recipient set.
    pub fn recipients_all(&self) -> Broadcast {
        self.snapshot_recipients(None)
    }

    fn snapshot_recipients(&self, except: Option<&str>) -> Broadcast {
        Broadcast {
            room_id: self.id.clone(),
            metrics: self.metrics.clone(),
            recipients: self
                .peers
                .iter()
                .filter(|(id, _)| except != Some(id.as_str()))
                .map(|(id, peer)| (id.clone(), peer.sender.clone()))
                .collect(),
        }
    }
}

/// A recipient set snapshotted under the room lock. Delivery runs with no
/// locks held and is fire and forget: a closed channel means the peer's own
/// disconnect handler is already tearing it down.
pub struct Broadcast {
    room_id: String,
    metrics: ServerMetrics,
    recipients: Vec<(String, mpsc::Sender<Arc<String>>)>,
}

impl Broadcast {
    pub fn send(&self, notification: &Notification) {
        let json = match serde_json::to_string(notification) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize notification: {}", e);
                return;
            }
        };
        for (id, sender) in &self.recipients {
            match sender.try_send(json.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.metrics.inc_broadcasts_dropped();
                    warn!("Channel full for peer {} in room {}, dropping notification", id, self.room_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Channel closed for peer {} in room {} (disconnected)", id, self.room_id);
                }
            }
        }
    }
}

/// Everything `joinRoom` returns: the router capabilities plus a snapshot of
/// the other peers and their producers at the joining instant.
pub struct JoinSnapshot {
    pub rtp_capabilities: RtpCapabilitiesFinalized,
    pub peers: Vec<PeerSummary>,
    pub producers: Vec<ProducerSummary>,
}

/// Everything `consume` returns to the requesting client.
pub struct ConsumeInfo {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub peer_id: String,
    pub display_name: String,
    pub source: MediaSource,
}

/// Coordinates rooms, peers, and the media engine.
pub struct RoomManager {
    registry: SessionRegistry,
    media: Arc<MediaWorker>,
    metrics: ServerMetrics,
    /// Serializes room materialization so racing `createRoom`/`joinRoom`
    /// requests build exactly one router per room id.
    create_lock: TokioMutex<()>,
}

impl RoomManager {
    pub fn new(media: Arc<MediaWorker>, metrics: ServerMetrics) -> Self {
        Self {
            registry: SessionRegistry::new(),
            media,
            metrics,
            create_lock: TokioMutex::new(()),
        }
    }

    /// Resolves the peer a connection joined as, if any.
    pub fn peer_for_conn(&self, conn_id: Uuid) -> SignalResult<String> {
        self.registry
            .peer_for_conn(conn_id)
            .ok_or_else(|| SignalError::Precondition("Not in a room".to_string()))
    }

    pub fn room_count(&self) -> usize {
        self.registry.room_count()
    }

    pub fn peer_count(&self) -> usize {
        self.registry.peer_count()
    }

    /// Returns the room, materializing router + observer if absent.
    async fn get_or_create_room(&self, room_id: &str) -> SignalResult<Arc<TokioRwLock<Room>>> {
        // Fast path: room exists.
        if let Some(room) = self.registry.room(room_id) {
            return Ok(room);
        }

        let _guard = self.create_lock.lock().await;
        // Re-check: another request may have materialized it while we waited.
        if let Some(room) = self.registry.room(room_id) {
            return Ok(room);
        }

        info!("Creating room {}", room_id);
        let router = self.media.create_router().await?;
        let audio_observer = self.media.create_audio_observer(&router).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // Loudness reports carry only the producer; the owning peer is
        // recovered from the app data stamped at produce time.
        audio_observer
            .on_volumes({
                let events_tx = events_tx.clone();
                move |volumes| {
                    let entries: Vec<AudioVolume> = volumes
                        .iter()
                        .filter_map(|v| {
                            v.producer
                                .app_data()
                                .downcast_ref::<ProducerAppData>()
                                .map(|data| AudioVolume {
                                    peer_id: data.peer_id.clone(),
                                    volume: v.volume,
                                })
                        })
                        .collect();
                    if !entries.is_empty() {
                        let _ = events_tx.send(RoomEvent::Volumes(entries));
                    }
                }
            })
            .detach();

        let room = Arc::new(TokioRwLock::new(Room::new(
            room_id.to_string(),
            router,
            audio_observer,
            events_tx,
            self.metrics.clone(),
        )));
        events::spawn_event_task(Arc::downgrade(&room), events_rx);

        self.registry.insert_room(room_id, room.clone());
        self.metrics.inc_rooms_created();
        Ok(room)
    }

    /// Idempotently materializes a room.
    pub async fn create_room(&self, room_id: &str) -> SignalResult<()> {
        self.get_or_create_room(room_id).await.map(|_| ())
    }

    /// Attaches a peer to a room, returning the join snapshot. The peer id
    /// is bound, the peer inserted, the snapshot taken, and `peerJoined`
    /// broadcast under one room write lock, so a producer appears in the
    /// snapshot or in a later `newProducer` notification, never both.
    pub async fn join_room(
        &self,
        conn_id: Uuid,
        room_id: &str,
        peer_id: &str,
        display_name: &str,
        sender: mpsc::Sender<Arc<String>>,
    ) -> SignalResult<JoinSnapshot> {
        loop {
            let room_lock = self.get_or_create_room(room_id).await?;
            // Bind, insert, snapshot, and capture the recipient set under
            // one write lock; delivery happens after it is released.
            let (snapshot, broadcast) = {
                let mut room = room_lock.write().await;
                if room.closed {
                    // Raced an empty-room collapse; let the closer finish
                    // unregistering, then materialize a fresh room.
                    drop(room);
                    tokio::task::yield_now().await;
                    continue;
                }

                self.registry.bind_peer(conn_id, peer_id, room_id)?;

                let mut joining = Peer::new(
                    peer_id.to_string(),
                    conn_id,
                    display_name.to_string(),
                    sender,
                );
                joining.state = PeerState::Connecting;
                room.peers.insert(peer_id.to_string(), joining);

                let peers: Vec<PeerSummary> = room
                    .peers
                    .values()
                    .filter(|p| p.id != peer_id)
                    .map(|p| PeerSummary {
                        id: p.id.clone(),
                        display_name: p.display_name.clone(),
                        connection_state: p.state.as_str().to_string(),
                    })
                    .collect();

                let producers: Vec<ProducerSummary> = room
                    .peers
                    .values()
                    .filter(|p| p.id != peer_id)
                    .flat_map(|p| {
                        p.producers.iter().map(|(id, entry)| ProducerSummary {
                            id: id.clone(),
                            peer_id: p.id.clone(),
                            kind: entry.kind,
                            source: entry.source,
                            display_name: p.display_name.clone(),
                        })
                    })
                    .collect();

                let broadcast = room.recipients_except(peer_id);

                // The response is on its way out; the peer is established.
                if let Some(p) = room.peers.get_mut(peer_id) {
                    p.state = PeerState::Connected;
                }

                let rtp_capabilities = room.router.rtp_capabilities().clone();

                (
                    JoinSnapshot {
                        rtp_capabilities,
                        peers,
                        producers,
                    },
                    broadcast,
                )
            };

            broadcast.send(&Notification::PeerJoined {
                peer_id: peer_id.to_string(),
                display_name: display_name.to_string(),
            });

            info!("Peer {} ({}) joined room {}", peer_id, display_name, room_id);
            self.metrics.inc_joins();

            return Ok(snapshot);
        }
    }

    /// Room lookup for a bound peer.
    fn peer_room(&self, peer_id: &str) -> SignalResult<(String, Arc<TokioRwLock<Room>>)> {
        let room_id = self
            .registry
            .room_for_peer(peer_id)
            .ok_or_else(|| SignalError::PeerNotFound(peer_id.to_string()))?;
        let room = self
            .registry
            .room(&room_id)
            .ok_or_else(|| SignalError::RoomNotFound(room_id.clone()))?;
        Ok((room_id, room))
    }

    /// Creates a WebRTC transport for `peer_id` in the given direction. A
    /// repeated request for the same direction replaces (and closes) the
    /// previous transport.
    pub async fn create_transport(
        &self,
        peer_id: &str,
        direction: TransportDirection,
    ) -> SignalResult<TransportInfo> {
        let (_, room_lock) = self.peer_room(peer_id)?;
        let (router, media) = {
            let room = room_lock.read().await;
            let peer = room
                .peers
                .get(peer_id)
                .ok_or_else(|| SignalError::PeerNotFound(peer_id.to_string()))?;
            (room.router.clone(), peer.media.clone())
        };

        // Engine call with no locks held.
        let transport = router
            .create_webrtc_transport(self.media.transport_options())
            .await
            .map_err(|e| SignalError::Worker(e.to_string()))?;

        let info = TransportInfo::from(&transport);

        transport
            .on_close({
                let peer_id = peer_id.to_string();
                let transport_id = info.id.clone();
                Box::new(move || {
                    debug!("Transport {} closed for peer {}", transport_id, peer_id);
                })
            })
            .detach();

        let mut guard = media.lock().await;
        match direction {
            TransportDirection::Send => guard.send_transport = Some(transport),
            TransportDirection::Recv => guard.recv_transport = Some(transport),
        }

        info!(
            "Created {:?} transport {} for peer {}",
            direction, info.id, peer_id
        );
        Ok(info)
    }

    /// Completes DTLS setup on a previously created transport.
    pub async fn connect_transport(
        &self,
        peer_id: &str,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> SignalResult<()> {
        let (_, room_lock) = self.peer_room(peer_id)?;
        let media = Self::media_of(&room_lock, peer_id).await?;
        let guard = media.lock().await;

        let transport = [&guard.send_transport, &guard.recv_transport]
            .into_iter()
            .flatten()
            .find(|t| t.id().to_string() == transport_id)
            .ok_or_else(|| SignalError::TransportNotFound(transport_id.to_string()))?;

        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| SignalError::Worker(e.to_string()))?;

        debug!("Connected transport {} for peer {}", transport_id, peer_id);
        Ok(())
    }

    /// Creates a producer on the peer's send transport and announces it to
    /// the rest of the room.
    pub async fn produce(
        &self,
        peer_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        source: Option<MediaSource>,
        paused: bool,
    ) -> SignalResult<String> {
        let (room_id, room_lock) = self.peer_room(peer_id)?;
        let (media, audio_observer, events, display_name) = {
            let room = room_lock.read().await;
            let peer = room
                .peers
                .get(peer_id)
                .ok_or_else(|| SignalError::PeerNotFound(peer_id.to_string()))?;
            (
                peer.media.clone(),
                room.audio_observer.clone(),
                room.event_sender(),
                peer.display_name.clone(),
            )
        };
        let source = source.unwrap_or_else(|| MediaSource::default_for(kind));

        let producer = {
            let guard = media.lock().await;
            let transport = guard
                .send_transport
                .as_ref()
                .ok_or_else(|| SignalError::Precondition("No send transport".to_string()))?;

            let mut options = ProducerOptions::new(kind, rtp_parameters);
            options.paused = paused;
            options.app_data = AppData::new(ProducerAppData {
                peer_id: peer_id.to_string(),
            });

            transport
                .produce(options)
                .await
                .map_err(|e| SignalError::Worker(e.to_string()))?
        };

        let producer_id = producer.id().to_string();

        if kind == MediaKind::Audio {
            // Rolled back (the handle drops, closing the producer) if the
            // observer rejects it.
            audio_observer
                .add_producer(RtpObserverAddProducerOptions::new(producer.id()))
                .await
                .map_err(|e| SignalError::Worker(e.to_string()))?;
        }

        producer
            .on_transport_close({
                let events = events.clone();
                let peer_id = peer_id.to_string();
                let producer_id = producer_id.clone();
                move || {
                    let _ = events.send(RoomEvent::ProducerTransportClosed {
                        peer_id,
                        producer_id,
                    });
                }
            })
            .detach();

        media.lock().await.producers.insert(producer_id.clone(), producer);

        // Metadata insert + recipient snapshot under one write lock, so a
        // concurrent join's snapshot and this `newProducer` are mutually
        // exclusive.
        let broadcast = {
            let mut room = room_lock.write().await;
            let Some(peer) = room.peers.get_mut(peer_id) else {
                // Torn down while we were producing; release the handle.
                media.lock().await.producers.remove(&producer_id);
                return Err(SignalError::PeerNotFound(peer_id.to_string()));
            };
            peer.producers.insert(
                producer_id.clone(),
                ProducerEntry { kind, source, paused, muted: false },
            );
            room.recipients_except(peer_id)
        };
        broadcast.send(&Notification::NewProducer {
            id: producer_id.clone(),
            peer_id: peer_id.to_string(),
            kind,
            source,
            display_name,
        });

        info!(
            "Created {:?} producer {} ({:?}) for peer {} in room {}",
            kind, producer_id, source, peer_id, room_id
        );
        self.metrics.inc_producers_created();
        Ok(producer_id)
    }

    /// Creates a consumer on the peer's receive transport for another peer's
    /// producer.
    pub async fn consume(
        &self,
        peer_id: &str,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> SignalResult<ConsumeInfo> {
        let (_, room_lock) = self.peer_room(peer_id)?;

        // Resolve the upstream producer in this room before anything else.
        let (media, events, upstream_peer_id, upstream_name, source) = {
            let room = room_lock.read().await;
            let caller = room
                .peers
                .get(peer_id)
                .ok_or_else(|| SignalError::PeerNotFound(peer_id.to_string()))?;

            let upstream = room
                .peers
                .values()
                .find(|p| p.producers.contains_key(producer_id))
                .ok_or(SignalError::ProducerNotFound)?;
            if upstream.id == peer_id {
                return Err(SignalError::Precondition(
                    "Cannot consume own producer".to_string(),
                ));
            }
            let entry = &upstream.producers[producer_id];
            (
                caller.media.clone(),
                room.event_sender(),
                upstream.id.clone(),
                upstream.display_name.clone(),
                entry.source,
            )
        };

        let upstream_producer_id: ProducerId = producer_id
            .parse()
            .map_err(|_| SignalError::InvalidRequest(format!("Invalid producer id: {producer_id}")))?;

        let mut guard = media.lock().await;
        let transport = guard
            .recv_transport
            .as_ref()
            .ok_or_else(|| SignalError::Precondition("No receive transport".to_string()))?;

        // Created unpaused; clients pause consumers themselves if needed.
        let options = ConsumerOptions::new(upstream_producer_id, rtp_capabilities);
        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| SignalError::Worker(e.to_string()))?;

        consumer
            .on_producer_close({
                let events = events.clone();
                let peer_id = peer_id.to_string();
                let producer_id = producer_id.to_string();
                move || {
                    let _ = events.send(RoomEvent::ConsumerUpstreamClosed {
                        peer_id,
                        producer_id,
                    });
                }
            })
            .detach();

        let info = ConsumeInfo {
            id: consumer.id().to_string(),
            producer_id: producer_id.to_string(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
            peer_id: upstream_peer_id.clone(),
            display_name: upstream_name,
            source,
        };

        guard.consumers.insert(
            producer_id.to_string(),
            ConsumerRecord {
                consumer,
                peer_id: upstream_peer_id,
            },
        );

        debug!(
            "Peer {} now consumes producer {} (consumer {})",
            peer_id, producer_id, info.id
        );
        self.metrics.inc_consumers_created();
        Ok(info)
    }

    /// Pauses or resumes a producer owned by `peer_id`.
    pub async fn set_producer_paused(
        &self,
        peer_id: &str,
        producer_id: &str,
        paused: bool,
    ) -> SignalResult<()> {
        let (_, room_lock) = self.peer_room(peer_id)?;
        let media = Self::media_of(&room_lock, peer_id).await?;
        {
            let guard = media.lock().await;
            let producer = guard
                .producers
                .get(producer_id)
                .ok_or(SignalError::ProducerNotFound)?;
            let result = if paused { producer.pause().await } else { producer.resume().await };
            result.map_err(|e| SignalError::Worker(e.to_string()))?;
        }

        let mut room = room_lock.write().await;
        if let Some(entry) = room
            .peers
            .get_mut(peer_id)
            .and_then(|p| p.producers.get_mut(producer_id))
        {
            entry.paused = paused;
        }

        debug!(
            "Producer {} of peer {} {}",
            producer_id,
            peer_id,
            if paused { "paused" } else { "resumed" }
        );
        Ok(())
    }

    /// Flips the application-level mute flag and tells everyone else.
    pub async fn set_producer_muted(
        &self,
        peer_id: &str,
        producer_id: &str,
        muted: bool,
    ) -> SignalResult<()> {
        let (_, room_lock) = self.peer_room(peer_id)?;
        let broadcast = {
            let mut room = room_lock.write().await;
            let entry = room
                .peers
                .get_mut(peer_id)
                .ok_or_else(|| SignalError::PeerNotFound(peer_id.to_string()))?
                .producers
                .get_mut(producer_id)
                .ok_or(SignalError::ProducerNotFound)?;
            entry.muted = muted;
            room.recipients_except(peer_id)
        };

        broadcast.send(&Notification::ProducerMuted {
            producer_id: producer_id.to_string(),
            muted,
        });
        Ok(())
    }

    /// Closes a producer owned by `peer_id` and announces the closure.
    pub async fn close_producer(&self, peer_id: &str, producer_id: &str) -> SignalResult<()> {
        let (_, room_lock) = self.peer_room(peer_id)?;
        let media = Self::media_of(&room_lock, peer_id).await?;

        // Dropping the handle closes the engine-side producer; downstream
        // consumers are evicted by their own producer-close events.
        media
            .lock()
            .await
            .producers
            .remove(producer_id)
            .ok_or(SignalError::ProducerNotFound)?;

        let broadcast = {
            let mut room = room_lock.write().await;
            if let Some(peer) = room.peers.get_mut(peer_id) {
                peer.producers.remove(producer_id);
            }
            room.recipients_except(peer_id)
        };
        broadcast.send(&Notification::ProducerClosed {
            peer_id: peer_id.to_string(),
            producer_id: producer_id.to_string(),
        });

        info!("Closed producer {} of peer {}", producer_id, peer_id);
        Ok(())
    }

    /// Tears down the peer a connection joined as, if any.
    pub async fn cleanup_conn(&self, conn_id: Uuid) {
        if let Some(peer_id) = self.registry.peer_for_conn(conn_id) {
            self.cleanup_peer(&peer_id).await;
        }
    }

    /// Tears down a peer: close producers (announcing each), consumers, and
    /// transports, drop the registry bindings, announce `peerLeft`, and
    /// collapse the room if it emptied. Runs at most once per peer; a
    /// concurrent call observes the `Disconnected` state and returns.
    pub async fn cleanup_peer(&self, peer_id: &str) {
        let Some(room_id) = self.registry.room_for_peer(peer_id) else {
            return;
        };
        let Some(room_lock) = self.registry.room(&room_id) else {
            return;
        };

        // Claim the teardown. The producer metadata is drained here, in the
        // same critical section that flips the state, so no concurrent
        // `consume` can resolve a producer whose engine handle is about to
        // drop.
        let (conn_id, display_name, media, producer_ids, closure_broadcast) = {
            let mut room = room_lock.write().await;
            let Some(peer) = room.peers.get_mut(peer_id) else {
                return;
            };
            if peer.state == PeerState::Disconnected {
                return;
            }
            peer.state = PeerState::Disconnected;
            let producer_ids: Vec<String> =
                peer.producers.drain().map(|(id, _)| id).collect();
            let conn_id = peer.conn_id;
            let display_name = peer.display_name.clone();
            let media = peer.media.clone();
            let broadcast = room.recipients_except(peer_id);
            (conn_id, display_name, media, producer_ids, broadcast)
        };

        // Release engine resources: producers, consumers, then transports.
        media.lock().await.close_all();

        // Tell the others which streams just died, before the peer itself.
        for producer_id in &producer_ids {
            closure_broadcast.send(&Notification::ProducerClosed {
                peer_id: peer_id.to_string(),
                producer_id: producer_id.clone(),
            });
        }

        // Drop the peer from the room and the registry.
        let (now_empty, left_broadcast) = {
            let mut room = room_lock.write().await;
            room.peers.remove(peer_id);
            let empty = room.peers.is_empty();
            if empty {
                room.closed = true;
            }
            (empty, room.recipients_all())
        };
        self.registry.unbind_peer(conn_id, peer_id);

        left_broadcast.send(&Notification::PeerLeft {
            peer_id: peer_id.to_string(),
            display_name: display_name.clone(),
        });

        info!("Peer {} ({}) left room {}", peer_id, display_name, room_id);
        self.metrics.inc_leaves();

        if now_empty {
            // Last Arc clone dropping closes the router and observer.
            self.registry.remove_room(&room_id);
            info!("Room {} is empty, closed", room_id);
        }
    }

    /// Drains every room through the normal teardown path.
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms...");
        for room_id in self.registry.room_ids() {
            let Some(room_lock) = self.registry.room(&room_id) else {
                continue;
            };
            let peer_ids: Vec<String> = {
                let room = room_lock.read().await;
                room.peers.keys().cloned().collect()
            };
            for peer_id in peer_ids {
                self.cleanup_peer(&peer_id).await;
            }
        }
        info!("All rooms shut down");
    }

    async fn media_of(
        room_lock: &Arc<TokioRwLock<Room>>,
        peer_id: &str,
    ) -> SignalResult<Arc<TokioMutex<PeerMedia>>> {
        let room = room_lock.read().await;
        room.peers
            .get(peer_id)
            .map(|p| p.media.clone())
            .ok_or_else(|| SignalError::PeerNotFound(peer_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaConfig;
    use std::num::{NonZeroU32, NonZeroU8};

    async fn manager() -> Arc<RoomManager> {
        let media = Arc::new(MediaWorker::new(MediaConfig::default()).await.unwrap());
        Arc::new(RoomManager::new(media, ServerMetrics::new()))
    }

    fn channel() -> (mpsc::Sender<Arc<String>>, mpsc::Receiver<Arc<String>>) {
        mpsc::channel(16)
    }

    fn next_json(rx: &mut mpsc::Receiver<Arc<String>>) -> serde_json::Value {
        let raw = rx.try_recv().expect("expected a queued frame");
        serde_json::from_str(&raw).unwrap()
    }

    /// Minimal Opus uplink parameters, the shape a browser client sends.
    fn audio_rtp_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters::Audio {
                mime_type: MimeTypeAudio::Opus,
                payload_type: 111,
                clock_rate: NonZeroU32::new(48000).unwrap(),
                channels: NonZeroU8::new(2).unwrap(),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: vec![],
            }],
            header_extensions: vec![],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(11112222),
                ..RtpEncodingParameters::default()
            }],
            rtcp: RtcpParameters::default(),
        }
    }

    /// Client-side capabilities derived from the router's advertisement,
    /// the way real clients echo them back.
    async fn router_caps(rooms: &RoomManager, room_id: &str) -> RtpCapabilities {
        let room = rooms.registry.room(room_id).unwrap();
        let guard = room.read().await;
        serde_json::from_value(serde_json::to_value(guard.router.rtp_capabilities()).unwrap())
            .unwrap()
    }

    #[tokio::test]
    async fn create_room_is_idempotent() {
        let rooms = manager().await;
        rooms.create_room("X").await.unwrap();
        let router_id = {
            let room = rooms.registry.room("X").unwrap();
            let guard = room.read().await;
            guard.router.id()
        };
        rooms.create_room("X").await.unwrap();
        let room = rooms.registry.room("X").unwrap();
        assert_eq!(room.read().await.router.id(), router_id);
        assert_eq!(rooms.room_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_create_builds_one_room() {
        let rooms = manager().await;
        let (a, b) = tokio::join!(rooms.create_room("X"), rooms.create_room("X"));
        a.unwrap();
        b.unwrap();
        assert_eq!(rooms.room_count(), 1);
    }

    #[tokio::test]
    async fn join_snapshot_and_peer_joined_broadcast() {
        let rooms = manager().await;
        let (tx1, mut rx1) = channel();
        let (tx2, _rx2) = channel();

        let snap1 = rooms
            .join_room(Uuid::new_v4(), "R", "p1", "A", tx1)
            .await
            .unwrap();
        assert!(snap1.peers.is_empty());
        assert!(snap1.producers.is_empty());

        let snap2 = rooms
            .join_room(Uuid::new_v4(), "R", "p2", "B", tx2)
            .await
            .unwrap();
        assert_eq!(snap2.peers.len(), 1);
        assert_eq!(snap2.peers[0].id, "p1");
        assert_eq!(snap2.peers[0].display_name, "A");
        assert_eq!(snap2.peers[0].connection_state, "connected");

        let joined = next_json(&mut rx1);
        assert_eq!(joined["type"], "peerJoined");
        assert_eq!(joined["peerId"], "p2");
        assert_eq!(joined["displayName"], "B");
    }

    #[tokio::test]
    async fn duplicate_peer_id_is_rejected() {
        let rooms = manager().await;
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        rooms
            .join_room(Uuid::new_v4(), "R", "p1", "A", tx1)
            .await
            .unwrap();
        let err = rooms
            .join_room(Uuid::new_v4(), "R", "p1", "B", tx2)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::PeerIdTaken(_)));

        // The room still holds exactly the first joiner.
        let room = rooms.registry.room("R").unwrap();
        assert_eq!(room.read().await.peers.len(), 1);
    }

    #[tokio::test]
    async fn consume_unknown_producer_reports_not_found() {
        let rooms = manager().await;
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        rooms
            .join_room(Uuid::new_v4(), "R", "p1", "A", tx1)
            .await
            .unwrap();
        rooms
            .join_room(Uuid::new_v4(), "R", "p2", "B", tx2)
            .await
            .unwrap();

        let caps = router_caps(&rooms, "R").await;
        let err = rooms.consume("p2", "does-not-exist", caps).await.unwrap_err();
        assert_eq!(err.to_string(), "Producer not found");
    }

    #[tokio::test]
    async fn produce_fan_out_consume_and_teardown() {
        let rooms = manager().await;
        let (tx1, _rx1) = channel();
        let (tx2, mut rx2) = channel();
        let conn1 = Uuid::new_v4();

        rooms.join_room(conn1, "R", "p1", "A", tx1).await.unwrap();
        rooms
            .join_room(Uuid::new_v4(), "R", "p2", "B", tx2)
            .await
            .unwrap();

        rooms
            .create_transport("p1", TransportDirection::Send)
            .await
            .unwrap();
        let producer_id = rooms
            .produce("p1", MediaKind::Audio, audio_rtp_parameters(), None, false)
            .await
            .unwrap();

        // The other peer hears about the new producer, mic defaulted for
        // audio.
        let announced = next_json(&mut rx2);
        assert_eq!(announced["type"], "newProducer");
        assert_eq!(announced["id"], producer_id.as_str());
        assert_eq!(announced["peerId"], "p1");
        assert_eq!(announced["kind"], "audio");
        assert_eq!(announced["source"], "mic");
        assert_eq!(announced["displayName"], "A");

        // A later joiner gets the producer in its snapshot instead.
        let (tx3, _rx3) = channel();
        let snapshot = rooms
            .join_room(Uuid::new_v4(), "R", "p3", "C", tx3)
            .await
            .unwrap();
        assert_eq!(snapshot.producers.len(), 1);
        assert_eq!(snapshot.producers[0].id, producer_id);
        assert_eq!(snapshot.producers[0].peer_id, "p1");
        let joined = next_json(&mut rx2);
        assert_eq!(joined["type"], "peerJoined");
        assert_eq!(joined["peerId"], "p3");

        // Consuming your own producer is refused.
        let caps = router_caps(&rooms, "R").await;
        let err = rooms
            .consume("p1", &producer_id, caps.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::Precondition(_)));

        // Another peer consumes it over its receive transport.
        rooms
            .create_transport("p2", TransportDirection::Recv)
            .await
            .unwrap();
        let consumed = rooms.consume("p2", &producer_id, caps).await.unwrap();
        assert_eq!(consumed.producer_id, producer_id);
        assert_eq!(consumed.peer_id, "p1");
        assert_eq!(consumed.display_name, "A");
        assert_eq!(consumed.kind, MediaKind::Audio);
        assert_eq!(consumed.source, MediaSource::Mic);

        // Mute flag fans out to the others only.
        rooms.set_producer_muted("p1", &producer_id, true).await.unwrap();
        let muted = next_json(&mut rx2);
        assert_eq!(muted["type"], "producerMuted");
        assert_eq!(muted["producerId"], producer_id.as_str());
        assert_eq!(muted["muted"], true);

        // Engine-side pause mirrors into the signaling view.
        rooms.set_producer_paused("p1", &producer_id, true).await.unwrap();
        rooms.set_producer_paused("p1", &producer_id, false).await.unwrap();

        // Disconnect announces the producer's closure before the departure.
        rooms.cleanup_conn(conn1).await;
        let closed = next_json(&mut rx2);
        assert_eq!(closed["type"], "producerClosed");
        assert_eq!(closed["peerId"], "p1");
        assert_eq!(closed["producerId"], producer_id.as_str());
        let left = next_json(&mut rx2);
        assert_eq!(left["type"], "peerLeft");
        assert_eq!(left["peerId"], "p1");
        assert_eq!(left["displayName"], "A");
    }

    #[tokio::test]
    async fn produce_without_send_transport_is_a_precondition_error() {
        let rooms = manager().await;
        let (tx1, _rx1) = channel();
        rooms
            .join_room(Uuid::new_v4(), "R", "p1", "A", tx1)
            .await
            .unwrap();

        let err = rooms
            .produce("p1", MediaKind::Audio, RtpParameters::default(), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::Precondition(_)));
    }

    #[tokio::test]
    async fn transport_creation_stores_per_direction() {
        let rooms = manager().await;
        let (tx1, _rx1) = channel();
        rooms
            .join_room(Uuid::new_v4(), "R", "p1", "A", tx1)
            .await
            .unwrap();

        let send = rooms
            .create_transport("p1", TransportDirection::Send)
            .await
            .unwrap();
        let recv = rooms
            .create_transport("p1", TransportDirection::Recv)
            .await
            .unwrap();
        assert_ne!(send.id, recv.id);
        assert!(!send.ice_candidates.is_empty());

        // Unknown transport id on connect is a not-found, not a worker error.
        let err = rooms
            .connect_transport("p1", "no-such-transport", send.dtls_parameters.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::TransportNotFound(_)));
    }

    #[tokio::test]
    async fn disconnect_cleanup_broadcasts_and_collapses() {
        let rooms = manager().await;
        let (tx1, _rx1) = channel();
        let (tx2, mut rx2) = channel();

        let conn1 = Uuid::new_v4();
        rooms.join_room(conn1, "R", "p1", "A", tx1).await.unwrap();
        rooms.join_room(Uuid::new_v4(), "R", "p2", "B", tx2).await.unwrap();

        let first_router_id = {
            let room = rooms.registry.room("R").unwrap();
            let guard = room.read().await;
            guard.router.id()
        };

        rooms.cleanup_conn(conn1).await;

        let left = next_json(&mut rx2);
        assert_eq!(left["type"], "peerLeft");
        assert_eq!(left["peerId"], "p1");
        assert_eq!(left["displayName"], "A");

        assert!(rooms.registry.room_for_peer("p1").is_none());
        assert!(rooms.registry.peer_for_conn(conn1).is_none());
        assert_eq!(rooms.peer_count(), 1);
        assert_eq!(rooms.room_count(), 1);

        // Second cleanup of the same peer is a no-op.
        rooms.cleanup_peer("p1").await;

        // Last peer out collapses the room...
        rooms.cleanup_peer("p2").await;
        assert_eq!(rooms.room_count(), 0);

        // ...and a rejoin materializes a brand-new router.
        let (tx3, _rx3) = channel();
        rooms
            .join_room(Uuid::new_v4(), "R", "p3", "C", tx3)
            .await
            .unwrap();
        let room = rooms.registry.room("R").unwrap();
        assert_ne!(room.read().await.router.id(), first_router_id);
    }

    #[tokio::test]
    async fn set_producer_muted_requires_ownership() {
        let rooms = manager().await;
        let (tx1, _rx1) = channel();
        rooms
            .join_room(Uuid::new_v4(), "R", "p1", "A", tx1)
            .await
            .unwrap();

        let err = rooms.set_producer_muted("p1", "missing", true).await.unwrap_err();
        assert_eq!(err.to_string(), "Producer not found");
    }
}
