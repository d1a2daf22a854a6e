#![forbid(unsafe_code)]

// Per-connection handler: a serial request loop with correlated responses.
//
// Frames on one connection are handled strictly in arrival order; the next
// frame is not read until the current handler finished, so every broadcast a
// request causes is emitted before the same client's next request is seen.

use super::protocol::{ClientRequest, ErrorFrame, ResponseFrame, ServerResponse};
use crate::error::{SignalError, SignalResult};
use crate::metrics::ServerMetrics;
use crate::room::RoomManager;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded per-client outbound buffer; notifications beyond this are stale
/// and dropped rather than queued.
const CHANNEL_CAPACITY: usize = 64;

/// Close connections that send nothing for this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

const MAX_ROOM_ID_LEN: usize = 128;
const MAX_PEER_ID_LEN: usize = 64;
const MAX_DISPLAY_NAME_LEN: usize = 64;

/// Serializes a frame and queues it on the client's channel.
fn send_frame<T: Serialize>(sender: &mpsc::Sender<Arc<String>>, frame: &T) {
    match serde_json::to_string(frame) {
        Ok(json) => {
            if sender.try_send(Arc::new(json)).is_err() {
                debug!("Dropping frame for closing connection");
            }
        }
        Err(e) => warn!("Failed to serialize frame: {}", e),
    }
}

/// Handles a single WebSocket connection until it closes, then tears down
/// whatever peer it joined as.
pub async fn handle_connection(
    socket: WebSocket,
    rooms: Arc<RoomManager>,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let conn_id = Uuid::new_v4();
    info!("New connection {}", conn_id);

    metrics.inc_connections();
    let _active = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    // Writer task: everything queued for this client goes out here.
    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_frames_sent();
            if ws_sender
                .send(Message::Text((*json).clone().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    loop {
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout on connection {}", conn_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_frames_received();

                let frame: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(e) => {
                        // Malformed JSON is not fatal; answer and read on.
                        metrics.inc_errors();
                        send_frame(&tx, &ErrorFrame {
                            req_id: None,
                            error: format!("Invalid JSON: {e}"),
                        });
                        continue;
                    }
                };
                let req_id = frame
                    .get("reqId")
                    .and_then(|v| v.as_str())
                    .map(String::from);

                let request = match serde_json::from_value::<ClientRequest>(frame) {
                    Ok(request) => request,
                    Err(e) => {
                        metrics.inc_errors();
                        send_frame(&tx, &ErrorFrame {
                            req_id,
                            error: format!("Invalid request: {e}"),
                        });
                        continue;
                    }
                };

                // A panicking handler must not take the connection (or the
                // process) down with it.
                let outcome = AssertUnwindSafe(dispatch(&rooms, conn_id, &tx, request))
                    .catch_unwind()
                    .await;

                match outcome {
                    Ok(Ok(response)) => {
                        send_frame(&tx, &ResponseFrame { req_id, body: response });
                    }
                    Ok(Err(err)) => {
                        metrics.inc_errors();
                        send_frame(&tx, &ErrorFrame { req_id, error: err.to_string() });
                    }
                    Err(_) => {
                        metrics.inc_errors();
                        error!("Request handler panicked on connection {}", conn_id);
                        send_frame(&tx, &ErrorFrame {
                            req_id,
                            error: "Internal server error".to_string(),
                        });
                    }
                }
            }
            Message::Close(_) => {
                debug!("Connection {} closed by client", conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {
                warn!("Ignoring non-text frame on connection {}", conn_id);
            }
        }
    }

    // Unconditional teardown; a no-op if this connection never joined.
    rooms.cleanup_conn(conn_id).await;

    drop(tx);
    let _ = send_task.await;
    info!("Connection {} finished", conn_id);
}

fn validate_len(value: &str, max: usize, what: &str) -> SignalResult<()> {
    if value.is_empty() || value.len() > max {
        return Err(SignalError::InvalidRequest(format!(
            "{what} must be 1-{max} characters"
        )));
    }
    Ok(())
}

/// Routes one request to its handler and produces the response body.
pub(crate) async fn dispatch(
    rooms: &Arc<RoomManager>,
    conn_id: Uuid,
    sender: &mpsc::Sender<Arc<String>>,
    request: ClientRequest,
) -> SignalResult<ServerResponse> {
    match request {
        ClientRequest::CreateRoom { room_id } => {
            validate_len(&room_id, MAX_ROOM_ID_LEN, "roomId")?;
            rooms.create_room(&room_id).await?;
            Ok(ServerResponse::CreateRoomResponse { success: true })
        }

        ClientRequest::JoinRoom { room_id, peer_id, display_name } => {
            validate_len(&room_id, MAX_ROOM_ID_LEN, "roomId")?;
            validate_len(&peer_id, MAX_PEER_ID_LEN, "peerId")?;
            validate_len(&display_name, MAX_DISPLAY_NAME_LEN, "displayName")?;

            let snapshot = rooms
                .join_room(conn_id, &room_id, &peer_id, &display_name, sender.clone())
                .await?;
            Ok(ServerResponse::JoinRoomResponse {
                rtp_capabilities: snapshot.rtp_capabilities,
                peers: snapshot.peers,
                producers: snapshot.producers,
            })
        }

        ClientRequest::CreateWebRtcTransport { direction } => {
            let peer_id = rooms.peer_for_conn(conn_id)?;
            let info = rooms.create_transport(&peer_id, direction).await?;
            Ok(ServerResponse::CreateWebRtcTransportResponse {
                id: info.id,
                ice_parameters: info.ice_parameters,
                ice_candidates: info.ice_candidates,
                dtls_parameters: info.dtls_parameters,
                sctp_parameters: info.sctp_parameters,
            })
        }

        ClientRequest::ConnectWebRtcTransport { transport_id, dtls_parameters } => {
            let peer_id = rooms.peer_for_conn(conn_id)?;
            rooms
                .connect_transport(&peer_id, &transport_id, dtls_parameters)
                .await?;
            Ok(ServerResponse::ConnectWebRtcTransportResponse { connected: true })
        }

        ClientRequest::Produce { kind, rtp_parameters, source, paused } => {
            let peer_id = rooms.peer_for_conn(conn_id)?;
            let id = rooms
                .produce(&peer_id, kind, rtp_parameters, source, paused)
                .await?;
            Ok(ServerResponse::ProduceResponse { id })
        }

        ClientRequest::Consume { producer_id, rtp_capabilities } => {
            let peer_id = rooms.peer_for_conn(conn_id)?;
            let info = rooms
                .consume(&peer_id, &producer_id, rtp_capabilities)
                .await?;
            Ok(ServerResponse::ConsumeResponse {
                id: info.id,
                producer_id: info.producer_id,
                kind: info.kind,
                rtp_parameters: info.rtp_parameters,
                peer_id: info.peer_id,
                display_name: info.display_name,
                source: info.source,
            })
        }

        ClientRequest::PauseProducer { producer_id } => {
            let peer_id = rooms.peer_for_conn(conn_id)?;
            rooms.set_producer_paused(&peer_id, &producer_id, true).await?;
            Ok(ServerResponse::PauseProducerResponse { success: true })
        }

        ClientRequest::ResumeProducer { producer_id } => {
            let peer_id = rooms.peer_for_conn(conn_id)?;
            rooms.set_producer_paused(&peer_id, &producer_id, false).await?;
            Ok(ServerResponse::ResumeProducerResponse { success: true })
        }

        ClientRequest::SetProducerMuted { producer_id, muted } => {
            let peer_id = rooms.peer_for_conn(conn_id)?;
            rooms.set_producer_muted(&peer_id, &producer_id, muted).await?;
            Ok(ServerResponse::SetProducerMutedResponse { success: true })
        }

        ClientRequest::CloseProducer { producer_id } => {
            let peer_id = rooms.peer_for_conn(conn_id)?;
            rooms.close_producer(&peer_id, &producer_id).await?;
            Ok(ServerResponse::CloseProducerResponse { success: true })
        }

        ClientRequest::Unknown => Ok(ServerResponse::Pong),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaConfig, MediaWorker};

    async fn rooms() -> Arc<RoomManager> {
        let media = Arc::new(MediaWorker::new(MediaConfig::default()).await.unwrap());
        Arc::new(RoomManager::new(media, ServerMetrics::new()))
    }

    #[tokio::test]
    async fn unknown_request_answers_pong() {
        let rooms = rooms().await;
        let (tx, _rx) = mpsc::channel(4);
        let response = dispatch(&rooms, Uuid::new_v4(), &tx, ClientRequest::Unknown)
            .await
            .unwrap();
        assert!(matches!(response, ServerResponse::Pong));
    }

    #[tokio::test]
    async fn empty_room_id_is_invalid() {
        let rooms = rooms().await;
        let (tx, _rx) = mpsc::channel(4);
        let err = dispatch(
            &rooms,
            Uuid::new_v4(),
            &tx,
            ClientRequest::CreateRoom { room_id: String::new() },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SignalError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn media_requests_before_join_are_rejected() {
        let rooms = rooms().await;
        let (tx, _rx) = mpsc::channel(4);
        let err = dispatch(
            &rooms,
            Uuid::new_v4(),
            &tx,
            ClientRequest::CloseProducer { producer_id: "x".to_string() },
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Not in a room");
    }

    #[tokio::test]
    async fn join_response_carries_capabilities_and_snapshots() {
        let rooms = rooms().await;
        let (tx, _rx) = mpsc::channel(4);
        let response = dispatch(
            &rooms,
            Uuid::new_v4(),
            &tx,
            ClientRequest::JoinRoom {
                room_id: "R".to_string(),
                peer_id: "p1".to_string(),
                display_name: "A".to_string(),
            },
        )
        .await
        .unwrap();

        let value = serde_json::to_value(ResponseFrame {
            req_id: Some("1".to_string()),
            body: response,
        })
        .unwrap();
        assert_eq!(value["type"], "joinRoomResponse");
        assert_eq!(value["reqId"], "1");
        assert!(value["rtpCapabilities"]["codecs"].is_array());
        assert_eq!(value["peers"], serde_json::json!([]));
        assert_eq!(value["producers"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn second_join_on_same_connection_is_rejected() {
        let rooms = rooms().await;
        let (tx, _rx) = mpsc::channel(4);
        let conn = Uuid::new_v4();

        dispatch(
            &rooms,
            conn,
            &tx,
            ClientRequest::JoinRoom {
                room_id: "R".to_string(),
                peer_id: "p1".to_string(),
                display_name: "A".to_string(),
            },
        )
        .await
        .unwrap();

        let err = dispatch(
            &rooms,
            conn,
            &tx,
            ClientRequest::JoinRoom {
                room_id: "R".to_string(),
                peer_id: "p2".to_string(),
                display_name: "B".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SignalError::Precondition(_)));
    }
}
