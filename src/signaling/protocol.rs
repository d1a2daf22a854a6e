#![forbid(unsafe_code)]

// Signaling protocol - typed frames for the bidirectional JSON stream.
//
// Every frame carries a `type` tag. Requests may carry an opaque `reqId`
// which the matching response echoes; notifications never do. An unknown
// request type deserializes to `Unknown` and is answered with `pong`, which
// doubles as the protocol's heartbeat.

use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};

/// Semantic origin of a producer, independent of its codec kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    Mic,
    Webcam,
    Screen,
}

impl MediaSource {
    /// Default when a `produce` request omits the source.
    pub fn default_for(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => MediaSource::Mic,
            MediaKind::Video => MediaSource::Webcam,
        }
    }
}

/// Direction of a WebRTC transport, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

/// Client-to-server requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientRequest {
    #[serde(rename_all = "camelCase")]
    CreateRoom { room_id: String },
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        peer_id: String,
        display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    CreateWebRtcTransport { direction: TransportDirection },
    #[serde(rename_all = "camelCase")]
    ConnectWebRtcTransport {
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        source: Option<MediaSource>,
        #[serde(default)]
        paused: bool,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    },
    #[serde(rename_all = "camelCase")]
    PauseProducer { producer_id: String },
    #[serde(rename_all = "camelCase")]
    ResumeProducer { producer_id: String },
    #[serde(rename_all = "camelCase")]
    SetProducerMuted { producer_id: String, muted: bool },
    #[serde(rename_all = "camelCase")]
    CloseProducer { producer_id: String },
    /// Any unrecognized `type`; treated as a heartbeat.
    #[serde(other)]
    Unknown,
}

/// Server-to-client responses, one per request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerResponse {
    #[serde(rename_all = "camelCase")]
    CreateRoomResponse { success: bool },
    #[serde(rename_all = "camelCase")]
    JoinRoomResponse {
        rtp_capabilities: RtpCapabilitiesFinalized,
        peers: Vec<PeerSummary>,
        producers: Vec<ProducerSummary>,
    },
    #[serde(rename_all = "camelCase")]
    CreateWebRtcTransportResponse {
        id: String,
        ice_parameters: IceParameters,
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
        #[serde(skip_serializing_if = "Option::is_none")]
        sctp_parameters: Option<SctpParameters>,
    },
    #[serde(rename_all = "camelCase")]
    ConnectWebRtcTransportResponse { connected: bool },
    #[serde(rename_all = "camelCase")]
    ProduceResponse { id: String },
    #[serde(rename_all = "camelCase")]
    ConsumeResponse {
        id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        peer_id: String,
        display_name: String,
        source: MediaSource,
    },
    #[serde(rename_all = "camelCase")]
    PauseProducerResponse { success: bool },
    #[serde(rename_all = "camelCase")]
    ResumeProducerResponse { success: bool },
    #[serde(rename_all = "camelCase")]
    SetProducerMutedResponse { success: bool },
    #[serde(rename_all = "camelCase")]
    CloseProducerResponse { success: bool },
    Pong,
}

/// Server-initiated notifications; no `reqId`, fire-and-forget.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: String, display_name: String },
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: String, display_name: String },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        id: String,
        peer_id: String,
        kind: MediaKind,
        source: MediaSource,
        display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed { peer_id: String, producer_id: String },
    #[serde(rename_all = "camelCase")]
    ProducerMuted { producer_id: String, muted: bool },
    /// Loudest speaker report; delivered to every peer including the
    /// speaker. `volume` is negative dBFS.
    #[serde(rename_all = "camelCase")]
    AudioLevel { peer_id: String, volume: f64 },
}

/// A peer as it appears in the `joinRoom` snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub id: String,
    pub display_name: String,
    pub connection_state: String,
}

/// A producer as it appears in the `joinRoom` snapshot; same shape as the
/// `newProducer` notification so joiners and bystanders converge.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub id: String,
    pub peer_id: String,
    pub kind: MediaKind,
    pub source: MediaSource,
    pub display_name: String,
}

/// Response frame: the correlated `reqId` (if the request carried one)
/// flattened next to the typed body.
#[derive(Debug, Serialize)]
pub struct ResponseFrame {
    #[serde(rename = "reqId", skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    #[serde(flatten)]
    pub body: ServerResponse,
}

/// Error frame: `{reqId?, error}` with no `type` field.
#[derive(Debug, Serialize)]
pub struct ErrorFrame {
    #[serde(rename = "reqId", skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    pub error: String,
}
