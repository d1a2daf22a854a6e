#![forbid(unsafe_code)]

// Shared types for the media adapter.

use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the media engine. Messages are kept verbatim so that request
/// handlers can forward them to clients unchanged.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("{0}")]
    Worker(String),

    #[error("{0}")]
    Router(String),

    #[error("{0}")]
    Observer(String),
}

pub type MediaResult<T> = Result<T, MediaError>;

/// Transport parameters handed to a client so it can complete ICE/DTLS setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<SctpParameters>,
}

impl From<&WebRtcTransport> for TransportInfo {
    fn from(transport: &WebRtcTransport) -> Self {
        Self {
            id: transport.id().to_string(),
            ice_parameters: transport.ice_parameters().clone(),
            ice_candidates: transport.ice_candidates().clone(),
            dtls_parameters: transport.dtls_parameters(),
            sctp_parameters: transport.sctp_parameters(),
        }
    }
}
