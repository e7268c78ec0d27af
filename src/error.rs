//! Crate-level error taxonomy (§7).
//!
//! Module-local error enums (`permissions::PermissionError`,
//! `codec::CodecError`, `signalling::SignalError`) convert into
//! `SfuError` via `#[from]`; this mirrors the split the teacher keeps
//! between its per-module `VoiceError`/`PermissionError` and whatever
//! top-level error the caller needs.

use crate::permissions::PermissionError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Crate-level error type.
#[derive(Debug, thiserror::Error)]
pub enum SfuError {
    /// Malformed JSON or an unknown message `type` on the signalling
    /// channel (§7 "transient signalling").
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Credential resolution failed (§4.7, §7 "authorisation").
    #[error(transparent)]
    Permission(#[from] PermissionError),

    /// The named group does not exist and the caller did not request
    /// implicit creation.
    #[error("no such group: {0}")]
    NoSuchGroup(String),

    /// The group is locked against new joins (§4.6).
    #[error("group locked: {0}")]
    GroupLocked(String),

    /// A referenced up/down connection id was not found on the client.
    #[error("no such stream: {0}")]
    NoSuchStream(String),

    /// The requested codec is not in the group's codec list (§4.3
    /// `addTrack`).
    #[error("codec not offered by group: {0}")]
    CodecNotOffered(String),

    /// The client's outbound JSON queue overran (§5, §7 "fatal
    /// client").
    #[error("outbound queue overrun")]
    Overrun,

    /// The client missed a keepalive pong deadline (§5, §7 "fatal
    /// client").
    #[error("keepalive missed")]
    KeepaliveMissed,

    /// A duplicate client id was presented on join (§4.7 failures).
    #[error("duplicate client id")]
    DuplicateId,

    /// WebRTC peer-connection/ICE/DTLS failure (§7 "fatal
    /// peer-connection").
    #[error("peer connection error: {0}")]
    PeerConnection(#[from] webrtc::Error),

    /// Malformed or truncated RTP/RTCP payload (§7 "media transient").
    /// Always handled by dropping the packet and incrementing a
    /// metric; this variant exists so the codec helpers have
    /// something typed to return, not to propagate to a client.
    #[error(transparent)]
    Codec(#[from] crate::codec::CodecError),
}

impl IntoResponse for SfuError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Permission(_) | Self::GroupLocked(_) => StatusCode::FORBIDDEN,
            Self::NoSuchGroup(_) | Self::NoSuchStream(_) => StatusCode::NOT_FOUND,
            Self::Protocol(_) | Self::CodecNotOffered(_) | Self::DuplicateId => {
                StatusCode::BAD_REQUEST
            }
            Self::Overrun | Self::KeepaliveMissed => StatusCode::REQUEST_TIMEOUT,
            Self::PeerConnection(_) | Self::Codec(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
