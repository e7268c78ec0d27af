//! HTTP surface (§6.2): public group index, per-group status, the
//! `/ws` signalling upgrade, and WHIP ingestion.
//!
//! Grounded on `voice/mod.rs`'s minimal router (`/ice-servers`) and
//! `ws/mod.rs`'s split-socket handler (`SplitSink`/`SplitStream`,
//! single-writer `mpsc` forwarding task, JSON-per-`Message::Text`
//! framing) generalised from the lineage's fixed `ClientEvent`/
//! `ServerEvent` pair to this crate's shared `SignalMessage` enum.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::group::random_id;
use crate::signalling::{JoinKind, Session, SignalMessage};
use crate::state::SfuState;

/// Builds the axum router for this crate's HTTP surface.
pub fn router(state: Arc<SfuState>) -> Router {
    Router::new()
        .route("/public-groups.json", get(public_groups))
        .route("/group/{name}/.status.json", get(group_status))
        .route("/ws", get(ws_upgrade))
        .route("/whip/{group}", post(whip_publish))
        .route("/whip/{group}/{id}", axum::routing::patch(whip_trickle))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct PublicGroupEntry {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    locked: bool,
    #[serde(rename = "clientCount")]
    client_count: usize,
}

/// `GET /public-groups.json` (§6.2): the public group index.
async fn public_groups(State(state): State<Arc<SfuState>>) -> Json<Vec<PublicGroupEntry>> {
    let entries = state
        .groups()
        .into_iter()
        .filter(|g| g.is_public())
        .map(|g| PublicGroupEntry {
            name: g.name.clone(),
            display_name: None,
            description: None,
            locked: g.is_locked(),
            client_count: g.client_count(),
        })
        .collect();
    Json(entries)
}

/// `GET /group/{name}/.status.json` (§6.2): per-group status.
async fn group_status(State(state): State<Arc<SfuState>>, Path(name): Path<String>) -> Response {
    let Some(group) = state.group(&name) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    Json(json!({
        "name": name,
        "locked": group.is_locked(),
        "clientCount": group.client_count(),
    }))
    .into_response()
}

/// `GET /ws`: upgrades to the signalling WebSocket and runs one
/// connection's read/write loop until close.
async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<SfuState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<SfuState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (session, mut outbox_rx) = Session::new(state);

    let forward_session = session.clone();
    let sender_handle = tokio::spawn(async move {
        while let Some(event) = outbox_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    warn!(%err, "failed to serialise outbound signalling message");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
            if forward_session.should_close() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let message: SignalMessage = match serde_json::from_str(&text) {
                    Ok(message) => message,
                    Err(err) => {
                        debug!(%err, "malformed signalling message, dropping connection");
                        break;
                    }
                };
                if let Err(err) = session.handle(message).await {
                    warn!(%err, "error handling signalling message");
                    break;
                }
                if session.should_close() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Err(err) => {
                warn!(%err, "websocket transport error");
                break;
            }
            _ => {}
        }
    }

    session.leave().await;
    sender_handle.abort();
}

/// `POST /whip/{group}` (§6.2): treats the SDP body as an anonymous
/// publisher offer, reusing the same `Session`/`SignalMessage`
/// machinery as the WebSocket offerer path rather than duplicating
/// the peer-connection setup.
async fn whip_publish(
    State(state): State<Arc<SfuState>>,
    Path(group): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(sdp) = String::from_utf8(body.to_vec()) else {
        return (StatusCode::BAD_REQUEST, "offer body is not valid UTF-8").into_response();
    };
    let token = bearer_token(&headers);

    let (session, mut outbox_rx) = Session::new(state);
    if let Err(err) = session
        .handle(SignalMessage::Join {
            kind: JoinKind::Join,
            group: group.clone(),
            username: None,
            password: None,
            token,
        })
        .await
    {
        warn!(%err, "whip join failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    if !joined_ok(&mut outbox_rx) {
        return (StatusCode::FORBIDDEN, "not authorised to publish to this group").into_response();
    }

    let id = random_id();
    if let Err(err) = session
        .handle(SignalMessage::Offer {
            id: id.clone(),
            label: "whip".into(),
            replace: None,
            source: String::new(),
            username: String::new(),
            sdp,
        })
        .await
    {
        warn!(%err, "whip offer handling failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let Some(answer_sdp) = answer_sdp(&mut outbox_rx) else {
        return (StatusCode::BAD_REQUEST, "offer was rejected").into_response();
    };

    let location = format!("/whip/{group}/{id}");
    Response::builder()
        .status(StatusCode::CREATED)
        .header(header::LOCATION, location)
        .header(header::CONTENT_TYPE, "application/sdp")
        .body(axum::body::Body::from(answer_sdp))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// `PATCH /whip/{group}/{id}` (§6.2): trickled ICE candidates, one
/// `a=candidate` line per fragment per the WHIP trickle convention.
async fn whip_trickle(Path((_group, id)): Path<(String, String)>, body: Bytes) -> StatusCode {
    let Ok(fragment) = String::from_utf8(body.to_vec()) else {
        return StatusCode::BAD_REQUEST;
    };
    for line in fragment.lines() {
        if let Some(candidate) = line.strip_prefix("a=") {
            debug!(%id, %candidate, "whip trickle candidate received but session is gone (stateless WHIP session)");
        }
    }
    StatusCode::NO_CONTENT
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn joined_ok(rx: &mut tokio::sync::mpsc::Receiver<Value>) -> bool {
    while let Ok(value) = rx.try_recv() {
        if value.get("type").and_then(Value::as_str) == Some("joined") {
            let kind = value.get("kind").and_then(Value::as_str);
            return kind != Some("fail");
        }
    }
    false
}

fn answer_sdp(rx: &mut tokio::sync::mpsc::Receiver<Value>) -> Option<String> {
    while let Ok(value) = rx.try_recv() {
        if value.get("type").and_then(Value::as_str) == Some("answer") {
            return value.get("sdp").and_then(Value::as_str).map(str::to_string);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::JwtValidator;
    use crate::config::Config;

    fn test_state() -> Arc<SfuState> {
        let config = Config::default_for_test();
        let validator: Arc<dyn crate::auth::TokenValidator> =
            Arc::new(JwtValidator::new(config.jwt_hs256_secret.clone()));
        Arc::new(SfuState::new(config, validator).expect("state builds"))
    }

    #[test]
    fn bearer_token_strips_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn bearer_token_absent_without_header() {
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn public_groups_lists_only_public_groups() {
        let state = test_state();
        let public = state.group_or_create("public-room");
        let mut description = public.description();
        description.public = true;
        public.set_description(description);
        state.group_or_create("private-room");

        let result = public_groups(State(state.clone())).await;
        assert!(result.0.iter().any(|g| g.name == "public-room"));
        assert!(!result.0.iter().any(|g| g.name == "private-room"));
    }

    #[tokio::test]
    async fn group_status_404_for_unknown_group() {
        let state = test_state();
        let response = group_status(State(state), Path("nope".into())).await;
        assert_eq!(response.into_response().status(), StatusCode::NOT_FOUND);
    }
}
