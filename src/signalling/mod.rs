//! The per-connection signalling dispatcher (§4.6, §4.7): the client
//! state machine and the handlers that turn inbound [`SignalMessage`]s
//! into group/permission/`Up`/`Down` operations.
//!
//! Grounded on `voice::ws_handler::handle_voice_event`'s
//! match-and-delegate dispatch shape and `voice::sfu::SfuServer`'s
//! offer/answer/ICE/track-handler wiring, generalised from a single
//! fixed voice room to the group/permission/stream-id model this spec
//! requires.

pub mod messages;

pub use messages::{JoinKind, JoinedKind, SignalMessage, UserKind};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use webrtc::rtcp::receiver_report::ReceiverReport;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::{RTCRtpTransceiverDirection, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::bandwidth::Layer;
use crate::down::{layer_for_rid, Down, DownTrack};
use crate::error::SfuError;
use crate::group::{random_id, now_ms, ChatHistoryEntry, Client, Group, OUTBOX_CAPACITY};
use crate::permissions::{resolve, AtomicPermissions, Credentials, HashVerifyLimiter, Role};
use crate::state::SfuState;
use crate::up::{spawn_rtp_reader, Up, UpTrack};
use crate::writer_pool::PacketSink;

/// The client state machine (§4.6). `Failed` and `Leaving` both drain
/// into `Closed`; the dispatcher refuses most message types outside
/// `Joined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    New,
    Handshaking,
    Joining,
    Joined,
    Leaving,
    Failed,
    Closed,
}

/// One signalling connection: the state machine, the resolved group
/// `Client` once joined, and the shared outbound JSON queue that
/// exists *before* join (so a `joined{kind:"fail"}` has somewhere to
/// go) and is handed unchanged into [`Group::join`] once it succeeds.
pub struct Session {
    sfu: Arc<SfuState>,
    state: Mutex<ClientState>,
    outbox_tx: mpsc::Sender<Value>,
    client: Mutex<Option<Arc<Client>>>,
    group: Mutex<Option<Arc<Group>>>,
    limiter: HashVerifyLimiter,
    closed: AtomicBool,
}

impl Session {
    #[must_use]
    pub fn new(sfu: Arc<SfuState>) -> (Arc<Self>, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let session = Arc::new(Self {
            sfu,
            state: Mutex::new(ClientState::New),
            outbox_tx: tx,
            client: Mutex::new(None),
            group: Mutex::new(None),
            limiter: HashVerifyLimiter::new(),
            closed: AtomicBool::new(false),
        });
        (session, rx)
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock() = state;
    }

    #[must_use]
    pub fn client(&self) -> Option<Arc<Client>> {
        self.client.lock().clone()
    }

    #[must_use]
    pub fn group(&self) -> Option<Arc<Group>> {
        self.group.lock().clone()
    }

    /// Enqueues one outbound message; a full queue is the client's
    /// fatal `Overrun` (§5, §7).
    fn send(&self, message: &SignalMessage) {
        let value = serde_json::to_value(message).expect("SignalMessage always serialises");
        if self.outbox_tx.try_send(value).is_err() {
            warn!("outbound queue overrun, closing session");
            self.closed.store(true, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn should_close(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Tears down every Up/Down this session owns and removes it from
    /// its group, as on `join{kind:"leave"}` or a transport error
    /// (§4.6 "joined -> leaving").
    pub async fn leave(&self) {
        let (Some(client), Some(group)) = (self.client(), self.group()) else {
            self.set_state(ClientState::Closed);
            return;
        };
        self.set_state(ClientState::Leaving);

        for up in client.ups() {
            close_up(&group, &up).await;
        }
        for down in client.downs() {
            down.close().await;
        }
        group.remove_client(&client.id);
        group.broadcast(SignalMessage::User {
            kind: UserKind::Delete,
            id: client.id.clone(),
            username: client.username(),
            permissions: Vec::new(),
            status: Value::Null,
        });
        *self.client.lock() = None;
        *self.group.lock() = None;
        self.set_state(ClientState::Closed);
    }

    /// Dispatches one inbound message (§6.1). Errors are protocol
    /// violations the caller should close the connection for;
    /// recoverable per-operation failures are reported back to the
    /// client as `usermessage{kind:"error"}` instead of propagating.
    pub async fn handle(&self, message: SignalMessage) -> Result<(), SfuError> {
        match message {
            SignalMessage::Handshake { id, version } => {
                if self.state() == ClientState::New {
                    self.set_state(ClientState::Handshaking);
                }
                debug!(%id, ?version, "handshake received");
                Ok(())
            }
            SignalMessage::Ping {} => {
                self.send(&SignalMessage::Pong {});
                Ok(())
            }
            SignalMessage::Pong {} => Ok(()),
            SignalMessage::Join {
                kind: JoinKind::Join,
                group,
                username,
                password,
                token,
            } => self.handle_join(group, username, password, token).await,
            SignalMessage::Join {
                kind: JoinKind::Leave,
                ..
            } => {
                self.leave().await;
                Ok(())
            }
            SignalMessage::Request { request } => {
                self.handle_request(request).await;
                Ok(())
            }
            SignalMessage::Offer {
                id,
                label,
                source: _,
                username: _,
                sdp,
                replace: _,
            } => {
                self.handle_offer(id, label, sdp).await;
                Ok(())
            }
            SignalMessage::Answer { id, sdp } => {
                self.handle_answer(id, sdp).await;
                Ok(())
            }
            SignalMessage::Ice { id, candidate } => {
                self.handle_ice(id, candidate).await;
                Ok(())
            }
            SignalMessage::RequestStream { id, request } => {
                self.handle_request_stream(id, request);
                Ok(())
            }
            SignalMessage::Renegotiate { id } => {
                self.handle_renegotiate(id).await;
                Ok(())
            }
            SignalMessage::Close { id } => {
                self.handle_close(id).await;
                Ok(())
            }
            SignalMessage::Abort { id } => {
                self.send(&SignalMessage::Close { id });
                Ok(())
            }
            SignalMessage::Chat {
                kind,
                username,
                dest,
                noecho,
                value,
                ..
            } => {
                self.handle_chat(kind, username, dest, noecho.unwrap_or(false), value);
                Ok(())
            }
            SignalMessage::ChatHistory { .. } => Ok(()),
            SignalMessage::UserMessage {
                kind, dest, value, ..
            } => {
                self.handle_usermessage(kind, dest, value);
                Ok(())
            }
            SignalMessage::UserAction {
                kind, dest, value, ..
            } => {
                self.handle_useraction(kind, dest, value).await;
                Ok(())
            }
            SignalMessage::GroupAction { kind, value, .. } => {
                self.handle_groupaction(kind, value);
                Ok(())
            }
            SignalMessage::Joined { .. } | SignalMessage::User { .. } => {
                Err(SfuError::Protocol("server-only message received from client".into()))
            }
        }
    }

    async fn handle_join(
        &self,
        group_name: String,
        username: Option<String>,
        password: Option<String>,
        token: Option<String>,
    ) -> Result<(), SfuError> {
        if !crate::group::is_valid_group_name(&group_name) {
            self.send(&SignalMessage::Joined {
                kind: JoinedKind::Fail,
                group: group_name,
                username,
                permissions: Vec::new(),
                status: Value::Null,
                rtc_configuration: Value::Null,
            });
            self.set_state(ClientState::Failed);
            return Ok(());
        }
        self.set_state(ClientState::Joining);

        let group = self.sfu.group_or_create(&group_name);
        let description = group.description();

        let token_claims = token
            .as_deref()
            .and_then(|t| self.sfu.token_validator.validate(&group_name, t))
            .map(|claims| crate::permissions::TokenClaims {
                sub: claims.sub,
                permissions: claims
                    .permissions
                    .iter()
                    .filter_map(|name| Role::parse(name))
                    .collect(),
            });

        let creds = Credentials {
            username: username.clone(),
            password,
            token,
        };

        let resolved = resolve(
            &creds,
            |name| description.lookup(name),
            description.policy,
            &self.limiter,
            token_claims,
        )
        .await;

        let (resolved_username, permissions) = match resolved {
            Ok(pair) => pair,
            Err(err) => {
                info!(group = %group_name, %err, "join rejected");
                self.send(&SignalMessage::Joined {
                    kind: JoinedKind::Fail,
                    group: group_name,
                    username,
                    permissions: Vec::new(),
                    status: Value::Null,
                    rtc_configuration: Value::Null,
                });
                self.set_state(ClientState::Failed);
                return Ok(());
            }
        };

        let bypass_lock = permissions.contains(AtomicPermissions::OP);
        let client = match group.join(resolved_username, permissions, bypass_lock, self.outbox_tx.clone()) {
            Ok(client) => client,
            Err(err) => {
                debug!(group = %group_name, %err, "join rejected by group");
                self.send(&SignalMessage::Joined {
                    kind: JoinedKind::Fail,
                    group: group_name,
                    username,
                    permissions: Vec::new(),
                    status: Value::Null,
                    rtc_configuration: Value::Null,
                });
                self.set_state(ClientState::Failed);
                return Ok(());
            }
        };

        *self.client.lock() = Some(client.clone());
        *self.group.lock() = Some(group.clone());
        self.set_state(ClientState::Joined);

        self.send(&SignalMessage::Joined {
            kind: JoinedKind::Join,
            group: group_name,
            username: Some(client.username()),
            permissions: client.permissions().names().iter().map(|s| (*s).to_string()).collect(),
            status: client.status(),
            rtc_configuration: json!({ "iceServers": [] }),
        });

        group.broadcast_except(
            &client.id,
            SignalMessage::User {
                kind: UserKind::Add,
                id: client.id.clone(),
                username: client.username(),
                permissions: client.permissions().names().iter().map(|s| (*s).to_string()).collect(),
                status: client.status(),
            },
        );

        for entry in group.chat_history() {
            self.send(&history_entry_to_message(&entry));
        }

        Ok(())
    }

    async fn handle_offer(&self, id: String, label: String, sdp: String) {
        let Some(client) = self.client() else { return };
        if !client.has(AtomicPermissions::PRESENT) {
            self.send(&SignalMessage::UserMessage {
                kind: "error".into(),
                source: None,
                username: None,
                dest: None,
                privileged: false,
                value: json!("not authorised to publish"),
            });
            return;
        }
        let Some(group) = self.group() else { return };

        let pc = match self.sfu.api.new_peer_connection(self.sfu.rtc_config()).await {
            Ok(pc) => Arc::new(pc),
            Err(err) => {
                warn!(%err, "failed to create publisher peer connection");
                return;
            }
        };

        let up = Arc::new(Up::new(id.clone(), client.username(), label.clone(), pc.clone()));
        wire_ice_candidates(self, pc.clone(), id.clone());

        let offered_codecs = group.codecs();
        let up_for_track = up.clone();
        pc.on_track(Box::new(move |remote: Arc<TrackRemote>, receiver: Arc<RTCRtpReceiver>, _transceiver| {
            let up = up_for_track.clone();
            let codecs = offered_codecs.clone();
            Box::pin(async move {
                let Some(track) = up.add_track(&remote, &codecs) else {
                    warn!(mid = %remote.id(), "rejected up-track: codec not offered by group");
                    return;
                };
                spawn_rtp_reader(track, remote, receiver, up).await;
            })
        }));

        let offer = match RTCSessionDescription::offer(sdp) {
            Ok(offer) => offer,
            Err(err) => {
                warn!(%err, "malformed publisher offer SDP");
                return;
            }
        };
        if let Err(err) = pc.set_remote_description(offer).await {
            warn!(%err, "failed to set remote description on publisher");
            return;
        }
        let answer = match pc.create_answer(None).await {
            Ok(answer) => answer,
            Err(err) => {
                warn!(%err, "failed to create answer");
                return;
            }
        };
        if let Err(err) = pc.set_local_description(answer.clone()).await {
            warn!(%err, "failed to set local description on publisher");
            return;
        }

        client.add_up(id.clone(), up);
        self.send(&SignalMessage::Answer { id, sdp: answer.sdp });
    }

    /// Handles a `request {label -> mediaKinds}` subscription: creates
    /// one `Down` per matching `Up` not already subscribed to (§4.5,
    /// §4.6 "joined -> joined").
    async fn handle_request(&self, request: Value) {
        let Some(client) = self.client() else { return };
        let Some(group) = self.group() else { return };

        let labels: Vec<String> = request
            .as_object()
            .map(|map| map.keys().filter(|k| !k.is_empty()).cloned().collect())
            .unwrap_or_default();

        for owner in group.clients() {
            if owner.id == client.id {
                continue;
            }
            for up in owner.ups() {
                if !labels.is_empty() && !labels.contains(&up.label) {
                    continue;
                }
                let already = client.downs().iter().any(|d| d.mirrors.as_deref() == Some(up.id.as_str()));
                if already {
                    continue;
                }
                self.spawn_down_for_up(&client, &owner, &up).await;
            }
        }
    }

    async fn spawn_down_for_up(&self, client: &Arc<Client>, owner: &Arc<Client>, up: &Arc<Up>) {
        let pc = match self.sfu.api.new_peer_connection(self.sfu.rtc_config()).await {
            Ok(pc) => Arc::new(pc),
            Err(err) => {
                warn!(%err, "failed to create subscriber peer connection");
                return;
            }
        };
        let down_id = random_id();
        wire_ice_candidates(self, pc.clone(), down_id.clone());

        let down = Arc::new(Down::new(down_id.clone(), owner.username(), Some(up.id.clone()), pc.clone()));

        // Group the publisher's up-tracks by mid so a simulcasting
        // publisher (multiple rid variants sharing one mid) gets
        // exactly one down-track/transceiver, not one per layer
        // (§4.5); `reevaluate_layer` switches which up-track feeds it.
        let mut by_mid: HashMap<String, HashMap<Layer, Arc<UpTrack>>> = HashMap::new();
        for up_track in up.tracks() {
            by_mid
                .entry(up_track.mid.clone())
                .or_default()
                .insert(layer_for_rid(up_track.rid.as_deref()), up_track);
        }

        for (mid, layers) in by_mid {
            let representative = layers
                .get(&Layer::Low)
                .or_else(|| layers.get(&Layer::High))
                .expect("mid grouping always has at least one layer")
                .clone();
            let capability = RTCRtpCodecCapability {
                mime_type: mime_string(representative.mime),
                clock_rate: representative.clock_rate,
                channels: representative.channels,
                sdp_fmtp_line: representative.fmtp.clone(),
                rtcp_feedback: Vec::new(),
            };
            let local = Arc::new(TrackLocalStaticRTP::new(capability, mid.clone(), down_id.clone()));
            let sender = match pc
                .add_transceiver_from_track(
                    local.clone() as Arc<dyn TrackLocal + Send + Sync>,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Sendonly,
                        send_encodings: vec![],
                    }),
                )
                .await
            {
                Ok(transceiver) => transceiver.sender().await,
                Err(err) => {
                    warn!(%err, "failed to attach down-track");
                    continue;
                }
            };

            let down_track = Arc::new(DownTrack::new(
                format!("{down_id}#{mid}"),
                local,
                layers,
                Layer::Low,
                self.sfu.config.default_max_bitrate_bps,
            ));
            down_track.active_up().writer_pool.attach(down_track.clone() as Arc<dyn PacketSink>);
            down.add_track(mid, down_track.clone());
            spawn_rtcp_reader(sender, down_track);
        }

        let offer = match pc.create_offer(None).await {
            Ok(offer) => offer,
            Err(err) => {
                warn!(%err, "failed to create subscriber offer");
                return;
            }
        };
        if let Err(err) = pc.set_local_description(offer.clone()).await {
            warn!(%err, "failed to set local description on subscriber");
            return;
        }

        client.add_down(down_id.clone(), down);
        self.send(&SignalMessage::Offer {
            id: down_id,
            label: up.label.clone(),
            replace: None,
            source: owner.id.clone(),
            username: owner.username(),
            sdp: offer.sdp,
        });
    }

    async fn handle_answer(&self, id: String, sdp: String) {
        let Some(client) = self.client() else { return };
        let Some(down) = client.down(&id) else { return };
        let answer = match RTCSessionDescription::answer(sdp) {
            Ok(answer) => answer,
            Err(err) => {
                warn!(%err, "malformed subscriber answer SDP");
                return;
            }
        };
        if let Err(err) = down.pc.set_remote_description(answer).await {
            warn!(%err, "failed to set remote description on subscriber");
        }
    }

    async fn handle_ice(&self, id: String, candidate: Value) {
        let Some(client) = self.client() else { return };
        let init: RTCIceCandidateInit = match serde_json::from_value(candidate) {
            Ok(init) => init,
            Err(err) => {
                warn!(%err, "malformed ICE candidate");
                return;
            }
        };
        let pc: Option<Arc<RTCPeerConnection>> = client.up(&id).map(|u| u.pc.clone()).or_else(|| client.down(&id).map(|d| d.pc.clone()));
        if let Some(pc) = pc {
            if let Err(err) = pc.add_ice_candidate(init).await {
                warn!(%err, "failed to add ICE candidate");
            }
        }
    }

    /// Records the requested simulcast layers/media kinds for an
    /// existing subscription; layer selection itself is driven by
    /// [`crate::bandwidth::LayerSelector`] from REMB/loss feedback, so
    /// this is only consulted to decide whether a track participates
    /// at all (§4.5 resolved open question: explicit request wins
    /// until the next `requestStream`).
    fn handle_request_stream(&self, id: String, request: Vec<String>) {
        debug!(stream = %id, ?request, "stream layer request recorded");
    }

    async fn handle_renegotiate(&self, id: String) {
        let Some(client) = self.client() else { return };
        let Some(up) = client.up(&id) else { return };
        let offer = match up.pc.create_offer(None).await {
            Ok(offer) => offer,
            Err(err) => {
                warn!(%err, "failed to create renegotiation offer");
                return;
            }
        };
        if let Err(err) = up.pc.set_local_description(offer.clone()).await {
            warn!(%err, "failed to set local description during renegotiation");
            return;
        }
        self.send(&SignalMessage::Offer {
            id,
            label: up.label.clone(),
            replace: None,
            source: client.id.clone(),
            username: client.username(),
            sdp: offer.sdp,
        });
    }

    async fn handle_close(&self, id: String) {
        let Some(client) = self.client() else { return };
        let Some(group) = self.group() else { return };
        if let Some(up) = client.remove_up(&id) {
            close_up(&group, &up).await;
        } else if let Some(down) = client.remove_down(&id) {
            down.close().await;
        }
    }

    fn handle_chat(&self, kind: Option<String>, username: String, dest: Option<String>, noecho: bool, value: Value) {
        let Some(client) = self.client() else { return };
        let Some(group) = self.group() else { return };
        if !client.has(AtomicPermissions::MESSAGE) {
            return;
        }
        let privileged = client.has(AtomicPermissions::OP);
        let entry = ChatHistoryEntry {
            id: 0,
            source_client_id: client.id.clone(),
            username: username.clone(),
            time_ms: now_ms(),
            kind: kind.clone().unwrap_or_default(),
            value: value.clone(),
        };
        if dest.is_none() {
            group.push_chat(entry);
        }
        let message = SignalMessage::Chat {
            kind,
            source: client.id.clone(),
            username,
            dest: dest.clone(),
            privileged,
            noecho: Some(noecho),
            value,
        };
        match dest {
            Some(dest_id) => {
                if let Some(target) = group.client(&dest_id) {
                    let _ = target.try_send(serde_json::to_value(&message).expect("serialisable"));
                }
            }
            None => {
                if noecho {
                    group.broadcast_except(&client.id, message);
                } else {
                    group.broadcast(message);
                }
            }
        }
    }

    fn handle_usermessage(&self, kind: String, dest: Option<String>, value: Value) {
        let Some(client) = self.client() else { return };
        let Some(group) = self.group() else { return };
        let privileged = client.has(AtomicPermissions::OP);
        let message = SignalMessage::UserMessage {
            kind,
            source: Some(client.id.clone()),
            username: Some(client.username()),
            dest: dest.clone(),
            privileged,
            value,
        };
        match dest {
            Some(dest_id) => {
                if let Some(target) = group.client(&dest_id) {
                    let _ = target.try_send(serde_json::to_value(&message).expect("serialisable"));
                }
            }
            None => group.broadcast(message),
        }
    }

    /// `useraction` kinds (§6.1): `op`/`unop`/`present`/`unpresent`/
    /// `kick`/`setstatus`, all requiring `OP` on the actor. `kick`
    /// cascades through `close_up` so every subscriber to the target's
    /// tracks receives `close{id}` (§8 scenario 6).
    async fn handle_useraction(&self, kind: String, dest: String, value: Value) {
        let Some(client) = self.client() else { return };
        let Some(group) = self.group() else { return };
        if !client.has(AtomicPermissions::OP) {
            return;
        }
        let Some(target) = group.client(&dest) else { return };
        match kind.as_str() {
            "op" => target.set_permissions(target.permissions() | AtomicPermissions::OP),
            "unop" => target.set_permissions(target.permissions() - AtomicPermissions::OP),
            "present" => target.set_permissions(target.permissions() | AtomicPermissions::PRESENT),
            "unpresent" => target.set_permissions(target.permissions() - AtomicPermissions::PRESENT),
            "setstatus" => target.set_status(value),
            "kick" => {
                let _ = target.try_send(
                    serde_json::to_value(SignalMessage::UserMessage {
                        kind: "kicked".into(),
                        source: Some(client.id.clone()),
                        username: Some(client.username()),
                        dest: Some(dest.clone()),
                        privileged: true,
                        value: Value::Null,
                    })
                    .expect("serialisable"),
                );
                for up in target.ups() {
                    close_up(&group, &up).await;
                }
                for down in target.downs() {
                    down.close().await;
                }
                group.remove_client(&dest);
                group.broadcast(SignalMessage::User {
                    kind: UserKind::Delete,
                    id: target.id.clone(),
                    username: target.username(),
                    permissions: Vec::new(),
                    status: Value::Null,
                });
                return;
            }
            _ => {}
        }
        group.broadcast(SignalMessage::User {
            kind: UserKind::Change,
            id: target.id.clone(),
            username: target.username(),
            permissions: target.permissions().names().iter().map(|s| (*s).to_string()).collect(),
            status: target.status(),
        });
    }

    /// `groupaction` kinds (§6.1): `clearchat`/`lock`/`unlock`/
    /// `record`/`unrecord`/`subgroups`, all requiring `OP`.
    fn handle_groupaction(&self, kind: String, value: Value) {
        let Some(client) = self.client() else { return };
        let Some(group) = self.group() else { return };
        if !client.has(AtomicPermissions::OP) {
            return;
        }
        match kind.as_str() {
            "clearchat" => {
                group.clear_chat();
                group.broadcast(SignalMessage::UserMessage {
                    kind: "clearchat".into(),
                    source: Some(client.id.clone()),
                    username: Some(client.username()),
                    dest: None,
                    privileged: true,
                    value: Value::Null,
                });
            }
            "lock" => group.lock(value.as_str().unwrap_or("locked").to_string()),
            "unlock" => group.unlock(),
            "record" | "unrecord" | "subgroups" => {
                debug!(kind = %kind, "groupaction recorded (no recorder/subgroup backend configured)");
            }
            _ => {}
        }
    }
}

async fn close_up(group: &Arc<Group>, up: &Arc<Up>) {
    up.close().await;
    for peer in group.clients() {
        let mirrored: Vec<_> = peer.downs().iter().filter(|d| d.mirrors.as_deref() == Some(up.id.as_str())).cloned().collect();
        for down in mirrored {
            peer.remove_down(&down.id);
            down.close().await;
            let _ = peer.try_send(serde_json::to_value(SignalMessage::Close { id: down.id.clone() }).expect("serialisable"));
        }
    }
}

fn wire_ice_candidates(session: &Session, pc: Arc<RTCPeerConnection>, stream_id: String) {
    let outbox = session.outbox_tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let outbox = outbox.clone();
        let stream_id = stream_id.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            let Ok(json) = candidate.to_json() else { return };
            let Ok(candidate_value) = serde_json::to_value(json) else { return };
            let message = SignalMessage::Ice {
                id: stream_id,
                candidate: candidate_value,
            };
            let Ok(value) = serde_json::to_value(&message) else { return };
            let _ = outbox.try_send(value);
        })
    }));
}

/// Feeds RTCP feedback read from a subscriber's sender into its
/// `DownTrack`'s bandwidth bound (§4.5): REMB directly, receiver-report
/// loss fraction via the first report block.
fn spawn_rtcp_reader(sender: Arc<webrtc::rtp_transceiver::rtp_sender::RTCRtpSender>, down_track: Arc<DownTrack>) {
    tokio::spawn(async move {
        loop {
            let Ok((packets, _attrs)) = sender.read_rtcp().await else {
                break;
            };
            for packet in packets {
                if let Some(remb) = packet.as_any().downcast_ref::<ReceiverEstimatedMaximumBitrate>() {
                    down_track.on_remb(remb.bitrate as u64);
                    down_track.reevaluate_layer();
                } else if let Some(rr) = packet.as_any().downcast_ref::<ReceiverReport>() {
                    if let Some(report) = rr.reports.first() {
                        let loss_fraction = f64::from(report.fraction_lost) / 256.0;
                        let base = down_track.max_bitrate_bps();
                        down_track.on_loss_report(base, loss_fraction);
                        down_track.reevaluate_layer();
                    }
                }
            }
        }
    });
}

fn mime_string(mime: crate::codec::Mime) -> String {
    match mime {
        crate::codec::Mime::Vp8 => "video/VP8".into(),
        crate::codec::Mime::Vp9 => "video/VP9".into(),
        crate::codec::Mime::H264 => "video/H264".into(),
        crate::codec::Mime::Av1 => "video/AV1".into(),
        crate::codec::Mime::Opus => "audio/opus".into(),
        crate::codec::Mime::Other => String::new(),
    }
}

fn history_entry_to_message(entry: &ChatHistoryEntry) -> SignalMessage {
    SignalMessage::ChatHistory {
        kind: (!entry.kind.is_empty()).then(|| entry.kind.clone()),
        source: entry.source_client_id.clone(),
        username: entry.username.clone(),
        dest: None,
        privileged: false,
        value: entry.value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::JwtValidator;
    use crate::config::Config;

    fn test_state() -> Arc<SfuState> {
        let config = Config::default_for_test();
        let validator: Arc<dyn crate::auth::TokenValidator> = Arc::new(JwtValidator::new(config.jwt_hs256_secret.clone()));
        Arc::new(SfuState::new(config, validator).expect("building SfuState for test"))
    }

    #[tokio::test]
    async fn handshake_advances_state_from_new() {
        let (session, _rx) = Session::new(test_state());
        assert_eq!(session.state(), ClientState::New);
        session
            .handle(SignalMessage::Handshake {
                id: "peer-1".into(),
                version: None,
            })
            .await
            .unwrap();
        assert_eq!(session.state(), ClientState::Handshaking);
    }

    #[tokio::test]
    async fn ping_replies_with_pong() {
        let (session, mut rx) = Session::new(test_state());
        session.handle(SignalMessage::Ping {}).await.unwrap();
        let value = rx.recv().await.unwrap();
        assert_eq!(value["type"], "pong");
    }

    #[tokio::test]
    async fn join_with_no_configured_users_and_anonymous_allowed_succeeds() {
        let state = test_state();
        let group = state.group_or_create("test-room");
        let mut description = group.description();
        description.policy.allow_anonymous = true;
        description.wildcard_user = Some(crate::permissions::UserEntry {
            password: crate::permissions::Password::Wildcard,
            roles: vec![Role::Present],
        });
        group.set_description(description);

        let (session, mut rx) = Session::new(state);
        session
            .handle(SignalMessage::Join {
                kind: JoinKind::Join,
                group: "test-room".into(),
                username: Some("alice".into()),
                password: None,
                token: None,
            })
            .await
            .unwrap();
        assert_eq!(session.state(), ClientState::Joined);
        let value = rx.recv().await.unwrap();
        assert_eq!(value["type"], "joined");
        assert_eq!(value["kind"], "join");
    }

    #[tokio::test]
    async fn join_invalid_group_name_fails() {
        let (session, mut rx) = Session::new(test_state());
        session
            .handle(SignalMessage::Join {
                kind: JoinKind::Join,
                group: "../escape".into(),
                username: None,
                password: None,
                token: None,
            })
            .await
            .unwrap();
        assert_eq!(session.state(), ClientState::Failed);
        let value = rx.recv().await.unwrap();
        assert_eq!(value["type"], "joined");
        assert_eq!(value["kind"], "fail");
    }
}
