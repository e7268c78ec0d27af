//! End-to-end scenario tests driving the signalling state machine
//! directly against the in-memory group table, in the lineage's
//! `tests/websocket_integration_test.rs` style (exercise the handler
//! layer rather than a live socket).

use std::sync::Arc;

use forge_sfu::auth::{JwtValidator, TokenValidator};
use forge_sfu::config::Config;
use forge_sfu::permissions::{Password, Role, UserEntry};
use forge_sfu::signalling::{JoinKind, Session, SignalMessage};
use forge_sfu::state::SfuState;

use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

fn test_state() -> Arc<SfuState> {
    let config = Config::default_for_test();
    let validator: Arc<dyn TokenValidator> = Arc::new(JwtValidator::new(config.jwt_hs256_secret.clone()));
    Arc::new(SfuState::new(config, validator).expect("building SfuState"))
}

/// Builds a standalone client-side SDP offer carrying one audio and
/// one video transceiver, the way a real browser's `createOffer`
/// would, without needing a second full peer connection pair to
/// actually complete ICE (local SDP generation never touches the
/// network).
async fn sample_client_offer() -> String {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().expect("register default codecs");
    let api = APIBuilder::new().with_media_engine(media_engine).build();
    let pc = api
        .new_peer_connection(webrtc::peer_connection::configuration::RTCConfiguration::default())
        .await
        .expect("build throwaway client peer connection");
    pc.add_transceiver_from_kind(RTPCodecType::Audio, None)
        .await
        .expect("add audio transceiver");
    pc.add_transceiver_from_kind(RTPCodecType::Video, None)
        .await
        .expect("add video transceiver");
    let offer = pc.create_offer(None).await.expect("create offer");
    pc.set_local_description(offer.clone()).await.expect("set local description");
    offer.sdp
}

async fn join(session: &Session, group: &str, username: &str, password: Option<&str>) {
    session
        .handle(SignalMessage::Join {
            kind: JoinKind::Join,
            group: group.into(),
            username: Some(username.into()),
            password: password.map(str::to_string),
            token: None,
        })
        .await
        .expect("join dispatches without a protocol error");
}

async fn drain_until<F: Fn(&serde_json::Value) -> bool>(
    rx: &mut tokio::sync::mpsc::Receiver<serde_json::Value>,
    matches: F,
) -> serde_json::Value {
    loop {
        let value = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("message arrives before timeout")
            .expect("outbox stays open");
        if matches(&value) {
            return value;
        }
    }
}

/// Scenario 1 (join and publish): a configured user joins with a
/// plain password, is granted `present`/`message`, and a subsequent
/// `offer` is answered.
#[tokio::test]
async fn join_and_publish() {
    let state = test_state();
    let group = state.group_or_create("scenario1");
    let mut description = group.description();
    description.users.insert(
        "a".into(),
        UserEntry {
            password: Password::Plain("x".into()),
            roles: vec![Role::Present],
        },
    );
    group.set_description(description);

    let (session, mut rx) = Session::new(state);
    join(&session, "scenario1", "a", Some("x")).await;
    let joined = drain_until(&mut rx, |v| v["type"] == "joined").await;
    assert_eq!(joined["kind"], "join");
    let permissions: Vec<String> = serde_json::from_value(joined["permissions"].clone()).unwrap();
    assert!(permissions.contains(&"present".to_string()));
    assert!(permissions.contains(&"message".to_string()));

    let sdp = sample_client_offer().await;
    session
        .handle(SignalMessage::Offer {
            id: "u1".into(),
            label: "camera".into(),
            replace: None,
            source: String::new(),
            username: String::new(),
            sdp,
        })
        .await
        .unwrap();
    let answer = drain_until(&mut rx, |v| v["type"] == "answer").await;
    assert_eq!(answer["id"], "u1");
    assert!(answer["sdp"].as_str().unwrap().contains("v=0"));
}

/// Scenario 2 (fan-out): once A is publishing, B's `request` produces
/// a subscriber `offer` naming A as the source.
#[tokio::test]
async fn fan_out_offers_existing_publisher_to_new_subscriber() {
    let state = test_state();
    let group = state.group_or_create("scenario2");
    let mut description = group.description();
    description.policy.allow_anonymous = true;
    description.wildcard_user = Some(UserEntry {
        password: Password::Wildcard,
        roles: vec![Role::Present],
    });
    group.set_description(description);

    let (session_a, mut rx_a) = Session::new(state.clone());
    join(&session_a, "scenario2", "a", None).await;
    let _ = drain_until(&mut rx_a, |v| v["type"] == "joined").await;
    let sdp = sample_client_offer().await;
    session_a
        .handle(SignalMessage::Offer {
            id: "u1".into(),
            label: "camera".into(),
            replace: None,
            source: String::new(),
            username: String::new(),
            sdp,
        })
        .await
        .unwrap();
    let _ = drain_until(&mut rx_a, |v| v["type"] == "answer").await;

    let (session_b, mut rx_b) = Session::new(state.clone());
    join(&session_b, "scenario2", "b", None).await;
    let _ = drain_until(&mut rx_b, |v| v["type"] == "joined").await;
    session_b
        .handle(SignalMessage::Request {
            request: serde_json::json!({"": ["audio", "video"]}),
        })
        .await
        .unwrap();

    let offer = drain_until(&mut rx_b, |v| v["type"] == "offer").await;
    assert_eq!(state.group("scenario2").unwrap().client_count(), 2);
    assert_eq!(offer["label"], "camera");
}

/// Scenario 3 (lock): once an operator locks the group, a fresh join
/// fails.
#[tokio::test]
async fn locked_group_rejects_join() {
    let state = test_state();
    let group = state.group_or_create("scenario3");
    let mut description = group.description();
    description.policy.allow_anonymous = true;
    description.wildcard_user = Some(UserEntry {
        password: Password::Wildcard,
        roles: vec![Role::Present],
    });
    description.users.insert(
        "op".into(),
        UserEntry {
            password: Password::Plain("y".into()),
            roles: vec![Role::Op],
        },
    );
    group.set_description(description);

    let (session_c, mut rx_c) = Session::new(state.clone());
    join(&session_c, "scenario3", "op", Some("y")).await;
    let _ = drain_until(&mut rx_c, |v| v["type"] == "joined").await;
    session_c
        .handle(SignalMessage::GroupAction {
            kind: "lock".into(),
            source: String::new(),
            username: String::new(),
            value: serde_json::json!("maintenance"),
        })
        .await
        .unwrap();
    assert!(group.is_locked());

    let (session_d, mut rx_d) = Session::new(state);
    join(&session_d, "scenario3", "d", None).await;
    let joined = drain_until(&mut rx_d, |v| v["type"] == "joined").await;
    assert_eq!(joined["kind"], "fail");
}

/// Scenario 6 (kick cascade): an admin's `kick` tears down the
/// target's `Up` and removes it from the group.
#[tokio::test]
async fn kick_removes_client_and_notifies() {
    let state = test_state();
    let group = state.group_or_create("scenario6");
    let mut description = group.description();
    description.policy.allow_anonymous = true;
    description.wildcard_user = Some(UserEntry {
        password: Password::Wildcard,
        roles: vec![Role::Present],
    });
    description.users.insert(
        "op".into(),
        UserEntry {
            password: Password::Plain("y".into()),
            roles: vec![Role::Op],
        },
    );
    group.set_description(description);

    let (session_c, mut rx_c) = Session::new(state.clone());
    join(&session_c, "scenario6", "op", Some("y")).await;
    let _ = drain_until(&mut rx_c, |v| v["type"] == "joined").await;

    let (session_a, mut rx_a) = Session::new(state.clone());
    join(&session_a, "scenario6", "a", None).await;
    let _ = drain_until(&mut rx_a, |v| v["type"] == "joined").await;
    let sdp = sample_client_offer().await;
    session_a
        .handle(SignalMessage::Offer {
            id: "u1".into(),
            label: "camera".into(),
            replace: None,
            source: String::new(),
            username: String::new(),
            sdp,
        })
        .await
        .unwrap();
    let _ = drain_until(&mut rx_a, |v| v["type"] == "answer").await;

    let a_id = session_a.client().expect("a has joined").id.clone();
    session_c
        .handle(SignalMessage::UserAction {
            kind: "kick".into(),
            source: String::new(),
            username: String::new(),
            dest: a_id.clone(),
            value: serde_json::Value::Null,
        })
        .await
        .unwrap();

    let kicked = drain_until(&mut rx_a, |v| v["type"] == "usermessage").await;
    assert_eq!(kicked["kind"], "kicked");
    assert!(group.client(&a_id).is_none());
}
