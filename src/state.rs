//! Process-wide shared state (§5, §6.3).
//!
//! Grounded on `voice::sfu::SfuServer::new`'s `MediaEngine`/interceptor
//! registry/`APIBuilder` construction, generalised from the teacher's
//! fixed Opus/VP9/VP8/H.264 codec list to the codec set in
//! [`Config`](crate::config::Config), and from a single global room
//! map to the spec's named-group table.

use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::RTCPFeedback;

use crate::auth::TokenValidator;
use crate::config::Config;
use crate::group::{Group, GroupDescription};

/// Shared, process-wide SFU state: the webrtc API instance, the group
/// table, configuration, and the token validator used by the
/// permission resolver (§4.7 step 1, §6.3).
pub struct SfuState {
    pub config: Config,
    pub api: Arc<API>,
    pub token_validator: Arc<dyn TokenValidator>,
    groups: DashMap<String, Arc<Group>>,
}

impl SfuState {
    pub fn new(config: Config, token_validator: Arc<dyn TokenValidator>) -> Result<Self> {
        let api = build_api().context("building webrtc API")?;
        Ok(Self {
            config,
            api: Arc::new(api),
            token_validator,
            groups: DashMap::new(),
        })
    }

    /// Returns the group, creating it with an empty description on
    /// first access (§3 "Groups are created on first access").
    pub fn group_or_create(&self, name: &str) -> Arc<Group> {
        if let Some(existing) = self.groups.get(name) {
            return existing.clone();
        }
        let group = Arc::new(Group::new(
            name.to_string(),
            GroupDescription::default(),
            self.config.chat_history_capacity,
            self.config.chat_history_max_age,
        ));
        self.groups.insert(name.to_string(), group.clone());
        group
    }

    #[must_use]
    pub fn group(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.get(name).map(|g| g.clone())
    }

    #[must_use]
    pub fn groups(&self) -> Vec<Arc<Group>> {
        self.groups.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Removes groups that are empty, private, and idle past the
    /// configured bound (§5 "group expiry").
    pub fn expire_groups(&self) {
        let bound = self.config.chat_history_max_age;
        let stale: Vec<String> = self
            .groups
            .iter()
            .filter(|entry| entry.value().is_expired(bound))
            .map(|entry| entry.key().clone())
            .collect();
        for name in stale {
            self.groups.remove(&name);
        }
    }

    #[must_use]
    pub fn rtc_config(&self) -> RTCConfiguration {
        let mut ice_servers = vec![RTCIceServer {
            urls: vec![self.config.stun_server.clone()],
            ..Default::default()
        }];
        if let Some(turn) = &self.config.turn_server {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.clone()],
                username: self.config.turn_username.clone().unwrap_or_default(),
                credential: self.config.turn_credential.clone().unwrap_or_default(),
                ..Default::default()
            });
        }
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

/// Builds the shared webrtc API with Opus/VP8/VP9/H.264 registered and
/// the default interceptor set (NACK, RTCP reports, TWCC), matching
/// the teacher's codec table.
fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: "audio/opus".into(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".into(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .context("registering opus codec")?;

    for (mime_type, payload_type, fmtp) in video_codecs() {
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: mime_type.into(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line: fmtp.into(),
                        rtcp_feedback: video_rtcp_feedback(),
                    },
                    payload_type,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .with_context(|| format!("registering {mime_type} codec"))?;
    }

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn video_codecs() -> [(&'static str, u8, &'static str); 3] {
    [
        ("video/VP8", 96, ""),
        ("video/VP9", 98, "profile-id=0"),
        (
            "video/H264",
            102,
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
        ),
    ]
}

fn video_rtcp_feedback() -> Vec<RTCPFeedback> {
    vec![
        RTCPFeedback {
            typ: "goog-remb".into(),
            parameter: String::new(),
        },
        RTCPFeedback {
            typ: "ccm".into(),
            parameter: "fir".into(),
        },
        RTCPFeedback {
            typ: "nack".into(),
            parameter: String::new(),
        },
        RTCPFeedback {
            typ: "nack".into(),
            parameter: "pli".into(),
        },
    ]
}

