//! The signalling wire format (§6.1): a single `SignalMessage` enum
//! shared by both directions, since most message types (`offer`,
//! `answer`, `ice`, `chat`, `close`) flow both ways — unlike the
//! lineage's separate `ClientEvent`/`ServerEvent` split in `ws::mod`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    Join,
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinedKind {
    Join,
    Fail,
    Change,
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserKind {
    Add,
    Change,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    #[serde(rename = "handshake")]
    Handshake {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    #[serde(rename = "ping")]
    Ping {},
    #[serde(rename = "pong")]
    Pong {},
    #[serde(rename = "join")]
    Join {
        kind: JoinKind,
        group: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    #[serde(rename = "joined")]
    Joined {
        kind: JoinedKind,
        group: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default)]
        permissions: Vec<String>,
        #[serde(default)]
        status: Value,
        #[serde(default, rename = "rtcConfiguration")]
        rtc_configuration: Value,
    },
    #[serde(rename = "user")]
    User {
        kind: UserKind,
        id: String,
        username: String,
        #[serde(default)]
        permissions: Vec<String>,
        #[serde(default)]
        status: Value,
    },
    #[serde(rename = "request")]
    Request { request: Value },
    #[serde(rename = "offer")]
    Offer {
        id: String,
        label: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        replace: Option<String>,
        source: String,
        username: String,
        sdp: String,
    },
    #[serde(rename = "answer")]
    Answer { id: String, sdp: String },
    #[serde(rename = "ice")]
    Ice { id: String, candidate: Value },
    #[serde(rename = "renegotiate")]
    Renegotiate { id: String },
    #[serde(rename = "requestStream")]
    RequestStream { id: String, request: Vec<String> },
    #[serde(rename = "close")]
    Close { id: String },
    #[serde(rename = "abort")]
    Abort { id: String },
    #[serde(rename = "chat")]
    Chat {
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        source: String,
        username: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        dest: Option<String>,
        #[serde(default)]
        privileged: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        noecho: Option<bool>,
        value: Value,
    },
    #[serde(rename = "chathistory")]
    ChatHistory {
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        source: String,
        username: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        dest: Option<String>,
        #[serde(default)]
        privileged: bool,
        value: Value,
    },
    #[serde(rename = "usermessage")]
    UserMessage {
        kind: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        dest: Option<String>,
        #[serde(default)]
        privileged: bool,
        value: Value,
    },
    #[serde(rename = "useraction")]
    UserAction {
        kind: String,
        source: String,
        username: String,
        dest: String,
        #[serde(default)]
        value: Value,
    },
    #[serde(rename = "groupaction")]
    GroupAction {
        kind: String,
        source: String,
        username: String,
        #[serde(default)]
        value: Value,
    },
}
