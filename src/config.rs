//! Server configuration.
//!
//! Loaded from environment variables, with a `.env` file read in
//! development via `dotenvy`.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8443").
    pub bind_address: String,

    /// STUN server advertised to clients in `rtcConfiguration`.
    pub stun_server: String,

    /// TURN server (optional).
    pub turn_server: Option<String>,

    /// TURN username (optional).
    pub turn_username: Option<String>,

    /// TURN credential (optional).
    pub turn_credential: Option<String>,

    /// Maximum number of video packets cached per up-track (§4.1).
    pub video_cache_size: usize,

    /// Maximum number of audio packets cached per up-track (§4.1).
    pub audio_cache_size: usize,

    /// Default chat history capacity per group (§3).
    pub chat_history_capacity: usize,

    /// Default chat history age bound (§3, §8 invariant 4).
    pub chat_history_max_age: Duration,

    /// Interval between group-expiry sweeps (§5).
    pub group_expiry_interval: Duration,

    /// Interval between chat-history aging sweeps (§5).
    pub chat_aging_interval: Duration,

    /// Keepalive ping interval (§5).
    pub keepalive_ping_interval: Duration,

    /// Keepalive pong deadline (§5, §6.1).
    pub keepalive_pong_deadline: Duration,

    /// Administrative bitrate cap applied to every down-track unless a
    /// group description sets a tighter one (§4.5).
    pub default_max_bitrate_bps: u64,

    /// HMAC/shared secret used to validate HS256 tokens when a group has
    /// no JWK set configured (§6.3).
    pub jwt_hs256_secret: Option<String>,

    /// Log output format: `json` in production, anything else for
    /// pretty/compact dev output.
    pub log_format: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8443".into()),
            stun_server: env::var("STUN_SERVER")
                .unwrap_or_else(|_| "stun:stun.l.google.com:19302".into()),
            turn_server: env::var("TURN_SERVER").ok(),
            turn_username: env::var("TURN_USERNAME").ok(),
            turn_credential: env::var("TURN_CREDENTIAL").ok(),
            video_cache_size: env::var("VIDEO_CACHE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(128),
            audio_cache_size: env::var("AUDIO_CACHE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(16),
            chat_history_capacity: env::var("CHAT_HISTORY_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50),
            chat_history_max_age: Duration::from_secs(
                env::var("CHAT_HISTORY_MAX_AGE_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(4 * 3600),
            ),
            group_expiry_interval: Duration::from_secs(
                env::var("GROUP_EXPIRY_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            chat_aging_interval: Duration::from_secs(
                env::var("CHAT_AGING_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
            keepalive_ping_interval: Duration::from_secs(
                env::var("KEEPALIVE_PING_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            ),
            keepalive_pong_deadline: Duration::from_secs(
                env::var("KEEPALIVE_PONG_DEADLINE_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            default_max_bitrate_bps: env::var("DEFAULT_MAX_BITRATE_BPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(u64::MAX),
            jwt_hs256_secret: env::var("JWT_HS256_SECRET").ok(),
            log_format: env::var("LOG_FORMAT").unwrap_or_else(|_| "json".into()),
        })
    }

    /// Check if TURN is configured.
    #[must_use]
    pub const fn has_turn(&self) -> bool {
        self.turn_server.is_some()
    }

    /// Create a default configuration for testing.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            bind_address: "127.0.0.1:0".into(),
            stun_server: "stun:stun.l.google.com:19302".into(),
            turn_server: None,
            turn_username: None,
            turn_credential: None,
            video_cache_size: 128,
            audio_cache_size: 16,
            chat_history_capacity: 50,
            chat_history_max_age: Duration::from_secs(4 * 3600),
            group_expiry_interval: Duration::from_secs(30),
            chat_aging_interval: Duration::from_secs(60),
            keepalive_ping_interval: Duration::from_secs(10),
            keepalive_pong_deadline: Duration::from_secs(30),
            default_max_bitrate_bps: u64::MAX,
            jwt_hs256_secret: Some("test-secret".into()),
            log_format: "pretty".into(),
        }
    }
}

/// Load `.env` (development convenience) then `Config::from_env`.
pub fn load() -> Result<Config> {
    dotenvy::dotenv().ok();
    Config::from_env().context("loading configuration from environment")
}
