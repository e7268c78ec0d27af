//! Forge SFU
//!
//! A WebRTC selective forwarding unit: per-group membership and
//! permissions, publisher/subscriber peer connections with packet
//! caching and retransmission, congestion-aware fan-out, and a JSON
//! signalling protocol over WebSocket (and WHIP for ingestion).

pub mod auth;
pub mod bandwidth;
pub mod codec;
pub mod config;
pub mod down;
pub mod error;
pub mod group;
pub mod http;
pub mod observability;
pub mod packet_cache;
pub mod permissions;
pub mod rate;
pub mod signalling;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod up;
pub mod writer_pool;
