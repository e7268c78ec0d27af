//! Forge SFU - Main Entry Point

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use forge_sfu::auth::{JwtValidator, TokenValidator};
use forge_sfu::config;
use forge_sfu::http;
use forge_sfu::observability;
use forge_sfu::state::SfuState;
use forge_sfu::supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (required for WebRTC)
    // This must happen before any TLS/WebRTC operations
    let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider());

    let config = config::load()?;
    let _otel_guard = observability::init(&config.log_format, None);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Forge SFU");

    let token_validator: Arc<dyn TokenValidator> = Arc::new(JwtValidator::new(config.jwt_hs256_secret.clone()));
    let group_expiry_interval = config.group_expiry_interval;
    let chat_aging_interval = config.chat_aging_interval;
    let bind_address = config.bind_address.clone();
    let state = Arc::new(SfuState::new(config, token_validator)?);

    let cancel = CancellationToken::new();
    let group_expiry = supervisor::spawn_group_expiry(state.clone(), group_expiry_interval, cancel.clone());
    let chat_aging = supervisor::spawn_chat_aging(state.clone(), chat_aging_interval, cancel.clone());

    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(address = %bind_address, "Server listening");

    let shutdown_signal = async {
        tokio::signal::ctrl_c().await.expect("failed to install CTRL+C signal handler");
        info!("received shutdown signal, cleaning up");
    };

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    cancel.cancel();
    let _ = tokio::join!(group_expiry, chat_aging);

    info!("server shutdown complete");
    Ok(())
}
