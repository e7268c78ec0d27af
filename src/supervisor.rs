//! Periodic background sweeps (§5): group expiry, chat-history aging,
//! per-client keepalive.
//!
//! Grounded on `voice::rate_limit::VoiceRateLimiter::cleanup`'s
//! periodic sweep-under-lock idiom, generalised from a single rate-
//! limit map cleanup to the three periodic tasks this spec names.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::group::now_ms;
use crate::state::SfuState;

/// Sweeps expired groups every `interval` until cancelled (§5 "group
/// expiry (every 30 s)").
pub fn spawn_group_expiry(state: Arc<SfuState>, period: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    state.expire_groups();
                    debug!("group expiry sweep complete");
                }
            }
        }
    })
}

/// Ages out chat-history entries in every group every `interval`
/// until cancelled (§5 "chat-history aging (every minute)").
pub fn spawn_chat_aging(state: Arc<SfuState>, period: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for group in state.groups() {
                        group.age_chat_history();
                    }
                }
            }
        }
    })
}

/// Tracks the most recent pong from one client; shared between the
/// keepalive task and the signalling dispatcher that observes inbound
/// `pong` messages (§5, §6.1 "pong MUST be sent within 30 s").
pub struct Keepalive {
    last_pong_ms: AtomicI64,
}

impl Keepalive {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            last_pong_ms: AtomicI64::new(now_ms()),
        })
    }

    pub fn record_pong(&self) {
        self.last_pong_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn overdue(&self, deadline: Duration) -> bool {
        now_ms() - self.last_pong_ms.load(Ordering::Relaxed) > deadline.as_millis() as i64
    }
}

/// Spawns one client's keepalive loop: calls `send_ping` every
/// `ping_interval`; if no pong has been recorded within `pong_deadline`
/// of the last one, calls `on_timeout` once and exits (§7 "Fatal
/// client... keepalive missed").
pub fn spawn_keepalive<P, T>(
    client_id: String,
    ping_interval: Duration,
    pong_deadline: Duration,
    send_ping: P,
    on_timeout: T,
    cancel: CancellationToken,
) -> (Arc<Keepalive>, tokio::task::JoinHandle<()>)
where
    P: Fn() -> bool + Send + 'static,
    T: FnOnce() + Send + 'static,
{
    let keepalive = Keepalive::new();
    let task_keepalive = keepalive.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = interval(ping_interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if task_keepalive.overdue(pong_deadline) {
                        info!(client = %client_id, "keepalive pong deadline missed, closing");
                        on_timeout();
                        break;
                    }
                    if !send_ping() {
                        break;
                    }
                }
            }
        }
    });
    (keepalive, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_not_overdue_right_after_creation() {
        let k = Keepalive::new();
        assert!(!k.overdue(Duration::from_secs(30)));
    }

    #[test]
    fn keepalive_overdue_with_zero_deadline() {
        let k = Keepalive::new();
        std::thread::sleep(Duration::from_millis(5));
        assert!(k.overdue(Duration::from_millis(0)));
    }

    #[tokio::test]
    async fn keepalive_task_sends_pings_until_cancelled() {
        let cancel = CancellationToken::new();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = count.clone();
        let (_ka, handle) = spawn_keepalive(
            "client1".into(),
            Duration::from_millis(5),
            Duration::from_secs(30),
            move || {
                c.fetch_add(1, Ordering::Relaxed);
                true
            },
            || {},
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        let _ = handle.await;
        assert!(count.load(Ordering::Relaxed) >= 2);
    }
}
