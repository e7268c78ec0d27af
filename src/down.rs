//! Subscriber (Down) peer connection (§4.5).
//!
//! Grounded on `voice::track::TrackRouter`'s one-local-track-per-
//! subscription shape, replacing its "forward everything unmodified"
//! behaviour with the seqno/picture-ID rewriting and keyframe-gating
//! the spec requires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::warn;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::util::marshal::Unmarshal;

use crate::bandwidth::{BitrateBound, Layer, LayerSelector};
use crate::codec::{self, Mime};
use crate::up::{KeyframeRequestKind, UpTrack};
use crate::writer_pool::{PacketSink, PoolPacket};

/// Maps an RTP `rid` (simulcast encoding id) onto a [`Layer`] (§4.5):
/// `"h"` is the high layer, anything else (including no rid at all,
/// for a non-simulcast publisher) is the low layer.
#[must_use]
pub fn layer_for_rid(rid: Option<&str>) -> Layer {
    match rid {
        Some("h") => Layer::High,
        _ => Layer::Low,
    }
}

/// Rewriter state for one down-track's seqno/picture-id remap (§3
/// `DownTrack`). `next_base_seqno` lets a layer switch keep the
/// subscriber-facing seqno sequence continuous instead of restarting
/// at 0.
struct RewriteState {
    base_seqno: Option<u16>,
    first_up_seqno: Option<u16>,
    pid_delta: i32,
    keyframe_seen: bool,
}

impl RewriteState {
    const fn new() -> Self {
        Self {
            base_seqno: None,
            first_up_seqno: None,
            pid_delta: 0,
            keyframe_seen: false,
        }
    }

    const fn reset_from(next_base_seqno: u16) -> Self {
        Self {
            base_seqno: Some(next_base_seqno),
            first_up_seqno: None,
            pid_delta: 0,
            keyframe_seen: false,
        }
    }
}

/// The up-track currently feeding a down-track, and which simulcast
/// layer it represents.
struct Active {
    layer: Layer,
    up: Arc<UpTrack>,
}

/// One subscriber-side track bound to a publisher's mid (§3
/// `DownTrack`). When the publisher simulcasts, `layers` holds every
/// rid variant and `active` names the one currently attached to the
/// writer pool; [`DownTrack::reevaluate_layer`] switches it as
/// bandwidth changes (§4.5).
pub struct DownTrack {
    pub id: String,
    pub mime: Mime,
    local: Arc<TrackLocalStaticRTP>,
    layers: HashMap<Layer, Arc<UpTrack>>,
    active: Mutex<Active>,
    rewrite: Mutex<RewriteState>,
    bound: Mutex<BitrateBound>,
    selector: Mutex<LayerSelector>,
    fir_sent: AtomicBool,
    loss_count: AtomicU64,
    expected_count: AtomicU64,
    last_forwarded_seqno: AtomicU16,
}

impl DownTrack {
    /// `layers` must contain at least `initial_layer`; any other
    /// layer present enables later switching via
    /// [`DownTrack::reevaluate_layer`].
    #[must_use]
    pub fn new(
        id: String,
        local: Arc<TrackLocalStaticRTP>,
        layers: HashMap<Layer, Arc<UpTrack>>,
        initial_layer: Layer,
        admin_cap_bps: u64,
    ) -> Self {
        let initial = layers
            .get(&initial_layer)
            .or_else(|| layers.values().next())
            .expect("DownTrack constructed with at least one up-track layer")
            .clone();
        let mime = initial.mime;
        Self {
            id,
            mime,
            local,
            layers,
            active: Mutex::new(Active {
                layer: initial_layer,
                up: initial,
            }),
            rewrite: Mutex::new(RewriteState::new()),
            bound: Mutex::new(BitrateBound::new(admin_cap_bps)),
            selector: Mutex::new(LayerSelector::new()),
            fir_sent: AtomicBool::new(false),
            loss_count: AtomicU64::new(0),
            expected_count: AtomicU64::new(0),
            last_forwarded_seqno: AtomicU16::new(0),
        }
    }

    #[must_use]
    pub fn active_up(&self) -> Arc<UpTrack> {
        self.active.lock().up.clone()
    }

    pub fn on_remb(&self, bps: u64) {
        self.bound.lock().on_remb(bps, Instant::now());
    }

    pub fn on_loss_report(&self, base_bps: u64, loss_fraction: f64) {
        self.bound.lock().on_loss_report(base_bps, loss_fraction);
    }

    #[must_use]
    pub fn max_bitrate_bps(&self) -> u64 {
        self.bound.lock().current(Instant::now())
    }

    #[must_use]
    pub fn current_layer(&self) -> Layer {
        let bps = self.max_bitrate_bps();
        self.selector.lock().update(bps, Instant::now())
    }

    /// Re-evaluates the desired simulcast layer from the current
    /// bandwidth estimate and switches the writer-pool attachment if
    /// it differs from the active one and the desired layer's
    /// up-track actually exists (§4.5). Called after every REMB/loss
    /// report.
    pub fn reevaluate_layer(self: &Arc<Self>) {
        let wanted = self.current_layer();
        let Some(wanted_up) = self.layers.get(&wanted) else {
            return;
        };

        let mut active = self.active.lock();
        if active.layer == wanted {
            return;
        }
        let previous_up = active.up.clone();
        active.layer = wanted;
        active.up = wanted_up.clone();
        drop(active);

        previous_up.writer_pool.detach(&self.id);
        wanted_up.writer_pool.attach(self.clone() as Arc<dyn PacketSink>);

        let next_base = self.last_forwarded_seqno.load(Ordering::Relaxed).wrapping_add(1);
        *self.rewrite.lock() = RewriteState::reset_from(next_base);
        self.fir_sent.store(false, Ordering::Relaxed);
    }

    /// Rewrites and forwards one RTP packet from the active up-track's
    /// perspective (§4.5 `writeRTP`): packets before the first
    /// forwarded keyframe are discarded and a keyframe is requested
    /// upstream.
    async fn write_rtp_inner(&self, mut packet: Packet) {
        let (definitely_key, known) = codec::is_keyframe(self.mime, &packet);

        let mut state = self.rewrite.lock();
        if !state.keyframe_seen {
            if known && definitely_key {
                state.keyframe_seen = true;
                state.first_up_seqno = Some(packet.header.sequence_number);
                state.base_seqno.get_or_insert(0);
            } else {
                drop(state);
                self.request_keyframe_upstream();
                return;
            }
        }

        let first_up = state.first_up_seqno.expect("keyframe_seen implies first_up_seqno set");
        let base = state.base_seqno.expect("keyframe_seen implies base_seqno set");
        let up_delta = packet.header.sequence_number.wrapping_sub(first_up);
        let new_seqno = base.wrapping_add(up_delta);
        let pid_delta = state.pid_delta;
        drop(state);

        if codec::rewrite(self.mime, &mut packet, None, new_seqno, pid_delta).is_err() {
            warn!(track = %self.id, "failed to rewrite packet for down-track");
            return;
        }

        self.last_forwarded_seqno.store(new_seqno, Ordering::Relaxed);
        self.expected_count.fetch_add(1, Ordering::Relaxed);

        if let Err(err) = self.local.write_rtp(&packet).await {
            warn!(track = %self.id, %err, "down-track write failed");
        }
    }

    /// Propagates a keyframe request to the active up-track, subject
    /// to the up-track's own one-per-second rate limit (§4.3). The
    /// first request per attachment (initial or after a layer switch)
    /// is a FIR; later ones are PLIs.
    fn request_keyframe_upstream(&self) {
        let up = self.active_up();
        if !up.should_request_keyframe(Instant::now()) {
            return;
        }
        let kind = if self.fir_sent.swap(true, Ordering::Relaxed) {
            KeyframeRequestKind::Pli
        } else {
            KeyframeRequestKind::Fir
        };
        tokio::spawn(async move {
            up.send_keyframe_request(kind).await;
        });
    }
}

impl PacketSink for DownTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn write_rtp(self: Arc<Self>, packet: &PoolPacket) {
        let mut buf = packet.payload.as_slice();
        match Packet::unmarshal(&mut buf) {
            Ok(parsed) => {
                tokio::spawn(async move {
                    self.write_rtp_inner(parsed).await;
                });
            }
            Err(err) => {
                warn!(track = %self.id, %err, "failed to unmarshal cached RTP packet");
            }
        }
    }

    fn request_keyframe(&self) {
        self.request_keyframe_upstream();
    }
}

/// A subscriber peer connection (§3 `Down`).
pub struct Down {
    pub id: String,
    pub owner: String,
    /// The up-id this Down mirrors, or `None` for a recorder-only
    /// subscriber (§3 "may be nil for recorder").
    pub mirrors: Option<String>,
    pub pc: Arc<RTCPeerConnection>,
    tracks: Mutex<HashMap<String, Arc<DownTrack>>>,
    rtt_ms: Mutex<f64>,
}

impl Down {
    #[must_use]
    pub fn new(id: String, owner: String, mirrors: Option<String>, pc: Arc<RTCPeerConnection>) -> Self {
        Self {
            id,
            owner,
            mirrors,
            pc,
            tracks: Mutex::new(HashMap::new()),
            rtt_ms: Mutex::new(0.0),
        }
    }

    /// Closes the underlying peer connection (§5 "a single `close()`
    /// that is idempotent").
    pub async fn close(&self) {
        let _ = self.pc.close().await;
    }

    pub fn add_track(&self, mid: String, track: Arc<DownTrack>) {
        self.tracks.lock().insert(mid, track);
    }

    #[must_use]
    pub fn track(&self, mid: &str) -> Option<Arc<DownTrack>> {
        self.tracks.lock().get(mid).cloned()
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<Arc<DownTrack>> {
        self.tracks.lock().values().cloned().collect()
    }

    pub fn remove_track(&self, mid: &str) -> Option<Arc<DownTrack>> {
        self.tracks.lock().remove(mid)
    }

    pub fn update_rtt(&self, rtt_ms: f64) {
        let mut rtt = self.rtt_ms.lock();
        *rtt = 0.875 * *rtt + 0.125 * rtt_ms;
    }

    #[must_use]
    pub fn rtt_ms(&self) -> f64 {
        *self.rtt_ms.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_state_starts_without_keyframe() {
        let state = RewriteState::new();
        assert!(!state.keyframe_seen);
    }

    #[test]
    fn rewrite_state_reset_continues_seqno_from_given_base() {
        let state = RewriteState::reset_from(500);
        assert!(!state.keyframe_seen);
        assert_eq!(state.base_seqno, Some(500));
    }

    #[test]
    fn layer_for_rid_maps_h_to_high_and_everything_else_to_low() {
        assert_eq!(layer_for_rid(Some("h")), Layer::High);
        assert_eq!(layer_for_rid(Some("l")), Layer::Low);
        assert_eq!(layer_for_rid(None), Layer::Low);
    }
}
