//! Publisher (Up) peer connection (§4.3).
//!
//! Grounded on `voice::sfu::SfuServer::setup_track_handler` and
//! `voice::track::spawn_rtp_forwarder` for the on-track/forwarding
//! shape, generalised from "forward everything" to the full
//! cache/NACK/PLI/writer-pool pipeline this spec requires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};
use webrtc::rtcp::payload_feedbacks::full_intra_request::{FirEntry, FullIntraRequest};
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::marshal::Marshal;

use webrtc::peer_connection::RTCPeerConnection;

use crate::codec::{self, Mime};
use crate::packet_cache::{seqno_diff, seqno_lt, PacketCache};
use crate::rate::{JitterTracker, LossTracker, RateEstimator};
use crate::writer_pool::WriterPool;

/// Whether the next keyframe request to a publisher must be a FIR (the
/// first request for a newly attached down-track, §4.3) or a PLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyframeRequestKind {
    Pli,
    Fir,
}

/// One video/audio track published by an `Up` connection.
pub struct UpTrack {
    pub mid: String,
    pub rid: Option<String>,
    pub mime: Mime,
    pub clock_rate: u32,
    pub channels: u16,
    pub fmtp: String,
    pub ssrc: u32,
    pub cache: Mutex<PacketCache>,
    pub rate: Mutex<RateEstimator>,
    pub jitter: Mutex<JitterTracker>,
    pub loss: Mutex<LossTracker>,
    pub writer_pool: WriterPool,
    pc: Arc<RTCPeerConnection>,
    last_keyframe_seqno: AtomicU16,
    last_keyframe_request: Mutex<Option<Instant>>,
    fir_seqno: AtomicU16,
    packets_received: AtomicU64,
}

impl UpTrack {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mid: String,
        rid: Option<String>,
        mime: Mime,
        clock_rate: u32,
        channels: u16,
        fmtp: String,
        ssrc: u32,
        pc: Arc<RTCPeerConnection>,
    ) -> Self {
        let cache_capacity = if mime.is_video() { 128 } else { 16 };
        Self {
            mid,
            rid,
            mime,
            clock_rate,
            channels,
            fmtp,
            ssrc,
            cache: Mutex::new(PacketCache::new(cache_capacity)),
            rate: Mutex::new(RateEstimator::new(Duration::from_secs(2), 0.2)),
            jitter: Mutex::new(JitterTracker::new()),
            loss: Mutex::new(LossTracker::new(Duration::from_secs(2))),
            writer_pool: WriterPool::new(),
            pc,
            last_keyframe_seqno: AtomicU16::new(0),
            last_keyframe_request: Mutex::new(None),
            fir_seqno: AtomicU16::new(0),
            packets_received: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn last_keyframe_seqno(&self) -> u16 {
        self.last_keyframe_seqno.load(Ordering::Relaxed)
    }

    /// Records one arriving RTP packet (§4.3 `write`): caches it,
    /// backfills any detected gap from the cache (NACKing the
    /// publisher for anything the cache doesn't have yet), updates
    /// keyframe tracking, and notifies the writer pool in seqno order.
    /// `rtt_ms` is the publisher connection's current RTT estimate,
    /// used to scale the NACK retry interval.
    pub fn write(self: &Arc<Self>, packet: &Packet, arrival: Instant, rtt_ms: f64) {
        let seqno = packet.header.sequence_number;
        let marker = packet.header.marker;
        let is_video = self.mime.is_video();

        self.rate.lock().record(arrival, packet.payload.len() as u64);
        self.packets_received.fetch_add(1, Ordering::Relaxed);

        let (definitely_key, known) = codec::is_keyframe(self.mime, packet);
        if known && definitely_key {
            self.last_keyframe_seqno.store(seqno, Ordering::Relaxed);
        }

        let mut payload = Vec::with_capacity(12 + packet.payload.len());
        packet
            .marshal_to(&mut payload)
            .map(|_| ())
            .unwrap_or_else(|_| payload.extend_from_slice(&packet.payload));

        let gap_start = {
            let mut cache = self.cache.lock();
            let previous_last = cache.stats().last_seqno;
            let index = cache.store(seqno, &payload);
            let _ = index;
            previous_last
        };

        // Backfill: if there's a gap between the previous last seqno
        // and this one, re-push anything the cache already has for
        // the missing range (covers retransmissions landing out of
        // order relative to a NACK); anything the cache doesn't have
        // yet is NACKed to the publisher (§4.3 loss recovery).
        if let Some(prev) = gap_start {
            let gap = seqno_diff(prev, seqno);
            if gap > 1 && gap <= 128 {
                let mut s = prev.wrapping_add(1);
                while seqno_lt(s, seqno) {
                    let cached = self.cache.lock().get_by_seqno(s).map(<[u8]>::to_vec);
                    if let Some(buf) = cached {
                        self.writer_pool.write(s, buf, Duration::ZERO, is_video, false);
                    } else {
                        self.request_retransmit(s, rtt_ms);
                    }
                    s = s.wrapping_add(1);
                }
            }
        }

        let delay = arrival.elapsed();
        self.writer_pool.write(seqno, payload, delay, is_video, marker);
    }

    /// Sends a NACK for one missing sequence number and retries up to
    /// [`MAX_NACK_RETRIES`] times, spaced by the RTT-scaled interval,
    /// stopping early once the packet lands in the cache (§4.3 loss
    /// recovery).
    fn request_retransmit(self: &Arc<Self>, seqno: u16, rtt_ms: f64) {
        let track = self.clone();
        let interval = nack_retry_interval(rtt_ms);
        tokio::spawn(async move {
            for _ in 0..MAX_NACK_RETRIES {
                if track.cached_packet(seqno).is_some() {
                    return;
                }
                let nack = TransportLayerNack {
                    sender_ssrc: 0,
                    media_ssrc: track.ssrc,
                    nacks: vec![NackPair {
                        packet_id: seqno,
                        lost_packets: 0,
                    }],
                };
                if let Err(err) = track.pc.write_rtcp(&[Box::new(nack)]).await {
                    warn!(mid = %track.mid, %err, "failed to send NACK to publisher");
                    return;
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    /// Fetch a cached packet by seqno, for NACK/retransmission
    /// servicing by the writer/down side.
    #[must_use]
    pub fn cached_packet(&self, seqno: u16) -> Option<Vec<u8>> {
        self.cache.lock().get_by_seqno(seqno).map(<[u8]>::to_vec)
    }

    /// True if a keyframe request may be sent now (§4.3: rate-limited
    /// to one per second).
    pub fn should_request_keyframe(&self, now: Instant) -> bool {
        let mut last = self.last_keyframe_request.lock();
        let allowed = last.map_or(true, |t| now.duration_since(t) >= Duration::from_secs(1));
        if allowed {
            *last = Some(now);
        }
        allowed
    }

    /// The next FIR command sequence number for this track; RFC 5104
    /// requires it to increase monotonically per sender.
    pub fn next_fir_seqno(&self) -> u8 {
        self.fir_seqno.fetch_add(1, Ordering::Relaxed) as u8
    }

    /// Sends a PLI or FIR to the publisher over its own peer connection
    /// (§4.3 `requestKeyframe`): a FIR for the first request per
    /// down-track attachment, a PLI otherwise.
    pub async fn send_keyframe_request(&self, kind: KeyframeRequestKind) {
        let result = match kind {
            KeyframeRequestKind::Pli => {
                self.pc
                    .write_rtcp(&[Box::new(PictureLossIndication {
                        sender_ssrc: 0,
                        media_ssrc: self.ssrc,
                    })])
                    .await
            }
            KeyframeRequestKind::Fir => {
                self.pc
                    .write_rtcp(&[Box::new(FullIntraRequest {
                        sender_ssrc: 0,
                        fir: vec![FirEntry {
                            ssrc: self.ssrc,
                            sequence_number: self.next_fir_seqno(),
                        }],
                    })])
                    .await
            }
        };
        if let Err(err) = result {
            warn!(mid = %self.mid, ?kind, %err, "failed to send keyframe request to publisher");
        }
    }
}

/// A publisher peer connection (§3 `Up`, §4.3).
pub struct Up {
    pub id: String,
    pub owner: String,
    pub label: String,
    pub pc: Arc<RTCPeerConnection>,
    tracks: Mutex<HashMap<String, Arc<UpTrack>>>,
    rtt_ms: Mutex<f64>,
    remote_sdp: Mutex<Option<String>>,
}

impl Up {
    #[must_use]
    pub fn new(id: String, owner: String, label: String, pc: Arc<RTCPeerConnection>) -> Self {
        Self {
            id,
            owner,
            label,
            pc,
            tracks: Mutex::new(HashMap::new()),
            rtt_ms: Mutex::new(0.0),
            remote_sdp: Mutex::new(None),
        }
    }

    pub fn set_remote_sdp(&self, sdp: String) {
        *self.remote_sdp.lock() = Some(sdp);
    }

    #[must_use]
    pub fn remote_sdp(&self) -> Option<String> {
        self.remote_sdp.lock().clone()
    }

    /// Closes the underlying peer connection (§5 "a single `close()`
    /// that is idempotent").
    pub async fn close(&self) {
        let _ = self.pc.close().await;
    }

    /// Attach a new up-track (§4.3 `addTrack`). `offered_codecs` is
    /// the group's codec allowlist; fails silently (returns `None`,
    /// the caller turns this into `SfuError::CodecNotOffered`) if the
    /// remote track's codec isn't in it.
    pub fn add_track(&self, remote: &TrackRemote, offered_codecs: &[Mime]) -> Option<Arc<UpTrack>> {
        let mime = Mime::parse(&remote.codec().capability.mime_type);
        if !offered_codecs.contains(&mime) {
            return None;
        }
        let mid = remote.id();
        let rid = {
            let r = remote.rid();
            (!r.is_empty()).then(|| r.to_string())
        };
        let track = Arc::new(UpTrack::new(
            mid.clone(),
            rid,
            mime,
            remote.codec().capability.clock_rate,
            remote.codec().capability.channels,
            remote.codec().capability.sdp_fmtp_line,
            remote.ssrc(),
            self.pc.clone(),
        ));
        // Multiple simultaneous tracks for the same mid (distinct
        // rid/simulcast layers, or a second video source) are kept
        // side by side, keyed by mid+rid so each is addressed and
        // forwarded independently (§4.3 resolved open question).
        let key = track
            .rid
            .as_ref()
            .map_or_else(|| mid.clone(), |rid| format!("{mid}#{rid}"));
        self.tracks.lock().insert(key, track.clone());
        Some(track)
    }

    #[must_use]
    pub fn track(&self, key: &str) -> Option<Arc<UpTrack>> {
        self.tracks.lock().get(key).cloned()
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<Arc<UpTrack>> {
        self.tracks.lock().values().cloned().collect()
    }

    /// Feeds a receiver report's RTT sample into this Up's RTT
    /// estimate (§4.3 `onReceiverReport`).
    pub fn on_receiver_report(&self, rtt_ms: f64) {
        let mut rtt = self.rtt_ms.lock();
        *rtt = 0.875 * *rtt + 0.125 * rtt_ms;
    }

    #[must_use]
    pub fn rtt_ms(&self) -> f64 {
        *self.rtt_ms.lock()
    }

    /// Removes a down-track subscriber from every up-track's writer
    /// pool (§4.3 `delLocal`).
    pub fn del_local(&self, down_track_id: &str) {
        for track in self.tracks.lock().values() {
            track.writer_pool.detach(down_track_id);
        }
    }
}

/// Drives the RTP reader for one up-track until the remote stream
/// ends, recording arrival time and forwarding into the cache/pool.
/// `up` supplies the publisher connection's RTT estimate for scaling
/// NACK retries.
pub async fn spawn_rtp_reader(
    track: Arc<UpTrack>,
    remote: Arc<TrackRemote>,
    _receiver: Arc<RTCRtpReceiver>,
    up: Arc<Up>,
) {
    tokio::spawn(async move {
        loop {
            match remote.read_rtp().await {
                Ok((packet, _attrs)) => {
                    track.write(&packet, Instant::now(), up.rtt_ms());
                }
                Err(err) => {
                    debug!(mid = %track.mid, %err, "up-track read ended");
                    break;
                }
            }
        }
    });
}

/// Jitter-aware NACK retry interval (§4.3): proportional to RTT,
/// capped at 100ms.
#[must_use]
pub fn nack_retry_interval(rtt_ms: f64) -> Duration {
    let ms = (rtt_ms * 1.5).clamp(10.0, 100.0);
    Duration::from_millis(ms as u64)
}

pub const MAX_NACK_RETRIES: u8 = 4;

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::api::media_engine::MediaEngine;
    use webrtc::api::APIBuilder;
    use webrtc::peer_connection::configuration::RTCConfiguration;

    #[test]
    fn nack_interval_caps_at_100ms() {
        assert_eq!(nack_retry_interval(1000.0), Duration::from_millis(100));
    }

    #[test]
    fn nack_interval_floors_at_10ms() {
        assert_eq!(nack_retry_interval(0.0), Duration::from_millis(10));
    }

    /// A throwaway peer connection for tests that only need an `UpTrack`
    /// to exist, never to actually negotiate anything.
    async fn dummy_pc() -> Arc<RTCPeerConnection> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().expect("register default codecs");
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .expect("build throwaway peer connection"),
        )
    }

    #[tokio::test]
    async fn keyframe_request_rate_limited_to_one_per_second() {
        let track = UpTrack::new(
            "0".into(),
            None,
            Mime::Vp8,
            90000,
            0,
            String::new(),
            1,
            dummy_pc().await,
        );
        let t0 = Instant::now();
        assert!(track.should_request_keyframe(t0));
        assert!(!track.should_request_keyframe(t0 + Duration::from_millis(500)));
        assert!(track.should_request_keyframe(t0 + Duration::from_millis(1001)));
    }

    #[tokio::test]
    async fn fir_seqno_increments() {
        let track = UpTrack::new(
            "0".into(),
            None,
            Mime::Vp8,
            90000,
            0,
            String::new(),
            1,
            dummy_pc().await,
        );
        let a = track.next_fir_seqno();
        let b = track.next_fir_seqno();
        assert_eq!(b, a.wrapping_add(1));
    }

    #[tokio::test]
    async fn write_caches_packets_and_leaves_a_gap_for_nack_recovery() {
        let track = Arc::new(UpTrack::new(
            "0".into(),
            None,
            Mime::Vp8,
            90000,
            0,
            String::new(),
            1,
            dummy_pc().await,
        ));
        let mut packet = Packet::default();
        packet.header.sequence_number = 10;
        track.write(&packet, Instant::now(), 20.0);
        packet.header.sequence_number = 12;
        track.write(&packet, Instant::now(), 20.0);

        assert!(track.cached_packet(10).is_some());
        assert!(track.cached_packet(12).is_some());
        // Seqno 11 never arrived: write() falls through to a NACK retry
        // rather than panicking, and the cache still doesn't have it.
        assert!(track.cached_packet(11).is_none());
    }
}
