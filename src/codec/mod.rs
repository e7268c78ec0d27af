//! Codec helpers (§4.2): keyframe detection, resolution extraction, and
//! seqno/picture-ID rewriting for VP8, VP9, H.264, AV1, Opus.
//!
//! These are pure functions over an already-parsed RTP packet
//! (`webrtc::rtp::packet::Packet`) rather than raw bytes, so header
//! fields (CSRC count, extensions) are handled by the `webrtc` crate's
//! own parser instead of being re-derived here. Payload *descriptor*
//! parsing (VP8's picture-ID field, etc.) is codec-specific and lives
//! in the submodules.

mod av1;
mod h264;
mod vp8;
mod vp9;

use webrtc::rtp::packet::Packet;

/// The RTP payload codec, derived from the SDP/`RTCRtpCodecParameters`
/// mime type string (e.g. `"video/VP8"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mime {
    Vp8,
    Vp9,
    H264,
    Av1,
    Opus,
    /// Anything else: keyframe detection always reports "undetermined"
    /// and rewriting only touches the seqno/marker.
    Other,
}

impl Mime {
    /// Parse a mime type string as used in SDP (`video/VP8`,
    /// `audio/opus`, case-insensitive).
    #[must_use]
    pub fn parse(mime: &str) -> Self {
        let lower = mime.to_ascii_lowercase();
        if lower.ends_with("vp8") {
            Self::Vp8
        } else if lower.ends_with("vp9") {
            Self::Vp9
        } else if lower.ends_with("h264") {
            Self::H264
        } else if lower.ends_with("av1") {
            Self::Av1
        } else if lower.ends_with("opus") {
            Self::Opus
        } else {
            Self::Other
        }
    }

    #[must_use]
    pub const fn is_video(self) -> bool {
        !matches!(self, Self::Opus)
    }
}

/// Errors returned by the rewriting helpers. Detection helpers never
/// error — they return a three-valued (definitely, known) pair instead
/// so callers fall back to requesting a PLI rather than guessing.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload too short to contain a {0} descriptor")]
    Truncated(&'static str),
}

/// Flags extracted from one RTP packet, used by the bandwidth
/// controller and writer pool (§4.2 `packetFlags`).
#[derive(Debug, Clone, Default)]
pub struct PacketFlags {
    pub seqno: u16,
    pub marker: bool,
    pub start: bool,
    pub end: bool,
    pub keyframe: bool,
    pub pid: Option<u16>,
    pub tid: Option<u8>,
    pub sid: Option<u8>,
    pub tid_up_sync: bool,
    pub sid_up_sync: bool,
    pub discardable: bool,
}

/// Three-valued keyframe determination: `(definitely_keyframe, known)`.
/// `(false, false)` means the descriptor could not be parsed and the
/// caller should request a PLI rather than assume either answer.
#[must_use]
pub fn is_keyframe(mime: Mime, packet: &Packet) -> (bool, bool) {
    match mime {
        Mime::Vp8 => vp8::is_keyframe(&packet.payload),
        Mime::Vp9 => vp9::is_keyframe(&packet.payload),
        Mime::H264 => h264::is_keyframe(&packet.payload),
        Mime::Av1 => av1::is_keyframe(&packet.payload),
        Mime::Opus | Mime::Other => (false, false),
    }
}

/// Resolution carried in a keyframe's payload descriptor, `(0, 0)` if
/// unknown or not applicable (§4.2 `keyframeDimensions`).
#[must_use]
pub fn keyframe_dimensions(mime: Mime, packet: &Packet) -> (u16, u16) {
    match mime {
        Mime::Vp8 => vp8::keyframe_dimensions(&packet.payload),
        Mime::Vp9 => vp9::keyframe_dimensions(&packet.payload),
        _ => (0, 0),
    }
}

/// Rewrites `packet`'s sequence number (and marker bit, if `set_marker`
/// is `Some`) in place, plus the VP8 picture-ID by `pid_delta` modulo
/// its field width when present (§4.2 `rewrite`). All other codecs
/// only get the seqno/marker touched.
pub fn rewrite(
    mime: Mime,
    packet: &mut Packet,
    set_marker: Option<bool>,
    new_seqno: u16,
    pid_delta: i32,
) -> Result<(), CodecError> {
    packet.header.sequence_number = new_seqno;
    if let Some(marker) = set_marker {
        packet.header.marker = marker;
    }
    if mime == Mime::Vp8 {
        vp8::rewrite_picture_id(packet, pid_delta)?;
    }
    Ok(())
}

/// Extracts bandwidth-controller-relevant flags from one packet
/// (§4.2 `packetFlags`).
#[must_use]
pub fn packet_flags(mime: Mime, packet: &Packet) -> PacketFlags {
    let mut flags = PacketFlags {
        seqno: packet.header.sequence_number,
        marker: packet.header.marker,
        ..Default::default()
    };
    match mime {
        Mime::Vp8 => vp8::fill_flags(&packet.payload, &mut flags),
        Mime::Vp9 => vp9::fill_flags(&packet.payload, &mut flags),
        _ => {
            flags.start = true;
            flags.end = flags.marker;
        }
    }
    let (definitely, known) = is_keyframe(mime, packet);
    flags.keyframe = known && definitely;
    flags
}
