//! VP8 payload descriptor (RFC 7741 §4.2) parsing and rewriting.

use super::{CodecError, PacketFlags};
use webrtc::rtp::packet::Packet;

struct Descriptor {
    /// Byte offset of the VP8 payload header (after the descriptor).
    payload_header_offset: usize,
    picture_id: Option<(u16, bool)>, // (value, is_15_bit)
    picture_id_offset: Option<usize>,
    start_of_partition: bool,
    tid: Option<u8>,
    tid_up_sync: bool,
}

fn parse_descriptor(payload: &[u8]) -> Option<Descriptor> {
    if payload.is_empty() {
        return None;
    }
    let b0 = payload[0];
    let extended = b0 & 0x80 != 0; // X bit
    let start_of_partition = b0 & 0x10 != 0; // S bit
    let mut offset = 1;

    let mut picture_id = None;
    let mut picture_id_offset = None;
    let mut tid = None;
    let mut tid_up_sync = false;

    if extended {
        let b1 = *payload.get(offset)?;
        offset += 1;
        let has_pid = b1 & 0x80 != 0; // I
        let has_tl0 = b1 & 0x40 != 0; // L
        let has_tid_or_key = b1 & 0x20 != 0 || b1 & 0x10 != 0; // T or K

        if has_pid {
            let pb0 = *payload.get(offset)?;
            if pb0 & 0x80 != 0 {
                let pb1 = *payload.get(offset + 1)?;
                let value = (u16::from(pb0 & 0x7f) << 8) | u16::from(pb1);
                picture_id_offset = Some(offset);
                picture_id = Some((value, true));
                offset += 2;
            } else {
                picture_id_offset = Some(offset);
                picture_id = Some((u16::from(pb0 & 0x7f), false));
                offset += 1;
            }
        }
        if has_tl0 {
            offset += 1;
        }
        if has_tid_or_key {
            let tb = *payload.get(offset)?;
            tid = Some((tb & 0xc0) >> 6);
            tid_up_sync = tb & 0x20 != 0;
            offset += 1;
        }
    }

    Some(Descriptor {
        payload_header_offset: offset,
        picture_id,
        picture_id_offset,
        start_of_partition,
        tid,
        tid_up_sync,
    })
}

/// `(definitely_keyframe, known)`. A VP8 payload is a keyframe iff it
/// starts a partition and the VP8 payload header's P bit (inverted
/// frame-type bit) is clear.
pub fn is_keyframe(payload: &[u8]) -> (bool, bool) {
    let Some(desc) = parse_descriptor(payload) else {
        return (false, false);
    };
    if !desc.start_of_partition {
        // A non-first packet of a partition carries no frame-type bit.
        return (false, false);
    }
    let Some(&header_byte) = payload.get(desc.payload_header_offset) else {
        return (false, false);
    };
    let is_key = header_byte & 0x01 == 0;
    (is_key, true)
}

/// Width/height in pixels from the VP8 keyframe's uncompressed data
/// chunk, `(0, 0)` if this packet is not the start of a keyframe.
pub fn keyframe_dimensions(payload: &[u8]) -> (u16, u16) {
    let Some(desc) = parse_descriptor(payload) else {
        return (0, 0);
    };
    let base = desc.payload_header_offset;
    // VP8 payload header is 3 bytes for a keyframe, followed by a
    // 3-byte start code then 2x2 bytes of width/height (14 bits each,
    // top 2 bits are a scale factor we ignore here).
    if payload.len() < base + 10 {
        return (0, 0);
    }
    let start_code = &payload[base + 3..base + 6];
    if start_code != [0x9d, 0x01, 0x2a] {
        return (0, 0);
    }
    let w = u16::from_le_bytes([payload[base + 6], payload[base + 7]]) & 0x3fff;
    let h = u16::from_le_bytes([payload[base + 8], payload[base + 9]]) & 0x3fff;
    (w, h)
}

/// Rewrites the picture-ID field in place by `delta`, wrapping modulo
/// its field width (7 or 15 bits per RFC 7741 §4.2).
pub fn rewrite_picture_id(packet: &mut Packet, delta: i32) -> Result<(), CodecError> {
    let Some(desc) = parse_descriptor(&packet.payload) else {
        return Ok(()); // nothing to rewrite, not malformed enough to error
    };
    let (Some((value, is_15_bit)), Some(offset)) = (desc.picture_id, desc.picture_id_offset)
    else {
        return Ok(());
    };

    let modulus: i32 = if is_15_bit { 1 << 15 } else { 1 << 7 };
    let new_value = (i32::from(value) + delta).rem_euclid(modulus) as u16;

    let mut payload = packet.payload.to_vec();
    if offset >= payload.len() {
        return Err(CodecError::Truncated("vp8 picture id"));
    }
    if is_15_bit {
        if offset + 1 >= payload.len() {
            return Err(CodecError::Truncated("vp8 picture id"));
        }
        payload[offset] = 0x80 | ((new_value >> 8) as u8 & 0x7f);
        payload[offset + 1] = (new_value & 0xff) as u8;
    } else {
        payload[offset] = (new_value & 0x7f) as u8;
    }
    packet.payload = bytes::Bytes::from(payload);
    Ok(())
}

pub fn fill_flags(payload: &[u8], flags: &mut PacketFlags) {
    let Some(desc) = parse_descriptor(payload) else {
        flags.start = true;
        flags.end = flags.marker;
        return;
    };
    flags.start = desc.start_of_partition;
    flags.end = flags.marker;
    flags.pid = desc.picture_id.map(|(v, _)| v);
    flags.tid = desc.tid;
    flags.tid_up_sync = desc.tid_up_sync;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_keyframe_payload() -> Vec<u8> {
        // No extended descriptor (X=0); S=1 (start of partition).
        let mut p = vec![0x10];
        // VP8 payload header: key frame (bit0 = 0), version/show bits 0.
        p.push(0x00);
        p.push(0x00);
        p.push(0x00);
        // start code + dims
        p.extend_from_slice(&[0x9d, 0x01, 0x2a]);
        p.extend_from_slice(&640u16.to_le_bytes());
        p.extend_from_slice(&480u16.to_le_bytes());
        p
    }

    #[test]
    fn detects_simple_keyframe() {
        let payload = simple_keyframe_payload();
        assert_eq!(is_keyframe(&payload), (true, true));
    }

    #[test]
    fn detects_interframe() {
        let mut payload = simple_keyframe_payload();
        payload[1] |= 0x01; // clear key-frame bit -> inter frame
        assert_eq!(is_keyframe(&payload), (false, true));
    }

    #[test]
    fn non_start_packet_is_unknown() {
        let payload = vec![0x00, 0x00]; // S bit clear
        assert_eq!(is_keyframe(&payload), (false, false));
    }

    #[test]
    fn empty_payload_is_unknown() {
        assert_eq!(is_keyframe(&[]), (false, false));
    }

    #[test]
    fn keyframe_dimensions_extracted() {
        let payload = simple_keyframe_payload();
        assert_eq!(keyframe_dimensions(&payload), (640, 480));
    }

    #[test]
    fn picture_id_rewrite_wraps_7_bit() {
        // X=1, S=1; ext byte I=1; 7-bit picture id = 100.
        let payload = vec![0x90, 0x80, 100, 0x00, 0x00, 0x00];
        let mut packet = Packet {
            payload: bytes::Bytes::from(payload),
            ..Default::default()
        };
        rewrite_picture_id(&mut packet, 50).unwrap();
        // 100 + 50 = 150, mod 128 = 22
        assert_eq!(packet.payload[2] & 0x7f, 22);
    }

    #[test]
    fn picture_id_rewrite_15_bit() {
        // ext byte I=1, 15-bit picture id via high bit set on first pid byte.
        let payload = vec![0x90, 0x80, 0x80 | 0x00, 0x01, 0x00, 0x00];
        let mut packet = Packet {
            payload: bytes::Bytes::from(payload),
            ..Default::default()
        };
        rewrite_picture_id(&mut packet, 1).unwrap();
        let hi = packet.payload[2] & 0x7f;
        let lo = packet.payload[3];
        let value = (u16::from(hi) << 8) | u16::from(lo);
        assert_eq!(value, 2);
    }
}
