//! VP9 payload descriptor parsing (draft-ietf-payload-vp9), partial:
//! only the fields the writer pool and bandwidth controller need
//! (picture-ID, layer indices, keyframe/dimensions). Flexible-mode
//! reference indices are not decoded; callers never rewrite VP9
//! picture IDs (§4.2 limits rewriting to VP8).

use super::PacketFlags;

struct Descriptor {
    payload_header_offset: usize,
    picture_id: Option<u16>,
    sid: Option<u8>,
    tid: Option<u8>,
    start_of_frame: bool,
    inter_picture_predicted: bool,
}

fn parse_descriptor(payload: &[u8]) -> Option<Descriptor> {
    let b0 = *payload.first()?;
    let has_pid = b0 & 0x80 != 0; // I
    let has_layer_indices = b0 & 0x20 != 0; // L
    let has_scalability = b0 & 0x10 != 0; // V, implies layer indices too
    let flexible = b0 & 0x10 != 0 && b0 & 0x08 != 0; // approximation, see below
    let _ = flexible;
    let start_of_frame = b0 & 0x04 != 0; // B
    let _end_of_frame = b0 & 0x02 != 0; // E

    let mut offset = 1;
    let mut picture_id = None;
    if has_pid {
        let pb0 = *payload.get(offset)?;
        if pb0 & 0x80 != 0 {
            let pb1 = *payload.get(offset + 1)?;
            picture_id = Some((u16::from(pb0 & 0x7f) << 8) | u16::from(pb1));
            offset += 2;
        } else {
            picture_id = Some(u16::from(pb0 & 0x7f));
            offset += 1;
        }
    }

    let mut sid = None;
    let mut tid = None;
    if has_layer_indices {
        let lb = *payload.get(offset)?;
        tid = Some((lb & 0xe0) >> 5);
        sid = Some((lb & 0x0e) >> 1);
        offset += 1;
        if has_scalability {
            // Scalability structure (N_S, etc.) is only present on
            // keyframes / first packet of a frame; skipping it is safe
            // here since we don't need its contents beyond the byte
            // already consumed.
        }
    }

    Some(Descriptor {
        payload_header_offset: offset,
        picture_id,
        sid,
        tid,
        start_of_frame,
        inter_picture_predicted: !start_of_frame,
    })
}

/// `(definitely_keyframe, known)`. VP9 keyframes are identified by the
/// payload header's frame-marker/profile bits at the start of the
/// first packet of a frame; we only attempt this on packets marked as
/// the start of a frame.
pub fn is_keyframe(payload: &[u8]) -> (bool, bool) {
    let Some(desc) = parse_descriptor(payload) else {
        return (false, false);
    };
    if !desc.start_of_frame {
        return (false, false);
    }
    let Some(&header_byte) = payload.get(desc.payload_header_offset) else {
        return (false, false);
    };
    // Uncompressed header: 2-bit frame marker (must be 0b10), 1 bit
    // profile low, ..., then profile_high, then (for profile < 3) a
    // reserved zero bit, then show_existing_frame, then frame_type
    // (0 = key). We only check the well-known frame_type bit position
    // for the common profile-0 case.
    if header_byte >> 6 != 0b10 {
        return (false, false);
    }
    let frame_type_bit = header_byte & 0x04 != 0;
    (!frame_type_bit && !desc.inter_picture_predicted, true)
}

/// VP9 keyframe dimensions are not parsed (would require walking the
/// full uncompressed header's render-size fields); always unknown.
pub fn keyframe_dimensions(_payload: &[u8]) -> (u16, u16) {
    (0, 0)
}

pub fn fill_flags(payload: &[u8], flags: &mut PacketFlags) {
    let Some(desc) = parse_descriptor(payload) else {
        flags.start = true;
        flags.end = flags.marker;
        return;
    };
    flags.start = desc.start_of_frame;
    flags.end = flags.marker;
    flags.pid = desc.picture_id;
    flags.tid = desc.tid;
    flags.sid = desc.sid;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_is_unknown() {
        assert_eq!(is_keyframe(&[]), (false, false));
    }

    #[test]
    fn non_start_packet_is_unknown() {
        // I=0, L=0, V=0, B=0 (not start of frame).
        let payload = vec![0x00, 0x82];
        assert_eq!(is_keyframe(&payload), (false, false));
    }

    #[test]
    fn start_of_frame_keyframe_header_detected() {
        // I=0, L=0, V=0, B=1 -> descriptor is 1 byte, payload header
        // next: frame marker 0b10, profile bits 0, show_existing=0,
        // frame_type=0 (key) at bit position we check (0x04 clear).
        let payload = vec![0x04, 0b1000_0000];
        assert_eq!(is_keyframe(&payload), (true, true));
    }

    #[test]
    fn picture_id_and_layers_extracted() {
        // I=1, L=1, V=0, B=1
        let payload = vec![0x80 | 0x20 | 0x04, 0x05, 0b0010_0000, 0b1000_0000];
        let desc = parse_descriptor(&payload).unwrap();
        assert_eq!(desc.picture_id, Some(5));
        assert!(desc.tid.is_some());
        assert!(desc.sid.is_some());
    }

    #[test]
    fn dimensions_always_unknown() {
        assert_eq!(keyframe_dimensions(&[0x04, 0x80]), (0, 0));
    }
}
