//! Per-track jitter/retransmission cache (§4.1).
//!
//! A fixed-capacity ring of recently received RTP packets, addressable
//! by sequence number or by the stable slot index handed back from
//! `store`. There is exactly one writer (the up-track's RTP reader
//! task); the writer pool reads it concurrently and must tolerate a
//! torn slot (a `store` landing mid-read) by treating it as a miss.

use std::time::Instant;

/// Compares two RTP sequence numbers under the usual 16-bit wraparound
/// rule: `a < b` iff `(b - a) mod 2^16 < 2^15`.
#[must_use]
pub const fn seqno_lt(a: u16, b: u16) -> bool {
    (b.wrapping_sub(a)) < 0x8000
}

/// Signed distance `b - a` under the same wraparound rule, used for
/// gap-size computation. Positive when `b` is "after" `a`.
#[must_use]
pub const fn seqno_diff(a: u16, b: u16) -> i32 {
    let raw = b.wrapping_sub(a);
    if raw < 0x8000 {
        raw as i32
    } else {
        raw as i32 - 0x10000
    }
}

#[derive(Clone)]
struct Slot {
    seqno: u16,
    arrived_at: Instant,
    payload: Vec<u8>,
    occupied: bool,
}

impl Slot {
    const fn empty() -> Self {
        Self {
            seqno: 0,
            arrived_at: Instant::now(),
            payload: Vec::new(),
            occupied: false,
        }
    }
}

/// Cumulative stats returned by [`PacketCache::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Packets expected based on first/last seqno seen (last - first + 1).
    pub expected: u64,
    /// Packets never observed in that range.
    pub lost: u64,
    /// Most recently stored sequence number.
    pub last_seqno: Option<u16>,
}

/// Fixed-capacity ring buffer of RTP packets keyed by sequence number.
pub struct PacketCache {
    slots: Vec<Slot>,
    capacity: usize,
    first_seqno: Option<u16>,
    last_seqno: Option<u16>,
    received: u64,
}

impl PacketCache {
    /// Create a cache with room for `capacity` packets. `capacity` must
    /// be non-zero; video tracks default to 128, audio to 16 (§4.1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "packet cache capacity must be non-zero");
        Self {
            slots: vec![Slot::empty(); capacity],
            capacity,
            first_seqno: None,
            last_seqno: None,
            received: 0,
        }
    }

    const fn index_for(&self, seqno: u16) -> usize {
        (seqno as usize) % self.capacity
    }

    /// Store a packet, replacing any existing entry with the same
    /// seqno, and return the stable slot index the writer pool should
    /// carry alongside the seqno.
    pub fn store(&mut self, seqno: u16, payload: &[u8]) -> usize {
        let index = self.index_for(seqno);
        let slot = &mut self.slots[index];
        slot.seqno = seqno;
        slot.arrived_at = Instant::now();
        slot.payload.clear();
        slot.payload.extend_from_slice(payload);
        slot.occupied = true;

        self.received += 1;
        if self.first_seqno.is_none() {
            self.first_seqno = Some(seqno);
        }
        if self.last_seqno.map_or(true, |last| seqno_lt(last, seqno)) {
            self.last_seqno = Some(seqno);
        }
        index
    }

    /// Fetch a packet by sequence number. Returns `None` if it was
    /// never stored or has since been evicted by a newer packet
    /// landing on the same slot.
    #[must_use]
    pub fn get_by_seqno(&self, seqno: u16) -> Option<&[u8]> {
        let slot = &self.slots[self.index_for(seqno)];
        (slot.occupied && slot.seqno == seqno).then(|| slot.payload.as_slice())
    }

    /// Fetch a packet by the slot index returned from `store`. Returns
    /// `None` if the slot has since been reused for a different
    /// seqno (the caller passed a stale index).
    #[must_use]
    pub fn get_by_index(&self, index: usize, expected_seqno: u16) -> Option<&[u8]> {
        let slot = self.slots.get(index)?;
        (slot.occupied && slot.seqno == expected_seqno).then(|| slot.payload.as_slice())
    }

    /// Arrival timestamp of the packet at `index`, if still present.
    #[must_use]
    pub fn arrival_time(&self, index: usize) -> Option<Instant> {
        self.slots.get(index).filter(|s| s.occupied).map(|s| s.arrived_at)
    }

    /// Packets expected, lost, and the last seqno received (§4.1
    /// `stats`).
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let (Some(first), Some(last)) = (self.first_seqno, self.last_seqno) else {
            return CacheStats::default();
        };
        let expected = i64::from(seqno_diff(first, last)) + 1;
        let expected = expected.max(1) as u64;
        let lost = expected.saturating_sub(self.received.min(expected));
        CacheStats {
            expected,
            lost,
            last_seqno: Some(last),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqno_lt_handles_wraparound() {
        assert!(seqno_lt(10, 20));
        assert!(!seqno_lt(20, 10));
        assert!(seqno_lt(65530, 5));
        assert!(!seqno_lt(5, 65530));
    }

    #[test]
    fn seqno_diff_matches_lt() {
        assert_eq!(seqno_diff(10, 20), 10);
        assert_eq!(seqno_diff(65530, 5), 11);
        assert!(seqno_diff(20, 10) < 0);
    }

    #[test]
    fn store_then_get_by_seqno_round_trips() {
        let mut cache = PacketCache::new(128);
        cache.store(42, b"hello");
        assert_eq!(cache.get_by_seqno(42), Some(b"hello".as_slice()));
        assert_eq!(cache.get_by_seqno(43), None);
    }

    #[test]
    fn replacing_same_seqno_overwrites_slot() {
        let mut cache = PacketCache::new(128);
        cache.store(1, b"first");
        cache.store(1, b"second");
        assert_eq!(cache.get_by_seqno(1), Some(b"second".as_slice()));
    }

    #[test]
    fn eviction_when_capacity_exceeded() {
        let mut cache = PacketCache::new(4);
        let idx0 = cache.store(0, b"a");
        let idx4 = cache.store(4, b"b"); // same slot as seqno 0 (4 % 4 == 0)
        assert_eq!(idx0, idx4);
        assert_eq!(cache.get_by_seqno(0), None);
        assert_eq!(cache.get_by_seqno(4), Some(b"b".as_slice()));
    }

    #[test]
    fn get_by_index_detects_stale_slot() {
        let mut cache = PacketCache::new(4);
        let idx = cache.store(0, b"a");
        assert_eq!(cache.get_by_index(idx, 0), Some(b"a".as_slice()));
        cache.store(4, b"b");
        // Same physical slot, different seqno now occupies it.
        assert_eq!(cache.get_by_index(idx, 0), None);
    }

    #[test]
    fn stats_reports_gap() {
        let mut cache = PacketCache::new(128);
        cache.store(0, b"a");
        cache.store(1, b"b");
        cache.store(3, b"d"); // seqno 2 missing
        let stats = cache.stats();
        assert_eq!(stats.expected, 4);
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.last_seqno, Some(3));
    }

    #[test]
    fn stats_on_empty_cache() {
        let cache = PacketCache::new(16);
        assert_eq!(cache.stats(), CacheStats::default());
    }
}
