//! Bandwidth controller shared by every `Down` connection (§4.5).
//!
//! The three-input minimum-wins `maxBitrate` bound is grounded on
//! `synctv-sfu::network_monitor`'s quality-score combination of
//! multiple signals into one action; the simulcast hysteresis/dwell
//! policy is grounded on `voice::quality::Quality`'s tier
//! upgrade/downgrade stepping, generalised from discrete named tiers
//! to a continuous bitrate threshold with a time-based dwell guard.

use std::time::{Duration, Instant};

/// REMB/transport-CC/administrative inputs feeding one down-track's
/// bound, and the staleness rule that reverts it to unbounded.
pub struct BitrateBound {
    remb_bps: Option<(u64, Instant)>,
    loss_bound_bps: Option<u64>,
    admin_cap_bps: u64,
}

const STALE_AFTER: Duration = Duration::from_secs(5);
const LOSS_K: f64 = 0.5;

impl BitrateBound {
    #[must_use]
    pub fn new(admin_cap_bps: u64) -> Self {
        Self {
            remb_bps: None,
            loss_bound_bps: None,
            admin_cap_bps,
        }
    }

    pub fn on_remb(&mut self, bps: u64, now: Instant) {
        self.remb_bps = Some((bps, now));
    }

    /// `base` is the previous accepted bound, `loss_fraction` in `[0,1]`
    /// over the last 2s (§4.5).
    pub fn on_loss_report(&mut self, base_bps: u64, loss_fraction: f64) {
        let bound = (base_bps as f64 * (1.0 - LOSS_K * loss_fraction)).max(0.0);
        self.loss_bound_bps = Some(bound as u64);
    }

    /// Lowest of the three inputs still fresh (§4.5); stale REMB is
    /// dropped and the bound reverts to unbounded for that input.
    #[must_use]
    pub fn current(&self, now: Instant) -> u64 {
        let remb = self
            .remb_bps
            .filter(|(_, t)| now.duration_since(*t) <= STALE_AFTER)
            .map(|(bps, _)| bps)
            .unwrap_or(u64::MAX);
        let loss = self.loss_bound_bps.unwrap_or(u64::MAX);
        remb.min(loss).min(self.admin_cap_bps)
    }
}

/// Simulcast layer: `h` (high) or `l` (low) per §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    High,
    Low,
}

const HIGH_THRESHOLD_BPS: u64 = 300_000;
const HYSTERESIS_BPS: u64 = 50_000;
const DWELL: Duration = Duration::from_secs(3);

/// Hysteresis/dwell-guarded simulcast layer selector (§4.5).
pub struct LayerSelector {
    current: Layer,
    last_switch: Option<Instant>,
}

impl LayerSelector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: Layer::Low,
            last_switch: None,
        }
    }

    /// Re-evaluates the layer given the down-track's current
    /// `max_bitrate_bps`, honouring hysteresis around the threshold
    /// and a minimum dwell time between switches.
    pub fn update(&mut self, max_bitrate_bps: u64, now: Instant) -> Layer {
        if let Some(last) = self.last_switch {
            if now.duration_since(last) < DWELL {
                return self.current;
            }
        }

        let wants_high = match self.current {
            Layer::Low => max_bitrate_bps >= HIGH_THRESHOLD_BPS + HYSTERESIS_BPS,
            Layer::High => max_bitrate_bps >= HIGH_THRESHOLD_BPS - HYSTERESIS_BPS,
        };
        let wanted = if wants_high { Layer::High } else { Layer::Low };
        if wanted != self.current {
            self.current = wanted;
            self.last_switch = Some(now);
        }
        self.current
    }

    #[must_use]
    pub const fn current(&self) -> Layer {
        self.current
    }
}

impl Default for LayerSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remb_and_admin_cap_take_minimum() {
        let mut bound = BitrateBound::new(500_000);
        let now = Instant::now();
        bound.on_remb(2_000_000, now);
        assert_eq!(bound.current(now), 500_000);
    }

    #[test]
    fn stale_remb_is_ignored() {
        let mut bound = BitrateBound::new(u64::MAX);
        let t0 = Instant::now();
        bound.on_remb(100_000, t0);
        let later = t0 + Duration::from_secs(6);
        assert_eq!(bound.current(later), u64::MAX);
    }

    #[test]
    fn loss_bound_scales_down_with_loss_fraction() {
        let mut bound = BitrateBound::new(u64::MAX);
        bound.on_loss_report(1_000_000, 0.2);
        let now = Instant::now();
        assert_eq!(bound.current(now), 900_000);
    }

    #[test]
    fn layer_selector_starts_low() {
        let selector = LayerSelector::new();
        assert_eq!(selector.current(), Layer::Low);
    }

    #[test]
    fn layer_selector_switches_up_above_threshold_plus_hysteresis() {
        let mut selector = LayerSelector::new();
        let t0 = Instant::now();
        assert_eq!(selector.update(200_000, t0), Layer::Low);
        assert_eq!(selector.update(360_000, t0), Layer::High);
    }

    #[test]
    fn layer_selector_respects_dwell_time() {
        let mut selector = LayerSelector::new();
        let t0 = Instant::now();
        selector.update(400_000, t0);
        assert_eq!(selector.current(), Layer::High);
        // Below threshold but within dwell window: stays High.
        assert_eq!(selector.update(100_000, t0 + Duration::from_millis(500)), Layer::High);
        // Past dwell: now allowed to drop.
        assert_eq!(selector.update(100_000, t0 + Duration::from_secs(4)), Layer::Low);
    }

    #[test]
    fn layer_selector_hysteresis_prevents_flapping_near_threshold() {
        let mut selector = LayerSelector::new();
        let t0 = Instant::now();
        selector.update(400_000, t0);
        let t1 = t0 + Duration::from_secs(4);
        // Still above (threshold - hysteresis) so stays High.
        assert_eq!(selector.update(260_000, t1), Layer::High);
    }
}
