//! Rate estimator and jitter tracker shared by up- and down-tracks.
//!
//! Grounded on the sliding-window byte-rate window in
//! `synctv-sfu::track::MediaTrack` and the RTT-variance jitter
//! calculation in `synctv-sfu::network_monitor`, generalised to a
//! single reusable type.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// EWMA byte-rate estimator plus a bounded window used for jitter and
/// loss-fraction accounting.
pub struct RateEstimator {
    window: VecDeque<(Instant, u64)>,
    window_len: Duration,
    ewma_bps: f64,
    alpha: f64,
}

impl RateEstimator {
    /// `window_len` bounds how far back `bitrate_bps`/`loss_fraction`
    /// look; `alpha` is the EWMA smoothing factor in `(0, 1]`.
    #[must_use]
    pub fn new(window_len: Duration, alpha: f64) -> Self {
        Self {
            window: VecDeque::new(),
            window_len,
            ewma_bps: 0.0,
            alpha,
        }
    }

    /// Record `bytes` received at `now`.
    pub fn record(&mut self, now: Instant, bytes: u64) {
        self.window.push_back((now, bytes));
        self.prune(now);
        let instantaneous_bps = (bytes as f64) * 8.0;
        self.ewma_bps = self.alpha * instantaneous_bps + (1.0 - self.alpha) * self.ewma_bps;
    }

    fn prune(&mut self, now: Instant) {
        let cutoff = now.checked_sub(self.window_len).unwrap_or(now);
        while let Some(&(t, _)) = self.window.front() {
            if t < cutoff {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bitrate over the configured window, in bits per second.
    #[must_use]
    pub fn windowed_bitrate_bps(&self) -> f64 {
        if self.window.len() < 2 {
            return 0.0;
        }
        let total_bytes: u64 = self.window.iter().map(|(_, b)| b).sum();
        let span = self
            .window
            .back()
            .unwrap()
            .0
            .duration_since(self.window.front().unwrap().0)
            .as_secs_f64();
        if span <= 0.0 {
            0.0
        } else {
            (total_bytes as f64) * 8.0 / span
        }
    }

    /// Smoothed instantaneous bitrate.
    #[must_use]
    pub const fn ewma_bitrate_bps(&self) -> f64 {
        self.ewma_bps
    }
}

/// RFC 3550 §A.8-style interarrival jitter estimator, operating on RTP
/// timestamps rather than wall-clock deltas so it tracks the same
/// quantity the receiver report carries.
#[derive(Default)]
pub struct JitterTracker {
    last_transit: Option<i64>,
    jitter: f64,
}

impl JitterTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `rtp_timestamp` and `arrival_rtp_units` must be in the same
    /// clock-rate units (the caller converts wall-clock arrival time
    /// into RTP units first).
    pub fn update(&mut self, rtp_timestamp: u32, arrival_rtp_units: i64) {
        let transit = arrival_rtp_units - i64::from(rtp_timestamp);
        if let Some(last) = self.last_transit {
            let d = (transit - last).unsigned_abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
    }

    /// Current smoothed jitter estimate, in RTP clock-rate units.
    #[must_use]
    pub const fn jitter(&self) -> f64 {
        self.jitter
    }
}

/// Loss fraction tracked over the last 2s window (§4.5 loss-based
/// bound). Distinct from `RateEstimator`'s byte window because it
/// tracks packet *counts*, not bytes.
pub struct LossTracker {
    window: VecDeque<(Instant, bool)>,
    window_len: Duration,
}

impl LossTracker {
    #[must_use]
    pub fn new(window_len: Duration) -> Self {
        Self {
            window: VecDeque::new(),
            window_len,
        }
    }

    /// Record one expected packet slot: `lost = true` if it was never
    /// received.
    pub fn record(&mut self, now: Instant, lost: bool) {
        self.window.push_back((now, lost));
        let cutoff = now.checked_sub(self.window_len).unwrap_or(now);
        while let Some(&(t, _)) = self.window.front() {
            if t < cutoff {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Fraction of packets lost in the current window, `0.0` if no
    /// samples are present.
    #[must_use]
    pub fn loss_fraction(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let lost = self.window.iter().filter(|(_, l)| *l).count();
        lost as f64 / self.window.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_estimator_reports_zero_with_one_sample() {
        let mut r = RateEstimator::new(Duration::from_secs(2), 0.5);
        r.record(Instant::now(), 1000);
        assert_eq!(r.windowed_bitrate_bps(), 0.0);
        assert!(r.ewma_bitrate_bps() > 0.0);
    }

    #[test]
    fn rate_estimator_windowed_bitrate_nonzero_with_span() {
        let mut r = RateEstimator::new(Duration::from_secs(2), 0.5);
        let t0 = Instant::now();
        r.record(t0, 1000);
        r.record(t0 + Duration::from_millis(500), 1000);
        assert!(r.windowed_bitrate_bps() > 0.0);
    }

    #[test]
    fn jitter_tracker_zero_on_perfectly_regular_arrivals() {
        let mut j = JitterTracker::new();
        for i in 0..10 {
            j.update(i * 160, i64::from(i * 160));
        }
        assert_eq!(j.jitter(), 0.0);
    }

    #[test]
    fn jitter_tracker_nonzero_on_irregular_arrivals() {
        let mut j = JitterTracker::new();
        j.update(0, 0);
        j.update(160, 300); // arrived late relative to RTP clock
        j.update(320, 320);
        assert!(j.jitter() > 0.0);
    }

    #[test]
    fn loss_tracker_computes_fraction() {
        let mut l = LossTracker::new(Duration::from_secs(2));
        let t0 = Instant::now();
        l.record(t0, false);
        l.record(t0, false);
        l.record(t0, true);
        l.record(t0, false);
        assert!((l.loss_fraction() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn loss_tracker_prunes_old_samples() {
        let mut l = LossTracker::new(Duration::from_millis(100));
        let t0 = Instant::now();
        l.record(t0, true);
        l.record(t0 + Duration::from_millis(200), false);
        assert_eq!(l.loss_fraction(), 0.0);
    }
}
