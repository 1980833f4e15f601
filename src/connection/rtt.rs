//! Round-trip estimation and retransmission timeout computation
//!
//! The classic integer-arithmetic smoothed estimator: `srtt` is kept scaled
//! by 8 and `mdev` by 4, the error feeds both with asymmetric gain on the
//! deviation (finer when the measurement came in under the estimate), and
//! `rto = srtt/8 + rttvar` clamped to the configured bounds. Samples must
//! come only from segments known not to have been retransmitted.

use std::cmp;
use std::time::Duration;

use super::seq::after;

/// RTT state for one flow, in milliseconds
#[derive(Debug, Copy, Clone)]
pub(crate) struct RttEstimator {
    /// Smoothed round-trip time, scaled by 8
    srtt: u32,
    /// Mean deviation, scaled by 4
    mdev: u32,
    /// Maximal `mdev` for the last measurement window
    mdev_max: u32,
    /// Smoothed `mdev_max`
    rttvar: u32,
    /// Sequence number bounding the current measurement window
    rtt_seq: u32,
    /// Current retransmission timeout
    rto: u32,
    rto_min: u32,
    rto_max: u32,
}

impl RttEstimator {
    pub(crate) fn new(initial_rto: Duration, rto_min: Duration, rto_max: Duration) -> Self {
        Self {
            srtt: 0,
            mdev: 0,
            mdev_max: 0,
            rttvar: 0,
            rtt_seq: 0,
            rto: initial_rto.as_millis() as u32,
            rto_min: rto_min.as_millis() as u32,
            rto_max: rto_max.as_millis() as u32,
        }
    }

    /// Current retransmission timeout, before backoff
    pub(crate) fn rto(&self) -> Duration {
        Duration::from_millis(u64::from(self.rto))
    }

    /// The timeout after `backoff` doublings, bounded by the maximum
    pub(crate) fn backed_off_rto(&self, backoff: u32) -> Duration {
        let ms = u64::from(self.rto) << cmp::min(backoff, 16);
        Duration::from_millis(cmp::min(ms, u64::from(self.rto_max)))
    }

    /// Smoothed round-trip estimate, `None` before the first sample
    pub(crate) fn smoothed(&self) -> Option<Duration> {
        if self.srtt == 0 {
            return None;
        }
        Some(Duration::from_millis(u64::from(self.srtt >> 3)))
    }

    /// Feed one measurement and recompute the timeout
    ///
    /// `snd_una`/`snd_nxt` bound the measurement window for the variance
    /// decay.
    pub(crate) fn update(&mut self, sample: Duration, snd_una: u32, snd_nxt: u32) {
        let mut m = sample.as_millis() as u32;
        if m == 0 {
            m = 1;
        }
        if self.srtt != 0 {
            let mut err = m as i64 - i64::from(self.srtt >> 3);
            self.srtt = (i64::from(self.srtt) + err) as u32;
            if err < 0 {
                err = -err;
                err -= i64::from(self.mdev >> 2);
                // Finer gain when the estimate overshot, limiting both
                // timeout growth and overly fast decay.
                if err > 0 {
                    err >>= 3;
                }
            } else {
                err -= i64::from(self.mdev >> 2);
            }
            self.mdev = (i64::from(self.mdev) + err) as u32;
            if self.mdev > self.mdev_max {
                self.mdev_max = self.mdev;
                if self.mdev_max > self.rttvar {
                    self.rttvar = self.mdev_max;
                }
            }
            if after(snd_una, self.rtt_seq) {
                if self.mdev_max < self.rttvar {
                    self.rttvar -= (self.rttvar - self.mdev_max) >> 2;
                }
                self.rtt_seq = snd_nxt;
                self.mdev_max = self.rto_min;
            }
        } else {
            // First measurement.
            self.srtt = m << 3;
            self.mdev = m << 1;
            self.mdev_max = cmp::max(self.mdev, self.rto_min);
            self.rttvar = self.mdev_max;
            self.rtt_seq = snd_nxt;
        }
        self.rto = cmp::min((self.srtt >> 3) + self.rttvar, self.rto_max);
    }
}
