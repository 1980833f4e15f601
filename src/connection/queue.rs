//! The control retransmission queue
//!
//! Unacknowledged control packets, ordered by sequence number. Only one
//! control packet is normally in flight at a time: a new control intent
//! (for example a migration request) replaces whatever was queued rather
//! than appending, so the queue discipline is replace-on-push and
//! prefix-drain on acknowledgement. The head's sequence number defines
//! `snd.una`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::seq::after;
use crate::packet::ControlFlags;

/// One control packet awaiting acknowledgement
#[derive(Debug, Clone)]
pub(crate) struct SentControl {
    pub(crate) verno: u32,
    pub(crate) flags: ControlFlags,
    /// Attach a Connection extension despite the SYN bit being clear
    pub(crate) conn_ack: bool,
    /// Transport payload riding on this control packet
    pub(crate) payload: Bytes,
    /// Time of the most recent transmission
    pub(crate) when: Instant,
    /// Set once the packet has been retransmitted; suppresses RTT sampling
    pub(crate) retransmitted: bool,
}

#[derive(Debug, Default)]
pub(crate) struct ControlQueue {
    queue: VecDeque<SentControl>,
}

/// Result of draining acknowledged packets
#[derive(Debug, Default)]
pub(crate) struct Cleaned {
    /// Number of packets removed
    pub(crate) removed: usize,
    /// Round-trip sample from the newest acknowledged packet that was never
    /// retransmitted
    pub(crate) rtt_sample: Option<Duration>,
}

impl ControlQueue {
    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn head_mut(&mut self) -> Option<&mut SentControl> {
        self.queue.front_mut()
    }

    /// Sequence number of the oldest unacknowledged packet
    pub(crate) fn una(&self) -> Option<u32> {
        self.queue.front().map(|ctrl| ctrl.verno)
    }

    /// Queue a control packet, discarding anything still outstanding
    ///
    /// Control packets override each other so that, for example, a migration
    /// request is not starved by an unacknowledged earlier control packet.
    pub(crate) fn push_replacing(&mut self, ctrl: SentControl) {
        self.queue.clear();
        self.queue.push_back(ctrl);
    }

    /// Remove every packet acknowledged by `ackno`
    ///
    /// A packet is acknowledged when its sequence number is strictly before
    /// `ackno`. Retransmitted packets never contribute an RTT sample.
    pub(crate) fn clean(&mut self, ackno: u32, now: Instant) -> Cleaned {
        let mut cleaned = Cleaned::default();
        while let Some(head) = self.queue.front() {
            if !after(ackno, head.verno) {
                break;
            }
            let head = self.queue.pop_front().unwrap();
            if !head.retransmitted {
                cleaned.rtt_sample = Some(now.saturating_duration_since(head.when));
            }
            cleaned.removed += 1;
        }
        cleaned
    }
}
