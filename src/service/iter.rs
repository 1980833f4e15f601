//! Iteration over a service entry's resolved targets
//!
//! Resolution operates on the highest-priority target set only. In anycast
//! mode a single target is drawn by weighted random sample; in the other
//! modes the set is walked in list order. The iterator holds the entry's
//! read lock for its entire lifetime, so callers must not block while one is
//! live.

use std::sync::RwLockReadGuard;

use rand::RngCore;

use super::{ServiceEntry, Target, TargetSet, MULTICAST};

/// How targets are selected from a service entry
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResolveMode {
    /// Pick exactly one target by weighted random sample, unless the set is
    /// multicast, in which case every target is returned
    Anycast,
    /// Return every target of the highest-priority set in list order
    All,
    /// Like `All`, restricted to demux targets
    DemuxOnly,
    /// Like `All`, restricted to forward targets
    ForwardOnly,
}

impl ServiceEntry {
    /// Begin resolving this entry
    ///
    /// `rng` supplies the anycast sample; it is drawn at most once, during
    /// this call.
    pub fn resolve<'a>(&'a self, mode: ResolveMode, rng: &mut impl RngCore) -> ServiceIter<'a> {
        let sets = self.sets.read().unwrap();
        let schedule = match sets.first() {
            None => Vec::new(),
            Some(set) => match mode {
                ResolveMode::Anycast if set.flags & MULTICAST == 0 => {
                    sample_weighted(set, rng).into_iter().collect()
                }
                ResolveMode::Anycast | ResolveMode::All => (0..set.targets.len()).collect(),
                ResolveMode::DemuxOnly => filtered(set, |t| matches!(t, Target::Demux(_))),
                ResolveMode::ForwardOnly => {
                    filtered(set, |t| matches!(t, Target::Forward { .. }))
                }
            },
        };
        ServiceIter {
            entry: self,
            sets,
            schedule,
            pos: 0,
            last: None,
        }
    }
}

fn filtered(set: &TargetSet, f: impl Fn(&Target) -> bool) -> Vec<usize> {
    set.targets
        .iter()
        .enumerate()
        .filter(|(_, t)| f(&t.target))
        .map(|(i, _)| i)
        .collect()
}

/// Weighted random selection in 32.32 fixed point
///
/// The sample is scaled by the set's normalizer and compared against the
/// running weight sum; the first target whose cumulative weight reaches the
/// threshold is selected. The small bias introduced by the integer
/// truncation is implementation-defined.
fn sample_weighted(set: &TargetSet, rng: &mut impl RngCore) -> Option<usize> {
    const SAMPLE_SHIFT: u32 = 32;
    if set.targets.is_empty() {
        return None;
    }
    let sample = u64::from(rng.next_u32()) * u64::from(set.normalizer);
    let mut sumweight = 0u64;
    for (i, entry) in set.targets.iter().enumerate() {
        sumweight += u64::from(entry.weight) << SAMPLE_SHIFT;
        if sample <= sumweight {
            return Some(i);
        }
    }
    Some(set.targets.len() - 1)
}

/// A stateful cursor over one resolution of a service entry
///
/// Holds the entry's read lock from creation until drop. Statistics recorded
/// through [`ServiceIter::inc_stats`] are attributed to the most recently
/// returned target and propagate to the entry- and table-level aggregates.
pub struct ServiceIter<'a> {
    entry: &'a ServiceEntry,
    sets: RwLockReadGuard<'a, Vec<TargetSet>>,
    schedule: Vec<usize>,
    pos: usize,
    last: Option<usize>,
}

impl ServiceIter<'_> {
    /// The next resolved target, or `None` at end of sequence
    pub fn next(&mut self) -> Option<Target> {
        let idx = *self.schedule.get(self.pos)?;
        self.pos += 1;
        self.last = Some(idx);
        Some(self.sets[0].targets[idx].target.clone())
    }

    /// Whether another target remains
    pub fn has_next(&self) -> bool {
        self.pos < self.schedule.len()
    }

    /// Priority of the set being iterated
    pub fn priority(&self) -> u32 {
        self.sets.first().map_or(0, |s| s.priority)
    }

    /// Flags of the set being iterated
    pub fn flags(&self) -> u16 {
        self.sets.first().map_or(0, |s| s.flags)
    }

    /// Attribute traffic to the most recently returned target
    ///
    /// Positive packet counts are recorded as resolved; negative counts are
    /// recorded as drops (with `bytes` interpreted likewise). Drops are
    /// recorded at the entry and table level even when no target was
    /// returned.
    pub fn inc_stats(&self, packets: i64, bytes: i64) {
        use std::sync::atomic::Ordering;
        if packets > 0 {
            let Some(idx) = self.last else { return };
            let target = &self.sets[0].targets[idx];
            target
                .packets_resolved
                .fetch_add(packets as u64, Ordering::Relaxed);
            target
                .bytes_resolved
                .fetch_add(bytes as u64, Ordering::Relaxed);
            self.entry.counters.add_resolved(packets as u64, bytes as u64);
            self.entry.table.add_resolved(packets as u64, bytes as u64);
        } else {
            let (packets, bytes) = ((-packets) as u64, (-bytes) as u64);
            if let Some(idx) = self.last {
                let target = &self.sets[0].targets[idx];
                target.packets_dropped.fetch_add(packets, Ordering::Relaxed);
                target.bytes_dropped.fetch_add(bytes, Ordering::Relaxed);
            }
            self.entry.counters.add_dropped(packets, bytes);
            self.entry.table.add_dropped(packets, bytes);
        }
    }
}
