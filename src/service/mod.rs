//! The service table
//!
//! A process-wide registry mapping service-identifier prefixes to weighted,
//! prioritized sets of resolution targets: local flows to demultiplex onto,
//! addresses to forward to, or policy actions (delay, drop). Lookups are
//! longest-prefix matches. The table performs no I/O; the endpoint and the
//! per-flow transmit path query it for every packet that cannot be
//! demultiplexed directly on a flow identifier.
//!
//! Structural changes serialize on a table-wide lock; each entry guards its
//! own target-set list with a separate lock so that statistics updates and
//! resolutions on one entry never block lookups of others. Entries are
//! shared (`Arc`), so a held handle stays valid after the entry has been
//! unlinked from the table.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::{cmp, fmt};

use thiserror::Error;
use tracing::{debug, trace};

use crate::endpoint::FlowHandle;
use crate::{DeviceId, Protocol, ServiceId};

mod iter;
mod trie;

pub use iter::{ResolveMode, ServiceIter};
use trie::Trie;

/// Target-set flag: resolve to every member of the set instead of sampling
/// one
pub const MULTICAST: u16 = 0x1;

/// Reference to a local flow held by a `Demux` target
///
/// The handle is validated against the endpoint's live-flow table before
/// use; the socket it names may close independently of the service table.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SocketRef {
    /// Handle of the listening or datagram flow packets demultiplex onto
    pub handle: FlowHandle,
    /// Transport protocol served by that flow
    pub protocol: Protocol,
}

/// One concrete resolution outcome for a service identifier
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Target {
    /// Deliver locally to a flow
    Demux(SocketRef),
    /// Forward to an address via a device
    Forward {
        /// Next-hop address
        addr: Ipv4Addr,
        /// Output interface
        device: DeviceId,
    },
    /// Queue externally for later re-resolution
    Delay,
    /// Discard
    Drop,
}

/// Key identifying one target within an entry for removal or modification
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TargetKey {
    /// The demux target for this protocol (any protocol if `None`)
    Demux(Option<Protocol>),
    /// The forward target with this destination
    Forward(Ipv4Addr),
}

impl TargetKey {
    fn matches(&self, target: &Target) -> bool {
        match (self, target) {
            (Self::Demux(proto), Target::Demux(sock)) => {
                proto.map_or(true, |p| p == sock.protocol)
            }
            (Self::Forward(addr), Target::Forward { addr: dst, .. }) => addr == dst,
            _ => false,
        }
    }
}

#[derive(Debug)]
struct TargetEntry {
    target: Target,
    weight: u32,
    packets_resolved: AtomicU64,
    bytes_resolved: AtomicU64,
    packets_dropped: AtomicU64,
    bytes_dropped: AtomicU64,
}

impl TargetEntry {
    fn new(target: Target, weight: u32) -> Self {
        Self {
            target,
            weight,
            packets_resolved: AtomicU64::new(0),
            bytes_resolved: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            bytes_dropped: AtomicU64::new(0),
        }
    }
}

/// A set of targets sharing one priority
///
/// `normalizer` is the running sum of the members' weights and is re-derived
/// on every add and remove; the anycast draw samples uniformly from
/// `[0, normalizer)`.
#[derive(Debug)]
pub struct TargetSet {
    flags: u16,
    priority: u32,
    normalizer: u32,
    targets: Vec<TargetEntry>,
}

impl TargetSet {
    fn new(flags: u16, priority: u32) -> Self {
        Self {
            flags,
            priority,
            normalizer: 0,
            targets: Vec::new(),
        }
    }

    /// Flags of this set
    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// Priority of this set; higher resolves first
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Sum of the weights of the live members
    pub fn normalizer(&self) -> u32 {
        self.normalizer
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether the set has no members
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    fn push(&mut self, entry: TargetEntry) {
        self.normalizer += entry.weight;
        self.targets.push(entry);
    }

    fn remove_at(&mut self, idx: usize) -> TargetEntry {
        let entry = self.targets.remove(idx);
        self.normalizer -= entry.weight;
        entry
    }
}

/// Errors returned by service table operations
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum ServiceError {
    /// A demux target for this protocol is already registered
    #[error("service already has a local target for this protocol")]
    AddressInUse,
    /// No entry exists for the given prefix, or no target matched the key
    #[error("no matching service entry")]
    NotFound,
    /// The prefix length exceeds the identifier width
    #[error("invalid prefix length")]
    InvalidPrefix,
}

/// Which entries a lookup may return
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MatchMode {
    /// Only entries with a demux target
    Local,
    /// Only entries with a forward target
    Global,
    /// The stored prefix length must equal this value exactly
    Exact(usize),
    /// Any entry
    Any,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    packets_resolved: AtomicU64,
    bytes_resolved: AtomicU64,
    packets_dropped: AtomicU64,
    bytes_dropped: AtomicU64,
}

impl Counters {
    pub(crate) fn add_resolved(&self, packets: u64, bytes: u64) {
        self.packets_resolved.fetch_add(packets, Ordering::Relaxed);
        self.bytes_resolved.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_dropped(&self, packets: u64, bytes: u64) {
        self.packets_dropped.fetch_add(packets, Ordering::Relaxed);
        self.bytes_dropped.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// An entry of the service table: the target sets registered for one
/// `(prefix, prefix_len)` pair
///
/// Sets are kept sorted by descending priority; priorities are unique within
/// an entry. No empty set persists, and an entry whose last set is removed is
/// unlinked from the table.
#[derive(Debug)]
pub struct ServiceEntry {
    srvid: ServiceId,
    prefix_len: usize,
    sets: RwLock<Vec<TargetSet>>,
    counters: Counters,
    table: Arc<Counters>,
}

impl ServiceEntry {
    fn new(srvid: ServiceId, prefix_len: usize, table: Arc<Counters>) -> Self {
        Self {
            srvid,
            prefix_len,
            sets: RwLock::new(Vec::new()),
            counters: Counters::default(),
            table,
        }
    }

    /// The service identifier prefix this entry is stored under
    pub fn service_id(&self) -> &ServiceId {
        &self.srvid
    }

    /// Length in bits of the stored prefix
    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    /// Snapshot of this entry's resolved/dropped counters as
    /// `(packets_resolved, bytes_resolved, packets_dropped, bytes_dropped)`
    pub fn stats(&self) -> (u64, u64, u64, u64) {
        (
            self.counters.packets_resolved.load(Ordering::Relaxed),
            self.counters.bytes_resolved.load(Ordering::Relaxed),
            self.counters.packets_dropped.load(Ordering::Relaxed),
            self.counters.bytes_dropped.load(Ordering::Relaxed),
        )
    }

    fn find_target(
        sets: &[TargetSet],
        key: &TargetKey,
    ) -> Option<(usize, usize)> {
        for (si, set) in sets.iter().enumerate() {
            for (ti, entry) in set.targets.iter().enumerate() {
                if key.matches(&entry.target) {
                    return Some((si, ti));
                }
            }
        }
        None
    }

    fn has_demux(&self) -> bool {
        let sets = self.sets.read().unwrap();
        Self::find_target(&sets, &TargetKey::Demux(None)).is_some()
    }

    fn has_forward(&self) -> bool {
        let sets = self.sets.read().unwrap();
        sets.iter()
            .any(|s| s.targets.iter().any(|t| matches!(t.target, Target::Forward { .. })))
    }

    fn is_empty(&self) -> bool {
        self.sets.read().unwrap().is_empty()
    }

    /// Insert or merge a target; returns the number of targets added
    fn add_target(
        &self,
        flags: u16,
        priority: u32,
        weight: u32,
        target: Target,
    ) -> Result<usize, ServiceError> {
        let mut sets = self.sets.write().unwrap();
        let key = match target {
            Target::Demux(sock) => Some(TargetKey::Demux(Some(sock.protocol))),
            Target::Forward { addr, .. } => Some(TargetKey::Forward(addr)),
            _ => None,
        };
        if let Some(key) = key {
            if let Some((si, ti)) = Self::find_target(&sets, &key) {
                return match sets[si].targets[ti].target {
                    Target::Demux(_) => Err(ServiceError::AddressInUse),
                    _ => {
                        debug!(service = %self.srvid, "identical target already registered");
                        Ok(0)
                    }
                };
            }
        }

        let entry = TargetEntry::new(target, weight);
        match sets.iter_mut().find(|s| s.priority == priority) {
            Some(set) => set.push(entry),
            None => {
                let mut set = TargetSet::new(flags, priority);
                set.push(entry);
                // Highest priority first.
                let pos = sets
                    .iter()
                    .position(|s| s.priority < priority)
                    .unwrap_or(sets.len());
                sets.insert(pos, set);
            }
        }
        Ok(1)
    }

    /// Remove the target matching `key`; empty sets are freed immediately
    fn remove_target(&self, key: &TargetKey) -> Result<(), ServiceError> {
        let mut sets = self.sets.write().unwrap();
        let (si, ti) = Self::find_target(&sets, key).ok_or(ServiceError::NotFound)?;
        sets[si].remove_at(ti);
        if sets[si].is_empty() {
            sets.remove(si);
        }
        Ok(())
    }

    /// Re-weight or re-home an existing target
    fn modify_target(
        &self,
        flags: u16,
        priority: u32,
        weight: u32,
        key: &TargetKey,
    ) -> Result<(), ServiceError> {
        let mut sets = self.sets.write().unwrap();
        let (si, ti) = Self::find_target(&sets, key).ok_or(ServiceError::NotFound)?;
        if sets[si].priority == priority {
            let set = &mut sets[si];
            set.normalizer -= set.targets[ti].weight;
            set.targets[ti].weight = weight;
            set.normalizer += weight;
            set.flags = flags;
            return Ok(());
        }
        let mut entry = sets[si].remove_at(ti);
        if sets[si].is_empty() {
            sets.remove(si);
        }
        entry.weight = weight;
        match sets.iter_mut().find(|s| s.priority == priority) {
            Some(set) => set.push(entry),
            None => {
                let mut set = TargetSet::new(flags, priority);
                set.push(entry);
                let pos = sets
                    .iter()
                    .position(|s| s.priority < priority)
                    .unwrap_or(sets.len());
                sets.insert(pos, set);
            }
        }
        Ok(())
    }

    /// Remove every forward target bound to `device`; returns the count
    fn remove_by_device(&self, device: DeviceId) -> usize {
        let mut sets = self.sets.write().unwrap();
        let mut removed = 0;
        sets.retain_mut(|set| {
            let before = set.targets.len();
            let mut i = 0;
            while i < set.targets.len() {
                let dead = matches!(
                    set.targets[i].target,
                    Target::Forward { device: dev, .. } if dev == device
                );
                if dead {
                    set.remove_at(i);
                } else {
                    i += 1;
                }
            }
            removed += before - set.targets.len();
            !set.is_empty()
        });
        removed
    }

    fn fmt_targets(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sets = self.sets.read().unwrap();
        for set in sets.iter() {
            for entry in &set.targets {
                writeln!(
                    f,
                    "{:<24} {:<5} {:<5} {:<5} {:<6} {:<10} {:<10} {:?}",
                    self.srvid,
                    self.prefix_len,
                    set.flags,
                    set.priority,
                    entry.weight,
                    entry.packets_resolved.load(Ordering::Relaxed),
                    entry.packets_dropped.load(Ordering::Relaxed),
                    entry.target,
                )?;
            }
        }
        Ok(())
    }
}

/// Aggregate statistics of a [`ServiceTable`]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct TableStats {
    /// Number of distinct `(prefix, prefix_len)` entries
    pub services: usize,
    /// Total number of registered targets
    pub instances: usize,
    /// Packets attributed to a resolution
    pub packets_resolved: u64,
    /// Bytes attributed to a resolution
    pub bytes_resolved: u64,
    /// Packets dropped during resolution
    pub packets_dropped: u64,
    /// Bytes dropped during resolution
    pub bytes_dropped: u64,
}

struct TableInner {
    tree: Trie<Arc<ServiceEntry>>,
    instances: usize,
}

/// Prefix-keyed registry mapping service identifiers to resolution targets
///
/// Shared process-wide: clone an `Arc<ServiceTable>` into every endpoint and
/// connection that resolves through it.
pub struct ServiceTable {
    inner: RwLock<TableInner>,
    counters: Arc<Counters>,
}

impl Default for ServiceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TableInner {
                tree: Trie::new(),
                instances: 0,
            }),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Register a target under `(srvid, prefix_len)`
    ///
    /// Creates the entry if none exists for this exact prefix. Weight 0 is
    /// normalized to 1. Adding a second demux target for the same protocol
    /// fails with [`ServiceError::AddressInUse`]; adding an identical forward
    /// target is a silent no-op. Returns the number of targets added (0 or
    /// 1).
    pub fn add(
        &self,
        srvid: &ServiceId,
        prefix_len: usize,
        flags: u16,
        priority: u32,
        weight: u32,
        target: Target,
    ) -> Result<usize, ServiceError> {
        if prefix_len > ServiceId::BITS {
            return Err(ServiceError::InvalidPrefix);
        }
        let weight = cmp::max(weight, 1);
        let mut inner = self.inner.write().unwrap();
        let added = match inner.tree.get(srvid, prefix_len) {
            Some(entry) => entry.add_target(flags, priority, weight, target)?,
            None => {
                let entry = Arc::new(ServiceEntry::new(
                    *srvid,
                    prefix_len,
                    self.counters.clone(),
                ));
                let added = entry.add_target(flags, priority, weight, target)?;
                inner.tree.insert(srvid, prefix_len, entry);
                trace!(service = %srvid, prefix_len, "new service entry");
                added
            }
        };
        inner.instances += added;
        Ok(added)
    }

    /// Remove the whole entry stored at `(srvid, prefix_len)`
    pub fn remove(&self, srvid: &ServiceId, prefix_len: usize) -> Result<(), ServiceError> {
        let mut inner = self.inner.write().unwrap();
        let entry = inner
            .tree
            .remove(srvid, prefix_len)
            .ok_or(ServiceError::NotFound)?;
        let count: usize = entry.sets.read().unwrap().iter().map(|s| s.len()).sum();
        inner.instances -= count;
        Ok(())
    }

    /// Remove the target matching `key` from the entry at
    /// `(srvid, prefix_len)`; the entry is unlinked if it becomes empty
    pub fn remove_target(
        &self,
        srvid: &ServiceId,
        prefix_len: usize,
        key: &TargetKey,
    ) -> Result<(), ServiceError> {
        let mut inner = self.inner.write().unwrap();
        let entry = inner
            .tree
            .get(srvid, prefix_len)
            .ok_or(ServiceError::NotFound)?
            .clone();
        entry.remove_target(key)?;
        inner.instances -= 1;
        if entry.is_empty() {
            inner.tree.remove(srvid, prefix_len);
        }
        Ok(())
    }

    /// Re-weight or re-home the target matching `key`
    pub fn modify(
        &self,
        srvid: &ServiceId,
        prefix_len: usize,
        flags: u16,
        priority: u32,
        weight: u32,
        key: &TargetKey,
    ) -> Result<(), ServiceError> {
        let weight = cmp::max(weight, 1);
        let inner = self.inner.read().unwrap();
        let entry = inner
            .tree
            .get(srvid, prefix_len)
            .ok_or(ServiceError::NotFound)?;
        entry.modify_target(flags, priority, weight, key)
    }

    /// Remove every forward target bound to `device` from the whole table
    ///
    /// Used on interface down. Entries left with no targets are unlinked.
    /// Returns the number of targets removed.
    pub fn remove_by_device(&self, device: DeviceId) -> usize {
        let mut inner = self.inner.write().unwrap();
        let mut removed = 0;
        inner.tree.for_each(|entry| {
            removed += entry.remove_by_device(device);
        });
        if removed > 0 {
            inner.tree.retain(|entry| !entry.is_empty());
            inner.instances -= removed;
            debug!(%device, removed, "removed targets for downed device");
        }
        removed
    }

    /// Longest-prefix lookup
    ///
    /// The returned handle remains valid after the entry is removed from the
    /// table.
    pub fn find(&self, srvid: &ServiceId, mode: MatchMode) -> Option<Arc<ServiceEntry>> {
        let inner = self.inner.read().unwrap();
        let (entry, bits) = inner.tree.longest_match(srvid, |entry| match mode {
            MatchMode::Local => entry.has_demux(),
            MatchMode::Global => entry.has_forward(),
            MatchMode::Exact(_) | MatchMode::Any => true,
        })?;
        if let MatchMode::Exact(len) = mode {
            if bits != len {
                return None;
            }
        }
        Some(entry.clone())
    }

    /// Find the local flow serving `srvid` for `protocol`
    ///
    /// `None` for the protocol matches a demux target of any protocol.
    pub fn find_socket(
        &self,
        srvid: &ServiceId,
        protocol: Option<Protocol>,
    ) -> Option<SocketRef> {
        let entry = self.find(srvid, MatchMode::Local)?;
        let sets = entry.sets.read().unwrap();
        let (si, ti) = ServiceEntry::find_target(&sets, &TargetKey::Demux(protocol))?;
        match sets[si].targets[ti].target {
            Target::Demux(sock) => Some(sock),
            _ => unreachable!("demux key matched non-demux target"),
        }
    }

    /// Account packets that could not be attributed to any entry
    ///
    /// Only drops are recorded at the table level.
    pub fn inc_stats(&self, packets: i64, bytes: i64) {
        if packets < 0 {
            self.counters.add_dropped((-packets) as u64, (-bytes) as u64);
        }
    }

    /// Snapshot of the aggregate table statistics
    pub fn stats(&self) -> TableStats {
        let inner = self.inner.read().unwrap();
        TableStats {
            services: inner.tree.len(),
            instances: inner.instances,
            packets_resolved: self.counters.packets_resolved.load(Ordering::Relaxed),
            bytes_resolved: self.counters.bytes_resolved.load(Ordering::Relaxed),
            packets_dropped: self.counters.packets_dropped.load(Ordering::Relaxed),
            bytes_dropped: self.counters.bytes_dropped.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for ServiceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        writeln!(
            f,
            "services: {} instances: {} resolved: {}/{} dropped: {}/{}",
            stats.services,
            stats.instances,
            stats.packets_resolved,
            stats.bytes_resolved,
            stats.packets_dropped,
            stats.bytes_dropped,
        )?;
        writeln!(
            f,
            "{:<24} {:<5} {:<5} {:<5} {:<6} {:<10} {:<10} {}",
            "prefix", "bits", "flags", "prio", "weight", "resolved", "dropped", "target(s)",
        )?;
        let inner = self.inner.read().unwrap();
        let mut result = Ok(());
        inner.tree.for_each(|entry| {
            if result.is_ok() {
                result = entry.fmt_targets(f);
            }
        });
        result
    }
}
