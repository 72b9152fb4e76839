// src/tlb_cache.rs — bounded-capacity LRU translation cache
//
// Keyed by (StreamID, PASID, IOVA-page, SecurityState). Backed by a slab of
// intrusively linked nodes (MRU<->LRU) plus a primary HashMap and three
// secondary multi-maps, all protected by one mutex — every live entry must
// appear in all four structures, which only holds if they mutate together.
// Hit/miss counters are lock-free atomics read through an optimistic
// re-read loop in `get_atomic_statistics`.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{SMMUError, SmmuResult};
use crate::types::{page_number, PagePermissions, SecurityState, IOVA, PA, PASID, StreamID};
use crate::types::{MAX_PASID, MAX_STREAM_ID};

const DEFAULT_MAX_SIZE: usize = 1024;

/// A resolved translation as cached by the TLB. `iova` and `pa` are
/// page-base addresses (offset math is `AddressSpace`'s responsibility);
/// `timestamp` is freshness metadata supplied by the caller's monotonic
/// tick source, not interpreted by the cache itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TLBEntry {
    pub stream_id: StreamID,
    pub pasid: PASID,
    pub iova: IOVA,
    pub pa: PA,
    pub permissions: PagePermissions,
    pub security_state: SecurityState,
    pub timestamp: u64,
    pub valid: bool,
}

impl TLBEntry {
    pub fn new(
        stream_id: StreamID,
        pasid: PASID,
        iova: IOVA,
        pa: PA,
        permissions: PagePermissions,
        security_state: SecurityState,
        timestamp: u64,
    ) -> Self {
        Self {
            stream_id,
            pasid,
            iova,
            pa,
            permissions,
            security_state,
            timestamp,
            valid: true,
        }
    }
}

/// `CacheEntry` is the same shape as `TLBEntry` in this core — the original
/// kept them as separate structs only for a legacy/back-compat surface this
/// crate does not carry forward.
pub type CacheEntry = TLBEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CacheKey {
    stream_id: StreamID,
    pasid: PASID,
    iova_page: u64,
    security_state: SecurityState,
}

impl CacheKey {
    fn new(stream_id: StreamID, pasid: PASID, iova: IOVA, security_state: SecurityState) -> Self {
        Self {
            stream_id,
            pasid,
            iova_page: page_number(iova),
            security_state,
        }
    }
}

// FNV-1a-style mixing of the four key fields. The page number is already
// shifted by the time it lands here, so page-aligned clustering cannot
// collapse lookups into a single bucket.
impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = FNV_OFFSET_BASIS;
        hash ^= self.stream_id as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= self.pasid as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= self.iova_page;
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= self.security_state as u64;
        hash = hash.wrapping_mul(FNV_PRIME);

        state.write_u64(hash);
    }
}

/// Point-in-time, internally-consistent cache counters, as returned by
/// `TLBCache::get_atomic_statistics`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub total: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub max_size: usize,
}

struct Node {
    key: CacheKey,
    entry: TLBEntry,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner {
    slab: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>, // most-recently-used
    tail: Option<usize>, // least-recently-used
    len: usize,
    max_size: usize,
    index: HashMap<CacheKey, usize>,
    by_stream: HashMap<StreamID, HashSet<usize>>,
    by_stream_pasid: HashMap<(StreamID, PASID), HashSet<usize>>,
    by_security: HashMap<SecurityState, HashSet<usize>>,
}

impl Inner {
    fn new(max_size: usize) -> Self {
        Self {
            slab: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
            max_size,
            index: HashMap::new(),
            by_stream: HashMap::new(),
            by_stream_pasid: HashMap::new(),
            by_security: HashMap::new(),
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.slab[idx].as_ref().unwrap();
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.slab[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slab[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.slab[idx].as_mut().unwrap();
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.slab[h].as_mut().unwrap().prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn add_to_secondary_indices(&mut self, key: CacheKey, idx: usize) {
        self.by_stream.entry(key.stream_id).or_default().insert(idx);
        self.by_stream_pasid
            .entry((key.stream_id, key.pasid))
            .or_default()
            .insert(idx);
        self.by_security.entry(key.security_state).or_default().insert(idx);
    }

    fn remove_from_secondary_indices(&mut self, key: CacheKey, idx: usize) {
        if let Some(set) = self.by_stream.get_mut(&key.stream_id) {
            set.remove(&idx);
            if set.is_empty() {
                self.by_stream.remove(&key.stream_id);
            }
        }
        let compound = (key.stream_id, key.pasid);
        if let Some(set) = self.by_stream_pasid.get_mut(&compound) {
            set.remove(&idx);
            if set.is_empty() {
                self.by_stream_pasid.remove(&compound);
            }
        }
        if let Some(set) = self.by_security.get_mut(&key.security_state) {
            set.remove(&idx);
            if set.is_empty() {
                self.by_security.remove(&key.security_state);
            }
        }
    }

    fn alloc(&mut self, key: CacheKey, entry: TLBEntry) -> usize {
        let node = Node {
            key,
            entry,
            prev: None,
            next: None,
        };
        if let Some(idx) = self.free.pop() {
            self.slab[idx] = Some(node);
            idx
        } else {
            self.slab.push(Some(node));
            self.slab.len() - 1
        }
    }

    fn evict_lru(&mut self) {
        let Some(idx) = self.tail else { return };
        let key = self.slab[idx].as_ref().unwrap().key;
        self.remove_from_secondary_indices(key, idx);
        self.index.remove(&key);
        self.unlink(idx);
        self.slab[idx] = None;
        self.free.push(idx);
        self.len -= 1;
        log::trace!("tlb_cache: evicted stream={} pasid={}", key.stream_id, key.pasid);
    }

    fn remove_idx(&mut self, idx: usize) {
        let key = self.slab[idx].as_ref().unwrap().key;
        self.remove_from_secondary_indices(key, idx);
        self.index.remove(&key);
        self.unlink(idx);
        self.slab[idx] = None;
        self.free.push(idx);
        self.len -= 1;
    }

    fn insert_entry(&mut self, key: CacheKey, entry: TLBEntry) {
        if let Some(&idx) = self.index.get(&key) {
            self.slab[idx].as_mut().unwrap().entry = entry;
            self.move_to_front(idx);
            return;
        }

        if self.len >= self.max_size {
            self.evict_lru();
        }

        let idx = self.alloc(key, entry);
        self.push_front(idx);
        self.index.insert(key, idx);
        self.add_to_secondary_indices(key, idx);
        self.len += 1;
    }

    fn invalidate_matching(&mut self, idxs: Vec<usize>) {
        for idx in idxs {
            if self.slab[idx].is_some() {
                self.remove_idx(idx);
            }
        }
    }
}

/// Shared, thread-safe bounded LRU cache mapping
/// `(StreamID, PASID, IOVA-page, SecurityState) -> TLBEntry`.
pub struct TLBCache {
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TLBCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::new(if max_size > 0 { max_size } else { DEFAULT_MAX_SIZE })),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Looks up a translation. Moves the entry to MRU on a hit. Streams or
    /// PASIDs outside their valid ranges are rejected and counted as a
    /// miss, without consulting the cache.
    pub fn lookup_entry(
        &self,
        stream_id: StreamID,
        pasid: PASID,
        iova: IOVA,
        security_state: SecurityState,
    ) -> SmmuResult<TLBEntry> {
        if stream_id > MAX_STREAM_ID {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Err(SMMUError::InvalidStreamID);
        }
        if pasid > MAX_PASID {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Err(SMMUError::InvalidPASID);
        }

        let key = CacheKey::new(stream_id, pasid, iova, security_state);
        let mut inner = self.inner.lock().unwrap();
        match inner.index.get(&key).copied() {
            Some(idx) => {
                inner.move_to_front(idx);
                let entry = inner.slab[idx].as_ref().unwrap().entry;
                drop(inner);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(entry)
            }
            None => {
                drop(inner);
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(SMMUError::CacheEntryNotFound)
            }
        }
    }

    /// Inserts (or refreshes and promotes to MRU) a resolved translation.
    /// Evicts the LRU entry first if the cache is at capacity.
    pub fn insert(&self, entry: TLBEntry) {
        let key = CacheKey::new(entry.stream_id, entry.pasid, entry.iova, entry.security_state);
        self.inner.lock().unwrap().insert_entry(key, entry);
    }

    /// Erases exactly the matching entry, if present.
    pub fn remove(&self, stream_id: StreamID, pasid: PASID, iova: IOVA, security_state: SecurityState) {
        let key = CacheKey::new(stream_id, pasid, iova, security_state);
        let mut inner = self.inner.lock().unwrap();
        if let Some(idx) = inner.index.get(&key).copied() {
            inner.remove_idx(idx);
        }
    }

    /// Single-key invalidation; an alias of `remove`.
    pub fn invalidate(&self, stream_id: StreamID, pasid: PASID, iova: IOVA, security_state: SecurityState) {
        self.remove(stream_id, pasid, iova, security_state);
    }

    /// Invalidates every entry for `stream_id`, in time proportional to the
    /// number of matching entries via the `by_stream` secondary index.
    pub fn invalidate_stream(&self, stream_id: StreamID) {
        let mut inner = self.inner.lock().unwrap();
        let idxs: Vec<usize> = inner
            .by_stream
            .get(&stream_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        inner.invalidate_matching(idxs);
    }

    /// Invalidates every entry for the `(stream_id, pasid)` pair, via the
    /// `by_stream_pasid` secondary index.
    pub fn invalidate_pasid(&self, stream_id: StreamID, pasid: PASID) {
        let mut inner = self.inner.lock().unwrap();
        let idxs: Vec<usize> = inner
            .by_stream_pasid
            .get(&(stream_id, pasid))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        inner.invalidate_matching(idxs);
    }

    /// Invalidates every entry carrying `security_state`, via the
    /// `by_security` secondary index.
    pub fn invalidate_by_security_state(&self, security_state: SecurityState) {
        let mut inner = self.inner.lock().unwrap();
        let idxs: Vec<usize> = inner
            .by_security
            .get(&security_state)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        inner.invalidate_matching(idxs);
    }

    /// Drops every entry and every index. Hit/miss counters are preserved.
    pub fn invalidate_all(&self) {
        self.clear();
    }

    /// Drops every entry and every index. Hit/miss counters are preserved.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::new(inner.max_size);
    }

    /// Like `clear`, then zeroes the hit/miss counters too.
    pub fn reset(&self) {
        self.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Updates capacity. If the cache is currently over the new limit,
    /// evicts LRU entries until it is not.
    pub fn set_max_size(&self, max_size: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.max_size = max_size;
        while inner.len > inner.max_size {
            inner.evict_lru();
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().len
    }

    pub fn max_size(&self) -> usize {
        self.inner.lock().unwrap().max_size
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Thread-safe, internally-consistent snapshot of the cache's
    /// counters and occupancy. The `(hits, misses)` pair is obtained via an
    /// optimistic re-read loop so that a concurrent counter increment
    /// cannot be observed split across the pair.
    pub fn get_atomic_statistics(&self) -> CacheStatistics {
        let (hits, misses) = loop {
            let h1 = self.hits.load(Ordering::Relaxed);
            let m1 = self.misses.load(Ordering::Relaxed);
            let h2 = self.hits.load(Ordering::Relaxed);
            let m2 = self.misses.load(Ordering::Relaxed);
            if h1 == h2 && m1 == m2 {
                break (h1, m1);
            }
        };

        let (size, max_size) = {
            let inner = self.inner.lock().unwrap();
            (inner.len, inner.max_size)
        };

        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };

        CacheStatistics {
            hits,
            misses,
            total,
            hit_rate,
            size,
            max_size,
        }
    }
}

impl Default for TLBCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rw() -> PagePermissions {
        PagePermissions::new(true, true, false)
    }

    fn entry(stream: StreamID, pasid: PASID, iova: IOVA) -> TLBEntry {
        TLBEntry::new(stream, pasid, iova, iova + 0x1000, rw(), SecurityState::NonSecure, 0)
    }

    // 3-entry cache: touching an entry must save it from the next eviction.
    #[test]
    fn lru_evicts_the_least_recently_touched_entry() {
        let cache = TLBCache::new(3);
        let a = entry(1, 1, 0x1000_0000);
        let b = entry(1, 1, 0x2000_0000);
        let c = entry(1, 1, 0x3000_0000);
        let d = entry(1, 1, 0x4000_0000);

        cache.insert(a);
        cache.insert(b);
        cache.insert(c);
        cache.lookup_entry(1, 1, 0x1000_0000, SecurityState::NonSecure).unwrap();
        cache.insert(d);

        assert!(cache.lookup_entry(1, 1, 0x1000_0000, SecurityState::NonSecure).is_ok());
        assert!(cache.lookup_entry(1, 1, 0x3000_0000, SecurityState::NonSecure).is_ok());
        assert!(cache.lookup_entry(1, 1, 0x4000_0000, SecurityState::NonSecure).is_ok());
        assert_eq!(
            cache.lookup_entry(1, 1, 0x2000_0000, SecurityState::NonSecure),
            Err(SMMUError::CacheEntryNotFound)
        );
    }

    #[test]
    fn invalidate_stream_only_affects_its_own_stream() {
        let cache = TLBCache::new(16);
        cache.insert(entry(0x1000, 1, 0x1000_0000));
        cache.insert(entry(0x2000, 1, 0x1000_0000));
        cache.insert(entry(0x1000, 1, 0x2000_0000));

        cache.invalidate_stream(0x1000);

        assert_eq!(cache.size(), 1);
        assert!(cache
            .lookup_entry(0x2000, 1, 0x1000_0000, SecurityState::NonSecure)
            .is_ok());
        assert_eq!(
            cache.lookup_entry(0x1000, 1, 0x1000_0000, SecurityState::NonSecure),
            Err(SMMUError::CacheEntryNotFound)
        );
        assert_eq!(
            cache.lookup_entry(0x1000, 1, 0x2000_0000, SecurityState::NonSecure),
            Err(SMMUError::CacheEntryNotFound)
        );
    }

    #[test]
    fn invalidate_pasid_is_scoped_to_stream_and_pasid() {
        let cache = TLBCache::new(16);
        cache.insert(entry(1, 1, 0x1000));
        cache.insert(entry(1, 2, 0x1000));
        cache.insert(entry(2, 1, 0x1000));

        cache.invalidate_pasid(1, 1);

        assert_eq!(cache.size(), 2);
        assert!(cache.lookup_entry(1, 2, 0x1000, SecurityState::NonSecure).is_ok());
        assert!(cache.lookup_entry(2, 1, 0x1000, SecurityState::NonSecure).is_ok());
    }

    #[test]
    fn invalidate_by_security_state_only_removes_matching_entries() {
        let cache = TLBCache::new(16);
        let mut secure = entry(1, 1, 0x1000);
        secure.security_state = SecurityState::Secure;
        let mut non_secure = entry(1, 1, 0x2000);
        non_secure.security_state = SecurityState::NonSecure;

        cache.insert(secure);
        cache.insert(non_secure);
        cache.invalidate_by_security_state(SecurityState::Secure);

        assert_eq!(cache.size(), 1);
        assert!(cache.lookup_entry(1, 1, 0x2000, SecurityState::NonSecure).is_ok());
        assert_eq!(
            cache.lookup_entry(1, 1, 0x1000, SecurityState::Secure),
            Err(SMMUError::CacheEntryNotFound)
        );
    }

    #[test]
    fn invalid_stream_and_pasid_are_rejected_and_counted_as_misses() {
        let cache = TLBCache::new(4);
        assert_eq!(
            cache.lookup_entry(MAX_STREAM_ID, 0, 0x1000, SecurityState::NonSecure),
            Err(SMMUError::InvalidStreamID)
        );
        assert_eq!(
            cache.lookup_entry(0, MAX_PASID + 1, 0x1000, SecurityState::NonSecure),
            Err(SMMUError::InvalidPASID)
        );
        assert_eq!(cache.get_atomic_statistics().misses, 2);
    }

    #[test]
    fn insert_on_existing_key_updates_in_place_and_promotes() {
        let cache = TLBCache::new(2);
        cache.insert(entry(1, 1, 0x1000));
        cache.insert(entry(1, 2, 0x2000));

        let mut updated = entry(1, 1, 0x1000);
        updated.pa = 0xABCD_0000;
        cache.insert(updated);

        // Inserting an existing key must not evict anything new.
        assert_eq!(cache.size(), 2);
        let looked_up = cache.lookup_entry(1, 1, 0x1000, SecurityState::NonSecure).unwrap();
        assert_eq!(looked_up.pa, 0xABCD_0000);
    }

    #[test]
    fn set_max_size_shrinks_by_evicting_lru_entries() {
        let cache = TLBCache::new(4);
        cache.insert(entry(1, 1, 0x1000));
        cache.insert(entry(1, 1, 0x2000));
        cache.insert(entry(1, 1, 0x3000));

        cache.set_max_size(1);

        assert_eq!(cache.size(), 1);
        assert!(cache.lookup_entry(1, 1, 0x3000, SecurityState::NonSecure).is_ok());
    }

    #[test]
    fn statistics_total_matches_hits_plus_misses_and_size_never_exceeds_capacity() {
        let cache = TLBCache::new(2);
        cache.insert(entry(1, 1, 0x1000));
        cache.insert(entry(1, 1, 0x2000));
        cache.insert(entry(1, 1, 0x3000));

        let _ = cache.lookup_entry(1, 1, 0x2000, SecurityState::NonSecure);
        let _ = cache.lookup_entry(1, 1, 0x9999, SecurityState::NonSecure);

        let stats = cache.get_atomic_statistics();
        assert_eq!(stats.total, stats.hits + stats.misses);
        assert!(stats.size <= stats.max_size);
    }

    #[test]
    fn clear_drops_entries_but_keeps_counters_reset_zeroes_both() {
        let cache = TLBCache::new(4);
        cache.insert(entry(1, 1, 0x1000));
        let _ = cache.lookup_entry(1, 1, 0x1000, SecurityState::NonSecure);
        let _ = cache.lookup_entry(1, 1, 0xDEAD, SecurityState::NonSecure);

        cache.clear();
        assert_eq!(cache.size(), 0);
        assert!(cache.get_atomic_statistics().hits > 0 || cache.get_atomic_statistics().misses > 0);

        cache.reset();
        let stats = cache.get_atomic_statistics();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn remove_erases_exactly_the_matching_entry() {
        let cache = TLBCache::new(4);
        cache.insert(entry(1, 1, 0x1000));
        cache.insert(entry(1, 1, 0x2000));

        cache.remove(1, 1, 0x1000, SecurityState::NonSecure);

        assert_eq!(cache.size(), 1);
        assert!(cache.lookup_entry(1, 1, 0x2000, SecurityState::NonSecure).is_ok());
    }

    #[test]
    fn concurrent_inserts_and_lookups_stay_within_capacity() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(TLBCache::new(8));
        let mut handles = Vec::new();
        for t in 0..8u32 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                for i in 0..200u64 {
                    cache.insert(entry(t, 1, i * 0x1000));
                    let _ = cache.lookup_entry(t, 1, i * 0x1000, SecurityState::NonSecure);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let stats = cache.get_atomic_statistics();
        assert!(stats.size <= stats.max_size);
        assert_eq!(stats.total, stats.hits + stats.misses);
    }
}
