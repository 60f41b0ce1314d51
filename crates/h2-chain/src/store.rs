//! Chain allocation, reference counting, last-drop disposition and insertion.

use crate::arena::ChainArena;
use crate::chain::{Chain, ChainBytes, ChainFlags, ChainId, ChainState, ChildEntry, Lifecycle};
use crate::lru::LruList;
use h2_block::DioCache;
use h2_error::ErrorFlags;
use h2_ondisk::{Blockref, BrefType, live_zero};
use h2_types::HAMMER2_BLOCKREF_BYTES;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Unreferenced chains kept for reuse before the oldest are freed.
    /// Zero disables caching.
    pub lru_limit: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self { lru_limit: 4096 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChainStats {
    pub live: usize,
    pub lru: usize,
    pub allocated: u64,
    pub freed: u64,
    pub loads: u64,
    pub check_failures: u64,
    pub io_errors: u64,
    pub lru_evictions: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) allocated: AtomicU64,
    pub(crate) freed: AtomicU64,
    pub(crate) loads: AtomicU64,
    pub(crate) check_failures: AtomicU64,
    pub(crate) io_errors: AtomicU64,
    pub(crate) lru_evictions: AtomicU64,
}

/// Per-filesystem chain topology cache.
#[derive(Debug)]
pub struct ChainStore {
    arena: ChainArena,
    pub(crate) dio: Arc<DioCache>,
    lru: Mutex<LruList>,
    config: ChainConfig,
    pub(crate) counters: Counters,
}

/// What a parent must do after one of its children was unlinked.
enum Cascade {
    Done,
    Parent(Arc<Chain>),
}

impl ChainStore {
    #[must_use]
    pub fn new(dio: Arc<DioCache>, config: ChainConfig) -> Self {
        Self {
            arena: ChainArena::default(),
            dio,
            lru: Mutex::new(LruList::default()),
            config,
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn dio(&self) -> &Arc<DioCache> {
        &self.dio
    }

    #[must_use]
    pub fn config(&self) -> ChainConfig {
        self.config
    }

    /// Resolve a handle. A stale handle is a caller bug.
    #[must_use]
    pub fn get(&self, id: ChainId) -> Arc<Chain> {
        self.arena
            .get(id)
            .unwrap_or_else(|| panic!("stale chain handle {id}"))
    }

    #[must_use]
    pub fn try_get(&self, id: ChainId) -> Option<Arc<Chain>> {
        self.arena.get(id)
    }

    #[must_use]
    pub fn stats(&self) -> ChainStats {
        ChainStats {
            live: self.arena.live(),
            lru: self.lru.lock().len(),
            allocated: self.counters.allocated.load(Ordering::Relaxed),
            freed: self.counters.freed.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            check_failures: self.counters.check_failures.load(Ordering::Relaxed),
            io_errors: self.counters.io_errors.load(Ordering::Relaxed),
            lru_evictions: self.counters.lru_evictions.load(Ordering::Relaxed),
        }
    }

    /// Chains currently parked on the LRU, oldest first.
    #[must_use]
    pub fn lru_snapshot(&self) -> Vec<ChainId> {
        self.lru.lock().ids()
    }

    /// Every live chain, in arena order.
    #[must_use]
    pub fn live_chains(&self) -> Vec<Arc<Chain>> {
        self.arena.snapshot()
    }

    // ── Allocation ──────────────────────────────────────────────────────────

    /// Allocate an unlinked chain for `bref` holding one reference.
    pub fn alloc(&self, bref: Blockref) -> ChainId {
        let chain = self.arena.allocate(|id| Chain::new(id, bref));
        self.counters.allocated.fetch_add(1, Ordering::Relaxed);
        trace!(
            target: "h2::chain",
            chain = %chain.id(),
            btype = %bref.btype,
            key = bref.key,
            keybits = bref.keybits,
            "chain_alloc"
        );
        chain.id()
    }

    /// Allocate a root chain whose blockset is embedded in the volume
    /// header. The payload is resolved up front and survives every unlock.
    pub fn alloc_root(&self, bref: Blockref, blockset: &[Blockref]) -> ChainId {
        let id = self.alloc(bref);
        let chain = self.get(id);
        let mut raw = vec![0_u8; blockset.len() * HAMMER2_BLOCKREF_BYTES];
        for (idx, entry) in blockset.iter().enumerate() {
            entry.write_to(&mut raw[idx * HAMMER2_BLOCKREF_BYTES..]);
        }
        let brefs: Arc<[Blockref]> = Arc::from(blockset.to_vec());
        let mut payload = chain.payload.lock();
        payload.data = Some(ChainBytes::embedded(Arc::from(raw)));
        payload.live_zero = live_zero(&brefs);
        payload.brefs = Some(brefs);
        drop(payload);
        chain.set_flags(
            ChainFlags::EMBEDDED | ChainFlags::TESTEDGOOD | ChainFlags::COUNTEDBREFS,
        );
        debug!(target: "h2::chain", chain = %id, btype = %bref.btype, "chain_alloc_root");
        id
    }

    // ── References ──────────────────────────────────────────────────────────

    pub fn ref_chain(&self, id: ChainId) {
        let chain = self.get(id);
        let mut st = chain.state.lock();
        self.ref_locked(&chain, &mut st);
    }

    /// Take a reference with `st` already locked.
    pub(crate) fn ref_locked(&self, chain: &Chain, st: &mut ChainState) {
        assert!(
            st.life != Lifecycle::Freed,
            "reference taken on freed chain {}",
            chain.id()
        );
        st.refs += 1;
        if st.refs == 1 {
            if let Some(seq) = st.lru_seq.take() {
                self.lru.lock().remove(seq);
                chain.clear_flags(ChainFlags::ONLRU);
            }
            st.life = Lifecycle::Referenced;
        }
    }

    /// Release a reference. At zero the chain is cached, pinned or freed.
    pub fn drop_chain(&self, id: ChainId) {
        let chain = self.get(id);
        let mut st = chain.state.lock();
        assert!(st.refs > 0, "drop of unreferenced chain {id}");
        st.refs -= 1;
        if st.refs > 0 {
            return;
        }
        drop(st);
        debug_assert_eq!(chain.lockcnt(), 0, "chain {id} dropped to zero while locked");
        self.lastdrop(chain);
        self.lru_enforce();
    }

    fn lastdrop(&self, start: Arc<Chain>) {
        let mut next = Some(start);
        while let Some(chain) = next.take() {
            if let Cascade::Parent(parent) = self.lastdrop_one(&chain) {
                next = Some(parent);
            }
        }
    }

    fn lastdrop_one(&self, chain: &Arc<Chain>) -> Cascade {
        loop {
            let mut st = chain.state.lock();
            if st.refs > 0
                || !matches!(st.life, Lifecycle::Referenced | Lifecycle::PinnedByChildren)
            {
                return Cascade::Done;
            }
            if !st.children.is_empty() {
                st.life = Lifecycle::PinnedByChildren;
                trace!(
                    target: "h2::chain",
                    chain = %chain.id(),
                    children = st.children.len(),
                    "chain_pinned"
                );
                return Cascade::Done;
            }
            let Some(parent_id) = st.parent else {
                st.life = Lifecycle::Freed;
                drop(st);
                self.free_chain(chain);
                return Cascade::Done;
            };
            if self.config.lru_limit > 0 && chain.btype() != BrefType::Data {
                let seq = self.lru.lock().push(chain.id());
                st.lru_seq = Some(seq);
                st.life = Lifecycle::CachedUnreferenced;
                chain.set_flags(ChainFlags::ONLRU);
                trace!(target: "h2::chain", chain = %chain.id(), seq, "chain_lru_park");
                return Cascade::Done;
            }
            drop(st);

            // The parent cannot go away while this chain is still linked.
            let parent = self.get(parent_id);
            let mut pst = parent.state.lock();
            let mut st = chain.state.lock();
            if st.refs > 0 || st.parent != Some(parent_id) || !st.children.is_empty() {
                continue;
            }
            Self::unlink_locked(chain, &mut st, &mut pst);
            st.life = Lifecycle::Freed;
            let orphaned = pst.refs == 0 && pst.children.is_empty();
            drop(st);
            drop(pst);
            self.free_chain(chain);
            return if orphaned {
                Cascade::Parent(parent)
            } else {
                Cascade::Done
            };
        }
    }

    fn unlink_locked(chain: &Chain, st: &mut ChainState, pst: &mut ChainState) {
        pst.children.remove(&chain.key());
        pst.generation += 1;
        st.parent = None;
        chain.clear_flags(ChainFlags::ONRBTREE);
    }

    fn free_chain(&self, chain: &Chain) {
        let mut payload = chain.payload.lock();
        payload.data = None;
        payload.brefs = None;
        drop(payload);
        chain.clear_flags(ChainFlags::ALLOCATED | ChainFlags::ONLRU);
        chain.set_flags(ChainFlags::DESTROY);
        self.arena.release(chain.id());
        self.counters.freed.fetch_add(1, Ordering::Relaxed);
        trace!(
            target: "h2::chain",
            chain = %chain.id(),
            btype = %chain.btype(),
            key = chain.key(),
            "chain_free"
        );
    }

    // ── LRU ─────────────────────────────────────────────────────────────────

    fn lru_enforce(&self) {
        loop {
            let victim = {
                let mut lru = self.lru.lock();
                if lru.len() <= self.config.lru_limit {
                    return;
                }
                lru.pop_oldest()
            };
            let Some((seq, id)) = victim else {
                return;
            };
            let Some(chain) = self.arena.get(id) else {
                continue;
            };
            if let Cascade::Parent(parent) = self.evict(&chain, seq) {
                self.lastdrop(parent);
            }
        }
    }

    /// Free an LRU victim if it is still unreferenced and parked under `seq`.
    fn evict(&self, chain: &Arc<Chain>, seq: u64) -> Cascade {
        let parent_id = {
            let st = chain.state.lock();
            if st.lru_seq != Some(seq) || st.life != Lifecycle::CachedUnreferenced {
                return Cascade::Done;
            }
            st.parent
        };
        let Some(parent_id) = parent_id else {
            return Cascade::Done;
        };
        let parent = self.get(parent_id);
        let mut pst = parent.state.lock();
        let mut st = chain.state.lock();
        if st.lru_seq != Some(seq)
            || st.refs != 0
            || st.life != Lifecycle::CachedUnreferenced
            || st.parent != Some(parent_id)
            || !st.children.is_empty()
        {
            return Cascade::Done;
        }
        st.lru_seq = None;
        Self::unlink_locked(chain, &mut st, &mut pst);
        st.life = Lifecycle::Freed;
        let orphaned = pst.refs == 0 && pst.children.is_empty();
        drop(st);
        drop(pst);
        self.free_chain(chain);
        self.counters.lru_evictions.fetch_add(1, Ordering::Relaxed);
        if orphaned {
            Cascade::Parent(parent)
        } else {
            Cascade::Done
        }
    }

    // ── Topology ────────────────────────────────────────────────────────────

    /// Link `child` under `parent`.
    ///
    /// With `generation` set, the insert only happens if the parent's child
    /// tree has not changed since the caller sampled it; otherwise `EAGAIN`
    /// is returned and nothing is linked.
    ///
    /// # Panics
    ///
    /// Panics if the child is already linked or overlaps an existing child.
    pub fn insert(
        &self,
        parent_id: ChainId,
        child_id: ChainId,
        generation: Option<u64>,
    ) -> Result<(), ErrorFlags> {
        let parent = self.get(parent_id);
        let child = self.get(child_id);
        let mut pst = parent.state.lock();
        if generation.is_some_and(|seen| seen != pst.generation) {
            trace!(
                target: "h2::chain",
                parent = %parent_id,
                child = %child_id,
                "chain_insert_race"
            );
            return Err(ErrorFlags::EAGAIN);
        }
        let mut st = child.state.lock();
        assert!(st.parent.is_none(), "chain {child_id} is already linked");
        let key = child.key();
        let end = child.bref().key_end();
        let below = pst.children.range(..=key).next_back().map(|(_, e)| *e);
        let above = pst.children.range(key..).next().map(|(k, _)| *k);
        assert!(
            below.is_none_or(|entry| entry.end < key) && above.is_none_or(|next| next > end),
            "chain {child_id} overlaps an existing child of {parent_id}"
        );
        pst.children.insert(key, ChildEntry { end, id: child_id });
        pst.generation += 1;
        st.parent = Some(parent_id);
        child.set_flags(ChainFlags::ONRBTREE);
        Ok(())
    }
}
