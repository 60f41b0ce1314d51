//! Keyed lookup and iteration under a parent chain.
//!
//! The caller passes its locked parent by `&mut` handle. Lookup may ascend
//! out of indirect blocks that do not enclose the requested range and
//! descends transparently into indirect blocks that overlap it, so the
//! handle can point at a different chain on return. The caller owns
//! whatever it points at and releases it with [`ChainStore::lookup_done`].
//!
//! Each level combines the parent's in-memory children with its on-media
//! blockref array. An in-memory chain wins a tie with a blockref at the same
//! key; a blockref hit is instantiated and linked, and a concurrent link of
//! the same key shows up as an `EAGAIN` insert that restarts the level.

use crate::chain::{Chain, ChainId, ChainState, ChildEntry};
use crate::io::{LockFlags, LockHow, Resolve};
use crate::store::ChainStore;
use bitflags::bitflags;
use h2_error::ErrorFlags;
use h2_ondisk::{Blockref, BrefType};
use std::sync::atomic::Ordering;
use tracing::trace;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LookupFlags: u32 {
        /// Lock parents and results shared.
        const SHARED   = 0x01;
        /// Resolve DATA chains too.
        const ALWAYS   = 0x02;
        /// Resolve nothing on the returned chain.
        const NODATA   = 0x04;
        /// Do not return a direct-data inode as its own data.
        const NODIRECT = 0x08;
        /// Return indirect blocks instead of descending into them.
        const MATCHIND = 0x10;
    }
}

/// Result of one lookup step.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup {
    /// Locked and referenced chain, or `None` when nothing matched.
    pub chain: Option<ChainId>,
    /// First key past the returned chain; zero when key space is exhausted.
    pub key_next: u64,
    /// Error bits from locking the returned chain or the scanned parent.
    pub error: ErrorFlags,
}

impl Lookup {
    const fn none(key_next: u64, error: ErrorFlags) -> Self {
        Self {
            chain: None,
            key_next,
            error,
        }
    }
}

enum Found {
    Memory(ChainId),
    Media(Blockref),
}

fn node_how(flags: LookupFlags) -> LockHow {
    if flags.contains(LookupFlags::SHARED) {
        LockHow::shared(Resolve::Maybe)
    } else {
        LockHow::exclusive(Resolve::Maybe)
    }
}

fn leaf_how(flags: LookupFlags) -> LockHow {
    let resolve = if flags.contains(LookupFlags::NODATA) {
        Resolve::Never
    } else if flags.contains(LookupFlags::ALWAYS) {
        Resolve::Always
    } else {
        Resolve::Maybe
    };
    if flags.contains(LookupFlags::SHARED) {
        LockHow::shared(resolve)
    } else {
        LockHow::exclusive(resolve)
    }
}

impl ChainStore {
    /// Reference and lock `parent` ahead of a lookup sequence.
    #[must_use = "lock errors must be checked"]
    pub fn lookup_init(&self, parent: ChainId, flags: LookupFlags) -> ErrorFlags {
        self.ref_chain(parent);
        let how = if flags.contains(LookupFlags::SHARED) {
            LockHow::shared(Resolve::Always)
        } else {
            LockHow::exclusive(Resolve::Always)
        };
        self.lock(parent, how)
    }

    /// Unlock and release whatever parent a lookup sequence ended on.
    pub fn lookup_done(&self, parent: ChainId) {
        self.unlock(parent);
        self.drop_chain(parent);
    }

    /// Release a chain returned by [`lookup`](Self::lookup).
    pub fn release(&self, chain: ChainId) {
        self.unlock(chain);
        self.drop_chain(chain);
    }

    /// Find the first chain overlapping `[key_beg, key_end]` under `*parentp`.
    pub fn lookup(
        &self,
        parentp: &mut ChainId,
        key_beg: u64,
        key_end: u64,
        flags: LookupFlags,
    ) -> Lookup {
        let node = node_how(flags);
        let leaf = leaf_how(flags);

        loop {
            let parent = self.get(*parentp);
            if !parent.btype().is_indirect() || parent.bref().encloses(key_beg, key_end) {
                break;
            }
            if !self.repparent(parentp, node) {
                break;
            }
        }

        let mut key_beg = key_beg;
        loop {
            let parent = self.get(*parentp);
            if !flags.contains(LookupFlags::NODIRECT) && parent.has_direct_data() {
                self.ref_chain(*parentp);
                let error = self.lock(*parentp, leaf.with(LockFlags::LOCKAGAIN));
                return Lookup {
                    chain: Some(*parentp),
                    key_next: key_end.wrapping_add(1),
                    error,
                };
            }
            let perr = parent.error();
            if !perr.is_empty() {
                return Lookup::none(0, perr);
            }

            let brefs = parent.blockrefs();
            let (found, key_next, generation) = {
                let st = parent.state.lock();
                let (found, key_next) = Self::combined_find(
                    &parent,
                    &st,
                    brefs.as_deref().unwrap_or(&[]),
                    key_beg,
                    key_end,
                );
                if let Some(Found::Memory(id)) = &found {
                    let child = self.get(*id);
                    let mut cst = child.state.lock();
                    self.ref_locked(&child, &mut cst);
                }
                (found, key_next, st.generation)
            };

            let id = match found {
                None => {
                    if key_beg == key_end || !parent.btype().is_indirect() {
                        return Lookup::none(key_next, ErrorFlags::empty());
                    }
                    match parent.bref().key_next() {
                        Some(next) if next <= key_end => key_beg = next,
                        _ => return Lookup::none(0, ErrorFlags::empty()),
                    }
                    drop(parent);
                    if !self.repparent(parentp, node) {
                        return Lookup::none(key_beg, ErrorFlags::empty());
                    }
                    continue;
                }
                Some(Found::Memory(id)) => id,
                Some(Found::Media(bref)) => {
                    let id = self.alloc(bref);
                    if self.insert(*parentp, id, Some(generation)).is_err() {
                        self.drop_chain(id);
                        continue;
                    }
                    id
                }
            };

            let indirect = self.get(id).btype().is_indirect();
            let error = self.lock(id, if indirect { node } else { leaf });
            if indirect && !flags.contains(LookupFlags::MATCHIND) && error.is_empty() {
                trace!(
                    target: "h2::chain",
                    parent = %*parentp,
                    child = %id,
                    "chain_lookup_descend"
                );
                let old = std::mem::replace(parentp, id);
                self.unlock(old);
                self.drop_chain(old);
                continue;
            }
            return Lookup {
                chain: Some(id),
                key_next,
                error,
            };
        }
    }

    /// Release `chain` (if any) and return the next match up to `key_end`.
    pub fn next(
        &self,
        parentp: &mut ChainId,
        chain: Option<ChainId>,
        key_end: u64,
        flags: LookupFlags,
    ) -> Lookup {
        let key_beg = match chain {
            Some(id) if id == *parentp => {
                self.release(id);
                return Lookup::none(0, ErrorFlags::empty());
            }
            Some(id) => {
                let next = self.get(id).bref().key_next();
                self.release(id);
                match next {
                    Some(next) if next <= key_end => next,
                    _ => return Lookup::none(0, ErrorFlags::empty()),
                }
            }
            None => return Lookup::none(0, ErrorFlags::empty()),
        };
        self.lookup(parentp, key_beg, key_end, flags)
    }

    /// Replace the locked `*parentp` with its own parent, locked with `how`.
    fn repparent(&self, parentp: &mut ChainId, how: LockHow) -> bool {
        let child = *parentp;
        let Some(up) = self.get(child).parent() else {
            return false;
        };
        self.ref_chain(up);
        self.unlock(child);
        let _ = self.lock(up, how);
        self.drop_chain(child);
        trace!(target: "h2::chain", from = %child, to = %up, "chain_repparent");
        *parentp = up;
        true
    }

    // ── Combined find ───────────────────────────────────────────────────────

    fn combined_find(
        parent: &Chain,
        st: &ChainState,
        brefs: &[Blockref],
        key_beg: u64,
        key_end: u64,
    ) -> (Option<Found>, u64) {
        let mut key_next = key_end.wrapping_add(1);
        let media = Self::find_blockref(parent, brefs, key_beg, key_end, &mut key_next);
        let memory = Self::find_child(st, key_beg, key_end, &mut key_next);
        let found = match (memory, media) {
            (None, None) => None,
            (Some((key, entry)), Some(bref)) if key <= bref.key => Some(Found::Memory(entry.id)),
            (_, Some(bref)) => Some(Found::Media(bref)),
            (Some((_, entry)), None) => Some(Found::Memory(entry.id)),
        };
        (found, key_next)
    }

    fn find_blockref(
        parent: &Chain,
        brefs: &[Blockref],
        key_beg: u64,
        key_end: u64,
        key_next: &mut u64,
    ) -> Option<Blockref> {
        let limit = parent.live_zero().min(brefs.len());
        if limit == 0 {
            return None;
        }
        let mut idx = parent.cache_index.load(Ordering::Relaxed).min(limit - 1);
        while idx > 0 && (brefs[idx].btype == BrefType::Empty || brefs[idx].key > key_beg) {
            idx -= 1;
        }
        for (pos, bref) in brefs.iter().enumerate().take(limit).skip(idx) {
            if bref.btype == BrefType::Empty || bref.key_end() < key_beg {
                continue;
            }
            if bref.key > key_end {
                return None;
            }
            parent.cache_index.store(pos, Ordering::Relaxed);
            if let Some(next) = bref.key_next() {
                clamp_next(key_next, next);
            }
            return Some(*bref);
        }
        None
    }

    fn find_child(
        st: &ChainState,
        key_beg: u64,
        key_end: u64,
        key_next: &mut u64,
    ) -> Option<(u64, ChildEntry)> {
        let below = st
            .children
            .range(..=key_beg)
            .next_back()
            .filter(|(_, entry)| entry.end >= key_beg);
        let hit = below.or_else(|| st.children.range(key_beg..=key_end).next())?;
        let (key, entry) = (*hit.0, *hit.1);
        if let Some(next) = entry.end.checked_add(1) {
            clamp_next(key_next, next);
        }
        Some((key, entry))
    }
}

/// Lower `key_next` to `next`; zero stands for the end of key space.
fn clamp_next(key_next: &mut u64, next: u64) {
    if *key_next == 0 || next < *key_next {
        *key_next = next;
    }
}

/// Blockrefs of every leaf chain overlapping `[key_beg, key_end]` under
/// `parent`, in key order, plus the accumulated lock errors.
pub fn scan_range(
    store: &ChainStore,
    parent: ChainId,
    key_beg: u64,
    key_end: u64,
    flags: LookupFlags,
) -> (Vec<Blockref>, ErrorFlags) {
    let mut parentp = parent;
    let mut out = Vec::new();
    let mut error = store.lookup_init(parentp, flags);
    if !error.is_empty() {
        store.lookup_done(parentp);
        return (out, error);
    }
    let mut step = store.lookup(&mut parentp, key_beg, key_end, flags);
    while let Some(id) = step.chain {
        error |= step.error;
        out.push(*store.get(id).bref());
        step = store.next(&mut parentp, Some(id), key_end, flags);
    }
    error |= step.error;
    store.lookup_done(parentp);
    (out, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChainConfig, Lifecycle};
    use h2_block::{DioCache, DioConfig, MemByteDevice};
    use h2_types::{HAMMER2_BLOCKREF_BYTES, PhysOffset};
    use std::sync::Arc;

    const IND_OFF: u64 = 0x1_0000;
    const LEAF_KEYS: [u64; 4] = [0x100, 0x200, 0x300, 0x400];

    /// Root blockset: an indirect block over `0..0x1000` holding four
    /// media-less inode refs, followed by one more inode at 0x10000.
    fn tree(lru_limit: usize) -> (ChainStore, ChainId) {
        let dev = Arc::new(MemByteDevice::new(vec![0_u8; 1 << 20]));
        let mut block = vec![0_u8; 4 * HAMMER2_BLOCKREF_BYTES];
        for (idx, key) in LEAF_KEYS.iter().enumerate() {
            Blockref::new(BrefType::Inode, *key, 0)
                .write_to(&mut block[idx * HAMMER2_BLOCKREF_BYTES..]);
        }
        dev.poke(IND_OFF, &block).expect("poke");
        let store = ChainStore::new(
            Arc::new(DioCache::new(dev, DioConfig::default())),
            ChainConfig { lru_limit },
        );
        let set = [
            Blockref::new(BrefType::Indirect, 0, 12).with_data(PhysOffset(IND_OFF), 9),
            Blockref::new(BrefType::Inode, 0x1_0000, 0),
            Blockref::empty(),
            Blockref::empty(),
        ];
        let root = store.alloc_root(Blockref::new(BrefType::Volume, 0, 64), &set);
        (store, root)
    }

    #[test]
    fn exact_lookup_descends_through_indirect() {
        let (store, root) = tree(64);
        let mut parent = root;
        assert!(store.lookup_init(parent, LookupFlags::SHARED).is_empty());
        let hit = store.lookup(&mut parent, 0x200, 0x200, LookupFlags::SHARED);
        let id = hit.chain.expect("found");
        assert!(hit.error.is_empty());
        assert_eq!(store.get(id).key(), 0x200);
        assert_ne!(parent, root, "parent handle moved to the indirect block");
        assert_eq!(store.get(parent).btype(), BrefType::Indirect);
        assert_eq!(hit.key_next, 0x201);
        store.release(id);
        store.lookup_done(parent);
    }

    #[test]
    fn missing_key_returns_nothing() {
        let (store, root) = tree(64);
        let mut parent = root;
        let _ = store.lookup_init(parent, LookupFlags::empty());
        let miss = store.lookup(&mut parent, 0x250, 0x250, LookupFlags::empty());
        assert!(miss.chain.is_none());
        assert!(miss.error.is_empty());
        store.lookup_done(parent);
    }

    #[test]
    fn full_scan_visits_every_leaf_in_key_order() {
        let (store, root) = tree(64);
        let (brefs, err) = scan_range(&store, root, 0, u64::MAX, LookupFlags::SHARED);
        assert!(err.is_empty());
        let keys: Vec<u64> = brefs.iter().map(|b| b.key).collect();
        assert_eq!(keys, vec![0x100, 0x200, 0x300, 0x400, 0x1_0000]);
    }

    #[test]
    fn matchind_returns_the_indirect_block() {
        let (store, root) = tree(64);
        let mut parent = root;
        let _ = store.lookup_init(parent, LookupFlags::empty());
        let hit = store.lookup(&mut parent, 0, 0xFFF, LookupFlags::MATCHIND);
        let id = hit.chain.expect("indirect");
        assert_eq!(store.get(id).btype(), BrefType::Indirect);
        assert_eq!(parent, root);
        store.release(id);
        store.lookup_done(parent);
    }

    #[test]
    fn repeated_lookup_reuses_the_cached_chain() {
        let (store, root) = tree(64);
        let find = |key| {
            let mut parent = root;
            let _ = store.lookup_init(parent, LookupFlags::SHARED);
            let hit = store.lookup(&mut parent, key, key, LookupFlags::SHARED);
            let id = hit.chain.expect("found");
            store.release(id);
            store.lookup_done(parent);
            id
        };
        let first = find(0x300);
        let allocated = store.stats().allocated;
        let second = find(0x300);
        assert_eq!(first, second);
        assert_eq!(store.stats().allocated, allocated, "no duplicate instantiation");
        assert_eq!(store.get(first).lifecycle(), Lifecycle::CachedUnreferenced);
    }

    #[test]
    fn lru_never_holds_chains_with_children() {
        let (store, root) = tree(2);
        let _ = scan_range(&store, root, 0, u64::MAX, LookupFlags::empty());
        for id in store.lru_snapshot() {
            assert_eq!(store.get(id).live_count(), 0);
        }
        assert!(store.stats().lru <= 2);
        for chain in store.live_chains() {
            if chain.id() != root {
                assert_eq!(chain.refs(), 0);
            }
        }
    }

    #[test]
    fn concurrent_lookups_link_each_key_once() {
        let (store, root) = tree(64);
        let store = Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut ids = Vec::new();
                    for key in LEAF_KEYS {
                        let mut parent = root;
                        let _ = store.lookup_init(parent, LookupFlags::SHARED);
                        let hit = store.lookup(&mut parent, key, key, LookupFlags::SHARED);
                        let id = hit.chain.expect("found");
                        ids.push(id);
                        store.release(id);
                        store.lookup_done(parent);
                    }
                    ids
                })
            })
            .collect();
        let results: Vec<Vec<ChainId>> =
            handles.into_iter().map(|h| h.join().expect("thread")).collect();
        for ids in &results[1..] {
            assert_eq!(ids, &results[0]);
        }
        // root + indirect + four leaves
        assert_eq!(store.stats().live, 6);
    }
}
