//! In-memory inodes.
//!
//! An [`Inode`] binds an inode number to a [`Cluster`] of backing chains.
//! Inodes live in a per-PFS [`InodeTree`] and carry their own reference
//! count, separate from the chains they hold: the tree entry goes away (and
//! the chain references with it) when the last [`InodeRef`] drops.

use crate::cluster::Cluster;
use h2_chain::{ChainId, ChainStore, LockHow, Resolve, SleepLock};
use h2_error::ErrorFlags;
use h2_ondisk::{BrefType, InodeData, InodeMeta};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, trace};

/// Inode lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeLock {
    Shared,
    Exclusive,
}

pub struct Inode {
    inum: u64,
    refs: AtomicU32,
    lock: SleepLock,
    cluster: Mutex<Cluster>,
    meta: Mutex<InodeMeta>,
    store: Arc<ChainStore>,
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode")
            .field("inum", &self.inum)
            .field("refs", &self.refs())
            .field("cluster", &*self.cluster.lock())
            .finish_non_exhaustive()
    }
}

impl Inode {
    fn new(inum: u64, cluster: Cluster, meta: InodeMeta, store: Arc<ChainStore>) -> Self {
        Self {
            inum,
            refs: AtomicU32::new(1),
            lock: SleepLock::new(),
            cluster: Mutex::new(cluster),
            meta: Mutex::new(meta),
            store,
        }
    }

    #[must_use]
    pub fn inum(&self) -> u64 {
        self.inum
    }

    #[must_use]
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Cached copy of the on-media inode meta.
    #[must_use]
    pub fn meta(&self) -> InodeMeta {
        self.meta.lock().clone()
    }

    /// Snapshot of the backing cluster. The chain ids are not referenced.
    #[must_use]
    pub fn cluster(&self) -> Cluster {
        self.cluster.lock().clone()
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.cluster.lock().width()
    }

    pub fn lock(&self, mode: InodeLock) {
        match mode {
            InodeLock::Shared => self.lock.lock_shared(false),
            InodeLock::Exclusive => self.lock.lock_exclusive(),
        }
    }

    pub fn unlock(&self) {
        self.lock.unlock();
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Reference and lock member `clindex`'s chain for a backend.
    ///
    /// Returns `None` when the member has no chain. The reference is taken
    /// under the cluster's short lock and the sleep lock after it is
    /// released, so a concurrent [`repoint`](Self::repoint) cannot free the
    /// chain in between.
    pub fn chain(&self, clindex: usize, how: LockHow) -> Option<(ChainId, ErrorFlags)> {
        let cluster = self.cluster.lock();
        let id = cluster.chain(clindex)?;
        let member_error = cluster.items()[clindex].error;
        self.store.ref_chain(id);
        drop(cluster);
        let error = self.store.lock(id, how);
        Some((id, error | member_error))
    }

    /// Swap in a freshly looked-up cluster and reload the cached meta from
    /// its focus. The caller's references move into the inode; the old
    /// members' references are dropped. Holders of the inode lock are not
    /// disturbed.
    pub fn repoint(&self, cluster: Cluster) -> ErrorFlags {
        let (meta, error) = match cluster.focus_chain() {
            Some(id) => load_meta(&self.store, id),
            None => (None, ErrorFlags::INCOMPLETE),
        };
        self.install(cluster, meta);
        error
    }

    fn install(&self, cluster: Cluster, meta: Option<InodeMeta>) {
        let mut guard = self.cluster.lock();
        let mut old = std::mem::replace(&mut *guard, cluster);
        drop(guard);
        if let Some(meta) = meta {
            *self.meta.lock() = meta;
        }
        debug!(
            target: "h2::inode",
            inum = self.inum,
            old = ?old.focus_chain(),
            new = ?self.cluster.lock().focus_chain(),
            "inode_repoint"
        );
        old.release(&self.store);
    }
}

/// Parse the inode meta out of `id`'s media.
pub(crate) fn load_meta(store: &ChainStore, id: ChainId) -> (Option<InodeMeta>, ErrorFlags) {
    store.ref_chain(id);
    let error = store.lock(id, LockHow::shared(Resolve::Always));
    let chain = store.get(id);
    let meta = if chain.btype() == BrefType::Inode {
        chain
            .data()
            .and_then(|data| InodeData::parse(&data).ok())
            .map(|ip| ip.meta)
    } else {
        None
    };
    drop(chain);
    store.unlock(id);
    store.drop_chain(id);
    let error = if meta.is_none() {
        error | ErrorFlags::BADBREF
    } else {
        error
    };
    (meta, error)
}

/// Per-PFS map from inode number to in-memory inode.
#[derive(Debug)]
pub struct InodeTree {
    store: Arc<ChainStore>,
    map: Mutex<BTreeMap<u64, Arc<Inode>>>,
}

impl InodeTree {
    #[must_use]
    pub fn new(store: Arc<ChainStore>) -> Self {
        Self {
            store,
            map: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ChainStore> {
        &self.store
    }

    /// Referenced inode for `inum`, if one is in memory.
    pub fn lookup(self: &Arc<Self>, inum: u64) -> Option<InodeRef> {
        let map = self.map.lock();
        let ip = map.get(&inum)?;
        ip.refs.fetch_add(1, Ordering::AcqRel);
        let ip = Arc::clone(ip);
        drop(map);
        Some(InodeRef {
            tree: Arc::clone(self),
            ip: Some(ip),
        })
    }

    /// Return the in-memory inode for `inum`, creating it around `cluster`
    /// or repointing an existing one at it.
    pub fn get_or_insert(
        self: &Arc<Self>,
        inum: u64,
        cluster: Cluster,
        meta: InodeMeta,
    ) -> InodeRef {
        let mut map = self.map.lock();
        if let Some(ip) = map.get(&inum) {
            ip.refs.fetch_add(1, Ordering::AcqRel);
            let ip = Arc::clone(ip);
            drop(map);
            if ip.cluster.lock().focus_chain() == cluster.focus_chain() {
                let mut dup = cluster;
                dup.release(&self.store);
            } else {
                ip.install(cluster, Some(meta));
            }
            return InodeRef {
                tree: Arc::clone(self),
                ip: Some(ip),
            };
        }
        let ip = Arc::new(Inode::new(inum, cluster, meta, Arc::clone(&self.store)));
        map.insert(inum, Arc::clone(&ip));
        drop(map);
        debug!(target: "h2::inode", inum, "inode_create");
        InodeRef {
            tree: Arc::clone(self),
            ip: Some(ip),
        }
    }

    pub fn ref_inode(&self, ip: &Inode) {
        let prev = ip.refs.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "ref of released inode {}", ip.inum);
    }

    /// Release one reference. The last one removes the inode from the tree
    /// and drops its chain references.
    pub fn drop_inode(&self, ip: &Arc<Inode>) {
        let prev = ip.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "drop of unreferenced inode {}", ip.inum);
        if prev > 1 {
            return;
        }
        let mut map = self.map.lock();
        if ip.refs() != 0 {
            return;
        }
        let ours = map.get(&ip.inum).is_some_and(|cur| Arc::ptr_eq(cur, ip));
        if !ours {
            return;
        }
        map.remove(&ip.inum);
        drop(map);
        ip.cluster.lock().release(&self.store);
        trace!(target: "h2::inode", inum = ip.inum, "inode_free");
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    #[must_use]
    pub fn inums(&self) -> Vec<u64> {
        self.map.lock().keys().copied().collect()
    }
}

/// Counted reference to an in-memory inode.
pub struct InodeRef {
    tree: Arc<InodeTree>,
    ip: Option<Arc<Inode>>,
}

impl InodeRef {
    #[must_use]
    pub fn tree(&self) -> &Arc<InodeTree> {
        &self.tree
    }

    fn inode(&self) -> &Arc<Inode> {
        match &self.ip {
            Some(ip) => ip,
            None => unreachable!("inode reference used after release"),
        }
    }
}

impl Deref for InodeRef {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        self.inode()
    }
}

impl Clone for InodeRef {
    fn clone(&self) -> Self {
        let ip = Arc::clone(self.inode());
        self.tree.ref_inode(&ip);
        Self {
            tree: Arc::clone(&self.tree),
            ip: Some(ip),
        }
    }
}

impl Drop for InodeRef {
    fn drop(&mut self) {
        if let Some(ip) = self.ip.take() {
            self.tree.drop_inode(&ip);
        }
    }
}

impl fmt::Debug for InodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inode().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use h2_block::{ByteDevice, DioCache, DioConfig, MemByteDevice};
    use h2_chain::ChainConfig;
    use h2_ondisk::Blockref;

    fn tree() -> Arc<InodeTree> {
        let dev: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(vec![0; 1 << 16]));
        let store = Arc::new(ChainStore::new(
            Arc::new(DioCache::new(dev, DioConfig::default())),
            ChainConfig::default(),
        ));
        Arc::new(InodeTree::new(store))
    }

    fn meta(inum: u64) -> InodeMeta {
        InodeMeta {
            inum,
            ..InodeMeta::default()
        }
    }

    #[test]
    fn last_reference_frees_entry_and_chains() {
        let tree = tree();
        let store = Arc::clone(tree.store());
        let chain = store.alloc(Blockref::new(BrefType::Inode, 7, 0));
        let ip = tree.get_or_insert(7, Cluster::with_chain(1, chain, ErrorFlags::empty()), meta(7));
        let again = tree.lookup(7).unwrap();
        assert_eq!(ip.refs(), 2);
        drop(ip);
        assert_eq!(tree.len(), 1);
        drop(again);
        assert!(tree.is_empty());
        assert_eq!(store.stats().live, 0);
    }

    #[test]
    fn reinsert_repoints_existing_inode() {
        let tree = tree();
        let store = Arc::clone(tree.store());
        let a = store.alloc(Blockref::new(BrefType::Inode, 9, 0));
        let b = store.alloc(Blockref::new(BrefType::Inode, 9, 0));
        let ip = tree.get_or_insert(9, Cluster::with_chain(1, a, ErrorFlags::empty()), meta(9));
        let mut newer = meta(9);
        newer.size = 4096;
        let same = tree.get_or_insert(9, Cluster::with_chain(1, b, ErrorFlags::empty()), newer);
        assert_eq!(ip.cluster().focus_chain(), Some(b));
        assert_eq!(ip.meta().size, 4096);
        assert!(store.try_get(a).is_none(), "old member released");
        drop((ip, same));
        assert_eq!(store.stats().live, 0);
    }

    #[test]
    fn shared_inode_locks_coexist() {
        let tree = tree();
        let store = Arc::clone(tree.store());
        let chain = store.alloc(Blockref::new(BrefType::Inode, 3, 0));
        let ip = tree.get_or_insert(3, Cluster::with_chain(1, chain, ErrorFlags::empty()), meta(3));
        ip.lock(InodeLock::Shared);
        ip.lock(InodeLock::Shared);
        assert!(ip.is_locked());
        ip.unlock();
        ip.unlock();
        assert!(!ip.is_locked());
        ip.lock(InodeLock::Exclusive);
        ip.unlock();
    }

    #[test]
    fn backend_chain_access_holds_a_reference() {
        let tree = tree();
        let store = Arc::clone(tree.store());
        let chain = store.alloc(Blockref::new(BrefType::Inode, 3, 0));
        let ip = tree.get_or_insert(3, Cluster::with_chain(1, chain, ErrorFlags::empty()), meta(3));
        let (id, err) = ip.chain(0, LockHow::shared(Resolve::Never)).unwrap();
        assert!(err.is_empty());
        assert_eq!(store.get(id).refs(), 2);
        store.unlock(id);
        store.drop_chain(id);
        assert!(ip.chain(1, LockHow::shared(Resolve::Never)).is_none());
    }
}
