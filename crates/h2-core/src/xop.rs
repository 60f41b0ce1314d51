//! Cross-cluster operations (XOPs).
//!
//! A frontend allocates an [`XopHead`] against an inode, sets the request
//! parameters, and starts an [`XopOp`]. The op's backend runs once per
//! cluster member and pushes matching chains into that member's FIFO with
//! [`XopHead::feed`]. The frontend pulls results in key order with
//! [`XopHead::collect`], which lines the members up on the lowest pending
//! key and validates them against each other.
//!
//! Lifetime follows the run mask: the frontend holds [`XOPMASK_VOP`] and
//! every started member holds its own bit. Whoever clears the last bit
//! releases the remaining held chains and hands the FIFO buffers back to the
//! pool. A frontend may retire early; backends still running then see
//! `ABORTED` from `feed` and wind down on their own.

use crate::cluster::Cluster;
use crate::inode::InodeRef;
use crate::ipdep::IpDep;
use bitflags::bitflags;
use h2_chain::{ChainId, ChainStore};
use h2_error::ErrorFlags;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use tracing::{debug, trace, warn};

/// Run-mask bit held by the frontend.
pub const XOPMASK_VOP: u32 = 0x8000_0000;

const XOP_FIFO_INITIAL: usize = 16;
const XOP_POOL_KEEP: usize = 32;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CollectFlags: u32 {
        /// Return `EINPROGRESS` instead of sleeping on a slow member.
        const NOWAIT = 0x01;
    }
}

/// Backend half of an XOP.
pub trait XopOp: Send + Sync {
    fn name(&self) -> &'static str;

    /// Scan member `clindex` and feed every match, in ascending key order.
    ///
    /// Returning an empty set means the scan ran to completion; the caller
    /// then reports `ENOENT` as the member's end marker.
    fn run(&self, xop: &XopHead, clindex: usize) -> ErrorFlags;
}

/// Request parameters shared by frontend and backends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XopParams {
    pub name1: Vec<u8>,
    pub name2: Vec<u8>,
    pub key_beg: u64,
    pub key_end: u64,
}

// ── FIFOs ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct FifoEntry {
    /// `None` marks the member's terminal entry.
    chain: Option<ChainId>,
    key: u64,
    error: ErrorFlags,
}

/// Unbounded per-member queue; a backend never blocks on a full FIFO.
#[derive(Debug, Default)]
struct Fifo {
    entries: VecDeque<FifoEntry>,
}

impl Fifo {
    fn reset(&mut self) {
        self.entries.clear();
        self.entries.reserve(XOP_FIFO_INITIAL);
    }

    fn held(&mut self, out: &mut Vec<ChainId>) {
        out.extend(self.entries.drain(..).filter_map(|e| e.chain));
    }
}

#[derive(Debug)]
struct XopState {
    fifos: Vec<Fifo>,
    run_mask: u32,
    /// Members that had no backing chain at start.
    absent: u32,
    /// Lowest key the next collect may return; `None` once `KEY_MAX` was
    /// returned.
    collect_key: Option<u64>,
    eof_reported: bool,
    /// Chains returned by the last collect, released by the next one.
    current: Vec<ChainId>,
    finalized: bool,
}

/// One collected result.
///
/// The member chains are referenced and held by the XOP until the next
/// `collect` or the frontend's retire; [`Chain::data`](h2_chain::Chain::data)
/// stays valid for that long. Take a reference to keep one longer.
#[derive(Debug, Clone)]
pub struct Collected {
    pub key: u64,
    pub cluster: Cluster,
    pub error: ErrorFlags,
}

impl Collected {
    fn terminal(width: usize, error: ErrorFlags) -> Self {
        Self {
            key: 0,
            cluster: Cluster::new(width),
            error,
        }
    }

    /// Focus member's chain.
    #[must_use]
    pub fn chain(&self) -> Option<ChainId> {
        self.cluster.focus_chain()
    }

    /// True for the end-of-scan report (or any terminal error).
    #[must_use]
    pub fn is_end(&self) -> bool {
        self.chain().is_none() && !self.error.contains(ErrorFlags::EINPROGRESS)
    }
}

enum Step {
    Wait,
    Ready(Collected),
}

// ── Pool ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct XopStats {
    pub allocs: u64,
    pub reuses: u64,
    pub retired: u64,
    pub pooled: usize,
}

#[derive(Debug, Default)]
struct PoolShared {
    free: Mutex<Vec<Vec<Fifo>>>,
    allocs: AtomicU64,
    reuses: AtomicU64,
    retired: AtomicU64,
}

impl PoolShared {
    fn put(&self, mut fifos: Vec<Fifo>) {
        let mut free = self.free.lock();
        if free.len() < XOP_POOL_KEEP {
            for fifo in &mut fifos {
                fifo.reset();
            }
            free.push(fifos);
        }
        drop(free);
        self.retired.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-PFS allocator of XOP heads.
#[derive(Debug)]
pub struct XopPool {
    store: Arc<ChainStore>,
    ipdep: Arc<IpDep>,
    shared: Arc<PoolShared>,
}

impl XopPool {
    #[must_use]
    pub fn new(store: Arc<ChainStore>, ipdep: Arc<IpDep>) -> Self {
        Self {
            store,
            ipdep,
            shared: Arc::new(PoolShared::default()),
        }
    }

    /// Allocate an XOP against `inode`, one FIFO per cluster member.
    pub fn alloc(&self, inode: &InodeRef) -> Arc<XopHead> {
        let width = inode.width();
        let recycled = self.shared.free.lock().pop();
        let mut fifos = match recycled {
            Some(fifos) => {
                self.shared.reuses.fetch_add(1, Ordering::Relaxed);
                fifos
            }
            None => Vec::with_capacity(width),
        };
        fifos.resize_with(width, Fifo::default);
        for fifo in &mut fifos {
            fifo.reset();
        }
        self.shared.allocs.fetch_add(1, Ordering::Relaxed);
        trace!(target: "h2::xop", inum = inode.inum(), width, "xop_alloc");
        Arc::new(XopHead {
            store: Arc::clone(&self.store),
            ipdep: Arc::clone(&self.ipdep),
            pool: Arc::clone(&self.shared),
            inode: Mutex::new(Some(inode.clone())),
            params: Mutex::new(XopParams::default()),
            state: Mutex::new(XopState {
                fifos,
                run_mask: XOPMASK_VOP,
                absent: 0,
                collect_key: Some(0),
                eof_reported: false,
                current: Vec::new(),
                finalized: false,
            }),
            cv: Condvar::new(),
        })
    }

    #[must_use]
    pub fn ipdep(&self) -> &Arc<IpDep> {
        &self.ipdep
    }

    #[must_use]
    pub fn stats(&self) -> XopStats {
        XopStats {
            allocs: self.shared.allocs.load(Ordering::Relaxed),
            reuses: self.shared.reuses.load(Ordering::Relaxed),
            retired: self.shared.retired.load(Ordering::Relaxed),
            pooled: self.shared.free.lock().len(),
        }
    }
}

// ── XOP head ────────────────────────────────────────────────────────────────

pub struct XopHead {
    store: Arc<ChainStore>,
    ipdep: Arc<IpDep>,
    pool: Arc<PoolShared>,
    inode: Mutex<Option<InodeRef>>,
    params: Mutex<XopParams>,
    state: Mutex<XopState>,
    cv: Condvar,
}

impl fmt::Debug for XopHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("XopHead")
            .field("params", &*self.params.lock())
            .field("run_mask", &format_args!("{:#x}", st.run_mask))
            .field("width", &st.fifos.len())
            .finish_non_exhaustive()
    }
}

impl XopHead {
    #[must_use]
    pub fn store(&self) -> &Arc<ChainStore> {
        &self.store
    }

    /// The inode this XOP runs against. `None` once every party retired.
    #[must_use]
    pub fn inode(&self) -> Option<InodeRef> {
        self.inode.lock().clone()
    }

    #[must_use]
    pub fn params(&self) -> XopParams {
        self.params.lock().clone()
    }

    pub fn setname(&self, name: &[u8]) {
        self.params.lock().name1 = name.to_vec();
    }

    pub fn setname2(&self, name: &[u8]) {
        self.params.lock().name2 = name.to_vec();
    }

    pub fn setkey(&self, key_beg: u64, key_end: u64) {
        let mut params = self.params.lock();
        params.key_beg = key_beg;
        params.key_end = key_end;
    }

    #[must_use]
    pub fn run_mask(&self) -> u32 {
        self.state.lock().run_mask
    }

    /// Arm every member and run each backend in turn on this thread.
    pub fn start(&self, op: &dyn XopOp) {
        let Some((inode, width)) = self.arm(op) else {
            return;
        };
        for clindex in 0..width {
            self.run_member(&inode, op, clindex);
        }
    }

    /// Arm every member and run each backend on its own helper thread.
    pub fn start_threaded(self: &Arc<Self>, op: Arc<dyn XopOp>) {
        let Some((inode, width)) = self.arm(op.as_ref()) else {
            return;
        };
        for clindex in 0..width {
            let xop = Arc::clone(self);
            let member_op = Arc::clone(&op);
            let member_inode = inode.clone();
            let spawned = thread::Builder::new()
                .name(format!("h2-xop-{}", op.name()))
                .spawn(move || xop.run_member(&member_inode, member_op.as_ref(), clindex));
            if let Err(err) = spawned {
                warn!(target: "h2::xop", op = op.name(), clindex, error = %err, "xop_spawn_failed");
                self.run_member(&inode, op.as_ref(), clindex);
            }
        }
    }

    fn arm(&self, op: &dyn XopOp) -> Option<(InodeRef, usize)> {
        let inode = self.inode()?;
        let mut st = self.state.lock();
        if st.run_mask & XOPMASK_VOP == 0 {
            return None;
        }
        let width = st.fifos.len();
        let members = (1_u32 << width) - 1;
        st.run_mask |= members;
        drop(st);
        debug!(target: "h2::xop", op = op.name(), inum = inode.inum(), width, "xop_start");
        Some((inode, width))
    }

    fn run_member(&self, inode: &InodeRef, op: &dyn XopOp, clindex: usize) {
        let bit = 1_u32 << clindex;
        if inode.cluster().chain(clindex).is_none() {
            self.state.lock().absent |= bit;
            let _ = self.feed(None, clindex, ErrorFlags::EIO);
            self.retire(bit);
            return;
        }
        let guard = self.ipdep.acquire(inode.inum());
        let error = op.run(self, clindex);
        drop(guard);
        let terminal = if error.is_empty() {
            ErrorFlags::ENOENT
        } else {
            error
        };
        trace!(target: "h2::xop", op = op.name(), clindex, error = %terminal, "xop_backend_done");
        let _ = self.feed(None, clindex, terminal);
        self.retire(bit);
    }

    /// Push one result for member `clindex`.
    ///
    /// A chain is referenced and held until the frontend consumes it, so a
    /// backend may unlock and drop its own reference right after feeding.
    /// `chain = None` is the member's terminal entry, carrying the error
    /// that ended the scan. Returns `ABORTED` once the frontend detached.
    pub fn feed(&self, chain: Option<ChainId>, clindex: usize, error: ErrorFlags) -> ErrorFlags {
        let mut st = self.state.lock();
        if st.run_mask & XOPMASK_VOP == 0 {
            return ErrorFlags::ABORTED;
        }
        let key = match chain {
            Some(id) => {
                self.store.ref_hold(id);
                self.store.get(id).key()
            }
            None => 0,
        };
        st.fifos[clindex]
            .entries
            .push_back(FifoEntry { chain, key, error });
        drop(st);
        self.cv.notify_all();
        ErrorFlags::empty()
    }

    /// Return the next result in ascending key order.
    ///
    /// Blocks while any running member has nothing queued, unless `NOWAIT`
    /// is set. Once every member is exhausted the end of the scan is
    /// reported exactly once, usually as `ENOENT`; later calls get `EINVAL`.
    pub fn collect(&self, flags: CollectFlags) -> Collected {
        let mut released = Vec::new();
        let mut st = self.state.lock();
        released.append(&mut st.current);
        let width = st.fifos.len();
        let out = loop {
            if st.finalized || st.eof_reported {
                break Collected::terminal(width, ErrorFlags::EINVAL);
            }
            match Self::try_collect(&self.store, &mut st, &mut released) {
                Step::Ready(out) => break out,
                Step::Wait if flags.contains(CollectFlags::NOWAIT) => {
                    break Collected::terminal(width, ErrorFlags::EINPROGRESS);
                }
                Step::Wait => self.cv.wait(&mut st),
            }
        };
        drop(st);
        for id in released {
            self.store.drop_unhold(id);
        }
        trace!(target: "h2::xop", key = out.key, error = %out.error, "xop_collect");
        out
    }

    fn try_collect(store: &ChainStore, st: &mut XopState, released: &mut Vec<ChainId>) -> Step {
        let width = st.fifos.len();
        let floor = st.collect_key;
        for fifo in &mut st.fifos {
            while let Some(head) = fifo.entries.front() {
                let stale = match (head.chain, floor) {
                    (None, _) => false,
                    (Some(_), None) => true,
                    (Some(_), Some(floor)) => head.key < floor,
                };
                if !stale {
                    break;
                }
                released.extend(fifo.entries.pop_front().and_then(|entry| entry.chain));
            }
        }

        let pending = st
            .fifos
            .iter()
            .enumerate()
            .any(|(idx, fifo)| fifo.entries.is_empty() && st.run_mask & (1 << idx) != 0);
        if pending {
            return Step::Wait;
        }

        let lowest = st
            .fifos
            .iter()
            .filter_map(|fifo| fifo.entries.front())
            .filter(|head| head.chain.is_some())
            .map(|head| head.key)
            .min();
        let all_absent = st.absent.count_ones() as usize == width;

        let Some(key) = lowest else {
            let mut error = ErrorFlags::empty();
            for (idx, fifo) in st.fifos.iter().enumerate() {
                if st.absent & (1 << idx) != 0 && !all_absent {
                    continue;
                }
                error |= fifo.entries.front().map_or(ErrorFlags::ENOENT, |head| head.error);
            }
            if error.is_empty() {
                error = ErrorFlags::ENOENT;
            }
            st.eof_reported = true;
            return Step::Ready(Collected::terminal(width, error));
        };

        let mut cluster = Cluster::new(width);
        let mut present = Cluster::new(width - st.absent.count_ones() as usize);
        let mut slot = 0;
        for idx in 0..width {
            let absent = st.absent & (1 << idx) != 0;
            let fifo = &mut st.fifos[idx];
            let head = fifo.entries.front().copied();
            match head {
                Some(entry) if entry.chain.is_some() && entry.key == key => {
                    fifo.entries.pop_front();
                    cluster.set(idx, entry.chain, entry.error);
                    if let Some(id) = entry.chain {
                        st.current.push(id);
                    }
                }
                Some(entry) if absent => {
                    cluster.set(idx, None, entry.error);
                }
                _ => {}
            }
            if !absent {
                present.set(slot, cluster.chain(idx), ErrorFlags::empty());
                slot += 1;
            }
        }
        let mut error = cluster.resolve();
        error |= present.check_members(store);
        st.collect_key = key.checked_add(1);
        Step::Ready(Collected {
            key,
            cluster,
            error,
        })
    }

    /// Clear `mask` from the run mask.
    ///
    /// Retiring [`XOPMASK_VOP`] detaches the frontend: queued results are
    /// released and later feeds abort. The last party out returns the FIFO
    /// buffers to the pool and drops the inode reference.
    pub fn retire(&self, mask: u32) {
        let mut released = Vec::new();
        let mut st = self.state.lock();
        st.run_mask &= !mask;
        if st.run_mask & XOPMASK_VOP == 0 {
            released.append(&mut st.current);
            for fifo in &mut st.fifos {
                fifo.held(&mut released);
            }
        }
        let last = st.run_mask == 0 && !st.finalized;
        let buffers = if last {
            st.finalized = true;
            Some(std::mem::take(&mut st.fifos))
        } else {
            None
        };
        drop(st);
        self.cv.notify_all();
        for id in released {
            self.store.drop_unhold(id);
        }
        if let Some(buffers) = buffers {
            self.pool.put(buffers);
            let inode = self.inode.lock().take();
            debug!(
                target: "h2::xop",
                inum = inode.as_ref().map(|ip| ip.inum()),
                "xop_retire"
            );
            drop(inode);
        }
    }
}

impl Drop for XopHead {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        let mut released = std::mem::take(&mut st.current);
        for fifo in &mut st.fifos {
            fifo.held(&mut released);
        }
        for id in released {
            self.store.drop_unhold(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::InodeTree;
    use h2_block::{ByteDevice, DioCache, DioConfig, MemByteDevice};
    use h2_chain::ChainConfig;
    use h2_ondisk::{Blockref, BrefType, InodeMeta};
    use std::sync::mpsc;

    struct Fixture {
        store: Arc<ChainStore>,
        tree: Arc<InodeTree>,
        pool: XopPool,
    }

    fn fixture() -> Fixture {
        let dev: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(vec![0; 1 << 16]));
        let store = Arc::new(ChainStore::new(
            Arc::new(DioCache::new(dev, DioConfig::default())),
            ChainConfig::default(),
        ));
        let tree = Arc::new(InodeTree::new(Arc::clone(&store)));
        let pool = XopPool::new(Arc::clone(&store), Arc::new(IpDep::new()));
        Fixture { store, tree, pool }
    }

    fn inode(fx: &Fixture, width: usize, members: usize) -> InodeRef {
        let mut cluster = Cluster::new(width);
        for idx in 0..members {
            let id = fx.store.alloc(Blockref::new(BrefType::Inode, 50, 0));
            cluster.set(idx, Some(id), ErrorFlags::empty());
        }
        cluster.resolve();
        fx.tree.get_or_insert(50, cluster, InodeMeta::default())
    }

    /// Feeds a fixed list of keys on every member.
    struct Keys {
        per_member: Vec<Vec<ChainId>>,
    }

    impl XopOp for Keys {
        fn name(&self) -> &'static str {
            "keys"
        }

        fn run(&self, xop: &XopHead, clindex: usize) -> ErrorFlags {
            for id in &self.per_member[clindex] {
                let err = xop.feed(Some(*id), clindex, ErrorFlags::empty());
                if !err.is_empty() {
                    return err;
                }
            }
            ErrorFlags::empty()
        }
    }

    fn chains(store: &ChainStore, keys: &[u64]) -> Vec<ChainId> {
        keys.iter()
            .map(|k| store.alloc(Blockref::new(BrefType::Inode, *k, 0)))
            .collect()
    }

    #[test]
    fn collect_orders_keys_and_ends_once() {
        let fx = fixture();
        let ip = inode(&fx, 1, 1);
        let op = Keys {
            per_member: vec![chains(&fx.store, &[10, 20, 30])],
        };
        let xop = fx.pool.alloc(&ip);
        xop.start(&op);
        let mut seen = Vec::new();
        loop {
            let out = xop.collect(CollectFlags::empty());
            if out.is_end() {
                assert_eq!(out.error, ErrorFlags::ENOENT);
                break;
            }
            assert!(out.error.is_empty());
            seen.push(out.key);
        }
        assert_eq!(seen, vec![10, 20, 30]);
        assert_eq!(xop.collect(CollectFlags::empty()).error, ErrorFlags::EINVAL);
        xop.retire(XOPMASK_VOP);
        for id in op.per_member.concat() {
            assert_eq!(fx.store.get(id).refs(), 1, "held reference released");
            fx.store.drop_chain(id);
        }
    }

    #[test]
    fn fifo_grows_past_its_initial_reserve_while_uncollected() {
        let fx = fixture();
        let ip = inode(&fx, 1, 1);
        let keys: Vec<u64> = (1..=(XOP_FIFO_INITIAL as u64 * 4)).collect();
        let op = Keys {
            per_member: vec![chains(&fx.store, &keys)],
        };
        let xop = fx.pool.alloc(&ip);
        xop.start(&op);
        assert_eq!(
            xop.state.lock().fifos[0].entries.len(),
            keys.len() + 1,
            "every result and the terminal entry queue up before any collect"
        );
        let mut seen = Vec::new();
        loop {
            let out = xop.collect(CollectFlags::empty());
            if out.is_end() {
                break;
            }
            seen.push(out.key);
        }
        assert_eq!(seen, keys);
        xop.retire(XOPMASK_VOP);
        drop(xop);

        let again = fx.pool.alloc(&ip);
        let st = again.state.lock();
        assert!(st.fifos[0].entries.is_empty(), "recycled FIFO starts empty");
        assert!(st.fifos[0].entries.capacity() >= XOP_FIFO_INITIAL);
        drop(st);
        again.retire(XOPMASK_VOP);
        for id in op.per_member.concat() {
            fx.store.drop_chain(id);
        }
    }

    #[test]
    fn agreeing_members_collect_clean() {
        let fx = fixture();
        let ip = inode(&fx, 2, 2);
        let op = Keys {
            per_member: vec![chains(&fx.store, &[1, 2]), chains(&fx.store, &[1, 2])],
        };
        let xop = fx.pool.alloc(&ip);
        xop.start(&op);
        let first = xop.collect(CollectFlags::empty());
        assert!(first.error.is_empty());
        assert_eq!(first.cluster.items().iter().filter(|i| i.chain.is_some()).count(), 2);
        xop.retire(XOPMASK_VOP);
        drop(xop);
        for id in op.per_member.concat() {
            fx.store.drop_chain(id);
        }
    }

    #[test]
    fn member_missing_a_key_is_an_integrity_error() {
        let fx = fixture();
        let ip = inode(&fx, 2, 2);
        let op = Keys {
            per_member: vec![chains(&fx.store, &[1, 2]), chains(&fx.store, &[2])],
        };
        let xop = fx.pool.alloc(&ip);
        xop.start(&op);
        let first = xop.collect(CollectFlags::empty());
        assert_eq!(first.key, 1);
        assert!(first.error.contains(ErrorFlags::INCOMPLETE));
        let second = xop.collect(CollectFlags::empty());
        assert_eq!(second.key, 2);
        assert!(second.error.is_empty());
        xop.retire(XOPMASK_VOP);
        drop(xop);
        for id in op.per_member.concat() {
            fx.store.drop_chain(id);
        }
    }

    #[test]
    fn absent_member_gets_placeholder_and_is_ignored() {
        let fx = fixture();
        let ip = inode(&fx, 2, 1);
        let op = Keys {
            per_member: vec![chains(&fx.store, &[7]), Vec::new()],
        };
        let xop = fx.pool.alloc(&ip);
        xop.start(&op);
        let hit = xop.collect(CollectFlags::empty());
        assert_eq!(hit.key, 7);
        assert!(hit.error.is_empty());
        assert_eq!(hit.cluster.items()[1].error, ErrorFlags::EIO);
        let end = xop.collect(CollectFlags::empty());
        assert_eq!(end.error, ErrorFlags::ENOENT);
        xop.retire(XOPMASK_VOP);
        drop(xop);
        for id in op.per_member.concat() {
            fx.store.drop_chain(id);
        }
    }

    /// Waits for a go signal before feeding; reports what feed returned.
    struct Gated {
        chain: ChainId,
        go: Mutex<Option<mpsc::Receiver<()>>>,
        result: mpsc::Sender<ErrorFlags>,
    }

    impl XopOp for Gated {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn run(&self, xop: &XopHead, clindex: usize) -> ErrorFlags {
            if let Some(go) = self.go.lock().take() {
                let _ = go.recv();
            }
            let err = xop.feed(Some(self.chain), clindex, ErrorFlags::empty());
            let _ = self.result.send(err);
            err
        }
    }

    #[test]
    fn nowait_reports_in_progress_until_fed() {
        let fx = fixture();
        let ip = inode(&fx, 1, 1);
        let chain = fx.store.alloc(Blockref::new(BrefType::Inode, 3, 0));
        let (go_tx, go_rx) = mpsc::channel();
        let (res_tx, res_rx) = mpsc::channel();
        let op = Arc::new(Gated {
            chain,
            go: Mutex::new(Some(go_rx)),
            result: res_tx,
        });
        let xop = fx.pool.alloc(&ip);
        xop.start_threaded(op);
        assert_eq!(xop.collect(CollectFlags::NOWAIT).error, ErrorFlags::EINPROGRESS);
        go_tx.send(()).unwrap();
        let hit = xop.collect(CollectFlags::empty());
        assert_eq!(hit.key, 3);
        assert_eq!(res_rx.recv().unwrap(), ErrorFlags::empty());
        assert!(xop.collect(CollectFlags::empty()).is_end());
        xop.retire(XOPMASK_VOP);
        drop(xop);
        fx.store.drop_chain(chain);
    }

    #[test]
    fn detached_frontend_aborts_feeds() {
        let fx = fixture();
        let ip = inode(&fx, 1, 1);
        let chain = fx.store.alloc(Blockref::new(BrefType::Inode, 3, 0));
        let (go_tx, go_rx) = mpsc::channel();
        let (res_tx, res_rx) = mpsc::channel();
        let op = Arc::new(Gated {
            chain,
            go: Mutex::new(Some(go_rx)),
            result: res_tx,
        });
        let xop = fx.pool.alloc(&ip);
        xop.start_threaded(op);
        xop.retire(XOPMASK_VOP);
        go_tx.send(()).unwrap();
        assert_eq!(res_rx.recv().unwrap(), ErrorFlags::ABORTED);
        drop(xop);
        assert_eq!(fx.store.get(chain).refs(), 1);
        fx.store.drop_chain(chain);
    }

    #[test]
    fn retired_buffers_are_reused() {
        let fx = fixture();
        let ip = inode(&fx, 1, 1);
        let op = Keys {
            per_member: vec![Vec::new()],
        };
        let first = fx.pool.alloc(&ip);
        first.start(&op);
        assert!(first.collect(CollectFlags::empty()).is_end());
        first.retire(XOPMASK_VOP);
        assert_eq!(first.run_mask(), 0);
        assert!(first.inode().is_none());
        let second = fx.pool.alloc(&ip);
        let stats = fx.pool.stats();
        assert_eq!((stats.allocs, stats.reuses, stats.retired), (2, 1, 1));
        second.retire(XOPMASK_VOP);
        drop((first, second, ip));
        assert!(fx.tree.is_empty());
        assert_eq!(fx.store.stats().live, 0);
    }
}
