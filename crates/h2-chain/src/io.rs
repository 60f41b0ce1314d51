//! Chain locking and media resolution.
//!
//! Locking a chain bumps its lock count and, depending on [`Resolve`],
//! loads its media through the dio cache. Concurrent loaders of one chain
//! coalesce: the first sets `IOINPROG` and reads, everyone else sleeps on
//! the chain's I/O condvar. Check codes are verified on the first
//! successful load only; `TESTEDGOOD` then stays set for the life of the
//! chain. Failures become sticky chain error bits and never abort the
//! caller: the lock is still held and the caller decides what to do.

use crate::chain::{Chain, ChainBytes, ChainFlags, ChainId, raw_inode_direct};
use crate::store::ChainStore;
use bitflags::bitflags;
use h2_error::ErrorFlags;
use h2_ondisk::{Blockref, BrefType, check, inode_blockset_range, live_zero, parse_blockref_array};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{trace, warn};

/// When a lock should also resolve the chain's media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolve {
    /// Never load.
    Never,
    /// Load metadata, skip file data.
    Maybe,
    /// Always load.
    Always,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LockFlags: u32 {
        const SHARED    = 0x1;
        /// Shared re-acquisition that does not queue behind writers.
        const LOCKAGAIN = 0x2;
        /// Fail with `EAGAIN` instead of sleeping.
        const NONBLOCK  = 0x4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockHow {
    pub resolve: Resolve,
    pub flags: LockFlags,
}

impl LockHow {
    #[must_use]
    pub const fn exclusive(resolve: Resolve) -> Self {
        Self {
            resolve,
            flags: LockFlags::empty(),
        }
    }

    #[must_use]
    pub const fn shared(resolve: Resolve) -> Self {
        Self {
            resolve,
            flags: LockFlags::SHARED,
        }
    }

    #[must_use]
    pub const fn with(self, flags: LockFlags) -> Self {
        Self {
            resolve: self.resolve,
            flags: self.flags.union(flags),
        }
    }
}

struct Loaded {
    data: Option<ChainBytes>,
    brefs: Option<Arc<[Blockref]>>,
    error: ErrorFlags,
}

impl ChainStore {
    /// Lock `id` and optionally resolve its media.
    ///
    /// The lock is held on return whatever the returned error bits say,
    /// except for `EAGAIN` from a `NONBLOCK` attempt, which acquires nothing.
    #[must_use = "lock errors must be checked"]
    pub fn lock(&self, id: ChainId, how: LockHow) -> ErrorFlags {
        let chain = self.get(id);
        debug_assert!(chain.refs() > 0, "lock of unreferenced chain {id}");
        let shared = how.flags.contains(LockFlags::SHARED);
        let again = how.flags.contains(LockFlags::LOCKAGAIN);
        if how.flags.contains(LockFlags::NONBLOCK) {
            let ok = if shared {
                chain.lock.try_lock_shared(again)
            } else {
                chain.lock.try_lock_exclusive()
            };
            if !ok {
                return ErrorFlags::EAGAIN;
            }
        } else if shared {
            chain.lock.lock_shared(again);
        } else {
            chain.lock.lock_exclusive();
        }
        chain.payload.lock().lockcnt += 1;

        let load = match how.resolve {
            Resolve::Never => false,
            Resolve::Maybe => chain.btype() != BrefType::Data,
            Resolve::Always => true,
        };
        if load {
            self.load(&chain);
        }
        chain.error()
    }

    /// Undo one [`lock`](Self::lock). The last unlock releases the media
    /// buffer unless the payload is embedded.
    pub fn unlock(&self, id: ChainId) {
        let chain = self.get(id);
        Self::release_lockcnt(&chain);
        chain.lock.unlock();
    }

    /// Take a reference plus a lock count without the sleep lock.
    ///
    /// Used to hand a locked chain to another thread: the receiver can read
    /// the resolved media through [`Chain::data`] until it calls
    /// [`drop_unhold`](Self::drop_unhold).
    pub fn ref_hold(&self, id: ChainId) {
        self.ref_chain(id);
        self.get(id).payload.lock().lockcnt += 1;
    }

    pub fn drop_unhold(&self, id: ChainId) {
        let chain = self.get(id);
        Self::release_lockcnt(&chain);
        drop(chain);
        self.drop_chain(id);
    }

    fn release_lockcnt(chain: &Chain) {
        let mut payload = chain.payload.lock();
        assert!(payload.lockcnt > 0, "unlock of chain {} that is not locked", chain.id());
        payload.lockcnt -= 1;
        if payload.lockcnt == 0 {
            payload.attempted = false;
        }
        if payload.lockcnt == 0 && !chain.flags().contains(ChainFlags::EMBEDDED) {
            let data = payload.data.take();
            payload.brefs = None;
            drop(payload);
            drop(data);
        }
    }

    /// Resolve media for a locked chain, coalescing concurrent loads.
    fn load(&self, chain: &Chain) {
        let mut payload = chain.payload.lock();
        let mut waited = false;
        loop {
            if payload.data.is_some() || payload.attempted || chain.bytes() == 0 {
                return;
            }
            // A failed load we waited on is reported through the chain error.
            if waited && !chain.flags().contains(ChainFlags::IOINPROG) {
                return;
            }
            if chain.flags().contains(ChainFlags::IOINPROG) {
                chain.set_flags(ChainFlags::IOSIGNAL);
                chain.io_cv.wait(&mut payload);
                waited = true;
                continue;
            }
            break;
        }
        chain.set_flags(ChainFlags::IOINPROG);
        drop(payload);

        let loaded = self.read_media(chain);

        let mut payload = chain.payload.lock();
        if !loaded.error.is_empty() {
            chain.set_error(loaded.error);
        }
        if let Some(brefs) = loaded.brefs {
            payload.live_zero = live_zero(&brefs);
            payload.brefs = Some(brefs);
            chain.set_flags(ChainFlags::COUNTEDBREFS);
        }
        payload.data = loaded.data;
        payload.attempted = true;
        let signal = chain.flags().contains(ChainFlags::IOSIGNAL);
        chain.clear_flags(ChainFlags::IOINPROG | ChainFlags::IOSIGNAL);
        drop(payload);
        if signal {
            chain.io_cv.notify_all();
        }
    }

    fn read_media(&self, chain: &Chain) -> Loaded {
        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        let bref = chain.bref();
        let offset = bref.data_offset().0;
        let len = chain.bytes() as usize;
        let fail = |error| Loaded {
            data: None,
            brefs: None,
            error,
        };

        let dio = match self.dio.getblk(bref.btype.to_raw(), offset, len) {
            Ok(dio) => dio,
            Err(err) => {
                self.counters.io_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "h2::chain",
                    chain = %chain.id(),
                    offset,
                    len,
                    error = %err,
                    "chain_load_io_error"
                );
                return fail(ErrorFlags::EIO);
            }
        };
        let Some(data) = ChainBytes::from_dio(dio, offset, len) else {
            self.counters.io_errors.fetch_add(1, Ordering::Relaxed);
            warn!(target: "h2::chain", chain = %chain.id(), offset, len, "chain_load_short_media");
            return fail(ErrorFlags::EIO);
        };

        let mut error = ErrorFlags::empty();
        if !chain.flags().contains(ChainFlags::TESTEDGOOD) {
            let outcome = check::verify(bref, &data);
            if outcome.is_failure() {
                self.counters.check_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "h2::chain",
                    chain = %chain.id(),
                    btype = %bref.btype,
                    offset,
                    method = check::method_name(bref.check_method()),
                    ?outcome,
                    "chain_check_failed"
                );
                error |= ErrorFlags::CHECK;
            } else {
                chain.set_flags(ChainFlags::TESTEDGOOD);
            }
        }

        let brefs = match Self::node_blockrefs(chain, &data) {
            Ok(brefs) => brefs,
            Err(err) => {
                error |= err;
                None
            }
        };
        trace!(target: "h2::chain", chain = %chain.id(), offset, len, error = %error, "chain_load");
        Loaded {
            data: Some(data),
            brefs,
            error,
        }
    }

    /// Parse the blockref array a node-type chain's media carries.
    fn node_blockrefs(chain: &Chain, data: &[u8]) -> Result<Option<Arc<[Blockref]>>, ErrorFlags> {
        let raw = match chain.btype() {
            BrefType::Indirect | BrefType::FreemapNode => data,
            BrefType::Inode => {
                let range = inode_blockset_range();
                if data.len() < range.end {
                    return Err(ErrorFlags::BADBREF);
                }
                if raw_inode_direct(data) {
                    return Ok(None);
                }
                &data[range]
            }
            _ => return Ok(None),
        };
        parse_blockref_array(raw)
            .map(|brefs| Some(Arc::from(brefs)))
            .map_err(|_| ErrorFlags::BADBREF)
    }
}
