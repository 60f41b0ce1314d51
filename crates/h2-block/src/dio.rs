//! IO buffer cache.
//!
//! Every media block the chain engine loads lives inside one 64 KiB
//! physical buffer. A [`Dio`] wrapper exists per physical buffer base and is
//! kept in a per-device tree. [`DioCache::getblk`] returns a referenced
//! [`DioRef`]; dropping it (or calling [`DioRef::putblk`]) releases the
//! reference. When the last reference goes away the buffer is detached and
//! the wrapper stays behind as metadata only. Once the number of wrappers
//! exceeds the soft limit, a batch eviction reclaims the least active
//! unreferenced wrappers.

use crate::ByteDevice;
use h2_error::{H2Error, Result};
use h2_types::{HAMMER2_PBUFMASK, HAMMER2_PBUFSIZE};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, trace};

/// Activity counter ceiling.
const DIO_ACT_MAX: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DioConfig {
    /// Wrapper count above which batch eviction runs.
    pub soft_limit: usize,
    /// Physical buffers read ahead on a miss.
    pub readahead: usize,
}

impl Default for DioConfig {
    fn default() -> Self {
        Self {
            soft_limit: 2048,
            readahead: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DioStats {
    pub wrappers: usize,
    pub hits: u64,
    pub misses: u64,
    pub readahead: u64,
    pub evicted: u64,
}

#[derive(Debug, Default)]
struct DioBuf {
    data: Option<Arc<[u8]>>,
    btype: u8,
    prefetched: bool,
}

/// One physical buffer wrapper.
#[derive(Debug)]
pub struct Dio {
    pbase: u64,
    refs: AtomicU32,
    act: AtomicU32,
    buf: Mutex<DioBuf>,
}

impl Dio {
    fn new(pbase: u64) -> Self {
        Self {
            pbase,
            refs: AtomicU32::new(0),
            act: AtomicU32::new(0),
            buf: Mutex::new(DioBuf::default()),
        }
    }

    #[must_use]
    pub fn pbase(&self) -> u64 {
        self.pbase
    }

    #[must_use]
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.buf.lock().data.is_some()
    }

    fn bump_activity(&self) {
        let _ = self
            .act
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |act| {
                Some((act + 1).min(DIO_ACT_MAX))
            });
    }

    fn put(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "dio refcount underflow");
        if prev != 1 {
            return;
        }
        let mut buf = self.buf.lock();
        if self.refs.load(Ordering::Acquire) == 0 && buf.data.is_some() {
            buf.data = None;
            buf.prefetched = false;
            trace!(pbase = self.pbase, btype = buf.btype, "dio_detach");
        }
        drop(buf);
    }
}

/// Referenced handle on a resolved physical buffer.
#[derive(Debug)]
pub struct DioRef {
    dio: Arc<Dio>,
    data: Arc<[u8]>,
}

impl DioRef {
    #[must_use]
    pub fn pbase(&self) -> u64 {
        self.dio.pbase
    }

    /// The whole physical buffer (may be short at the end of the device).
    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.data
    }

    /// Sub-range of the buffer for media at device offset `offset`.
    pub fn data(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let rel = offset
            .checked_sub(self.dio.pbase)
            .and_then(|rel| usize::try_from(rel).ok())
            .ok_or_else(|| H2Error::InvalidArgument(format!("offset {offset:#x} below pbase")))?;
        let end = rel
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                H2Error::Corruption {
                    offset,
                    detail: format!("media of {len} bytes runs past end of device"),
                }
            })?;
        Ok(&self.data[rel..end])
    }

    /// Release the reference. Equivalent to dropping the handle.
    pub fn putblk(self) {
        drop(self);
    }
}

impl Clone for DioRef {
    fn clone(&self) -> Self {
        self.dio.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            dio: Arc::clone(&self.dio),
            data: Arc::clone(&self.data),
        }
    }
}

impl Drop for DioRef {
    fn drop(&mut self) {
        self.dio.put();
    }
}

/// Per-device IO buffer cache.
pub struct DioCache {
    dev: Arc<dyn ByteDevice>,
    tree: Mutex<BTreeMap<u64, Arc<Dio>>>,
    config: DioConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    readahead: AtomicU64,
    evicted: AtomicU64,
}

impl std::fmt::Debug for DioCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DioCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl DioCache {
    #[must_use]
    pub fn new(dev: Arc<dyn ByteDevice>, config: DioConfig) -> Self {
        Self {
            dev,
            tree: Mutex::new(BTreeMap::new()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            readahead: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn ByteDevice> {
        &self.dev
    }

    #[must_use]
    pub fn config(&self) -> DioConfig {
        self.config
    }

    /// Reference the physical buffer holding `[offset, offset + size)`,
    /// reading it from the device if it is not resolved.
    ///
    /// `btype` records the blockref type of the first user for diagnostics.
    /// The range must not cross a 64 KiB boundary.
    pub fn getblk(&self, btype: u8, offset: u64, size: usize) -> Result<DioRef> {
        let size_u64 = u64::try_from(size)
            .map_err(|_| H2Error::InvalidArgument("size overflows u64".to_owned()))?;
        if size_u64 > HAMMER2_PBUFSIZE || (offset & HAMMER2_PBUFMASK) + size_u64 > HAMMER2_PBUFSIZE
        {
            return Err(H2Error::Corruption {
                offset,
                detail: format!("media of {size} bytes crosses a physical buffer"),
            });
        }
        let pbase = offset & !HAMMER2_PBUFMASK;
        let dio = self.reference(pbase);

        let mut buf = dio.buf.lock();
        let data = if let Some(data) = buf.data.clone() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            if buf.prefetched {
                buf.prefetched = false;
                trace!(pbase, "dio_readahead_hit");
            }
            data
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            let data = match self.read_cluster(pbase) {
                Ok(data) => data,
                Err(err) => {
                    drop(buf);
                    dio.put();
                    return Err(err);
                }
            };
            buf.data = Some(Arc::clone(&data));
            buf.btype = btype;
            data
        };
        drop(buf);
        trace!(pbase, offset, size, btype, "dio_getblk");
        Ok(DioRef { dio, data })
    }

    /// Release a reference obtained from [`getblk`](Self::getblk).
    pub fn putblk(&self, dio: DioRef) {
        dio.putblk();
    }

    fn reference(&self, pbase: u64) -> Arc<Dio> {
        let mut tree = self.tree.lock();
        let (dio, inserted) = match tree.get(&pbase) {
            Some(dio) => (Arc::clone(dio), false),
            None => {
                let dio = Arc::new(Dio::new(pbase));
                tree.insert(pbase, Arc::clone(&dio));
                (dio, true)
            }
        };
        dio.refs.fetch_add(1, Ordering::AcqRel);
        if inserted && tree.len() > self.config.soft_limit {
            self.evict_batch(&mut tree);
        }
        drop(tree);
        dio.bump_activity();
        dio
    }

    /// Read the buffer at `pbase`, plus read-ahead buffers when configured.
    ///
    /// Read-ahead buffers are installed into unresolved wrappers and stay
    /// attached until first use or eviction.
    fn read_cluster(&self, pbase: u64) -> Result<Arc<[u8]>> {
        let dev_len = self.dev.len_bytes();
        if pbase >= dev_len {
            return Err(H2Error::Corruption {
                offset: pbase,
                detail: format!("physical buffer beyond device end {dev_len:#x}"),
            });
        }
        let span_blocks = 1 + u64::try_from(self.config.readahead).unwrap_or(0);
        let span_end = pbase
            .saturating_add(span_blocks.saturating_mul(HAMMER2_PBUFSIZE))
            .min(dev_len);
        let len = usize::try_from(span_end - pbase)
            .map_err(|_| H2Error::InvalidArgument("read span overflows usize".to_owned()))?;
        let mut raw = vec![0_u8; len];
        self.dev.read_exact_at(pbase, &mut raw)?;

        let pbuf = usize::try_from(HAMMER2_PBUFSIZE).unwrap_or(usize::MAX);
        let mut chunks = raw.chunks(pbuf);
        let first: Arc<[u8]> = Arc::from(chunks.next().unwrap_or_default());
        let mut next_base = pbase + HAMMER2_PBUFSIZE;
        for chunk in chunks {
            self.install_readahead(next_base, chunk);
            next_base += HAMMER2_PBUFSIZE;
        }
        Ok(first)
    }

    fn install_readahead(&self, pbase: u64, chunk: &[u8]) {
        let mut tree = self.tree.lock();
        let dio = Arc::clone(
            tree.entry(pbase)
                .or_insert_with(|| Arc::new(Dio::new(pbase))),
        );
        drop(tree);
        let mut buf = dio.buf.lock();
        if buf.data.is_none() {
            buf.data = Some(Arc::from(chunk));
            buf.prefetched = true;
            self.readahead.fetch_add(1, Ordering::Relaxed);
            trace!(pbase, "dio_readahead");
        }
        drop(buf);
    }

    /// Reclaim unreferenced wrappers, least active first.
    ///
    /// Brings the tree to three quarters of the soft limit where possible and
    /// halves the activity of the survivors.
    fn evict_batch(&self, tree: &mut BTreeMap<u64, Arc<Dio>>) {
        let target = self.config.soft_limit - self.config.soft_limit / 4;
        let excess = tree.len().saturating_sub(target);
        let mut idle: Vec<(u32, u64)> = tree
            .values()
            .filter(|dio| dio.refs() == 0)
            .map(|dio| (dio.act.load(Ordering::Acquire), dio.pbase))
            .collect();
        idle.sort_unstable();
        let mut evicted = 0_u64;
        for (_, pbase) in idle.iter().take(excess) {
            if let Some(dio) = tree.get(pbase) {
                if dio.refs() == 0 {
                    tree.remove(pbase);
                    evicted += 1;
                }
            }
        }
        for (_, pbase) in idle.iter().skip(excess) {
            if let Some(dio) = tree.get(pbase) {
                let _ = dio
                    .act
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |act| Some(act / 2));
            }
        }
        self.evicted.fetch_add(evicted, Ordering::Relaxed);
        debug!(
            evicted,
            remaining = tree.len(),
            soft_limit = self.config.soft_limit,
            "dio_evict_batch"
        );
    }

    /// Drop every unreferenced wrapper.
    pub fn invalidate_unreferenced(&self) -> usize {
        let mut tree = self.tree.lock();
        let before = tree.len();
        tree.retain(|_, dio| dio.refs() != 0);
        let removed = before - tree.len();
        drop(tree);
        self.evicted
            .fetch_add(u64::try_from(removed).unwrap_or(0), Ordering::Relaxed);
        removed
    }

    /// Current reference count of the wrapper at `pbase`, if one exists.
    #[must_use]
    pub fn refs_at(&self, pbase: u64) -> Option<u32> {
        self.tree.lock().get(&pbase).map(|dio| dio.refs())
    }

    /// True when the wrapper at `pbase` currently holds a buffer.
    #[must_use]
    pub fn is_resolved(&self, pbase: u64) -> bool {
        let dio = self.tree.lock().get(&pbase).cloned();
        dio.is_some_and(|dio| dio.is_resolved())
    }

    #[must_use]
    pub fn stats(&self) -> DioStats {
        DioStats {
            wrappers: self.tree.lock().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            readahead: self.readahead.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}
