//! The in-memory chain node.
//!
//! A chain mirrors one blockref. Its identity (`bref`) never changes after
//! allocation; everything that does change lives behind one of three
//! short-hold locks:
//!
//! - `state`: refcount, lifecycle and topology (parent link, child tree).
//! - `payload`: lock count and the loaded media (data + parsed blockrefs).
//! - `lock`: the long-hold sleep lock callers take through
//!   [`ChainStore::lock`](crate::ChainStore::lock).
//!
//! Short locks nest in the order parent `state` → child `state` → LRU list
//! → arena. `payload` is never held while taking a `state` lock.

use crate::lock::SleepLock;
use bitflags::bitflags;
use h2_block::DioRef;
use h2_error::ErrorFlags;
use h2_ondisk::{Blockref, BrefType};
use h2_types::{HAMMER2_OPFLAG_DIRECTDATA, HAMMER2_RADIX_MAX};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, Range};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Offset of `op_flags` inside a raw inode.
const INODE_OP_FLAGS_OFFSET: usize = 0x51;

/// True when raw inode bytes carry the DIRECTDATA op flag.
pub(crate) fn raw_inode_direct(data: &[u8]) -> bool {
    data.get(INODE_OP_FLAGS_OFFSET)
        .is_some_and(|op| op & HAMMER2_OPFLAG_DIRECTDATA != 0)
}

// ── Identity ────────────────────────────────────────────────────────────────

/// Generation-checked handle on a chain in a [`ChainStore`](crate::ChainStore).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainId {
    slot: u32,
    generation: u32,
}

impl ChainId {
    #[must_use]
    pub const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    #[must_use]
    pub const fn slot(self) -> u32 {
        self.slot
    }

    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}.{}", self.slot, self.generation)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ChainFlags: u32 {
        /// Allocated and not yet freed.
        const ALLOCATED    = 0x0000_0001;
        /// Freed; the handle is dead.
        const DESTROY      = 0x0000_0002;
        /// Linked into its parent's child tree.
        const ONRBTREE     = 0x0000_0004;
        /// Parked on the LRU list.
        const ONLRU        = 0x0000_0008;
        /// A load is in flight.
        const IOINPROG     = 0x0000_0010;
        /// Someone is waiting for the in-flight load.
        const IOSIGNAL     = 0x0000_0020;
        /// Media passed its check code once; never re-verified.
        const TESTEDGOOD   = 0x0000_0040;
        /// The blockref array was parsed and its live extent counted.
        const COUNTEDBREFS = 0x0000_0080;
        /// Payload is embedded (volume/freemap roots) and never released.
        const EMBEDDED     = 0x0000_0100;
    }
}

/// Where a chain sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    /// At least one reference is held.
    Referenced,
    /// Unreferenced, childless, still linked, parked on the LRU.
    CachedUnreferenced,
    /// Unreferenced but kept alive by live children.
    PinnedByChildren,
    /// Returned to the arena.
    Freed,
}

// ── Payload ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Backing {
    Dio(DioRef),
    Embedded(Arc<[u8]>),
}

/// Borrowed view of a chain's media bytes.
///
/// Holding it keeps the underlying physical buffer resident; it does not
/// keep the chain locked.
#[derive(Debug, Clone)]
pub struct ChainBytes {
    backing: Backing,
    range: Range<usize>,
}

impl ChainBytes {
    pub(crate) fn from_dio(dio: DioRef, offset: u64, len: usize) -> Option<Self> {
        let rel = usize::try_from(offset.checked_sub(dio.pbase())?).ok()?;
        let end = rel.checked_add(len)?;
        if end > dio.buffer().len() {
            return None;
        }
        Some(Self {
            backing: Backing::Dio(dio),
            range: rel..end,
        })
    }

    pub(crate) fn embedded(bytes: Arc<[u8]>) -> Self {
        let range = 0..bytes.len();
        Self {
            backing: Backing::Embedded(bytes),
            range,
        }
    }

    #[must_use]
    pub fn is_embedded(&self) -> bool {
        matches!(self.backing, Backing::Embedded(_))
    }
}

impl Deref for ChainBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.backing {
            Backing::Dio(dio) => &dio.buffer()[self.range.clone()],
            Backing::Embedded(bytes) => &bytes[self.range.clone()],
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Payload {
    pub(crate) lockcnt: u32,
    /// A load ran in the current lock cycle, whatever its outcome.
    pub(crate) attempted: bool,
    pub(crate) data: Option<ChainBytes>,
    pub(crate) brefs: Option<Arc<[Blockref]>>,
    pub(crate) live_zero: usize,
}

// ── Topology ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChildEntry {
    pub(crate) end: u64,
    pub(crate) id: ChainId,
}

#[derive(Debug)]
pub(crate) struct ChainState {
    pub(crate) refs: u32,
    pub(crate) life: Lifecycle,
    pub(crate) parent: Option<ChainId>,
    /// In-memory children keyed by their base key.
    pub(crate) children: BTreeMap<u64, ChildEntry>,
    /// Bumped on every insertion or removal in `children`.
    pub(crate) generation: u64,
    pub(crate) lru_seq: Option<u64>,
}

// ── Chain ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Chain {
    id: ChainId,
    bref: Blockref,
    bytes: u32,
    flags: AtomicU32,
    error: AtomicU32,
    /// Hint for the blockref array scan.
    pub(crate) cache_index: AtomicUsize,
    pub(crate) state: Mutex<ChainState>,
    pub(crate) payload: Mutex<Payload>,
    pub(crate) io_cv: Condvar,
    pub(crate) lock: SleepLock,
}

impl Chain {
    /// A fresh chain holding one reference, unlinked.
    ///
    /// A media radix larger than one physical buffer marks the chain
    /// `BADBREF` with no loadable media.
    #[must_use]
    pub(crate) fn new(id: ChainId, bref: Blockref) -> Self {
        let (bytes, error) = if bref.data_radix() > HAMMER2_RADIX_MAX {
            (0, ErrorFlags::BADBREF)
        } else {
            (
                u32::try_from(bref.data_bytes()).unwrap_or(0),
                ErrorFlags::empty(),
            )
        };
        Self {
            id,
            bref,
            bytes,
            flags: AtomicU32::new(ChainFlags::ALLOCATED.bits()),
            error: AtomicU32::new(error.bits()),
            cache_index: AtomicUsize::new(0),
            state: Mutex::new(ChainState {
                refs: 1,
                life: Lifecycle::Referenced,
                parent: None,
                children: BTreeMap::new(),
                generation: 0,
                lru_seq: None,
            }),
            payload: Mutex::new(Payload::default()),
            io_cv: Condvar::new(),
            lock: SleepLock::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> ChainId {
        self.id
    }

    #[must_use]
    pub fn bref(&self) -> &Blockref {
        &self.bref
    }

    #[must_use]
    pub fn btype(&self) -> BrefType {
        self.bref.btype
    }

    #[must_use]
    pub fn key(&self) -> u64 {
        self.bref.key
    }

    #[must_use]
    pub fn keybits(&self) -> u8 {
        self.bref.keybits
    }

    /// Media size in bytes (zero when the blockref references no media).
    #[must_use]
    pub fn bytes(&self) -> u32 {
        self.bytes
    }

    #[must_use]
    pub fn flags(&self) -> ChainFlags {
        ChainFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: ChainFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, flags: ChainFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Sticky error bits accumulated by loads of this chain.
    #[must_use]
    pub fn error(&self) -> ErrorFlags {
        ErrorFlags::from_bits_retain(self.error.load(Ordering::Acquire))
    }

    pub(crate) fn set_error(&self, err: ErrorFlags) {
        self.error.fetch_or(err.bits(), Ordering::AcqRel);
    }

    #[must_use]
    pub fn refs(&self) -> u32 {
        self.state.lock().refs
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().life
    }

    #[must_use]
    pub fn parent(&self) -> Option<ChainId> {
        self.state.lock().parent
    }

    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.state.lock().parent.is_some()
    }

    /// Number of in-memory children.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.state.lock().children.len()
    }

    #[must_use]
    pub fn child_generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// In-memory children in key order.
    #[must_use]
    pub fn children(&self) -> Vec<ChainId> {
        self.state
            .lock()
            .children
            .values()
            .map(|entry| entry.id)
            .collect()
    }

    #[must_use]
    pub fn lockcnt(&self) -> u32 {
        self.payload.lock().lockcnt
    }

    #[must_use]
    pub fn is_sleep_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Loaded media, if resolved. Only meaningful while the caller holds
    /// the chain locked or held.
    #[must_use]
    pub fn data(&self) -> Option<ChainBytes> {
        self.payload.lock().data.clone()
    }

    /// Parsed blockref array of a node-type chain whose payload is resolved.
    #[must_use]
    pub fn blockrefs(&self) -> Option<Arc<[Blockref]>> {
        self.payload.lock().brefs.clone()
    }

    /// Array slots up to the last non-empty blockref.
    #[must_use]
    pub fn live_zero(&self) -> usize {
        self.payload.lock().live_zero
    }

    /// True for an inode chain whose loaded media stores file data inline.
    #[must_use]
    pub fn has_direct_data(&self) -> bool {
        if self.btype() != BrefType::Inode {
            return false;
        }
        self.payload
            .lock()
            .data
            .as_ref()
            .is_some_and(|data| raw_inode_direct(data))
    }

    /// Whether this chain's blockref can carry children in a blockref array.
    #[must_use]
    pub fn is_node(&self) -> bool {
        matches!(
            self.btype(),
            BrefType::Indirect
                | BrefType::FreemapNode
                | BrefType::Inode
                | BrefType::Volume
                | BrefType::Freemap
        )
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} key={:016x}/{} bytes={}",
            self.id,
            self.btype(),
            self.key(),
            self.keybits(),
            self.bytes
        )
    }
}
