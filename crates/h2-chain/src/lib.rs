#![forbid(unsafe_code)]
//! HAMMER2 chain engine.
//!
//! A chain is the in-memory representation of one blockref. Chains form a
//! sparse tree that mirrors the on-media radix tree: only the parts that
//! were looked up are instantiated. The [`ChainStore`] owns every chain of
//! one filesystem instance in a generation-checked arena and hands out
//! [`ChainId`] handles.
//!
//! Two counters govern a chain:
//!
//! - `refs` keeps it allocated. At zero a linked metadata chain parks on the
//!   LRU (still linked, reusable by the next lookup), a chain with live
//!   children is pinned, and anything else is unlinked and freed. Freeing
//!   the last child of an unreferenced parent frees the parent in turn.
//! - `lockcnt` keeps its media resolved. The first lock loads (and
//!   verifies) the media, the last unlock releases the buffer.
//!
//! Lookup walks a parent's combined view of in-memory children and the
//! on-media blockref array, descending through indirect blocks.

mod arena;
mod chain;
mod io;
mod lock;
mod lookup;
mod lru;
mod store;

pub use chain::{Chain, ChainBytes, ChainFlags, ChainId, Lifecycle};
pub use io::{LockFlags, LockHow, Resolve};
pub use lock::SleepLock;
pub use lookup::{Lookup, LookupFlags, scan_range};
pub use store::{ChainConfig, ChainStats, ChainStore};
