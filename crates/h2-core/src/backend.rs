//! XOP backends.
//!
//! Each backend walks one cluster member's chain topology and feeds what it
//! finds. Backends never interpret results beyond what they need to pick
//! them; decoding is the frontend's job.

use crate::inode::InodeRef;
use crate::xop::{XopHead, XopOp};
use h2_chain::{ChainId, ChainStore, LockHow, LookupFlags, Resolve};
use h2_error::ErrorFlags;
use h2_ondisk::{BrefType, Dirent, InodeData, InodeMeta, dirhash};
use h2_types::{HAMMER2_DIRHASH_LOMASK, HAMMER2_KEY_MAX};
use std::ops::ControlFlow;
use tracing::{trace, warn};

const SCAN: LookupFlags = LookupFlags::SHARED;

/// Lock member `clindex` of `inode` as a lookup parent.
fn member(store: &ChainStore, inode: &InodeRef, clindex: usize) -> Result<ChainId, ErrorFlags> {
    let (id, error) = inode
        .chain(clindex, LockHow::shared(Resolve::Always))
        .ok_or(ErrorFlags::EIO)?;
    if error.intersects(ErrorFlags::MEDIA) {
        store.lookup_done(id);
        return Err(error);
    }
    Ok(id)
}

fn xop_member(xop: &XopHead, clindex: usize) -> Result<ChainId, ErrorFlags> {
    let inode = xop.inode().ok_or(ErrorFlags::ABORTED)?;
    member(xop.store(), &inode, clindex)
}

/// Visit every chain overlapping `[key_beg, key_end]` under the locked
/// `parent`, then unlock and release the parent. The visitor sees each
/// chain locked; returning `Break` stops the walk with that error.
pub(crate) fn walk(
    store: &ChainStore,
    parent: ChainId,
    key_beg: u64,
    key_end: u64,
    flags: LookupFlags,
    mut visit: impl FnMut(ChainId, ErrorFlags) -> ControlFlow<ErrorFlags>,
) -> ErrorFlags {
    let mut parentp = parent;
    let mut step = store.lookup(&mut parentp, key_beg, key_end, flags);
    while let Some(id) = step.chain {
        if let ControlFlow::Break(stop) = visit(id, step.error) {
            store.release(id);
            store.lookup_done(parentp);
            return stop;
        }
        step = store.next(&mut parentp, Some(id), key_end, flags);
    }
    store.lookup_done(parentp);
    step.error
}

/// Feed every chain the walk visits, stopping when the frontend detaches.
fn feed_all(
    xop: &XopHead,
    clindex: usize,
    key_beg: u64,
    key_end: u64,
    flags: LookupFlags,
) -> ErrorFlags {
    let parent = match xop_member(xop, clindex) {
        Ok(parent) => parent,
        Err(error) => return error,
    };
    walk(xop.store(), parent, key_beg, key_end, flags, |id, error| {
        let fed = xop.feed(Some(id), clindex, error);
        if fed.is_empty() {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(fed)
        }
    })
}

/// Find inode `inum` in the inode index under `root`'s member. On success the
/// returned chain is locked and referenced.
fn lookup_inum(
    store: &ChainStore,
    root: &InodeRef,
    clindex: usize,
    inum: u64,
) -> Result<(ChainId, ErrorFlags), ErrorFlags> {
    let mut parentp = member(store, root, clindex)?;
    let step = store.lookup(&mut parentp, inum, inum, SCAN);
    store.lookup_done(parentp);
    let Some(id) = step.chain else {
        return Err(step.error | ErrorFlags::ENOENT);
    };
    let chain = store.get(id);
    let found = if chain.btype() == BrefType::Inode {
        chain.data().and_then(|data| InodeMeta::parse(&data).ok()).map(|meta| meta.inum)
    } else {
        None
    };
    drop(chain);
    if found == Some(inum) {
        Ok((id, step.error))
    } else {
        warn!(target: "h2::xop", inum, found = ?found, "inode_index_mismatch");
        Ok((id, step.error | ErrorFlags::BADBREF))
    }
}

// ── Backends ────────────────────────────────────────────────────────────────

/// Feed the inode's own chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ipcluster;

impl XopOp for Ipcluster {
    fn name(&self) -> &'static str {
        "ipcluster"
    }

    fn run(&self, xop: &XopHead, clindex: usize) -> ErrorFlags {
        let Some(inode) = xop.inode() else {
            return ErrorFlags::ABORTED;
        };
        let Some((id, error)) = inode.chain(clindex, LockHow::shared(Resolve::Always)) else {
            return ErrorFlags::EIO;
        };
        let fed = xop.feed(Some(id), clindex, error);
        xop.store().release(id);
        fed
    }
}

/// Find one inode by number in the PFS inode index. Runs against the PFS
/// root inode.
#[derive(Debug, Clone, Copy)]
pub struct LookupInum {
    pub inum: u64,
}

impl XopOp for LookupInum {
    fn name(&self) -> &'static str {
        "lookup_inum"
    }

    fn run(&self, xop: &XopHead, clindex: usize) -> ErrorFlags {
        let Some(root) = xop.inode() else {
            return ErrorFlags::ABORTED;
        };
        match lookup_inum(xop.store(), &root, clindex, self.inum) {
            Ok((id, error)) => {
                let fed = xop.feed(Some(id), clindex, error);
                xop.store().release(id);
                fed
            }
            Err(error) => error,
        }
    }
}

/// Resolve `name1` in a directory to its inode chain.
///
/// Candidates are every entry in the name's hash collision range. A DIRENT
/// match is chased through the PFS inode index; an embedded INODE entry is
/// the inode itself.
#[derive(Debug)]
pub struct Nresolve {
    pub root: InodeRef,
}

enum Hit {
    Inum(u64),
    Inode(ChainId, ErrorFlags),
}

impl XopOp for Nresolve {
    fn name(&self) -> &'static str {
        "nresolve"
    }

    fn run(&self, xop: &XopHead, clindex: usize) -> ErrorFlags {
        let store = xop.store();
        let name = xop.params().name1;
        let lhc = dirhash(&name);
        let parent = match xop_member(xop, clindex) {
            Ok(parent) => parent,
            Err(error) => return error,
        };

        let mut hit = None;
        let error = walk(store, parent, lhc, lhc | HAMMER2_DIRHASH_LOMASK, SCAN, |id, error| {
            let chain = store.get(id);
            let matched = match chain.btype() {
                BrefType::Dirent => Dirent::parse(chain.bref(), chain.data().as_deref())
                    .ok()
                    .filter(|d| d.name == name)
                    .map(|d| Hit::Inum(d.head.inum)),
                BrefType::Inode => chain
                    .data()
                    .and_then(|data| InodeData::parse(&data).ok())
                    .filter(|ip| ip.filename == name)
                    .map(|_| {
                        store.ref_chain(id);
                        Hit::Inode(id, error)
                    }),
                _ => None,
            };
            drop(chain);
            match matched {
                Some(found) => {
                    hit = Some(found);
                    ControlFlow::Break(ErrorFlags::empty())
                }
                None => ControlFlow::Continue(()),
            }
        });

        match hit {
            None => {
                trace!(target: "h2::xop", lhc, clindex, "nresolve_miss");
                if error.is_empty() {
                    ErrorFlags::ENOENT
                } else {
                    error
                }
            }
            Some(Hit::Inode(id, error)) => {
                // The walk unlocked the match; the extra reference kept it.
                let relock = store.lock(id, LockHow::shared(Resolve::Maybe));
                let fed = xop.feed(Some(id), clindex, error | relock);
                store.release(id);
                fed
            }
            Some(Hit::Inum(inum)) => match lookup_inum(store, &self.root, clindex, inum) {
                Ok((id, error)) => {
                    let fed = xop.feed(Some(id), clindex, error);
                    store.release(id);
                    fed
                }
                Err(error) => {
                    warn!(target: "h2::xop", inum, error = %error, "nresolve_dangling_dirent");
                    error
                }
            },
        }
    }
}

/// Feed every directory entry from `key_beg` to the end of key space.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readdir;

impl XopOp for Readdir {
    fn name(&self) -> &'static str {
        "readdir"
    }

    fn run(&self, xop: &XopHead, clindex: usize) -> ErrorFlags {
        let beg = xop.params().key_beg;
        feed_all(xop, clindex, beg, HAMMER2_KEY_MAX, SCAN | LookupFlags::NODIRECT)
    }
}

/// Feed everything in the hash collision range starting at `key_beg`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanLhc;

impl XopOp for ScanLhc {
    fn name(&self) -> &'static str {
        "scanlhc"
    }

    fn run(&self, xop: &XopHead, clindex: usize) -> ErrorFlags {
        let lhc = xop.params().key_beg;
        feed_all(xop, clindex, lhc, lhc | HAMMER2_DIRHASH_LOMASK, SCAN | LookupFlags::NODIRECT)
    }
}

/// Feed every leaf chain in `[key_beg, key_end]` without resolving data.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanAll;

impl XopOp for ScanAll {
    fn name(&self) -> &'static str {
        "scanall"
    }

    fn run(&self, xop: &XopHead, clindex: usize) -> ErrorFlags {
        let params = xop.params();
        feed_all(
            xop,
            clindex,
            params.key_beg,
            params.key_end,
            SCAN | LookupFlags::NODATA | LookupFlags::NODIRECT,
        )
    }
}

/// Feed the data chain for the logical block at `key_beg`.
///
/// A direct-data inode feeds itself. Nothing at the key is a hole and ends
/// the member with `ENOENT`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrategyRead;

impl XopOp for StrategyRead {
    fn name(&self) -> &'static str {
        "strategy_read"
    }

    fn run(&self, xop: &XopHead, clindex: usize) -> ErrorFlags {
        let lbase = xop.params().key_beg;
        feed_all(xop, clindex, lbase, lbase, SCAN | LookupFlags::ALWAYS)
    }
}
