//! PFS mount and the read-only frontends.
//!
//! A mounted PFS owns an inode tree, an XOP pool and a per-inode serializer.
//! Every frontend operation allocates an XOP against an inode, runs one of
//! the [`backend`](crate::backend) ops on each cluster member, and turns the
//! collected chains into inodes, directory entries or file bytes. The inode
//! stays locked shared from start until the XOP is retired.

use crate::backend::{LookupInum, Nresolve, Readdir, StrategyRead, walk};
use crate::cluster::Cluster;
use crate::inode::{InodeLock, InodeRef, InodeTree};
use crate::ipdep::IpDep;
use crate::volume::Volume;
use crate::xop::{CollectFlags, Collected, XOPMASK_VOP, XopHead, XopOp, XopPool, XopStats};
use h2_block::DioStats;
use h2_chain::{ChainId, ChainStats, ChainStore, LookupFlags};
use h2_error::{ErrorFlags, H2Error, Result};
use h2_ondisk::check::method_name;
use h2_ondisk::compress::{comp_name, decompress};
use h2_ondisk::{BrefType, Dirent, InodeData, InodeMeta, ObjType, dirhash_range};
use h2_types::{
    HAMMER2_COMP_AUTOZERO, HAMMER2_DIRHASH_USERMSK, HAMMER2_DIRHASH_VISIBLE, HAMMER2_KEY_MAX,
    HAMMER2_PBUFMASK, HAMMER2_PBUFSIZE, radix_to_bytes,
};
use serde::{Deserialize, Serialize};
use std::ops::{ControlFlow, Deref};
use std::sync::Arc;
use tracing::{debug, info, warn};

const NAME_MAX: usize = 255;

/// One directory entry as returned by [`Pfs::readdir`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub inum: u64,
    pub kind: ObjType,
    /// Directory hash key; 0 and 1 for `.` and `..`.
    pub key: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub inum: u64,
    pub kind: ObjType,
    pub mode: u32,
    pub nlinks: u64,
    pub size: u64,
    pub iparent: u64,
    pub ctime: u64,
    pub mtime: u64,
    pub atime: u64,
    pub btime: u64,
    pub comp: String,
    pub check: String,
    pub direct_data: bool,
    pub pfs_root: bool,
}

impl Stat {
    fn from_meta(meta: &InodeMeta) -> Self {
        Self {
            inum: meta.inum,
            kind: meta.kind(),
            mode: meta.mode,
            nlinks: meta.nlinks,
            size: meta.size,
            iparent: meta.iparent,
            ctime: meta.ctime,
            mtime: meta.mtime,
            atime: meta.atime,
            btime: meta.btime,
            comp: comp_name(meta.comp_algo).to_owned(),
            check: method_name(meta.check_algo).to_owned(),
            direct_data: meta.has_direct_data(),
            pfs_root: meta.is_pfs_root(),
        }
    }
}

/// A PFS root found in the super-root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PfsInfo {
    pub name: String,
    pub key: u64,
    pub inum: u64,
    pub pfs_type: u8,
    /// Next inode number the PFS would allocate.
    pub next_inum: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PfsStats {
    pub chains: ChainStats,
    pub dio: DioStats,
    pub xops: XopStats,
    pub inodes: usize,
    pub ipdep_contended: u64,
}

// ── Super-root ──────────────────────────────────────────────────────────────

/// Reference (unlocked) the super-root inode under the volume root.
fn super_root(volume: &Volume) -> Result<ChainId> {
    let store = volume.store();
    let mut parentp = volume.vchain();
    let error = store.lookup_init(parentp, LookupFlags::SHARED);
    if !error.is_empty() {
        store.lookup_done(parentp);
        return Err(H2Error::Chain(error));
    }
    let step = store.lookup(&mut parentp, 0, 0, LookupFlags::SHARED);
    store.lookup_done(parentp);
    let Some(id) = step.chain else {
        return Err(H2Error::Format("volume has no super-root inode".to_owned()));
    };
    store.unlock(id);
    if step.error.intersects(ErrorFlags::MEDIA) {
        let err = chain_error(store, id, step.error, "super-root");
        store.drop_chain(id);
        return Err(err);
    }
    Ok(id)
}

/// Visit every PFS root inode in `[key_beg, key_end]` of the super-root.
fn scan_super_root(
    store: &ChainStore,
    sroot: ChainId,
    key_beg: u64,
    key_end: u64,
    mut visit: impl FnMut(ChainId, ErrorFlags, &InodeData) -> ControlFlow<()>,
) -> Result<()> {
    let error = store.lookup_init(sroot, LookupFlags::SHARED);
    if error.intersects(ErrorFlags::MEDIA) {
        store.lookup_done(sroot);
        return Err(chain_error(store, sroot, error, "super-root"));
    }
    let error = walk(store, sroot, key_beg, key_end, LookupFlags::SHARED, |id, error| {
        let chain = store.get(id);
        if chain.btype() != BrefType::Inode {
            return ControlFlow::Continue(());
        }
        let parsed = chain.data().and_then(|data| InodeData::parse(&data).ok());
        drop(chain);
        match parsed {
            Some(ip) if ip.meta.is_pfs_root() => {
                if visit(id, error, &ip).is_break() {
                    return ControlFlow::Break(ErrorFlags::empty());
                }
                ControlFlow::Continue(())
            }
            _ => ControlFlow::Continue(()),
        }
    });
    if error.intersects(ErrorFlags::MEDIA) {
        return Err(H2Error::Chain(error));
    }
    Ok(())
}

/// List every PFS in the super-root, in key order.
pub fn list_pfs(volume: &Volume) -> Result<Vec<PfsInfo>> {
    let store = volume.store();
    let sroot = super_root(volume)?;
    let mut out = Vec::new();
    let scanned = scan_super_root(store, sroot, 0, HAMMER2_KEY_MAX, |id, _, ip| {
        out.push(PfsInfo {
            name: ip.filename_lossy(),
            key: store.get(id).key(),
            inum: ip.meta.inum,
            pfs_type: ip.meta.pfs_type,
            next_inum: ip.meta.pfs_inum,
        });
        ControlFlow::Continue(())
    });
    store.drop_chain(sroot);
    scanned.map(|()| out)
}

// ── Error mapping ───────────────────────────────────────────────────────────

fn chain_error(store: &ChainStore, id: ChainId, error: ErrorFlags, what: &str) -> H2Error {
    let offset = store.try_get(id).map_or(0, |c| c.bref().data_offset().0);
    if error.contains(ErrorFlags::CHECK) {
        warn!(target: "h2::pfs", what, offset, "check_failure");
        return H2Error::Checksum { offset };
    }
    if error.contains(ErrorFlags::BADBREF) {
        return H2Error::Corruption {
            offset,
            detail: format!("{what}: {error}"),
        };
    }
    H2Error::Chain(error)
}

fn collected_error(store: &ChainStore, out: &Collected, what: impl FnOnce() -> String) -> H2Error {
    match out.chain() {
        Some(id) => chain_error(store, id, out.error, &what()),
        None if out.error == ErrorFlags::ENOENT => H2Error::NotFound(what()),
        None if out.error.contains(ErrorFlags::CHECK) => H2Error::Checksum { offset: 0 },
        None => H2Error::Chain(out.error),
    }
}

/// Frontend's hold on a started XOP and on its inode's shared lock.
/// Retires the XOP, then unlocks, on drop.
struct Running {
    xop: Arc<XopHead>,
    ip: InodeRef,
}

impl Deref for Running {
    type Target = XopHead;

    fn deref(&self) -> &XopHead {
        &self.xop
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.xop.retire(XOPMASK_VOP);
        self.ip.unlock();
    }
}

// ── Pfs ─────────────────────────────────────────────────────────────────────

/// A mounted PFS.
#[derive(Debug)]
pub struct Pfs {
    root: InodeRef,
    xops: XopPool,
    inodes: Arc<InodeTree>,
    ipdep: Arc<IpDep>,
    name: String,
    volume: Arc<Volume>,
}

impl Pfs {
    /// Locate PFS `name` in the super-root and load its root inode.
    pub fn mount(volume: Arc<Volume>, name: &str) -> Result<Self> {
        let store = Arc::clone(volume.store());
        let sroot = super_root(&volume)?;
        let (beg, end) = dirhash_range(name.as_bytes());
        let mut found = None;
        let scanned = scan_super_root(&store, sroot, beg, end, |id, error, ip| {
            if ip.filename != name.as_bytes() {
                return ControlFlow::Continue(());
            }
            store.ref_chain(id);
            found = Some((id, error, ip.meta.clone()));
            ControlFlow::Break(())
        });
        store.drop_chain(sroot);
        scanned?;
        let Some((id, error, meta)) = found else {
            return Err(H2Error::NotFound(format!("PFS {name}")));
        };
        if error.intersects(ErrorFlags::MEDIA) {
            let err = chain_error(&store, id, error, "PFS root");
            store.drop_chain(id);
            return Err(err);
        }

        let width = volume.options().cluster_width;
        let inodes = Arc::new(InodeTree::new(Arc::clone(&store)));
        let root = inodes.get_or_insert(meta.inum, Cluster::with_chain(width, id, error), meta);
        let ipdep = Arc::new(IpDep::new());
        let xops = XopPool::new(Arc::clone(&store), Arc::clone(&ipdep));
        info!(
            target: "h2::pfs",
            pfs = name,
            root_inum = root.inum(),
            width,
            "pfs_mount"
        );
        Ok(Self {
            root,
            xops,
            inodes,
            ipdep,
            name: name.to_owned(),
            volume,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ChainStore> {
        self.volume.store()
    }

    #[must_use]
    pub fn root(&self) -> &InodeRef {
        &self.root
    }

    #[must_use]
    pub fn inodes(&self) -> &Arc<InodeTree> {
        &self.inodes
    }

    #[must_use]
    pub fn xops(&self) -> &XopPool {
        &self.xops
    }

    #[must_use]
    pub fn stats(&self) -> PfsStats {
        PfsStats {
            chains: self.store().stats(),
            dio: self.store().dio().stats(),
            xops: self.xops.stats(),
            inodes: self.inodes.len(),
            ipdep_contended: self.ipdep.contended(),
        }
    }

    /// Lock `ip` shared, then start `op` against it. The caller must not
    /// already hold `ip`'s lock.
    fn run(&self, ip: &InodeRef, op: &dyn XopOp, setup: impl FnOnce(&XopHead)) -> Running {
        ip.lock(InodeLock::Shared);
        let xop = self.xops.alloc(ip);
        setup(&xop);
        xop.start(op);
        Running {
            xop,
            ip: ip.clone(),
        }
    }

    /// Turn a collected inode result into an in-memory inode.
    fn adopt(&self, out: &Collected) -> Result<InodeRef> {
        let store = self.store();
        let mut cluster = out.cluster.clone();
        for item in cluster.items() {
            if let Some(id) = item.chain {
                store.ref_chain(id);
            }
        }
        let parsed = cluster.focus_chain().and_then(|id| {
            let chain = store.get(id);
            chain.data().map(|data| (id, InodeData::parse(&data)))
        });
        match parsed {
            Some((_, Ok(ip))) => Ok(self.inodes.get_or_insert(ip.meta.inum, cluster, ip.meta)),
            Some((id, Err(err))) => {
                let offset = store.get(id).bref().data_offset().0;
                cluster.release(store);
                Err(H2Error::Corruption {
                    offset,
                    detail: err.to_string(),
                })
            }
            None => {
                cluster.release(store);
                Err(H2Error::Chain(ErrorFlags::EIO))
            }
        }
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    /// In-memory inode for `inum`, loading it from the inode index.
    pub fn lookup_inode(&self, inum: u64) -> Result<InodeRef> {
        if let Some(ip) = self.inodes.lookup(inum) {
            return Ok(ip);
        }
        let xop = self.run(&self.root, &LookupInum { inum }, |_| {});
        let out = xop.collect(CollectFlags::empty());
        if out.chain().is_none() || !out.error.is_empty() {
            return Err(collected_error(self.store(), &out, || format!("inode {inum}")));
        }
        self.adopt(&out)
    }

    /// Resolve one name in directory `dir`.
    pub fn nresolve(&self, dir: &InodeRef, name: &[u8]) -> Result<InodeRef> {
        if !dir.meta().is_dir() {
            return Err(H2Error::NotDirectory);
        }
        if name.len() > NAME_MAX {
            return Err(H2Error::NameTooLong);
        }
        match name {
            b"" | b"." => return Ok(dir.clone()),
            b".." => {
                if dir.inum() == self.root.inum() {
                    return Ok(self.root.clone());
                }
                return self.lookup_inode(dir.meta().iparent & HAMMER2_DIRHASH_USERMSK);
            }
            _ => {}
        }
        let op = Nresolve {
            root: self.root.clone(),
        };
        let xop = self.run(dir, &op, |xop| xop.setname(name));
        let out = xop.collect(CollectFlags::empty());
        if out.chain().is_none() || !out.error.is_empty() {
            return Err(collected_error(self.store(), &out, || {
                String::from_utf8_lossy(name).into_owned()
            }));
        }
        let ip = self.adopt(&out)?;
        debug!(target: "h2::pfs", dir = dir.inum(), inum = ip.inum(), "nresolve");
        Ok(ip)
    }

    /// Resolve a `/`-separated path from the PFS root. Symlinks are not
    /// followed.
    pub fn resolve_path(&self, path: &str) -> Result<InodeRef> {
        let mut ip = self.root.clone();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            ip = self.nresolve(&ip, component.as_bytes())?;
        }
        Ok(ip)
    }

    // ── Directories ─────────────────────────────────────────────────────────

    /// Every entry of `dir`, starting with `.` and `..`, in hash order.
    pub fn readdir(&self, dir: &InodeRef) -> Result<Vec<DirEntry>> {
        let meta = dir.meta();
        if !meta.is_dir() {
            return Err(H2Error::NotDirectory);
        }
        let parent = if dir.inum() == self.root.inum() {
            meta.inum & HAMMER2_DIRHASH_USERMSK
        } else {
            meta.iparent & HAMMER2_DIRHASH_USERMSK
        };
        let mut entries = vec![
            DirEntry {
                name: ".".to_owned(),
                inum: meta.inum,
                kind: ObjType::Directory,
                key: 0,
            },
            DirEntry {
                name: "..".to_owned(),
                inum: parent,
                kind: ObjType::Directory,
                key: 1,
            },
        ];

        let store = self.store();
        let xop = self.run(dir, &Readdir, |xop| {
            xop.setkey(HAMMER2_DIRHASH_VISIBLE | 2, HAMMER2_KEY_MAX);
        });
        loop {
            let out = xop.collect(CollectFlags::empty());
            if out.is_end() {
                if out.error == ErrorFlags::ENOENT {
                    break;
                }
                return Err(collected_error(store, &out, || format!("directory {}", meta.inum)));
            }
            if !out.error.is_empty() {
                return Err(collected_error(store, &out, || format!("directory {}", meta.inum)));
            }
            let Some(id) = out.chain() else { continue };
            let chain = store.get(id);
            let entry = match chain.btype() {
                BrefType::Dirent => Dirent::parse(chain.bref(), chain.data().as_deref())
                    .map(|d| DirEntry {
                        name: d.name_lossy(),
                        inum: d.head.inum,
                        kind: ObjType::from_raw(d.head.obj_type),
                        key: out.key,
                    })
                    .map_err(|err| err.to_string()),
                BrefType::Inode => chain
                    .data()
                    .ok_or_else(|| "entry inode has no media".to_owned())
                    .and_then(|data| InodeData::parse(&data).map_err(|err| err.to_string()))
                    .map(|ip| DirEntry {
                        name: ip.filename_lossy(),
                        inum: ip.meta.inum,
                        kind: ip.meta.kind(),
                        key: out.key,
                    }),
                _ => continue,
            };
            let offset = chain.bref().data_offset().0;
            drop(chain);
            entries.push(entry.map_err(|detail| H2Error::Corruption { offset, detail })?);
        }
        Ok(entries)
    }

    // ── File data ───────────────────────────────────────────────────────────

    /// Logical block covering `lbase` as `(key, bytes)`, or `None` for a hole.
    fn read_block(&self, ip: &InodeRef, lbase: u64) -> Result<Option<(u64, Vec<u8>)>> {
        let store = self.store();
        let xop = self.run(ip, &StrategyRead, |xop| xop.setkey(lbase, lbase));
        let out = xop.collect(CollectFlags::empty());
        let what = || format!("inode {} block {lbase:#x}", ip.inum());
        if out.is_end() && out.error == ErrorFlags::ENOENT {
            return Ok(None);
        }
        let Some(id) = out.chain().filter(|_| out.error.is_empty()) else {
            return Err(collected_error(store, &out, what));
        };

        let chain = store.get(id);
        let bref = *chain.bref();
        let offset = bref.data_offset().0;
        let corrupt = |detail: String| H2Error::Corruption { offset, detail };
        match bref.btype {
            BrefType::Inode => {
                let data = chain.data().ok_or_else(|| corrupt("inode has no media".into()))?;
                let parsed = InodeData::parse(&data).map_err(|e| corrupt(e.to_string()))?;
                let direct = parsed
                    .direct_data()
                    .ok_or_else(|| corrupt("inode has no direct data".into()))?;
                Ok(Some((0, direct.to_vec())))
            }
            BrefType::Data => {
                let out_len = usize::try_from(radix_to_bytes(bref.keybits))
                    .map_err(|_| corrupt("data block key range too large".into()))?;
                if bref.comp_method() == HAMMER2_COMP_AUTOZERO || !bref.has_media() {
                    return Ok(Some((bref.key, vec![0; out_len])));
                }
                let data = chain.data().ok_or_else(|| corrupt("data block not resolved".into()))?;
                let bytes = decompress(bref.comp_method(), &data, out_len)
                    .map_err(|e| corrupt(e.to_string()))?;
                Ok(Some((bref.key, bytes)))
            }
            other => Err(corrupt(format!("unexpected {other} under file inode"))),
        }
    }

    fn read_inner(&self, ip: &InodeRef, size: u64, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= size {
            return Ok(0);
        }
        let len = usize::try_from((size - offset).min(buf.len() as u64)).unwrap_or(buf.len());
        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let lbase = pos & !HAMMER2_PBUFMASK;
            let chunk = (len - done).min((HAMMER2_PBUFSIZE - (pos - lbase)) as usize);
            let dst = &mut buf[done..done + chunk];
            match self.read_block(ip, lbase)? {
                Some((key, bytes)) => {
                    let start = usize::try_from(pos.saturating_sub(key)).unwrap_or(usize::MAX);
                    let avail = bytes.get(start..).unwrap_or(&[]);
                    let take = avail.len().min(chunk);
                    dst[..take].copy_from_slice(&avail[..take]);
                    dst[take..].fill(0);
                }
                None => dst.fill(0),
            }
            done += chunk;
        }
        Ok(len)
    }

    /// Read up to `buf.len()` bytes at `offset`, capped at the file size.
    /// Holes read as zeros.
    pub fn read(&self, ip: &InodeRef, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let meta = ip.meta();
        match meta.kind() {
            ObjType::Regular => self.read_inner(ip, meta.size, offset, buf),
            ObjType::Directory => Err(H2Error::IsDirectory),
            other => Err(H2Error::InvalidArgument(format!(
                "read of {other:?} inode {}",
                meta.inum
            ))),
        }
    }

    pub fn read_all(&self, ip: &InodeRef) -> Result<Vec<u8>> {
        let size = usize::try_from(ip.meta().size)
            .map_err(|_| H2Error::InvalidArgument("file too large".to_owned()))?;
        let mut out = vec![0; size];
        let got = self.read(ip, 0, &mut out)?;
        out.truncate(got);
        Ok(out)
    }

    pub fn readlink(&self, ip: &InodeRef) -> Result<Vec<u8>> {
        let meta = ip.meta();
        if meta.kind() != ObjType::Symlink {
            return Err(H2Error::InvalidArgument(format!(
                "inode {} is not a symlink",
                meta.inum
            )));
        }
        let len = usize::try_from(meta.size)
            .map_err(|_| H2Error::InvalidArgument("link too long".to_owned()))?;
        let mut out = vec![0; len];
        let got = self.read_inner(ip, meta.size, 0, &mut out)?;
        out.truncate(got);
        Ok(out)
    }

    #[must_use]
    pub fn stat(&self, ip: &InodeRef) -> Stat {
        Stat::from_meta(&ip.meta())
    }
}
