#![forbid(unsafe_code)]
//! Deterministic HAMMER2 image construction.
//!
//! [`ImageBuilder`] lays out a complete single-volume image in memory: the
//! volume header (all three CRC regions sealed), a super-root holding one
//! inode per PFS, each PFS root carrying both its inode index (keyed by
//! inode number) and its root directory entries (keyed by directory hash),
//! file data with optional compression, holes and DIRECTDATA, INDIRECT
//! blocks wherever a blockset overflows, and a freemap node/leaf pair that
//! reflects every allocation. Every block is sealed with the configured
//! check method so the chain engine verifies real digests.

mod layout;

use h2_ondisk::compress::{compress_lz4, compress_zlib};
use h2_ondisk::{Blockref, BrefType, DirentHead, InodeMeta, VolumeHeader, dirhash};
use h2_types::{
    HAMMER2_CHECK_XXHASH64, HAMMER2_COMP_AUTOZERO, HAMMER2_COMP_LZ4, HAMMER2_COMP_NONE,
    HAMMER2_COMP_ZLIB, HAMMER2_DIRENT_INLINE_MAX, HAMMER2_DIRHASH_LOMASK,
    HAMMER2_EMBEDDED_BYTES, HAMMER2_INODE_MAXNAME, HAMMER2_INODE_ROOT, HAMMER2_OBJTYPE_DIRECTORY,
    HAMMER2_OBJTYPE_REGFILE, HAMMER2_OBJTYPE_SOFTLINK, HAMMER2_OPFLAG_DIRECTDATA,
    HAMMER2_OPFLAG_PFSROOT, HAMMER2_PBUFRADIX, HAMMER2_PBUFSIZE, HAMMER2_PFSTYPE_MASTER,
    HAMMER2_PFSTYPE_SUPROOT, HAMMER2_SET_COUNT, HAMMER2_VOL_VERSION_DEFAULT,
    HAMMER2_VOLUME_BYTES, HAMMER2_VOLUME_ID_HBO, HAMMER2_ZONE_BYTES64, bytes_to_radix,
    enc_check, enc_comp,
};
use layout::{Body, FREEMAP_BLOCK_RADIX, Writer};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, Write as _};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::debug;

/// Bytes below the first allocatable block (volume header zone 0 plus
/// reserved area).
pub const RESERVED_BYTES: u64 = 4 << 20;
/// Inode number of the super-root.
pub const SUPROOT_INUM: u64 = 0;
/// Fixed timestamp stamped into every inode.
pub const BUILD_TIME: u64 = 1_700_000_000_000_000;

// ── Options ─────────────────────────────────────────────────────────────────

/// How all-zero file blocks are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroBlocks {
    /// Write them like any other block.
    Store,
    /// Leave no blockref at all.
    Hole,
    /// Media-less blockref with the AUTOZERO compression method.
    Autozero,
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Check method for every sealed block.
    pub check: u8,
    /// Default compression for file data.
    pub comp: u8,
    /// Blockrefs per INDIRECT block (power of two, 8..=512).
    pub fanout: usize,
    /// Embed files of up to 512 bytes in the inode.
    pub direct_data: bool,
    pub zero_blocks: ZeroBlocks,
    /// Directory entries point at the child's INODE block instead of a
    /// DIRENT (the pre-dirent layout).
    pub embedded_inode_entries: bool,
    /// `mirror_tid` of each volume header copy, zone 0 first.
    pub header_tids: Vec<u64>,
    /// Minimum image length.
    pub min_image_bytes: u64,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            check: HAMMER2_CHECK_XXHASH64,
            comp: HAMMER2_COMP_NONE,
            fanout: 8,
            direct_data: true,
            zero_blocks: ZeroBlocks::Store,
            embedded_inode_entries: false,
            header_tids: vec![1],
            min_image_bytes: 8 << 20,
        }
    }
}

/// Per-file overrides of [`BuildOptions`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FileOptions {
    pub comp: Option<u8>,
    pub check: Option<u8>,
    pub direct_data: Option<bool>,
    pub zero_blocks: Option<ZeroBlocks>,
}

// ── Tree description ────────────────────────────────────────────────────────

/// Handle to a node created through the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef {
    pub pfs: usize,
    pub inum: u64,
}

#[derive(Debug, Clone)]
enum NodeKind {
    Dir { entries: Vec<(Vec<u8>, u64)> },
    File { data: Vec<u8>, opts: FileOptions },
    Symlink { target: Vec<u8> },
}

#[derive(Debug, Clone)]
struct Node {
    parent: u64,
    name: Vec<u8>,
    kind: NodeKind,
}

impl Node {
    fn obj_type(&self) -> u8 {
        match self.kind {
            NodeKind::Dir { .. } => HAMMER2_OBJTYPE_DIRECTORY,
            NodeKind::File { .. } => HAMMER2_OBJTYPE_REGFILE,
            NodeKind::Symlink { .. } => HAMMER2_OBJTYPE_SOFTLINK,
        }
    }
}

#[derive(Debug, Clone)]
struct PfsSpec {
    name: Vec<u8>,
    next_inum: u64,
    nodes: BTreeMap<u64, Node>,
}

impl PfsSpec {
    fn new(name: &[u8]) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            HAMMER2_INODE_ROOT,
            Node {
                parent: HAMMER2_INODE_ROOT,
                name: name.to_vec(),
                kind: NodeKind::Dir {
                    entries: Vec::new(),
                },
            },
        );
        Self {
            name: name.to_vec(),
            next_inum: HAMMER2_INODE_ROOT + 1,
            nodes,
        }
    }
}

// ── Built image ─────────────────────────────────────────────────────────────

/// What a placed block holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    SuperRoot,
    Inode { pfs: usize, inum: u64 },
    Data { pfs: usize, inum: u64, key: u64 },
    DirentName { pfs: usize, dir: u64, key: u64 },
    /// `owner` is the (pfs, inum) whose tree holds the block, `None` for the
    /// super-root.
    Indirect {
        owner: Option<(usize, u64)>,
        key: u64,
        keybits: u8,
    },
    FreemapNode,
    FreemapLeaf,
}

impl BlockKind {
    fn owner(self) -> Option<(usize, u64)> {
        match self {
            Self::Inode { pfs, inum } => Some((pfs, inum)),
            Self::Indirect { owner, .. } => owner,
            _ => None,
        }
    }
}

/// One allocated media block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub kind: BlockKind,
    pub offset: u64,
    pub len: u64,
}

/// Result of [`ImageBuilder::build`].
#[derive(Debug, Clone)]
pub struct BuiltImage {
    /// Zone 0 image: header copy 0 plus all media.
    pub bytes: Vec<u8>,
    pub placements: Vec<Placement>,
    /// Header copies for zones 1.., as (device offset, 64 KiB region).
    pub backup_headers: Vec<(u64, Vec<u8>)>,
    /// Parsed form of header copy 0.
    pub header: VolumeHeader,
    pub free_bytes: u64,
}

impl BuiltImage {
    pub fn find(&self, kind: BlockKind) -> Option<&Placement> {
        self.placements.iter().find(|p| p.kind == kind)
    }

    #[must_use]
    pub fn inode_offset(&self, node: NodeRef) -> Option<u64> {
        self.find(BlockKind::Inode {
            pfs: node.pfs,
            inum: node.inum,
        })
        .map(|p| p.offset)
    }

    /// Data blocks of `node` in key order.
    #[must_use]
    pub fn data_blocks(&self, node: NodeRef) -> Vec<Placement> {
        let mut out: Vec<_> = self
            .placements
            .iter()
            .filter(|p| {
                matches!(p.kind, BlockKind::Data { pfs, inum, .. }
                    if pfs == node.pfs && inum == node.inum)
            })
            .copied()
            .collect();
        out.sort_by_key(|p| match p.kind {
            BlockKind::Data { key, .. } => key,
            _ => 0,
        });
        out
    }

    #[must_use]
    pub fn indirect_blocks(&self) -> Vec<Placement> {
        self.placements
            .iter()
            .filter(|p| matches!(p.kind, BlockKind::Indirect { .. }))
            .copied()
            .collect()
    }

    /// Flip every bit of one byte of zone 0.
    pub fn corrupt(&mut self, offset: u64) {
        let at = usize::try_from(offset).unwrap_or(usize::MAX);
        self.bytes[at] ^= 0xFF;
    }

    /// Damage header copy `zone` so its CRCs no longer match.
    pub fn corrupt_header(&mut self, zone: usize) {
        if zone == 0 {
            self.corrupt(0x40);
        } else if let Some((_, region)) = self.backup_headers.get_mut(zone - 1) {
            region[0x40] ^= 0xFF;
        }
    }

    /// Total device length including backup header zones.
    #[must_use]
    pub fn device_len(&self) -> u64 {
        self.backup_headers
            .iter()
            .map(|(offset, region)| offset + region.len() as u64)
            .chain(std::iter::once(self.bytes.len() as u64))
            .max()
            .unwrap_or(0)
    }

    /// Write the image (sparse past zone 0) to `path`.
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(&self.bytes)?;
        for (offset, region) in &self.backup_headers {
            file.write_all_at(region, *offset)?;
        }
        file.set_len(self.device_len())?;
        file.sync_all()
    }
}

// ── Builder ─────────────────────────────────────────────────────────────────

/// In-memory description of a HAMMER2 filesystem, turned into media by
/// [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    options: BuildOptions,
    pfs: Vec<PfsSpec>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    /// A builder with one PFS named `ROOT`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(BuildOptions::default())
    }

    #[must_use]
    pub fn with_options(options: BuildOptions) -> Self {
        assert!(
            options.fanout.is_power_of_two() && (8..=512).contains(&options.fanout),
            "fanout must be a power of two in 8..=512"
        );
        assert!(!options.header_tids.is_empty(), "at least one header copy");
        Self {
            options,
            pfs: vec![PfsSpec::new(b"ROOT")],
        }
    }

    #[must_use]
    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Root directory of the default PFS.
    #[must_use]
    pub fn root(&self) -> NodeRef {
        NodeRef {
            pfs: 0,
            inum: HAMMER2_INODE_ROOT,
        }
    }

    /// Add another PFS and return its root directory.
    pub fn add_pfs(&mut self, name: &str) -> NodeRef {
        assert!(
            self.pfs.iter().all(|pfs| pfs.name != name.as_bytes()),
            "duplicate PFS {name}"
        );
        self.pfs.push(PfsSpec::new(name.as_bytes()));
        NodeRef {
            pfs: self.pfs.len() - 1,
            inum: HAMMER2_INODE_ROOT,
        }
    }

    pub fn mkdir(&mut self, parent: NodeRef, name: &str) -> NodeRef {
        self.add(
            parent,
            name,
            NodeKind::Dir {
                entries: Vec::new(),
            },
        )
    }

    pub fn file(&mut self, parent: NodeRef, name: &str, data: impl Into<Vec<u8>>) -> NodeRef {
        self.file_with(parent, name, data, FileOptions::default())
    }

    pub fn file_with(
        &mut self,
        parent: NodeRef,
        name: &str,
        data: impl Into<Vec<u8>>,
        opts: FileOptions,
    ) -> NodeRef {
        self.add(
            parent,
            name,
            NodeKind::File {
                data: data.into(),
                opts,
            },
        )
    }

    pub fn symlink(&mut self, parent: NodeRef, name: &str, target: &str) -> NodeRef {
        self.add(
            parent,
            name,
            NodeKind::Symlink {
                target: target.as_bytes().to_vec(),
            },
        )
    }

    fn add(&mut self, parent: NodeRef, name: &str, kind: NodeKind) -> NodeRef {
        let name = name.as_bytes().to_vec();
        assert!(
            !name.is_empty() && name.len() <= HAMMER2_INODE_MAXNAME,
            "name length out of range"
        );
        let pfs = &mut self.pfs[parent.pfs];
        let inum = pfs.next_inum;
        match pfs.nodes.get_mut(&parent.inum).map(|node| &mut node.kind) {
            Some(NodeKind::Dir { entries }) => {
                assert!(
                    entries.iter().all(|(existing, _)| *existing != name),
                    "duplicate entry"
                );
                entries.push((name.clone(), inum));
            }
            _ => panic!("parent {parent:?} is not a directory"),
        }
        pfs.next_inum += 1;
        pfs.nodes.insert(
            inum,
            Node {
                parent: parent.inum,
                name,
                kind,
            },
        );
        NodeRef {
            pfs: parent.pfs,
            inum,
        }
    }

    /// Lay out the image.
    #[must_use]
    pub fn build(&self) -> BuiltImage {
        let opts = &self.options;
        let tid = opts.header_tids.iter().copied().max().unwrap_or(1);
        let mut w = Writer::new(RESERVED_BYTES, opts.check, opts.fanout, tid);
        let fm_node = w.alloc(BlockKind::FreemapNode, FREEMAP_BLOCK_RADIX);
        let fm_leaf = w.alloc(BlockKind::FreemapLeaf, FREEMAP_BLOCK_RADIX);

        let mut used = BTreeSet::new();
        let mut sroot_entries = Vec::with_capacity(self.pfs.len());
        for (idx, pfs) in self.pfs.iter().enumerate() {
            let root = self.build_pfs(&mut w, idx, pfs);
            let key = unique_key(&mut used, dirhash(&pfs.name));
            sroot_entries.push(Blockref { key, ..root });
        }

        let sroot_meta = InodeMeta {
            version: 1,
            obj_type: HAMMER2_OBJTYPE_DIRECTORY,
            mode: 0o755,
            inum: SUPROOT_INUM,
            nlinks: 1,
            pfs_type: HAMMER2_PFSTYPE_SUPROOT,
            comp_algo: HAMMER2_COMP_NONE,
            check_algo: opts.check,
            ctime: BUILD_TIME,
            mtime: BUILD_TIME,
            atime: BUILD_TIME,
            btime: BUILD_TIME,
            ..InodeMeta::default()
        };
        let sroot = w.inode(
            BlockKind::SuperRoot,
            sroot_meta,
            b"",
            Body::Tree(sroot_entries),
            0,
        );

        let volu_size = w
            .high_water()
            .next_multiple_of(1 << 20)
            .max(opts.min_image_bytes);
        w.image
            .resize(usize::try_from(volu_size).unwrap_or(usize::MAX), 0);
        let (fm_bref, free_bytes) = w.freemap(fm_node, fm_leaf, volu_size);

        let mut sroot_blockset = vec![Blockref::empty(); HAMMER2_SET_COUNT];
        sroot_blockset[0] = sroot;
        let mut freemap_blockset = vec![Blockref::empty(); HAMMER2_SET_COUNT];
        freemap_blockset[0] = fm_bref;
        let mut volu_loff = vec![u64::MAX; 64];
        volu_loff[0] = 0;
        let mut header = VolumeHeader {
            magic: HAMMER2_VOLUME_ID_HBO,
            boot_beg: 0,
            boot_end: 0,
            aux_beg: 0,
            aux_end: 0,
            volu_size,
            version: HAMMER2_VOL_VERSION_DEFAULT,
            flags: 0,
            copyid: 0,
            freemap_version: 1,
            peer_type: 0,
            volu_id: 0,
            nvolumes: 1,
            fsid: *b"h2-harness-fsid\0",
            fstype: *b"hammer2-harness\0",
            allocator_size: volu_size,
            allocator_free: free_bytes,
            allocator_beg: RESERVED_BYTES,
            mirror_tid: opts.header_tids[0],
            freemap_tid: opts.header_tids[0],
            bulkfree_tid: 0,
            total_size: volu_size,
            sroot_blockset,
            freemap_blockset,
            volu_loff,
        };

        let mut bytes = w.image;
        bytes[..HAMMER2_VOLUME_BYTES].copy_from_slice(&header.to_bytes());
        let header0 = header.clone();
        let mut backup_headers = Vec::new();
        for (zone, tid) in opts.header_tids.iter().enumerate().skip(1) {
            header.mirror_tid = *tid;
            header.freemap_tid = *tid;
            backup_headers.push((zone as u64 * HAMMER2_ZONE_BYTES64, header.to_bytes()));
        }

        debug!(
            target: "h2::harness",
            event = "harness_image_built",
            volu_size,
            blocks = w.placements.len(),
            pfs = self.pfs.len(),
            headers = opts.header_tids.len(),
            free_bytes
        );
        BuiltImage {
            bytes,
            placements: w.placements,
            backup_headers,
            header: header0,
            free_bytes,
        }
    }

    /// Write every inode of one PFS, children before parents, and return
    /// the PFS root's blockref.
    fn build_pfs(&self, w: &mut Writer, idx: usize, pfs: &PfsSpec) -> Blockref {
        let opts = &self.options;
        let mut written: BTreeMap<u64, Blockref> = BTreeMap::new();
        for (&inum, node) in pfs.nodes.iter().rev() {
            if inum == HAMMER2_INODE_ROOT {
                continue;
            }
            let mut meta = self.meta_for(inum, node);
            let body = match &node.kind {
                NodeKind::Dir { entries } => {
                    Body::Tree(self.dir_entries(w, idx, inum, entries, pfs, &written))
                }
                NodeKind::File { data, opts: fopts } => {
                    self.file_body(w, idx, inum, data, *fopts, &mut meta)
                }
                NodeKind::Symlink { target } => {
                    self.file_body(w, idx, inum, target, FileOptions::default(), &mut meta)
                }
            };
            let bref = w.inode(BlockKind::Inode { pfs: idx, inum }, meta, &node.name, body, inum);
            written.insert(inum, bref);
        }

        let root = &pfs.nodes[&HAMMER2_INODE_ROOT];
        let mut entries: Vec<Blockref> = written.values().copied().collect();
        if let NodeKind::Dir { entries: dirents } = &root.kind {
            entries.extend(self.dir_entries(w, idx, HAMMER2_INODE_ROOT, dirents, pfs, &written));
        }
        let mut meta = self.meta_for(HAMMER2_INODE_ROOT, root);
        meta.op_flags |= HAMMER2_OPFLAG_PFSROOT;
        meta.pfs_type = HAMMER2_PFSTYPE_MASTER;
        meta.pfs_inum = pfs.next_inum;
        let clid = pfs.name.len().min(16);
        meta.pfs_clid[..clid].copy_from_slice(&pfs.name[..clid]);
        meta.pfs_fsid[0] = u8::try_from(idx).unwrap_or(u8::MAX);
        w.inode(
            BlockKind::Inode {
                pfs: idx,
                inum: HAMMER2_INODE_ROOT,
            },
            meta,
            &pfs.name,
            Body::Tree(entries),
            HAMMER2_INODE_ROOT,
        )
    }

    fn meta_for(&self, inum: u64, node: &Node) -> InodeMeta {
        let mode = match node.kind {
            NodeKind::Dir { .. } => 0o755,
            NodeKind::File { .. } => 0o644,
            NodeKind::Symlink { .. } => 0o777,
        };
        InodeMeta {
            version: 1,
            obj_type: node.obj_type(),
            mode,
            inum,
            nlinks: 1,
            iparent: node.parent,
            name_key: dirhash(&node.name),
            comp_algo: self.options.comp,
            check_algo: self.options.check,
            ctime: BUILD_TIME,
            mtime: BUILD_TIME + inum,
            atime: BUILD_TIME,
            btime: BUILD_TIME,
            ..InodeMeta::default()
        }
    }

    /// Directory entries of `dir`, keyed by directory hash.
    fn dir_entries(
        &self,
        w: &mut Writer,
        pfs_idx: usize,
        dir: u64,
        entries: &[(Vec<u8>, u64)],
        pfs: &PfsSpec,
        written: &BTreeMap<u64, Blockref>,
    ) -> Vec<Blockref> {
        let mut used = BTreeSet::new();
        let mut out = Vec::with_capacity(entries.len());
        for (name, inum) in entries {
            let key = unique_key(&mut used, dirhash(name));
            if self.options.embedded_inode_entries {
                if let Some(child) = written.get(inum) {
                    out.push(Blockref { key, ..*child });
                    continue;
                }
            }
            let head = DirentHead {
                inum: *inum,
                namlen: u16::try_from(name.len()).unwrap_or(u16::MAX),
                obj_type: pfs.nodes[inum].obj_type(),
            };
            let bref = if name.len() <= HAMMER2_DIRENT_INLINE_MAX {
                let mut bref = w.bare(BrefType::Dirent, key, 0);
                bref.check[..name.len()].copy_from_slice(name);
                bref
            } else {
                let check = w.check();
                w.put(
                    BlockKind::DirentName {
                        pfs: pfs_idx,
                        dir,
                        key,
                    },
                    BrefType::Dirent,
                    key,
                    0,
                    name,
                    check,
                    HAMMER2_COMP_NONE,
                )
            };
            out.push(Blockref {
                embed: head.to_embed(),
                ..bref
            });
        }
        out
    }

    /// DIRECTDATA body or data blockrefs for a file's content.
    fn file_body(
        &self,
        w: &mut Writer,
        pfs: usize,
        inum: u64,
        data: &[u8],
        fopts: FileOptions,
        meta: &mut InodeMeta,
    ) -> Body {
        let comp = fopts.comp.unwrap_or(self.options.comp);
        let check = fopts.check.unwrap_or(self.options.check);
        let direct = fopts.direct_data.unwrap_or(self.options.direct_data);
        let zeros = fopts.zero_blocks.unwrap_or(self.options.zero_blocks);
        meta.size = data.len() as u64;
        meta.comp_algo = comp;
        meta.check_algo = check;
        if direct && data.len() <= HAMMER2_EMBEDDED_BYTES {
            meta.op_flags |= HAMMER2_OPFLAG_DIRECTDATA;
            return Body::Direct(data.to_vec());
        }

        let lradix = if data.len() as u64 <= HAMMER2_PBUFSIZE {
            bytes_to_radix(data.len().max(1) as u64)
        } else {
            HAMMER2_PBUFRADIX
        };
        let lsize = 1_usize << lradix;
        let mut brefs = Vec::new();
        for (idx, chunk) in data.chunks(lsize).enumerate() {
            let key = (idx as u64) << lradix;
            let mut block = chunk.to_vec();
            block.resize(lsize, 0);
            if block.iter().all(|b| *b == 0) {
                match zeros {
                    ZeroBlocks::Hole => continue,
                    ZeroBlocks::Autozero => {
                        let mut bref = w.bare(BrefType::Data, key, lradix);
                        bref.methods = enc_check(check) | enc_comp(HAMMER2_COMP_AUTOZERO);
                        brefs.push(bref);
                        continue;
                    }
                    ZeroBlocks::Store => {}
                }
            }
            let packed = match comp {
                HAMMER2_COMP_LZ4 => compress_lz4(&block).map(|c| (c, HAMMER2_COMP_LZ4)),
                HAMMER2_COMP_ZLIB => compress_zlib(&block, 6).map(|c| (c, HAMMER2_COMP_ZLIB)),
                _ => None,
            };
            let (payload, used_comp) = packed.unwrap_or((block, HAMMER2_COMP_NONE));
            brefs.push(w.put(
                BlockKind::Data { pfs, inum, key },
                BrefType::Data,
                key,
                lradix,
                &payload,
                check,
                used_comp,
            ));
        }
        Body::Tree(brefs)
    }
}

/// First free key at or above `base` inside its collision space.
fn unique_key(used: &mut BTreeSet<u64>, base: u64) -> u64 {
    let mut key = base;
    while used.contains(&key) {
        key += 1;
        assert!(
            key & HAMMER2_DIRHASH_LOMASK != 0,
            "directory hash collision space exhausted"
        );
    }
    used.insert(key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use h2_ondisk::check::verify;
    use h2_ondisk::{CheckOutcome, InodeData};

    fn region(img: &BuiltImage, offset: u64, len: u64) -> &[u8] {
        let at = usize::try_from(offset).unwrap();
        &img.bytes[at..at + usize::try_from(len).unwrap()]
    }

    #[test]
    fn header_parses_and_crcs_hold() {
        let img = ImageBuilder::new().build();
        let raw = &img.bytes[..HAMMER2_VOLUME_BYTES];
        assert!(VolumeHeader::verify_crcs(raw).all_good());
        let parsed = VolumeHeader::parse(raw).unwrap();
        assert_eq!(parsed, img.header);
        assert_eq!(parsed.sroot_blockset[0].btype, BrefType::Inode);
        assert_eq!(parsed.freemap_blockset[0].btype, BrefType::FreemapNode);
        assert!(img.free_bytes > 0 && img.free_bytes < parsed.volu_size);
    }

    #[test]
    fn super_root_holds_each_pfs_under_its_hash() {
        let mut b = ImageBuilder::new();
        b.add_pfs("BACKUP");
        let img = b.build();
        let sroot_off = img.find(BlockKind::SuperRoot).unwrap().offset;
        let sroot = InodeData::parse(region(&img, sroot_off, 1024)).unwrap();
        let set = sroot.blockset().unwrap();
        let keys: Vec<u64> = set
            .iter()
            .filter(|b| b.btype == BrefType::Inode)
            .map(|b| b.key)
            .collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&dirhash(b"ROOT")));
        assert!(keys.contains(&dirhash(b"BACKUP")));
    }

    #[test]
    fn every_sealed_block_verifies() {
        let mut b = ImageBuilder::new();
        let root = b.root();
        let dir = b.mkdir(root, "d");
        for i in 0..40 {
            b.file(dir, &format!("f{i}"), vec![u8::try_from(i).unwrap(); 3000]);
        }
        let img = b.build();
        let dir_off = img.inode_offset(dir).unwrap();
        let inode = InodeData::parse(region(&img, dir_off, 1024)).unwrap();
        for bref in inode.blockset().unwrap().iter().filter(|b| b.has_media()) {
            let data = region(&img, bref.data_offset().0, bref.data_bytes());
            assert_eq!(verify(bref, data), CheckOutcome::Good);
        }
        assert!(!img.indirect_blocks().is_empty());
    }

    #[test]
    fn small_files_go_direct_and_large_files_split() {
        let mut b = ImageBuilder::new();
        let root = b.root();
        let small = b.file(root, "small", b"hello".to_vec());
        let big = b.file(root, "big", vec![7_u8; 200_000]);
        let img = b.build();
        assert!(img.data_blocks(small).is_empty());
        let blocks = img.data_blocks(big);
        assert_eq!(blocks.len(), 4);
        assert!(blocks.iter().all(|p| p.len == HAMMER2_PBUFSIZE));
    }

    #[test]
    fn holes_leave_no_blocks() {
        let opts = BuildOptions {
            zero_blocks: ZeroBlocks::Hole,
            ..BuildOptions::default()
        };
        let mut b = ImageBuilder::with_options(opts);
        let root = b.root();
        let mut data = vec![0_u8; 3 * 65536];
        data[2 * 65536] = 1;
        let sparse = b.file(root, "sparse", data);
        let img = b.build();
        let blocks = img.data_blocks(sparse);
        assert_eq!(blocks.len(), 1);
        assert!(matches!(blocks[0].kind, BlockKind::Data { key: 0x20000, .. }));
    }

    #[test]
    fn backup_headers_land_in_their_zones() {
        let opts = BuildOptions {
            header_tids: vec![5, 9],
            ..BuildOptions::default()
        };
        let mut img = ImageBuilder::with_options(opts).build();
        assert_eq!(img.backup_headers.len(), 1);
        let (offset, raw) = &img.backup_headers[0];
        assert_eq!(*offset, HAMMER2_ZONE_BYTES64);
        assert_eq!(VolumeHeader::parse(raw).unwrap().mirror_tid, 9);
        assert_eq!(img.device_len(), HAMMER2_ZONE_BYTES64 + 65536);
        img.corrupt_header(1);
        assert!(!VolumeHeader::verify_crcs(&img.backup_headers[0].1).all_good());
    }
}
