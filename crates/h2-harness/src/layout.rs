//! Media allocation and radix-tree construction for built images.

use crate::{BlockKind, Placement};
use h2_ondisk::check::{icrc32, seal};
use h2_ondisk::freemap::{
    HAMMER2_FREEMAP_BLOCK_RADIX, HAMMER2_FREEMAP_COUNT, HAMMER2_FREEMAP_LEVEL0_RADIX,
    HAMMER2_FREEMAP_LEVEL1_RADIX, HAMMER2_FREEMAP_LEVELN_PSIZE,
};
use h2_ondisk::{
    BmapData, Blockref, BrefType, FreemapCheck, FreemapLeaf, InodeBody, InodeData, InodeMeta,
};
use h2_types::{
    HAMMER2_BLOCKREF_BYTES, HAMMER2_CHECK_FREEMAP, HAMMER2_SET_COUNT, PhysOffset,
    bytes_to_radix, enc_check, enc_comp,
};
use tracing::trace;

/// Freemap nodes and leaves are 32 KiB.
pub(crate) const FREEMAP_BLOCK_RADIX: u8 = 15;
/// Key range of the single freemap node (256 leaves of 1 GiB).
pub(crate) const FREEMAP_NODE_KEYBITS: u8 = 38;

/// Bump allocator over an in-memory image.
pub(crate) struct Writer {
    pub(crate) image: Vec<u8>,
    pub(crate) placements: Vec<Placement>,
    next: u64,
    check: u8,
    fanout: usize,
    tid: u64,
}

impl Writer {
    pub(crate) fn new(start: u64, check: u8, fanout: usize, tid: u64) -> Self {
        Self {
            image: Vec::new(),
            placements: Vec::new(),
            next: start,
            check,
            fanout,
            tid,
        }
    }

    pub(crate) fn check(&self) -> u8 {
        self.check
    }

    /// Reserve a naturally aligned block of `1 << radix` bytes.
    pub(crate) fn alloc(&mut self, kind: BlockKind, radix: u8) -> u64 {
        let size = 1_u64 << radix;
        let offset = self.next.next_multiple_of(size);
        self.next = offset + size;
        let end = usize::try_from(self.next).unwrap_or(usize::MAX);
        if self.image.len() < end {
            self.image.resize(end, 0);
        }
        self.placements.push(Placement {
            kind,
            offset,
            len: size,
        });
        offset
    }

    /// First unallocated byte.
    pub(crate) fn high_water(&self) -> u64 {
        self.next
    }

    pub(crate) fn fill(&mut self, offset: u64, bytes: &[u8]) {
        let at = usize::try_from(offset).unwrap_or(usize::MAX);
        self.image[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// Write `payload` into a fresh block and return a sealed blockref.
    ///
    /// The check code covers the whole padded block, matching what a chain
    /// load hands to verification.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn put(
        &mut self,
        kind: BlockKind,
        btype: BrefType,
        key: u64,
        keybits: u8,
        payload: &[u8],
        check: u8,
        comp: u8,
    ) -> Blockref {
        let radix = bytes_to_radix(payload.len() as u64);
        let offset = self.alloc(kind, radix);
        let mut block = payload.to_vec();
        block.resize(1 << radix, 0);
        self.fill(offset, &block);

        let mut bref = Blockref::new(btype, key, keybits).with_data(PhysOffset(offset), radix);
        bref.methods = enc_check(check) | enc_comp(comp);
        bref.mirror_tid = self.tid;
        bref.modify_tid = self.tid;
        bref.update_tid = self.tid;
        seal(&mut bref, &block);
        trace!(
            target: "h2::harness",
            event = "harness_block_put",
            btype = %btype,
            key = format_args!("{key:#018x}"),
            offset = format_args!("{offset:#x}"),
            radix
        );
        bref
    }

    /// Media-less blockref that still carries the tid stamps.
    pub(crate) fn bare(&self, btype: BrefType, key: u64, keybits: u8) -> Blockref {
        let mut bref = Blockref::new(btype, key, keybits);
        bref.mirror_tid = self.tid;
        bref.modify_tid = self.tid;
        bref.update_tid = self.tid;
        bref
    }

    /// Serialize an inode whose blockset holds `entries` (folded through
    /// indirect blocks as needed) or whose body is direct data.
    pub(crate) fn inode(
        &mut self,
        kind: BlockKind,
        mut meta: InodeMeta,
        filename: &[u8],
        body: Body,
        key: u64,
    ) -> Blockref {
        meta.name_len = u16::try_from(filename.len()).unwrap_or(u16::MAX);
        let body = match body {
            Body::Direct(bytes) => InodeBody::Direct(bytes),
            Body::Tree(entries) => {
                let owner = kind.owner();
                let top = self.fold(entries, HAMMER2_SET_COUNT, owner);
                let mut set = [Blockref::empty(); HAMMER2_SET_COUNT];
                for (slot, bref) in set.iter_mut().zip(top) {
                    *slot = bref;
                }
                InodeBody::Blockset(set)
            }
        };
        let data = InodeData {
            meta,
            filename: filename.to_vec(),
            body,
        };
        let check = self.check;
        self.put(kind, BrefType::Inode, key, 0, &data.to_bytes(), check, 0)
    }

    /// Reduce `entries` to at most `slots` blockrefs.
    ///
    /// The covered key span is split on its high bits into `slots` aligned
    /// sub-ranges; any sub-range holding more than one entry becomes an
    /// INDIRECT block of `fanout` slots, built recursively.
    pub(crate) fn fold(
        &mut self,
        mut entries: Vec<Blockref>,
        slots: usize,
        owner: Option<(usize, u64)>,
    ) -> Vec<Blockref> {
        entries.sort_by_key(|bref| bref.key);
        if entries.len() <= slots {
            return entries;
        }
        let lo = entries[0].key;
        let hi = entries.iter().map(Blockref::key_end).max().unwrap_or(lo);
        let span = 64 - u8::try_from((lo ^ hi).leading_zeros()).unwrap_or(64);
        let slot_bits = u8::try_from(slots.trailing_zeros()).unwrap_or(0);
        let widest = entries.iter().map(|bref| bref.keybits).max().unwrap_or(0);
        let sub = span.saturating_sub(slot_bits).max(widest).min(63);

        let mut groups: Vec<Vec<Blockref>> = Vec::new();
        for bref in entries {
            match groups.last_mut() {
                Some(group) if group[0].key >> sub == bref.key >> sub => group.push(bref),
                _ => groups.push(vec![bref]),
            }
        }

        let mut out = Vec::with_capacity(groups.len());
        for group in groups {
            if group.len() == 1 {
                out.extend(group);
                continue;
            }
            let base = group[0].key & !((1_u64 << sub) - 1);
            let children = self.fold(group, self.fanout, owner);
            let mut block = vec![0_u8; self.fanout * HAMMER2_BLOCKREF_BYTES];
            for (idx, child) in children.iter().enumerate() {
                child.write_to(&mut block[idx * HAMMER2_BLOCKREF_BYTES..]);
            }
            let check = self.check;
            out.push(self.put(
                BlockKind::Indirect {
                    owner,
                    key: base,
                    keybits: sub,
                },
                BrefType::Indirect,
                base,
                sub,
                &block,
                check,
                0,
            ));
        }
        out
    }

    /// Write the freemap leaf and node into the blocks reserved at build
    /// start, marking every placement (and everything past `volu_size`) as
    /// allocated. Returns the node blockref and the free byte count.
    pub(crate) fn freemap(
        &mut self,
        node_off: u64,
        leaf_off: u64,
        volu_size: u64,
    ) -> (Blockref, u64) {
        let region = 1_u64 << HAMMER2_FREEMAP_LEVEL0_RADIX;
        let unit = 1_u64 << HAMMER2_FREEMAP_BLOCK_RADIX;
        let per_region = usize::try_from(region / unit).unwrap_or(256);
        let mut used = vec![vec![false; per_region]; HAMMER2_FREEMAP_COUNT];

        let mut mark = |beg: u64, end: u64| {
            let mut at = beg - beg % unit;
            while at < end && at < (1_u64 << HAMMER2_FREEMAP_LEVEL1_RADIX) {
                let r = usize::try_from(at / region).unwrap_or(0);
                let b = usize::try_from((at % region) / unit).unwrap_or(0);
                used[r][b] = true;
                at += unit;
            }
        };
        mark(0, crate::RESERVED_BYTES);
        for placement in &self.placements {
            mark(placement.offset, placement.offset + placement.len);
        }
        mark(volu_size, 1_u64 << HAMMER2_FREEMAP_LEVEL1_RADIX);

        let entries: Vec<BmapData> = used
            .iter()
            .map(|blocks| {
                let mut bitmapq = [0_u64; 8];
                for (idx, _) in blocks.iter().enumerate().filter(|(_, used)| **used) {
                    bitmapq[idx / 32] |= 0b11 << ((idx % 32) * 2);
                }
                let taken = blocks.iter().filter(|used| **used).count() as u64;
                BmapData {
                    linear: 0,
                    class: 0,
                    avail: u32::try_from(region - taken * unit).unwrap_or(0),
                    bitmapq,
                }
            })
            .collect();
        let leaf = FreemapLeaf { entries };
        let avail = leaf.total_avail();
        let leaf_bytes = leaf.to_bytes();
        debug_assert_eq!(leaf_bytes.len(), HAMMER2_FREEMAP_LEVELN_PSIZE);
        self.fill(leaf_off, &leaf_bytes);

        let mut leaf_bref = self
            .bare(BrefType::FreemapLeaf, 0, HAMMER2_FREEMAP_LEVEL1_RADIX)
            .with_data(PhysOffset(leaf_off), FREEMAP_BLOCK_RADIX);
        leaf_bref.methods = enc_check(HAMMER2_CHECK_FREEMAP);
        FreemapCheck {
            icrc32: icrc32(&leaf_bytes),
            bigmask: u32::MAX,
            avail,
        }
        .store(&mut leaf_bref);

        let mut node = vec![0_u8; 1 << FREEMAP_BLOCK_RADIX];
        leaf_bref.write_to(&mut node);
        self.fill(node_off, &node);
        let mut node_bref = self
            .bare(BrefType::FreemapNode, 0, FREEMAP_NODE_KEYBITS)
            .with_data(PhysOffset(node_off), FREEMAP_BLOCK_RADIX);
        node_bref.methods = enc_check(HAMMER2_CHECK_FREEMAP);
        FreemapCheck {
            icrc32: icrc32(&node),
            bigmask: u32::MAX,
            avail,
        }
        .store(&mut node_bref);
        (node_bref, avail)
    }
}

/// Content of an inode's 512-byte union.
pub(crate) enum Body {
    Direct(Vec<u8>),
    Tree(Vec<Blockref>),
}
