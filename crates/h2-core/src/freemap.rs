//! Read-only freemap statistics.
//!
//! Walks the freemap topology under `fchain` through the ordinary chain
//! lookup path and sums what each leaf reports. Nothing is allocated or
//! reclaimed.

use crate::backend::walk;
use crate::volume::Volume;
use h2_chain::LookupFlags;
use h2_error::{ErrorFlags, H2Error, Result};
use h2_ondisk::freemap::HAMMER2_FREEMAP_BLOCK_RADIX;
use h2_ondisk::{BrefType, FreemapCheck, FreemapLeaf};
use h2_types::HAMMER2_KEY_MAX;
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafSummary {
    pub key: u64,
    pub keybits: u8,
    /// Sum of the leaf's per-element `avail` fields.
    pub avail: u64,
    /// `avail` recorded in the parent's blockref.
    pub bref_avail: u64,
    pub allocated_bytes: u64,
    pub error: ErrorFlags,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreemapSummary {
    pub leaves: Vec<LeafSummary>,
    pub avail: u64,
    pub allocated_bytes: u64,
    pub bad_leaves: u64,
    /// `allocator_free` from the selected volume header.
    pub header_free: u64,
}

impl FreemapSummary {
    /// True when the leaves add up to the header's free count.
    #[must_use]
    pub fn consistent(&self) -> bool {
        self.bad_leaves == 0 && self.avail == self.header_free
    }
}

pub fn scan_freemap(volume: &Volume) -> Result<FreemapSummary> {
    let store = volume.store();
    let fchain = volume.fchain();
    let mut summary = FreemapSummary {
        header_free: volume.header().allocator_free,
        ..FreemapSummary::default()
    };
    let error = store.lookup_init(fchain, LookupFlags::SHARED);
    if !error.is_empty() {
        store.lookup_done(fchain);
        return Err(H2Error::Chain(error));
    }
    let error = walk(store, fchain, 0, HAMMER2_KEY_MAX, LookupFlags::SHARED, |id, error| {
        let chain = store.get(id);
        if chain.btype() != BrefType::FreemapLeaf {
            return ControlFlow::Continue(());
        }
        let bref = *chain.bref();
        let parsed = chain.data().map(|data| FreemapLeaf::parse(&data));
        drop(chain);
        let mut leaf = LeafSummary {
            key: bref.key,
            keybits: bref.keybits,
            avail: 0,
            bref_avail: FreemapCheck::from_bref(&bref).avail,
            allocated_bytes: 0,
            error,
        };
        match parsed {
            Some(Ok(parsed)) if error.is_empty() => {
                leaf.avail = parsed.total_avail();
                leaf.allocated_bytes = parsed
                    .entries
                    .iter()
                    .map(|e| u64::from(e.allocated_blocks()) << HAMMER2_FREEMAP_BLOCK_RADIX)
                    .sum();
                summary.avail += leaf.avail;
                summary.allocated_bytes += leaf.allocated_bytes;
            }
            Some(Err(err)) => {
                warn!(
                    target: "h2::freemap",
                    key = bref.key,
                    error = %err,
                    "freemap_leaf_unparsable"
                );
                leaf.error |= ErrorFlags::BADBREF;
                summary.bad_leaves += 1;
            }
            _ => {
                warn!(
                    target: "h2::freemap",
                    key = bref.key,
                    error = %error,
                    "freemap_leaf_unreadable"
                );
                leaf.error |= ErrorFlags::EIO;
                summary.bad_leaves += 1;
            }
        }
        summary.leaves.push(leaf);
        ControlFlow::Continue(())
    });
    if error.intersects(ErrorFlags::MEDIA) {
        return Err(H2Error::Chain(error));
    }
    debug!(
        target: "h2::freemap",
        leaves = summary.leaves.len(),
        avail = summary.avail,
        header_free = summary.header_free,
        "freemap_scan"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::MountOptions;
    use h2_block::MemByteDevice;
    use h2_harness::{BlockKind, ImageBuilder};
    use std::sync::Arc;

    #[test]
    fn leaves_add_up_to_header_free() {
        let mut builder = ImageBuilder::new();
        let root = builder.root();
        builder.file(root, "big", vec![7_u8; 300_000]);
        let img = builder.build();
        let dev = Arc::new(MemByteDevice::new(img.bytes.clone()));
        let vol = Volume::open(dev, &MountOptions::default()).unwrap();
        let summary = scan_freemap(&vol).unwrap();
        assert_eq!(summary.leaves.len(), 1);
        assert_eq!(summary.avail, img.free_bytes);
        assert_eq!(summary.leaves[0].bref_avail, img.free_bytes);
        assert!(summary.consistent());
        assert!(summary.allocated_bytes >= 4 << 20);
    }

    #[test]
    fn corrupt_leaf_is_counted_not_fatal() {
        let mut img = ImageBuilder::new().build();
        let leaf = img.find(BlockKind::FreemapLeaf).unwrap().offset;
        img.corrupt(leaf + 0x1C);
        let dev = Arc::new(MemByteDevice::new(img.bytes.clone()));
        let vol = Volume::open(dev, &MountOptions::default()).unwrap();
        let summary = scan_freemap(&vol).unwrap();
        assert_eq!(summary.bad_leaves, 1);
        assert!(summary.leaves[0].error.contains(ErrorFlags::CHECK));
        assert!(!summary.consistent());
    }
}
