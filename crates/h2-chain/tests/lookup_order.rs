#![forbid(unsafe_code)]

use h2_block::{DioCache, DioConfig, MemByteDevice};
use h2_chain::{ChainConfig, ChainStore, LookupFlags, scan_range};
use h2_ondisk::{Blockref, BrefType};
use h2_types::HAMMER2_SET_COUNT;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

/// A volume root whose blockset holds up to four media keys, with every
/// other key linked in as an in-memory child.
fn populated(keys: &BTreeSet<u64>, on_media: usize) -> (ChainStore, h2_chain::ChainId) {
    let dev = Arc::new(MemByteDevice::new(vec![0_u8; 1 << 16]));
    let store = ChainStore::new(
        Arc::new(DioCache::new(dev, DioConfig::default())),
        ChainConfig { lru_limit: 4096 },
    );
    let media: Vec<u64> = keys.iter().copied().step_by(2).take(on_media).collect();
    let mut set = [Blockref::empty(); HAMMER2_SET_COUNT];
    for (slot, key) in set.iter_mut().zip(&media) {
        *slot = Blockref::new(BrefType::Inode, *key, 0);
    }
    let root = store.alloc_root(Blockref::new(BrefType::Volume, 0, 64), &set);
    for key in keys.iter().filter(|k| !media.contains(k)) {
        let id = store.alloc(Blockref::new(BrefType::Inode, *key, 0));
        store.insert(root, id, None).expect("insert");
        store.drop_chain(id);
    }
    (store, root)
}

proptest! {
    #[test]
    fn full_scan_yields_each_key_once_ascending(
        keys in prop::collection::btree_set(any::<u64>(), 1..64),
        on_media in 0_usize..=4,
    ) {
        let (store, root) = populated(&keys, on_media);
        let (brefs, error) = scan_range(&store, root, 0, u64::MAX, LookupFlags::SHARED);
        prop_assert!(error.is_empty());
        let seen: Vec<u64> = brefs.iter().map(|b| b.key).collect();
        let expected: Vec<u64> = keys.iter().copied().collect();
        prop_assert_eq!(seen, expected);
    }

    #[test]
    fn range_scan_yields_exactly_the_overlapping_keys(
        keys in prop::collection::btree_set(0_u64..10_000, 1..64),
        on_media in 0_usize..=4,
        a in 0_u64..10_000,
        b in 0_u64..10_000,
    ) {
        let (beg, end) = (a.min(b), a.max(b));
        let (store, root) = populated(&keys, on_media);
        let (brefs, error) = scan_range(&store, root, beg, end, LookupFlags::SHARED);
        prop_assert!(error.is_empty());
        let seen: Vec<u64> = brefs.iter().map(|b| b.key).collect();
        let expected: Vec<u64> = keys.range(beg..=end).copied().collect();
        prop_assert_eq!(seen, expected);
    }

    #[test]
    fn repeated_scans_instantiate_nothing_new(
        keys in prop::collection::btree_set(any::<u64>(), 1..32),
    ) {
        let (store, root) = populated(&keys, 4);
        let _ = scan_range(&store, root, 0, u64::MAX, LookupFlags::SHARED);
        let allocated = store.stats().allocated;
        let _ = scan_range(&store, root, 0, u64::MAX, LookupFlags::SHARED);
        prop_assert_eq!(store.stats().allocated, allocated);
        for chain in store.live_chains() {
            if chain.id() != root {
                prop_assert_eq!(chain.refs(), 0);
            }
        }
    }
}
