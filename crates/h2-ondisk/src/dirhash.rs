use crate::check::icrc32;
use h2_types::{HAMMER2_DIRHASH_FORCED, HAMMER2_DIRHASH_LOMASK};

/// Directory hash key for `name`.
///
/// The high 32 bits are the sum of CRCs over the name's segments (split on
/// `.`, `-`, `_` and `~`) with bit 63 forced on, so names that differ only
/// in a suffix land near each other. The next 16 bits come from a CRC of the
/// whole name. The low 16 bits form the collision space, with bit 15 set.
#[must_use]
pub fn dirhash(name: &[u8]) -> u64 {
    let mut crcx: u32 = 0;
    let mut seg_start = 0;
    for (idx, byte) in name.iter().enumerate() {
        if matches!(byte, b'.' | b'-' | b'_' | b'~') {
            if idx != seg_start {
                crcx = crcx.wrapping_add(icrc32(&name[seg_start..idx]));
            }
            seg_start = idx + 1;
        }
    }
    if seg_start != name.len() {
        crcx = crcx.wrapping_add(icrc32(&name[seg_start..]));
    }
    crcx |= 0x8000_0000;
    let mut key = u64::from(crcx) << 32;

    let mut whole = icrc32(name);
    whole ^= whole << 16;
    key |= u64::from(whole & 0xFFFF_0000);
    key | HAMMER2_DIRHASH_FORCED
}

/// Inclusive key range that may hold `name` or its hash collisions.
#[must_use]
pub fn dirhash_range(name: &[u8]) -> (u64, u64) {
    let lhc = dirhash(name);
    (lhc, lhc | HAMMER2_DIRHASH_LOMASK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use h2_types::HAMMER2_DIRHASH_VISIBLE;

    #[test]
    fn keys_are_visible_and_forced() {
        for name in [&b"a"[..], b"ROOT", b"file.tar.gz", b"x_y~z-w"] {
            let key = dirhash(name);
            assert_ne!(key & HAMMER2_DIRHASH_VISIBLE, 0);
            assert_eq!(key & 0xFFFF, 0x8000);
        }
    }

    #[test]
    fn separators_only_split_segments() {
        // Both names have segments "a" and "b"; the high half matches.
        let dot = dirhash(b"a.b");
        let dash = dirhash(b"a-b");
        assert_eq!(dot >> 32, dash >> 32);
        assert_ne!(dot, dash);
    }

    #[test]
    fn deterministic_and_distinct() {
        assert_eq!(dirhash(b"hello"), dirhash(b"hello"));
        assert_ne!(dirhash(b"hello"), dirhash(b"world"));
        let (beg, end) = dirhash_range(b"hello");
        assert_eq!(end - beg, 0x7FFF);
    }

    #[test]
    fn empty_and_separator_only_names() {
        assert_eq!(dirhash(b"") >> 32, 0x8000_0000);
        assert_eq!(dirhash(b"...") >> 32, 0x8000_0000);
    }

    proptest::proptest! {
        #[test]
        fn any_name_hashes_into_the_visible_space(
            name in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..=255),
        ) {
            let key = dirhash(&name);
            let (beg, end) = dirhash_range(&name);
            proptest::prop_assert!(key >= HAMMER2_DIRHASH_VISIBLE);
            proptest::prop_assert_eq!(key & 0xFFFF, HAMMER2_DIRHASH_FORCED);
            proptest::prop_assert_eq!(beg, key);
            proptest::prop_assert!(end > beg);
        }

        #[test]
        fn separator_choice_keeps_the_segment_half(
            segs in proptest::collection::vec("[a-z0-9]{1,8}", 1..5),
        ) {
            let dotted = segs.join(".");
            let tilded = segs.join("~");
            proptest::prop_assert_eq!(
                dirhash(dotted.as_bytes()) >> 32,
                dirhash(tilded.as_bytes()) >> 32
            );
        }
    }
}
