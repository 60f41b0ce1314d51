#![forbid(unsafe_code)]
//! On-disk constants and parsing primitives shared by every hammer2-rs crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Geometry ────────────────────────────────────────────────────────────────

/// Smallest allocation radix (1 KiB).
pub const HAMMER2_RADIX_MIN: u8 = 10;
/// Largest allocation radix (64 KiB).
pub const HAMMER2_RADIX_MAX: u8 = 16;

/// Physical buffer size used by the IO buffer cache.
pub const HAMMER2_PBUFRADIX: u8 = 16;
pub const HAMMER2_PBUFSIZE: u64 = 1 << HAMMER2_PBUFRADIX;
pub const HAMMER2_PBUFMASK: u64 = HAMMER2_PBUFSIZE - 1;

/// Logical buffer size used by file data blocks.
pub const HAMMER2_LBUFRADIX: u8 = 14;
pub const HAMMER2_LBUFSIZE: u64 = 1 << HAMMER2_LBUFRADIX;

/// Size of one volume header copy.
pub const HAMMER2_VOLUME_BYTES: usize = 65536;
/// Spacing between volume header copies.
pub const HAMMER2_ZONE_BYTES64: u64 = 2 * 1024 * 1024 * 1024;
/// Maximum number of volume header copies.
pub const HAMMER2_NUM_VOLHDRS: usize = 4;

pub const HAMMER2_BLOCKREF_BYTES: usize = 128;
pub const HAMMER2_INODE_BYTES: usize = 1024;
pub const HAMMER2_INODE_META_BYTES: usize = 256;
pub const HAMMER2_INODE_MAXNAME: usize = 256;
pub const HAMMER2_EMBEDDED_BYTES: usize = 512;
/// Number of blockrefs in an embedded blockset (inode or volume root).
pub const HAMMER2_SET_COUNT: usize = 4;
/// Directory entry names up to this length are stored in the blockref itself.
pub const HAMMER2_DIRENT_INLINE_MAX: usize = 64;

/// Low bits of `data_off` carry the size radix.
pub const HAMMER2_OFF_MASK: u64 = 0xFFFF_FFFF_FFFF_FFC0;
pub const HAMMER2_OFF_MASK_RADIX: u64 = 0x0000_0000_0000_003F;

// ── Volume header ───────────────────────────────────────────────────────────

pub const HAMMER2_VOLUME_ID_HBO: u64 = 0x4841_4d32_0517_2011;
pub const HAMMER2_VOLUME_ID_ABO: u64 = 0x1120_1705_324d_4148;
pub const HAMMER2_VOL_VERSION_MIN: u32 = 1;
pub const HAMMER2_VOL_VERSION_DEFAULT: u32 = 2;
pub const HAMMER2_VOL_VERSION_WIP: u32 = 3;

// ── Blockref types ──────────────────────────────────────────────────────────

pub const HAMMER2_BREF_TYPE_EMPTY: u8 = 0;
pub const HAMMER2_BREF_TYPE_INODE: u8 = 1;
pub const HAMMER2_BREF_TYPE_INDIRECT: u8 = 2;
pub const HAMMER2_BREF_TYPE_DATA: u8 = 3;
pub const HAMMER2_BREF_TYPE_DIRENT: u8 = 4;
pub const HAMMER2_BREF_TYPE_FREEMAP_NODE: u8 = 5;
pub const HAMMER2_BREF_TYPE_FREEMAP_LEAF: u8 = 6;
pub const HAMMER2_BREF_TYPE_FREEMAP: u8 = 254;
pub const HAMMER2_BREF_TYPE_VOLUME: u8 = 255;

// ── Check and compression methods (packed into `methods`) ──────────────────

pub const HAMMER2_CHECK_NONE: u8 = 0;
pub const HAMMER2_CHECK_DISABLED: u8 = 1;
pub const HAMMER2_CHECK_ISCSI32: u8 = 2;
pub const HAMMER2_CHECK_XXHASH64: u8 = 3;
pub const HAMMER2_CHECK_SHA192: u8 = 4;
pub const HAMMER2_CHECK_FREEMAP: u8 = 5;

pub const HAMMER2_COMP_NONE: u8 = 0;
pub const HAMMER2_COMP_AUTOZERO: u8 = 1;
pub const HAMMER2_COMP_LZ4: u8 = 2;
pub const HAMMER2_COMP_ZLIB: u8 = 3;

/// Seed for the XXH64 check code.
pub const HAMMER2_XXH64_SEED: u64 = 0x4d61_7474_446c_6c6e;

#[must_use]
pub const fn enc_check(check: u8) -> u8 {
    (check & 15) << 4
}

#[must_use]
pub const fn enc_comp(comp: u8) -> u8 {
    comp & 15
}

#[must_use]
pub const fn dec_check(methods: u8) -> u8 {
    (methods >> 4) & 15
}

#[must_use]
pub const fn dec_comp(methods: u8) -> u8 {
    methods & 15
}

// ── Inode ───────────────────────────────────────────────────────────────────

pub const HAMMER2_OPFLAG_DIRECTDATA: u8 = 0x01;
pub const HAMMER2_OPFLAG_PFSROOT: u8 = 0x02;

pub const HAMMER2_OBJTYPE_UNKNOWN: u8 = 0;
pub const HAMMER2_OBJTYPE_DIRECTORY: u8 = 1;
pub const HAMMER2_OBJTYPE_REGFILE: u8 = 2;
pub const HAMMER2_OBJTYPE_FIFO: u8 = 4;
pub const HAMMER2_OBJTYPE_CDEV: u8 = 5;
pub const HAMMER2_OBJTYPE_BDEV: u8 = 6;
pub const HAMMER2_OBJTYPE_SOFTLINK: u8 = 7;
pub const HAMMER2_OBJTYPE_SOCKET: u8 = 9;
pub const HAMMER2_OBJTYPE_WHITEOUT: u8 = 10;

pub const HAMMER2_PFSTYPE_NONE: u8 = 0;
pub const HAMMER2_PFSTYPE_MASTER: u8 = 6;
pub const HAMMER2_PFSTYPE_SUPROOT: u8 = 8;

// ── Keys ────────────────────────────────────────────────────────────────────

/// Directory hash keys always carry the high bit.
pub const HAMMER2_DIRHASH_VISIBLE: u64 = 0x8000_0000_0000_0000;
/// Collision space at the bottom of each directory hash.
pub const HAMMER2_DIRHASH_LOMASK: u64 = 0x0000_0000_0000_7FFF;
pub const HAMMER2_DIRHASH_HIMASK: u64 = 0xFFFF_FFFF_FFFF_0000;
pub const HAMMER2_DIRHASH_FORCED: u64 = 0x0000_0000_0000_8000;
pub const HAMMER2_DIRHASH_USERMSK: u64 = 0x7FFF_FFFF_FFFF_FFFF;
pub const HAMMER2_KEY_MAX: u64 = u64::MAX;

/// Inode number of a PFS root.
pub const HAMMER2_INODE_ROOT: u64 = 1;

/// Maximum number of members in a cluster.
pub const HAMMER2_MAXCLUSTER: usize = 8;

/// Inclusive end of the key range `[key, key + 2^keybits)`.
///
/// Saturates for a `keybits` of 64 or for a key that is not aligned to the
/// range.
#[must_use]
pub fn key_range_end(key: u64, keybits: u8) -> u64 {
    if keybits >= 64 {
        return u64::MAX;
    }
    key.saturating_add((1_u64 << keybits) - 1)
}

/// First key after `[key, key + 2^keybits)`, or `None` when the range reaches
/// the top of the key space.
#[must_use]
pub fn key_range_next(key: u64, keybits: u8) -> Option<u64> {
    key_range_end(key, keybits).checked_add(1)
}

/// Byte size encoded in the low radix bits of a `data_off`.
///
/// A radix of zero means "no media" and yields zero.
#[must_use]
pub fn radix_to_bytes(radix: u8) -> u64 {
    if radix == 0 || radix >= 64 {
        0
    } else {
        1_u64 << radix
    }
}

/// Smallest allocation radix that holds `bytes`, clamped to the 1 KiB minimum.
#[must_use]
pub fn bytes_to_radix(bytes: u64) -> u8 {
    let mut radix = HAMMER2_RADIX_MIN;
    while radix < 63 && (1_u64 << radix) < bytes {
        radix += 1;
    }
    radix
}

// ── Newtypes ────────────────────────────────────────────────────────────────

/// Inode number within one PFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

impl InodeNumber {
    pub const ROOT: Self = Self(HAMMER2_INODE_ROOT);
}

/// Transaction id (mirror, modify or update tid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tid(pub u64);

/// Physical byte offset of media on the device, radix bits stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhysOffset(pub u64);

impl PhysOffset {
    /// Base of the 64 KiB physical buffer containing this offset.
    #[must_use]
    pub fn pbase(self) -> u64 {
        self.0 & !HAMMER2_PBUFMASK
    }

    /// Offset of this address within its physical buffer.
    #[must_use]
    pub fn pbuf_offset(self) -> usize {
        usize::try_from(self.0 & HAMMER2_PBUFMASK).unwrap_or(0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Display for PhysOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

// ── Parse errors and readers ────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// Format a 16-byte UUID field in canonical 8-4-4-4-12 form.
#[must_use]
pub fn format_uuid(bytes: &[u8; 16]) -> String {
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn methods_pack_and_unpack() {
        let methods = enc_check(HAMMER2_CHECK_XXHASH64) | enc_comp(HAMMER2_COMP_LZ4);
        assert_eq!(methods, 0x32);
        assert_eq!(dec_check(methods), HAMMER2_CHECK_XXHASH64);
        assert_eq!(dec_comp(methods), HAMMER2_COMP_LZ4);
    }

    #[test]
    fn radix_bytes() {
        assert_eq!(radix_to_bytes(0), 0);
        assert_eq!(radix_to_bytes(10), 1024);
        assert_eq!(radix_to_bytes(16), 65536);
        assert_eq!(bytes_to_radix(1), 10);
        assert_eq!(bytes_to_radix(1024), 10);
        assert_eq!(bytes_to_radix(1025), 11);
        assert_eq!(bytes_to_radix(65536), 16);
    }

    #[test]
    fn key_range_edges() {
        assert_eq!(key_range_end(0, 0), 0);
        assert_eq!(key_range_end(0, 16), 0xFFFF);
        assert_eq!(key_range_end(0, 64), u64::MAX);
        assert_eq!(key_range_next(0x10000, 16), Some(0x20000));
        assert_eq!(key_range_next(HAMMER2_DIRHASH_VISIBLE, 63), None);
        assert_eq!(key_range_next(u64::MAX, 0), None);
    }

    #[test]
    fn phys_offset_split() {
        let off = PhysOffset(0x0012_3456);
        assert_eq!(off.pbase(), 0x0012_0000);
        assert_eq!(off.pbuf_offset(), 0x3456);
    }

    #[test]
    fn readers_reject_short_input() {
        let data = [1_u8, 2, 3];
        assert_eq!(read_le_u16(&data, 1), Ok(0x0302));
        assert!(matches!(
            read_le_u32(&data, 0),
            Err(ParseError::InsufficientData {
                needed: 4,
                offset: 0,
                actual: 3
            })
        ));
        assert!(ensure_slice(&data, usize::MAX, 2).is_err());
    }

    #[test]
    fn uuid_formatting() {
        let mut raw = [0_u8; 16];
        raw[0] = 0xde;
        raw[15] = 0x01;
        assert_eq!(format_uuid(&raw), "de000000-0000-0000-0000-000000000001");
        assert_eq!(trim_nul_padded(b"ROOT\0\0\0"), "ROOT");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn aligned_ranges_contain_their_key(key in any::<u64>(), keybits in 0_u8..=64) {
            let mask = if keybits >= 64 { u64::MAX } else { (1_u64 << keybits) - 1 };
            let aligned = key & !mask;
            let end = key_range_end(aligned, keybits);
            prop_assert!(end >= aligned);
            prop_assert_eq!(end, aligned | mask);
            match key_range_next(aligned, keybits) {
                Some(next) => prop_assert_eq!(next, end + 1),
                None => prop_assert_eq!(end, u64::MAX),
            }
        }
    }
}
