//! Freemap leaf layout. Read-only: the engine never allocates.

use crate::blockref::Blockref;
use h2_types::{ParseError, ensure_slice, read_le_u16, read_le_u32, read_le_u64};
use serde::{Deserialize, Serialize};

/// Bytes of one `bmap_data` element.
pub const HAMMER2_BMAP_BYTES: usize = 128;
/// Elements per freemap leaf.
pub const HAMMER2_FREEMAP_COUNT: usize = 256;
/// Bytes of a freemap leaf block.
pub const HAMMER2_FREEMAP_LEVELN_PSIZE: usize = HAMMER2_BMAP_BYTES * HAMMER2_FREEMAP_COUNT;
/// Storage covered by one `bmap_data` element (4 MiB).
pub const HAMMER2_FREEMAP_LEVEL0_RADIX: u8 = 22;
/// Storage covered by one freemap leaf (1 GiB).
pub const HAMMER2_FREEMAP_LEVEL1_RADIX: u8 = 30;
/// Allocation granularity tracked by the 2-bit bitmap entries (16 KiB).
pub const HAMMER2_FREEMAP_BLOCK_RADIX: u8 = 14;
const BMAP_ELEMENTS: usize = 8;

/// One `bmap_data` element managing 4 MiB of storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BmapData {
    pub linear: i32,
    pub class: u16,
    pub avail: u32,
    pub bitmapq: [u64; BMAP_ELEMENTS],
}

impl BmapData {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(data, 0, HAMMER2_BMAP_BYTES)?;
        let mut bitmapq = [0_u64; BMAP_ELEMENTS];
        for (idx, word) in bitmapq.iter_mut().enumerate() {
            *word = read_le_u64(raw, 0x40 + idx * 8)?;
        }
        Ok(Self {
            linear: i32::from_le_bytes(read_le_u32(raw, 0x00)?.to_le_bytes()),
            class: read_le_u16(raw, 0x04)?,
            avail: read_le_u32(raw, 0x1C)?,
            bitmapq,
        })
    }

    pub fn write_to(&self, out: &mut [u8]) {
        let out = &mut out[..HAMMER2_BMAP_BYTES];
        out.fill(0);
        out[0x00..0x04].copy_from_slice(&self.linear.to_le_bytes());
        out[0x04..0x06].copy_from_slice(&self.class.to_le_bytes());
        out[0x1C..0x20].copy_from_slice(&self.avail.to_le_bytes());
        for (idx, word) in self.bitmapq.iter().enumerate() {
            let at = 0x40 + idx * 8;
            out[at..at + 8].copy_from_slice(&word.to_le_bytes());
        }
    }

    /// Number of 16 KiB blocks whose 2-bit state is non-zero.
    #[must_use]
    pub fn allocated_blocks(&self) -> u32 {
        self.bitmapq
            .iter()
            .map(|word| {
                (0..32)
                    .filter(|slot| (word >> (slot * 2)) & 0b11 != 0)
                    .count()
            })
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .sum()
    }
}

/// A freemap leaf: 256 elements covering 1 GiB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreemapLeaf {
    pub entries: Vec<BmapData>,
}

impl FreemapLeaf {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(data, 0, HAMMER2_FREEMAP_LEVELN_PSIZE)?;
        let entries = raw
            .chunks_exact(HAMMER2_BMAP_BYTES)
            .map(BmapData::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0_u8; HAMMER2_FREEMAP_LEVELN_PSIZE];
        for (idx, entry) in self.entries.iter().take(HAMMER2_FREEMAP_COUNT).enumerate() {
            entry.write_to(&mut out[idx * HAMMER2_BMAP_BYTES..]);
        }
        out
    }

    #[must_use]
    pub fn total_avail(&self) -> u64 {
        self.entries.iter().map(|e| u64::from(e.avail)).sum()
    }
}

/// Freemap-specific fields sharing the blockref check area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreemapCheck {
    pub icrc32: u32,
    pub bigmask: u32,
    pub avail: u64,
}

impl FreemapCheck {
    #[must_use]
    pub fn from_bref(bref: &Blockref) -> Self {
        Self {
            icrc32: read_le_u32(&bref.check, 0).unwrap_or(0),
            bigmask: read_le_u32(&bref.check, 4).unwrap_or(0),
            avail: read_le_u64(&bref.check, 8).unwrap_or(0),
        }
    }

    pub fn store(&self, bref: &mut Blockref) {
        bref.check[0..4].copy_from_slice(&self.icrc32.to_le_bytes());
        bref.check[4..8].copy_from_slice(&self.bigmask.to_le_bytes());
        bref.check[8..16].copy_from_slice(&self.avail.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockref::BrefType;

    #[test]
    fn leaf_layout() {
        let mut leaf = FreemapLeaf {
            entries: vec![
                BmapData {
                    linear: 0,
                    class: 0,
                    avail: 4 << 20,
                    bitmapq: [0; BMAP_ELEMENTS],
                };
                HAMMER2_FREEMAP_COUNT
            ],
        };
        leaf.entries[0].avail = 1 << 20;
        leaf.entries[0].bitmapq[0] = 0b11_00_10_01;
        leaf.entries[0].linear = -1;
        let raw = leaf.to_bytes();
        assert_eq!(raw.len(), 32768);
        assert_eq!(u32::from_le_bytes(raw[0x1C..0x20].try_into().unwrap()), 1 << 20);
        let parsed = FreemapLeaf::parse(&raw).unwrap();
        assert_eq!(parsed, leaf);
        assert_eq!(parsed.entries[0].allocated_blocks(), 3);
        assert_eq!(parsed.total_avail(), (1 << 20) + 255 * (4 << 20));
    }

    #[test]
    fn check_area_fields() {
        let mut bref = Blockref::new(BrefType::FreemapLeaf, 0, HAMMER2_FREEMAP_LEVEL1_RADIX);
        let fc = FreemapCheck {
            icrc32: 0xDEAD_BEEF,
            bigmask: 0xFFFF_FFFF,
            avail: 1 << 30,
        };
        fc.store(&mut bref);
        assert_eq!(FreemapCheck::from_bref(&bref), fc);
    }

    #[test]
    fn short_leaf_rejected() {
        assert!(FreemapLeaf::parse(&[0_u8; 1024]).is_err());
    }
}
