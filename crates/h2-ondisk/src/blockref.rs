use h2_types::{
    HAMMER2_BLOCKREF_BYTES, HAMMER2_BREF_TYPE_DATA, HAMMER2_BREF_TYPE_DIRENT,
    HAMMER2_BREF_TYPE_EMPTY, HAMMER2_BREF_TYPE_FREEMAP, HAMMER2_BREF_TYPE_FREEMAP_LEAF,
    HAMMER2_BREF_TYPE_FREEMAP_NODE, HAMMER2_BREF_TYPE_INDIRECT, HAMMER2_BREF_TYPE_INODE,
    HAMMER2_BREF_TYPE_VOLUME, HAMMER2_OFF_MASK, HAMMER2_OFF_MASK_RADIX, HAMMER2_SET_COUNT,
    ParseError, PhysOffset, dec_check, dec_comp, ensure_slice, key_range_end, key_range_next,
    radix_to_bytes, read_fixed, read_le_u16, read_le_u64,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of object a blockref points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrefType {
    Empty,
    Inode,
    Indirect,
    Data,
    Dirent,
    FreemapNode,
    FreemapLeaf,
    Freemap,
    Volume,
    Unknown(u8),
}

impl BrefType {
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            HAMMER2_BREF_TYPE_EMPTY => Self::Empty,
            HAMMER2_BREF_TYPE_INODE => Self::Inode,
            HAMMER2_BREF_TYPE_INDIRECT => Self::Indirect,
            HAMMER2_BREF_TYPE_DATA => Self::Data,
            HAMMER2_BREF_TYPE_DIRENT => Self::Dirent,
            HAMMER2_BREF_TYPE_FREEMAP_NODE => Self::FreemapNode,
            HAMMER2_BREF_TYPE_FREEMAP_LEAF => Self::FreemapLeaf,
            HAMMER2_BREF_TYPE_FREEMAP => Self::Freemap,
            HAMMER2_BREF_TYPE_VOLUME => Self::Volume,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Empty => HAMMER2_BREF_TYPE_EMPTY,
            Self::Inode => HAMMER2_BREF_TYPE_INODE,
            Self::Indirect => HAMMER2_BREF_TYPE_INDIRECT,
            Self::Data => HAMMER2_BREF_TYPE_DATA,
            Self::Dirent => HAMMER2_BREF_TYPE_DIRENT,
            Self::FreemapNode => HAMMER2_BREF_TYPE_FREEMAP_NODE,
            Self::FreemapLeaf => HAMMER2_BREF_TYPE_FREEMAP_LEAF,
            Self::Freemap => HAMMER2_BREF_TYPE_FREEMAP,
            Self::Volume => HAMMER2_BREF_TYPE_VOLUME,
            Self::Unknown(raw) => raw,
        }
    }

    /// Interior radix-tree nodes that lookups descend through transparently.
    #[must_use]
    pub fn is_indirect(self) -> bool {
        matches!(self, Self::Indirect | Self::FreemapNode)
    }

    /// Roots whose blockset is embedded in the volume header.
    #[must_use]
    pub fn is_volume_root(self) -> bool {
        matches!(self, Self::Volume | Self::Freemap)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Inode => "inode",
            Self::Indirect => "indirect",
            Self::Data => "data",
            Self::Dirent => "dirent",
            Self::FreemapNode => "freemap_node",
            Self::FreemapLeaf => "freemap_leaf",
            Self::Freemap => "freemap",
            Self::Volume => "volume",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for BrefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(raw) => write!(f, "unknown({raw})"),
            other => f.write_str(other.name()),
        }
    }
}

/// 128-byte on-disk block reference.
///
/// ```text
/// 00 type  01 methods  02 copyid  03 keybits  04 vradix  05 flags  06 leaf_count
/// 08 key   10 mirror_tid   18 modify_tid   20 data_off   28 update_tid
/// 30 embed[16]   40 check[64]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blockref {
    pub btype: BrefType,
    pub methods: u8,
    pub copyid: u8,
    pub keybits: u8,
    pub vradix: u8,
    pub flags: u8,
    pub leaf_count: u16,
    pub key: u64,
    pub mirror_tid: u64,
    pub modify_tid: u64,
    pub data_off: u64,
    pub update_tid: u64,
    pub embed: [u8; 16],
    pub check: [u8; 64],
}

impl Blockref {
    /// An all-zero (EMPTY) blockref.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            btype: BrefType::Empty,
            methods: 0,
            copyid: 0,
            keybits: 0,
            vradix: 0,
            flags: 0,
            leaf_count: 0,
            key: 0,
            mirror_tid: 0,
            modify_tid: 0,
            data_off: 0,
            update_tid: 0,
            embed: [0; 16],
            check: [0; 64],
        }
    }

    /// A blockref of `btype` covering `[key, key + 2^keybits)` with no media.
    #[must_use]
    pub fn new(btype: BrefType, key: u64, keybits: u8) -> Self {
        Self {
            btype,
            key,
            keybits,
            ..Self::empty()
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(data, 0, HAMMER2_BLOCKREF_BYTES)?;
        let keybits = raw[3];
        if keybits > 64 {
            return Err(ParseError::InvalidField {
                field: "blockref.keybits",
                reason: "exceeds 64",
            });
        }
        Ok(Self {
            btype: BrefType::from_raw(raw[0]),
            methods: raw[1],
            copyid: raw[2],
            keybits,
            vradix: raw[4],
            flags: raw[5],
            leaf_count: read_le_u16(raw, 0x06)?,
            key: read_le_u64(raw, 0x08)?,
            mirror_tid: read_le_u64(raw, 0x10)?,
            modify_tid: read_le_u64(raw, 0x18)?,
            data_off: read_le_u64(raw, 0x20)?,
            update_tid: read_le_u64(raw, 0x28)?,
            embed: read_fixed::<16>(raw, 0x30)?,
            check: read_fixed::<64>(raw, 0x40)?,
        })
    }

    /// Serialize into the first 128 bytes of `out`.
    pub fn write_to(&self, out: &mut [u8]) {
        let out = &mut out[..HAMMER2_BLOCKREF_BYTES];
        out[0] = self.btype.to_raw();
        out[1] = self.methods;
        out[2] = self.copyid;
        out[3] = self.keybits;
        out[4] = self.vradix;
        out[5] = self.flags;
        out[0x06..0x08].copy_from_slice(&self.leaf_count.to_le_bytes());
        out[0x08..0x10].copy_from_slice(&self.key.to_le_bytes());
        out[0x10..0x18].copy_from_slice(&self.mirror_tid.to_le_bytes());
        out[0x18..0x20].copy_from_slice(&self.modify_tid.to_le_bytes());
        out[0x20..0x28].copy_from_slice(&self.data_off.to_le_bytes());
        out[0x28..0x30].copy_from_slice(&self.update_tid.to_le_bytes());
        out[0x30..0x40].copy_from_slice(&self.embed);
        out[0x40..0x80].copy_from_slice(&self.check);
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HAMMER2_BLOCKREF_BYTES] {
        let mut out = [0_u8; HAMMER2_BLOCKREF_BYTES];
        self.write_to(&mut out);
        out
    }

    /// Physical offset of the referenced media (radix bits stripped).
    #[must_use]
    pub fn data_offset(&self) -> PhysOffset {
        PhysOffset(self.data_off & HAMMER2_OFF_MASK)
    }

    #[must_use]
    pub fn data_radix(&self) -> u8 {
        u8::try_from(self.data_off & HAMMER2_OFF_MASK_RADIX).unwrap_or(0)
    }

    /// Byte size of the referenced media, or zero when there is none.
    #[must_use]
    pub fn data_bytes(&self) -> u64 {
        radix_to_bytes(self.data_radix())
    }

    #[must_use]
    pub fn has_media(&self) -> bool {
        self.data_bytes() != 0
    }

    #[must_use]
    pub fn check_method(&self) -> u8 {
        dec_check(self.methods)
    }

    #[must_use]
    pub fn comp_method(&self) -> u8 {
        dec_comp(self.methods)
    }

    /// Inclusive end of the key range this blockref covers.
    #[must_use]
    pub fn key_end(&self) -> u64 {
        key_range_end(self.key, self.keybits)
    }

    /// First key after this blockref's range, `None` at the top of key space.
    #[must_use]
    pub fn key_next(&self) -> Option<u64> {
        key_range_next(self.key, self.keybits)
    }

    /// True when `[key_beg, key_end]` intersects this blockref's range.
    #[must_use]
    pub fn overlaps(&self, key_beg: u64, key_end: u64) -> bool {
        self.key <= key_end && self.key_end() >= key_beg
    }

    /// True when `[key_beg, key_end]` lies entirely inside this blockref.
    #[must_use]
    pub fn encloses(&self, key_beg: u64, key_end: u64) -> bool {
        key_beg >= self.key && key_end <= self.key_end()
    }

    /// Embedded statistics of INODE/INDIRECT blockrefs.
    #[must_use]
    pub fn stats(&self) -> BlockrefStats {
        BlockrefStats {
            data_count: u64::from_le_bytes(self.embed[0..8].try_into().unwrap_or([0; 8])),
            inode_count: u64::from_le_bytes(self.embed[8..16].try_into().unwrap_or([0; 8])),
        }
    }

    #[must_use]
    pub fn with_data(mut self, offset: PhysOffset, radix: u8) -> Self {
        self.data_off = (offset.0 & HAMMER2_OFF_MASK) | u64::from(radix);
        self
    }
}

impl fmt::Display for Blockref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} key={:016x}/{} data_off={:016x} mirror_tid={:016x}",
            self.btype, self.key, self.keybits, self.data_off, self.mirror_tid
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockrefStats {
    pub data_count: u64,
    pub inode_count: u64,
}

/// Parse an array of blockrefs (an indirect block or an embedded blockset).
///
/// EMPTY entries are kept so array indices stay meaningful for the
/// lookup scan.
pub fn parse_blockref_array(data: &[u8]) -> Result<Vec<Blockref>, ParseError> {
    if data.len() % HAMMER2_BLOCKREF_BYTES != 0 {
        return Err(ParseError::InvalidField {
            field: "blockref_array",
            reason: "length not a multiple of 128",
        });
    }
    data.chunks_exact(HAMMER2_BLOCKREF_BYTES)
        .map(Blockref::parse)
        .collect()
}

/// Parse an embedded blockset (four blockrefs).
pub fn parse_blockset(data: &[u8]) -> Result<[Blockref; HAMMER2_SET_COUNT], ParseError> {
    let raw = ensure_slice(data, 0, HAMMER2_SET_COUNT * HAMMER2_BLOCKREF_BYTES)?;
    let mut set = [Blockref::empty(); HAMMER2_SET_COUNT];
    for (slot, chunk) in set.iter_mut().zip(raw.chunks_exact(HAMMER2_BLOCKREF_BYTES)) {
        *slot = Blockref::parse(chunk)?;
    }
    Ok(set)
}

/// Number of leading array slots up to and including the last non-empty one.
#[must_use]
pub fn live_zero(brefs: &[Blockref]) -> usize {
    brefs
        .iter()
        .rposition(|bref| bref.btype != BrefType::Empty)
        .map_or(0, |idx| idx + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use h2_types::{HAMMER2_CHECK_XXHASH64, HAMMER2_COMP_LZ4, enc_check, enc_comp};

    fn sample() -> Blockref {
        let mut bref = Blockref::new(BrefType::Data, 0x20000, 16);
        bref.methods = enc_check(HAMMER2_CHECK_XXHASH64) | enc_comp(HAMMER2_COMP_LZ4);
        bref.mirror_tid = 7;
        bref.modify_tid = 6;
        bref.embed[0] = 0xAA;
        bref.check[0] = 0x55;
        bref.with_data(PhysOffset(0x0040_0000), 14)
    }

    #[test]
    fn layout_offsets_match_format() {
        let bytes = sample().to_bytes();
        assert_eq!(bytes[0], HAMMER2_BREF_TYPE_DATA);
        assert_eq!(bytes[3], 16);
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 0x20000);
        assert_eq!(
            u64::from_le_bytes(bytes[0x20..0x28].try_into().unwrap()),
            0x0040_000E
        );
        assert_eq!(bytes[0x30], 0xAA);
        assert_eq!(bytes[0x40], 0x55);
        assert_eq!(Blockref::parse(&bytes).unwrap(), sample());
    }

    #[test]
    fn data_offset_and_size() {
        let bref = sample();
        assert_eq!(bref.data_offset(), PhysOffset(0x0040_0000));
        assert_eq!(bref.data_radix(), 14);
        assert_eq!(bref.data_bytes(), 16384);
        assert_eq!(bref.check_method(), HAMMER2_CHECK_XXHASH64);
        assert_eq!(bref.comp_method(), HAMMER2_COMP_LZ4);
        assert!(!Blockref::empty().has_media());
    }

    #[test]
    fn key_ranges() {
        let bref = sample();
        assert_eq!(bref.key_end(), 0x2FFFF);
        assert_eq!(bref.key_next(), Some(0x30000));
        assert!(bref.overlaps(0x2FFFF, 0x40000));
        assert!(!bref.overlaps(0x30000, 0x40000));
        assert!(bref.encloses(0x20000, 0x2FFFF));
        assert!(!bref.encloses(0x10000, 0x2FFFF));
    }

    #[test]
    fn rejects_bad_keybits_and_short_input() {
        let mut bytes = sample().to_bytes();
        bytes[3] = 65;
        assert!(matches!(
            Blockref::parse(&bytes),
            Err(ParseError::InvalidField {
                field: "blockref.keybits",
                ..
            })
        ));
        assert!(Blockref::parse(&bytes[..64]).is_err());
    }

    #[test]
    fn array_parsing_and_live_zero() {
        let mut raw = vec![0_u8; 4 * HAMMER2_BLOCKREF_BYTES];
        sample().write_to(&mut raw[HAMMER2_BLOCKREF_BYTES..]);
        let brefs = parse_blockref_array(&raw).unwrap();
        assert_eq!(brefs.len(), 4);
        assert_eq!(live_zero(&brefs), 2);
        assert_eq!(live_zero(&brefs[..1]), 0);
        assert!(parse_blockref_array(&raw[..100]).is_err());
        let set = parse_blockset(&raw).unwrap();
        assert_eq!(set[1].btype, BrefType::Data);
    }

    #[test]
    fn unknown_types_survive() {
        let mut bytes = sample().to_bytes();
        bytes[0] = 77;
        let bref = Blockref::parse(&bytes).unwrap();
        assert_eq!(bref.btype, BrefType::Unknown(77));
        assert_eq!(bref.btype.to_string(), "unknown(77)");
        assert!(BrefType::Indirect.is_indirect());
        assert!(BrefType::FreemapNode.is_indirect());
        assert!(!BrefType::Inode.is_indirect());
    }
}
