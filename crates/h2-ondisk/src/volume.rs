use crate::blockref::{Blockref, parse_blockset};
use crate::check::icrc32;
use h2_types::{
    HAMMER2_BLOCKREF_BYTES, HAMMER2_SET_COUNT, HAMMER2_VOL_VERSION_MIN, HAMMER2_VOL_VERSION_WIP,
    HAMMER2_VOLUME_BYTES, HAMMER2_VOLUME_ID_ABO, HAMMER2_VOLUME_ID_HBO, ParseError, read_fixed,
    read_le_u32, read_le_u64, read_u8,
};
use serde::{Deserialize, Serialize};

const VOLUME_ICRC_SECTS_OFFSET: usize = 0x1E0;
/// icrc_sects[7] covers sector 0 up to itself.
const VOLUME_ICRC0_OFFSET: usize = VOLUME_ICRC_SECTS_OFFSET + 7 * 4;
/// icrc_sects[6] covers sector 1.
const VOLUME_ICRC1_OFFSET: usize = VOLUME_ICRC_SECTS_OFFSET + 6 * 4;
const VOLUME_SECT0: std::ops::Range<usize> = 0..VOLUME_ICRC0_OFFSET;
const VOLUME_SECT1: std::ops::Range<usize> = 0x200..0x400;
const VOLUME_SROOT_OFFSET: usize = 0x200;
const VOLUME_FREEMAP_OFFSET: usize = 0x800;
const VOLUME_ICRC_VOLHDR_OFFSET: usize = HAMMER2_VOLUME_BYTES - 4;
const VOLUME_LOFF_OFFSET: usize = 0xE00;
const VOLUME_LOFF_COUNT: usize = 64;

/// Parsed volume header (one 64 KiB copy).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeHeader {
    pub magic: u64,
    pub boot_beg: u64,
    pub boot_end: u64,
    pub aux_beg: u64,
    pub aux_end: u64,
    pub volu_size: u64,
    pub version: u32,
    pub flags: u32,
    pub copyid: u8,
    pub freemap_version: u8,
    pub peer_type: u8,
    pub volu_id: u8,
    pub nvolumes: u8,
    pub fsid: [u8; 16],
    pub fstype: [u8; 16],
    pub allocator_size: u64,
    pub allocator_free: u64,
    pub allocator_beg: u64,
    pub mirror_tid: u64,
    pub freemap_tid: u64,
    pub bulkfree_tid: u64,
    pub total_size: u64,
    #[serde(skip)]
    pub sroot_blockset: Vec<Blockref>,
    #[serde(skip)]
    pub freemap_blockset: Vec<Blockref>,
    pub volu_loff: Vec<u64>,
}

/// Result of checking the three CRC-protected regions of a header copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCrcStatus {
    pub sect0: bool,
    pub sect1: bool,
    pub whole: bool,
}

impl VolumeCrcStatus {
    #[must_use]
    pub fn all_good(self) -> bool {
        self.sect0 && self.sect1 && self.whole
    }
}

impl VolumeHeader {
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < HAMMER2_VOLUME_BYTES {
            return Err(ParseError::InsufficientData {
                needed: HAMMER2_VOLUME_BYTES,
                offset: 0,
                actual: region.len(),
            });
        }
        let magic = read_le_u64(region, 0x00)?;
        if magic == HAMMER2_VOLUME_ID_ABO {
            return Err(ParseError::InvalidField {
                field: "volume.magic",
                reason: "reverse byte order volumes are unsupported",
            });
        }
        if magic != HAMMER2_VOLUME_ID_HBO {
            return Err(ParseError::InvalidMagic {
                expected: HAMMER2_VOLUME_ID_HBO,
                actual: magic,
            });
        }
        let version = read_le_u32(region, 0x30)?;
        if !(HAMMER2_VOL_VERSION_MIN..=HAMMER2_VOL_VERSION_WIP).contains(&version) {
            return Err(ParseError::InvalidField {
                field: "volume.version",
                reason: "outside supported range",
            });
        }

        let sroot = parse_blockset(&region[VOLUME_SROOT_OFFSET..])?;
        let freemap = parse_blockset(&region[VOLUME_FREEMAP_OFFSET..])?;
        let volu_loff = (0..VOLUME_LOFF_COUNT)
            .map(|idx| read_le_u64(region, VOLUME_LOFF_OFFSET + idx * 8))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            magic,
            boot_beg: read_le_u64(region, 0x08)?,
            boot_end: read_le_u64(region, 0x10)?,
            aux_beg: read_le_u64(region, 0x18)?,
            aux_end: read_le_u64(region, 0x20)?,
            volu_size: read_le_u64(region, 0x28)?,
            version,
            flags: read_le_u32(region, 0x34)?,
            copyid: read_u8(region, 0x38)?,
            freemap_version: read_u8(region, 0x39)?,
            peer_type: read_u8(region, 0x3A)?,
            volu_id: read_u8(region, 0x3B)?,
            nvolumes: read_u8(region, 0x3C)?,
            fsid: read_fixed::<16>(region, 0x40)?,
            fstype: read_fixed::<16>(region, 0x50)?,
            allocator_size: read_le_u64(region, 0x60)?,
            allocator_free: read_le_u64(region, 0x68)?,
            allocator_beg: read_le_u64(region, 0x70)?,
            mirror_tid: read_le_u64(region, 0x78)?,
            freemap_tid: read_le_u64(region, 0x90)?,
            bulkfree_tid: read_le_u64(region, 0x98)?,
            total_size: read_le_u64(region, 0xC0)?,
            sroot_blockset: sroot.to_vec(),
            freemap_blockset: freemap.to_vec(),
            volu_loff,
        })
    }

    /// Check the sector 0, sector 1 and whole-header CRCs of a raw copy.
    #[must_use]
    pub fn verify_crcs(region: &[u8]) -> VolumeCrcStatus {
        if region.len() < HAMMER2_VOLUME_BYTES {
            return VolumeCrcStatus {
                sect0: false,
                sect1: false,
                whole: false,
            };
        }
        let stored = |at: usize| read_le_u32(region, at).unwrap_or(0);
        VolumeCrcStatus {
            sect0: icrc32(&region[VOLUME_SECT0]) == stored(VOLUME_ICRC0_OFFSET),
            sect1: icrc32(&region[VOLUME_SECT1]) == stored(VOLUME_ICRC1_OFFSET),
            whole: icrc32(&region[..VOLUME_ICRC_VOLHDR_OFFSET])
                == stored(VOLUME_ICRC_VOLHDR_OFFSET),
        }
    }

    /// Serialize into a 64 KiB region with all three CRCs sealed.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0_u8; HAMMER2_VOLUME_BYTES];
        let put64 = |out: &mut [u8], at: usize, v: u64| {
            out[at..at + 8].copy_from_slice(&v.to_le_bytes());
        };
        put64(&mut out, 0x00, self.magic);
        put64(&mut out, 0x08, self.boot_beg);
        put64(&mut out, 0x10, self.boot_end);
        put64(&mut out, 0x18, self.aux_beg);
        put64(&mut out, 0x20, self.aux_end);
        put64(&mut out, 0x28, self.volu_size);
        out[0x30..0x34].copy_from_slice(&self.version.to_le_bytes());
        out[0x34..0x38].copy_from_slice(&self.flags.to_le_bytes());
        out[0x38] = self.copyid;
        out[0x39] = self.freemap_version;
        out[0x3A] = self.peer_type;
        out[0x3B] = self.volu_id;
        out[0x3C] = self.nvolumes;
        out[0x40..0x50].copy_from_slice(&self.fsid);
        out[0x50..0x60].copy_from_slice(&self.fstype);
        put64(&mut out, 0x60, self.allocator_size);
        put64(&mut out, 0x68, self.allocator_free);
        put64(&mut out, 0x70, self.allocator_beg);
        put64(&mut out, 0x78, self.mirror_tid);
        put64(&mut out, 0x90, self.freemap_tid);
        put64(&mut out, 0x98, self.bulkfree_tid);
        put64(&mut out, 0xC0, self.total_size);
        for (set, base) in [
            (&self.sroot_blockset, VOLUME_SROOT_OFFSET),
            (&self.freemap_blockset, VOLUME_FREEMAP_OFFSET),
        ] {
            for (idx, bref) in set.iter().take(HAMMER2_SET_COUNT).enumerate() {
                let at = base + idx * HAMMER2_BLOCKREF_BYTES;
                bref.write_to(&mut out[at..at + HAMMER2_BLOCKREF_BYTES]);
            }
        }
        for (idx, loff) in self.volu_loff.iter().take(VOLUME_LOFF_COUNT).enumerate() {
            put64(&mut out, VOLUME_LOFF_OFFSET + idx * 8, *loff);
        }
        seal_crcs(&mut out);
        out
    }
}

/// Recompute the three header CRCs in place.
///
/// Sector 1 is sealed first because its CRC lives inside sector 0.
pub fn seal_crcs(region: &mut [u8]) {
    let crc1 = icrc32(&region[VOLUME_SECT1]);
    region[VOLUME_ICRC1_OFFSET..VOLUME_ICRC1_OFFSET + 4].copy_from_slice(&crc1.to_le_bytes());
    let crc0 = icrc32(&region[VOLUME_SECT0]);
    region[VOLUME_ICRC0_OFFSET..VOLUME_ICRC0_OFFSET + 4].copy_from_slice(&crc0.to_le_bytes());
    let whole = icrc32(&region[..VOLUME_ICRC_VOLHDR_OFFSET]);
    region[VOLUME_ICRC_VOLHDR_OFFSET..VOLUME_ICRC_VOLHDR_OFFSET + 4]
        .copy_from_slice(&whole.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockref::BrefType;
    use h2_types::HAMMER2_VOL_VERSION_DEFAULT;

    pub(crate) fn header(mirror_tid: u64) -> VolumeHeader {
        let mut sroot = vec![Blockref::empty(); HAMMER2_SET_COUNT];
        sroot[0] = Blockref::new(BrefType::Inode, 0, 0);
        VolumeHeader {
            magic: HAMMER2_VOLUME_ID_HBO,
            boot_beg: 0,
            boot_end: 0,
            aux_beg: 0,
            aux_end: 0,
            volu_size: 64 << 20,
            version: HAMMER2_VOL_VERSION_DEFAULT,
            flags: 0,
            copyid: 0,
            freemap_version: 1,
            peer_type: 0,
            volu_id: 0,
            nvolumes: 1,
            fsid: [7; 16],
            fstype: [9; 16],
            allocator_size: 64 << 20,
            allocator_free: 60 << 20,
            allocator_beg: 4 << 20,
            mirror_tid,
            freemap_tid: mirror_tid,
            bulkfree_tid: 0,
            total_size: 64 << 20,
            sroot_blockset: sroot,
            freemap_blockset: vec![Blockref::empty(); HAMMER2_SET_COUNT],
            volu_loff: vec![0; VOLUME_LOFF_COUNT],
        }
    }

    #[test]
    fn serialized_header_parses_and_verifies() {
        let raw = header(5).to_bytes();
        assert!(VolumeHeader::verify_crcs(&raw).all_good());
        let parsed = VolumeHeader::parse(&raw).unwrap();
        assert_eq!(parsed, header(5));
        assert_eq!(parsed.sroot_blockset[0].btype, BrefType::Inode);
    }

    #[test]
    fn each_crc_region_detects_damage() {
        let good = header(5).to_bytes();

        let mut raw = good.clone();
        raw[0x78] ^= 1;
        let status = VolumeHeader::verify_crcs(&raw);
        assert!(!status.sect0);
        assert!(status.sect1);
        assert!(!status.whole);

        let mut raw = good.clone();
        raw[0x210] ^= 1;
        let status = VolumeHeader::verify_crcs(&raw);
        assert!(!status.sect1);
        assert!(!status.whole);

        let mut raw = good;
        raw[0x4000] ^= 1;
        let status = VolumeHeader::verify_crcs(&raw);
        assert!(status.sect0 && status.sect1);
        assert!(!status.whole);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut raw = header(1).to_bytes();
        raw[0] ^= 0xFF;
        assert!(matches!(
            VolumeHeader::parse(&raw),
            Err(ParseError::InvalidMagic { .. })
        ));

        let mut raw = header(1).to_bytes();
        raw[0..8].copy_from_slice(&HAMMER2_VOLUME_ID_ABO.to_le_bytes());
        assert!(VolumeHeader::parse(&raw).is_err());

        let mut raw = header(1).to_bytes();
        raw[0x30..0x34].copy_from_slice(&99_u32.to_le_bytes());
        assert!(VolumeHeader::parse(&raw).is_err());

        assert!(VolumeHeader::parse(&raw[..1024]).is_err());
        assert!(!VolumeHeader::verify_crcs(&raw[..1024]).all_good());
    }
}
