use crate::blockref::{Blockref, parse_blockset};
use h2_types::{
    HAMMER2_BLOCKREF_BYTES, HAMMER2_EMBEDDED_BYTES, HAMMER2_INODE_BYTES, HAMMER2_INODE_MAXNAME,
    HAMMER2_INODE_META_BYTES, HAMMER2_OBJTYPE_BDEV, HAMMER2_OBJTYPE_CDEV,
    HAMMER2_OBJTYPE_DIRECTORY, HAMMER2_OBJTYPE_FIFO, HAMMER2_OBJTYPE_REGFILE,
    HAMMER2_OBJTYPE_SOCKET, HAMMER2_OBJTYPE_SOFTLINK, HAMMER2_OBJTYPE_WHITEOUT,
    HAMMER2_OPFLAG_DIRECTDATA, HAMMER2_OPFLAG_PFSROOT, HAMMER2_SET_COUNT, ParseError,
    ensure_slice, read_fixed, read_le_u16, read_le_u32, read_le_u64, read_u8,
};
use serde::{Deserialize, Serialize};

const FILENAME_OFFSET: usize = HAMMER2_INODE_META_BYTES;
const U_OFFSET: usize = FILENAME_OFFSET + HAMMER2_INODE_MAXNAME;

/// First 256 bytes of an on-disk inode.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InodeMeta {
    pub version: u16,
    pub pfs_subtype: u8,
    pub uflags: u32,
    pub rmajor: u32,
    pub rminor: u32,
    pub ctime: u64,
    pub mtime: u64,
    pub atime: u64,
    pub btime: u64,
    pub uid: [u8; 16],
    pub gid: [u8; 16],
    pub obj_type: u8,
    pub op_flags: u8,
    pub cap_flags: u16,
    pub mode: u32,
    pub inum: u64,
    pub size: u64,
    pub nlinks: u64,
    pub iparent: u64,
    pub name_key: u64,
    pub name_len: u16,
    pub ncopies: u8,
    pub comp_algo: u8,
    pub check_algo: u8,
    pub pfs_nmasters: u8,
    pub pfs_type: u8,
    pub pfs_inum: u64,
    pub pfs_clid: [u8; 16],
    pub pfs_fsid: [u8; 16],
    pub data_quota: u64,
    pub inode_quota: u64,
    pub pfs_lsnap_tid: u64,
    pub decrypt_check: u64,
}

impl InodeMeta {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(data, 0, HAMMER2_INODE_META_BYTES)?;
        Ok(Self {
            version: read_le_u16(raw, 0x00)?,
            pfs_subtype: read_u8(raw, 0x03)?,
            uflags: read_le_u32(raw, 0x04)?,
            rmajor: read_le_u32(raw, 0x08)?,
            rminor: read_le_u32(raw, 0x0C)?,
            ctime: read_le_u64(raw, 0x10)?,
            mtime: read_le_u64(raw, 0x18)?,
            atime: read_le_u64(raw, 0x20)?,
            btime: read_le_u64(raw, 0x28)?,
            uid: read_fixed::<16>(raw, 0x30)?,
            gid: read_fixed::<16>(raw, 0x40)?,
            obj_type: read_u8(raw, 0x50)?,
            op_flags: read_u8(raw, 0x51)?,
            cap_flags: read_le_u16(raw, 0x52)?,
            mode: read_le_u32(raw, 0x54)?,
            inum: read_le_u64(raw, 0x58)?,
            size: read_le_u64(raw, 0x60)?,
            nlinks: read_le_u64(raw, 0x68)?,
            iparent: read_le_u64(raw, 0x70)?,
            name_key: read_le_u64(raw, 0x78)?,
            name_len: read_le_u16(raw, 0x80)?,
            ncopies: read_u8(raw, 0x82)?,
            comp_algo: read_u8(raw, 0x83)?,
            check_algo: read_u8(raw, 0x85)?,
            pfs_nmasters: read_u8(raw, 0x86)?,
            pfs_type: read_u8(raw, 0x87)?,
            pfs_inum: read_le_u64(raw, 0x88)?,
            pfs_clid: read_fixed::<16>(raw, 0x90)?,
            pfs_fsid: read_fixed::<16>(raw, 0xA0)?,
            data_quota: read_le_u64(raw, 0xB0)?,
            inode_quota: read_le_u64(raw, 0xC0)?,
            pfs_lsnap_tid: read_le_u64(raw, 0xD0)?,
            decrypt_check: read_le_u64(raw, 0xE0)?,
        })
    }

    /// Serialize into the first 256 bytes of `out`.
    pub fn write_to(&self, out: &mut [u8]) {
        let out = &mut out[..HAMMER2_INODE_META_BYTES];
        out.fill(0);
        out[0x00..0x02].copy_from_slice(&self.version.to_le_bytes());
        out[0x03] = self.pfs_subtype;
        out[0x04..0x08].copy_from_slice(&self.uflags.to_le_bytes());
        out[0x08..0x0C].copy_from_slice(&self.rmajor.to_le_bytes());
        out[0x0C..0x10].copy_from_slice(&self.rminor.to_le_bytes());
        out[0x10..0x18].copy_from_slice(&self.ctime.to_le_bytes());
        out[0x18..0x20].copy_from_slice(&self.mtime.to_le_bytes());
        out[0x20..0x28].copy_from_slice(&self.atime.to_le_bytes());
        out[0x28..0x30].copy_from_slice(&self.btime.to_le_bytes());
        out[0x30..0x40].copy_from_slice(&self.uid);
        out[0x40..0x50].copy_from_slice(&self.gid);
        out[0x50] = self.obj_type;
        out[0x51] = self.op_flags;
        out[0x52..0x54].copy_from_slice(&self.cap_flags.to_le_bytes());
        out[0x54..0x58].copy_from_slice(&self.mode.to_le_bytes());
        out[0x58..0x60].copy_from_slice(&self.inum.to_le_bytes());
        out[0x60..0x68].copy_from_slice(&self.size.to_le_bytes());
        out[0x68..0x70].copy_from_slice(&self.nlinks.to_le_bytes());
        out[0x70..0x78].copy_from_slice(&self.iparent.to_le_bytes());
        out[0x78..0x80].copy_from_slice(&self.name_key.to_le_bytes());
        out[0x80..0x82].copy_from_slice(&self.name_len.to_le_bytes());
        out[0x82] = self.ncopies;
        out[0x83] = self.comp_algo;
        out[0x85] = self.check_algo;
        out[0x86] = self.pfs_nmasters;
        out[0x87] = self.pfs_type;
        out[0x88..0x90].copy_from_slice(&self.pfs_inum.to_le_bytes());
        out[0x90..0xA0].copy_from_slice(&self.pfs_clid);
        out[0xA0..0xB0].copy_from_slice(&self.pfs_fsid);
        out[0xB0..0xB8].copy_from_slice(&self.data_quota.to_le_bytes());
        out[0xC0..0xC8].copy_from_slice(&self.inode_quota.to_le_bytes());
        out[0xD0..0xD8].copy_from_slice(&self.pfs_lsnap_tid.to_le_bytes());
        out[0xE0..0xE8].copy_from_slice(&self.decrypt_check.to_le_bytes());
    }

    #[must_use]
    pub fn has_direct_data(&self) -> bool {
        self.op_flags & HAMMER2_OPFLAG_DIRECTDATA != 0
    }

    #[must_use]
    pub fn is_pfs_root(&self) -> bool {
        self.op_flags & HAMMER2_OPFLAG_PFSROOT != 0
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.obj_type == HAMMER2_OBJTYPE_DIRECTORY
    }

    #[must_use]
    pub fn kind(&self) -> ObjType {
        ObjType::from_raw(self.obj_type)
    }
}

/// Object type of an inode or directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjType {
    Directory,
    Regular,
    Fifo,
    CharDevice,
    BlockDevice,
    Symlink,
    Socket,
    Whiteout,
    Unknown(u8),
}

impl ObjType {
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            HAMMER2_OBJTYPE_DIRECTORY => Self::Directory,
            HAMMER2_OBJTYPE_REGFILE => Self::Regular,
            HAMMER2_OBJTYPE_FIFO => Self::Fifo,
            HAMMER2_OBJTYPE_CDEV => Self::CharDevice,
            HAMMER2_OBJTYPE_BDEV => Self::BlockDevice,
            HAMMER2_OBJTYPE_SOFTLINK => Self::Symlink,
            HAMMER2_OBJTYPE_SOCKET => Self::Socket,
            HAMMER2_OBJTYPE_WHITEOUT => Self::Whiteout,
            other => Self::Unknown(other),
        }
    }

    /// One-character type tag in `ls -l` style.
    #[must_use]
    pub fn tag(self) -> char {
        match self {
            Self::Directory => 'd',
            Self::Regular => '-',
            Self::Fifo => 'p',
            Self::CharDevice => 'c',
            Self::BlockDevice => 'b',
            Self::Symlink => 'l',
            Self::Socket => 's',
            Self::Whiteout => 'w',
            Self::Unknown(_) => '?',
        }
    }
}

/// Embedded union at the end of an inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodeBody {
    Blockset([Blockref; HAMMER2_SET_COUNT]),
    Direct(Vec<u8>),
}

/// Fully decoded 1024-byte inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeData {
    pub meta: InodeMeta,
    pub filename: Vec<u8>,
    pub body: InodeBody,
}

impl InodeData {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(data, 0, HAMMER2_INODE_BYTES)?;
        let meta = InodeMeta::parse(raw)?;
        let name_len = usize::from(meta.name_len);
        if name_len > HAMMER2_INODE_MAXNAME {
            return Err(ParseError::InvalidField {
                field: "inode.name_len",
                reason: "exceeds 256",
            });
        }
        let filename = raw[FILENAME_OFFSET..FILENAME_OFFSET + name_len].to_vec();
        let u_area = &raw[U_OFFSET..U_OFFSET + HAMMER2_EMBEDDED_BYTES];
        let body = if meta.has_direct_data() {
            InodeBody::Direct(u_area.to_vec())
        } else {
            InodeBody::Blockset(parse_blockset(u_area)?)
        };
        Ok(Self {
            meta,
            filename,
            body,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0_u8; HAMMER2_INODE_BYTES];
        self.meta.write_to(&mut out);
        let len = self.filename.len().min(HAMMER2_INODE_MAXNAME);
        out[FILENAME_OFFSET..FILENAME_OFFSET + len].copy_from_slice(&self.filename[..len]);
        match &self.body {
            InodeBody::Blockset(set) => {
                for (idx, bref) in set.iter().enumerate() {
                    let at = U_OFFSET + idx * HAMMER2_BLOCKREF_BYTES;
                    bref.write_to(&mut out[at..at + HAMMER2_BLOCKREF_BYTES]);
                }
            }
            InodeBody::Direct(bytes) => {
                let len = bytes.len().min(HAMMER2_EMBEDDED_BYTES);
                out[U_OFFSET..U_OFFSET + len].copy_from_slice(&bytes[..len]);
            }
        }
        out
    }

    #[must_use]
    pub fn filename_lossy(&self) -> String {
        String::from_utf8_lossy(&self.filename).into_owned()
    }

    /// Embedded blockset, or `None` for direct-data inodes.
    #[must_use]
    pub fn blockset(&self) -> Option<&[Blockref; HAMMER2_SET_COUNT]> {
        match &self.body {
            InodeBody::Blockset(set) => Some(set),
            InodeBody::Direct(_) => None,
        }
    }

    #[must_use]
    pub fn direct_data(&self) -> Option<&[u8]> {
        match &self.body {
            InodeBody::Direct(bytes) => Some(bytes),
            InodeBody::Blockset(_) => None,
        }
    }
}

/// Byte range of the embedded blockset inside raw inode bytes.
#[must_use]
pub fn inode_blockset_range() -> std::ops::Range<usize> {
    U_OFFSET..U_OFFSET + HAMMER2_EMBEDDED_BYTES
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockref::BrefType;

    fn meta() -> InodeMeta {
        InodeMeta {
            version: 1,
            obj_type: HAMMER2_OBJTYPE_REGFILE,
            mode: 0o644,
            inum: 17,
            size: 12,
            nlinks: 1,
            iparent: 1,
            name_key: 0x8000_1234_0000_8000,
            name_len: 5,
            mtime: 1_700_000_000_000_000,
            ..InodeMeta::default()
        }
    }

    #[test]
    fn meta_field_offsets() {
        let mut raw = [0_u8; HAMMER2_INODE_META_BYTES];
        meta().write_to(&mut raw);
        assert_eq!(raw[0x50], HAMMER2_OBJTYPE_REGFILE);
        assert_eq!(u64::from_le_bytes(raw[0x58..0x60].try_into().unwrap()), 17);
        assert_eq!(u16::from_le_bytes(raw[0x80..0x82].try_into().unwrap()), 5);
        assert_eq!(InodeMeta::parse(&raw).unwrap(), meta());
    }

    #[test]
    fn direct_data_inode() {
        let mut m = meta();
        m.op_flags = HAMMER2_OPFLAG_DIRECTDATA;
        let inode = InodeData {
            meta: m,
            filename: b"hello".to_vec(),
            body: InodeBody::Direct(b"hello world\n".to_vec()),
        };
        let parsed = InodeData::parse(&inode.to_bytes()).unwrap();
        assert!(parsed.meta.has_direct_data());
        assert_eq!(parsed.filename_lossy(), "hello");
        assert_eq!(&parsed.direct_data().unwrap()[..12], b"hello world\n");
        assert!(parsed.blockset().is_none());
    }

    #[test]
    fn blockset_inode() {
        let mut set = [Blockref::empty(); HAMMER2_SET_COUNT];
        set[0] = Blockref::new(BrefType::Data, 0, 16);
        let inode = InodeData {
            meta: meta(),
            filename: b"hello".to_vec(),
            body: InodeBody::Blockset(set),
        };
        let raw = inode.to_bytes();
        assert_eq!(raw[inode_blockset_range().start], 3);
        let parsed = InodeData::parse(&raw).unwrap();
        assert_eq!(parsed.blockset().unwrap()[0].btype, BrefType::Data);
        assert_eq!(parsed.meta.kind(), ObjType::Regular);
        assert_eq!(parsed.meta.kind().tag(), '-');
    }

    #[test]
    fn rejects_short_and_bad_name_len() {
        assert!(InodeData::parse(&[0_u8; 512]).is_err());
        let mut raw = InodeData {
            meta: meta(),
            filename: b"hello".to_vec(),
            body: InodeBody::Direct(Vec::new()),
        }
        .to_bytes();
        raw[0x80..0x82].copy_from_slice(&300_u16.to_le_bytes());
        assert!(matches!(
            InodeData::parse(&raw),
            Err(ParseError::InvalidField {
                field: "inode.name_len",
                ..
            })
        ));
    }
}
