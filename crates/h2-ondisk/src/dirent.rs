use crate::blockref::{Blockref, BrefType};
use h2_types::{
    HAMMER2_DIRENT_INLINE_MAX, HAMMER2_INODE_MAXNAME, ParseError, ensure_slice, read_le_u16,
    read_le_u64,
};
use serde::{Deserialize, Serialize};

/// Directory entry head stored in a DIRENT blockref's `embed` area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirentHead {
    pub inum: u64,
    pub namlen: u16,
    pub obj_type: u8,
}

impl DirentHead {
    pub fn parse(embed: &[u8; 16]) -> Result<Self, ParseError> {
        let namlen = read_le_u16(embed, 8)?;
        if usize::from(namlen) > HAMMER2_INODE_MAXNAME {
            return Err(ParseError::InvalidField {
                field: "dirent.namlen",
                reason: "exceeds 256",
            });
        }
        Ok(Self {
            inum: read_le_u64(embed, 0)?,
            namlen,
            obj_type: embed[10],
        })
    }

    #[must_use]
    pub fn to_embed(&self) -> [u8; 16] {
        let mut embed = [0_u8; 16];
        embed[0..8].copy_from_slice(&self.inum.to_le_bytes());
        embed[8..10].copy_from_slice(&self.namlen.to_le_bytes());
        embed[10] = self.obj_type;
        embed
    }

    /// True when the name lives in the blockref check area.
    #[must_use]
    pub fn name_is_inline(&self) -> bool {
        usize::from(self.namlen) <= HAMMER2_DIRENT_INLINE_MAX
    }
}

/// Decoded directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dirent {
    pub head: DirentHead,
    pub name: Vec<u8>,
}

impl Dirent {
    /// Decode a DIRENT blockref.
    ///
    /// Short names are read from `bref.check`; longer names come from the
    /// media block, which the caller supplies as `data`.
    pub fn parse(bref: &Blockref, data: Option<&[u8]>) -> Result<Self, ParseError> {
        if bref.btype != BrefType::Dirent {
            return Err(ParseError::InvalidField {
                field: "blockref.type",
                reason: "not a dirent",
            });
        }
        let head = DirentHead::parse(&bref.embed)?;
        let len = usize::from(head.namlen);
        let name = if head.name_is_inline() {
            bref.check[..len].to_vec()
        } else {
            let data = data.ok_or(ParseError::InvalidField {
                field: "dirent.name",
                reason: "long name requires media",
            })?;
            ensure_slice(data, 0, len)?.to_vec()
        };
        Ok(Self { head, name })
    }

    #[must_use]
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}
