#![forbid(unsafe_code)]
//! On-disk format parsing for HAMMER2 structures.
//!
//! Pure parsing crate, no I/O. Decodes blockrefs, inodes, directory entries,
//! volume headers and freemap leaves from byte slices, validates check codes,
//! expands compressed blocks and computes directory hash keys. The encoders
//! exist for image construction in tests and tooling.

pub mod blockref;
pub mod check;
pub mod compress;
pub mod dirent;
pub mod dirhash;
pub mod freemap;
pub mod inode;
pub mod volume;

pub use blockref::{
    Blockref, BlockrefStats, BrefType, live_zero, parse_blockref_array, parse_blockset,
};
pub use check::CheckOutcome;
pub use dirent::{Dirent, DirentHead};
pub use dirhash::{dirhash, dirhash_range};
pub use freemap::{BmapData, FreemapCheck, FreemapLeaf};
pub use inode::{InodeBody, InodeData, InodeMeta, ObjType, inode_blockset_range};
pub use volume::{VolumeCrcStatus, VolumeHeader, seal_crcs};
