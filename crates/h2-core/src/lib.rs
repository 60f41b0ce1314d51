#![forbid(unsafe_code)]
//! HAMMER2 read-only mount path.
//!
//! Sits on top of the chain engine: selects the volume header, builds
//! clusters of chains per inode, and answers frontend requests (name
//! resolution, directory scans, file reads) by dispatching XOPs to one
//! backend per cluster member and collecting their results in key order.

pub mod backend;
pub mod cluster;
pub mod freemap;
pub mod inode;
pub mod ipdep;
pub mod options;
pub mod pfs;
pub mod volume;
pub mod xop;

pub use cluster::{Cluster, ClusterItem};
pub use freemap::{FreemapSummary, LeafSummary, scan_freemap};
pub use inode::{Inode, InodeLock, InodeRef, InodeTree};
pub use ipdep::{IpDep, IpDepGuard};
pub use options::{CrcPolicy, MountOptions};
pub use pfs::{DirEntry, Pfs, PfsInfo, PfsStats, Stat, list_pfs};
pub use volume::{HeaderCandidate, Volume, select_header};
pub use xop::{CollectFlags, Collected, XOPMASK_VOP, XopHead, XopOp, XopParams, XopPool, XopStats};

pub use h2_block::{ByteDevice, DioStats, FileByteDevice, MemByteDevice};
pub use h2_chain::{ChainId, ChainStats, ChainStore};
pub use h2_error::{ErrorFlags, H2Error, Result};
pub use h2_ondisk::{ObjType, VolumeHeader};

use h2_types::ParseError;

/// `ParseError` lives in `h2-types`, which `h2-error` does not depend on.
pub(crate) fn parse_error_to_h2(e: &ParseError) -> H2Error {
    H2Error::Parse(e.to_string())
}
