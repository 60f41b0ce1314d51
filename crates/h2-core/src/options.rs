use h2_block::DioConfig;
use h2_chain::ChainConfig;
use serde::{Deserialize, Serialize};

/// How volume header copies with bad CRCs are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrcPolicy {
    /// Skip any copy whose sector or whole-header CRC fails.
    #[default]
    Strict,
    /// Accept a copy with bad CRCs (logged) when its magic and version parse.
    Lenient,
}

/// Options controlling how an image is opened and mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Label of the PFS to mount.
    pub pfs: String,
    /// Unreferenced metadata chains kept for reuse.
    pub lru_limit: usize,
    /// Dio wrappers kept before batch eviction.
    pub dio_soft_limit: usize,
    /// Physical buffers read ahead on a dio miss.
    pub readahead: usize,
    pub crc_policy: CrcPolicy,
    /// Cluster members per inode. Members past the first have no backing
    /// chain and report `EIO` placeholders.
    pub cluster_width: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            pfs: "ROOT".to_owned(),
            lru_limit: ChainConfig::default().lru_limit,
            dio_soft_limit: DioConfig::default().soft_limit,
            readahead: 0,
            crc_policy: CrcPolicy::Strict,
            cluster_width: 1,
        }
    }
}

impl MountOptions {
    #[must_use]
    pub fn chain_config(&self) -> ChainConfig {
        ChainConfig {
            lru_limit: self.lru_limit,
        }
    }

    #[must_use]
    pub fn dio_config(&self) -> DioConfig {
        DioConfig {
            soft_limit: self.dio_soft_limit,
            readahead: self.readahead,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = MountOptions::default();
        assert_eq!(opts.pfs, "ROOT");
        assert_eq!(opts.lru_limit, 4096);
        assert_eq!(opts.dio_soft_limit, 2048);
        assert_eq!(opts.readahead, 0);
        assert_eq!(opts.crc_policy, CrcPolicy::Strict);
        assert_eq!(opts.cluster_width, 1);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let opts: MountOptions =
            serde_json::from_str(r#"{"pfs":"BACKUP","crc_policy":"lenient"}"#).unwrap();
        assert_eq!(opts.pfs, "BACKUP");
        assert_eq!(opts.crc_policy, CrcPolicy::Lenient);
        assert_eq!(opts.lru_limit, 4096);
        assert_eq!(opts.dio_config().soft_limit, 2048);
        assert_eq!(opts.chain_config().lru_limit, 4096);
    }
}
