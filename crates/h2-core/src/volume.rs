//! Volume open: header selection and the two root chains.

use crate::options::{CrcPolicy, MountOptions};
use crate::parse_error_to_h2;
use h2_block::{ByteDevice, DioCache, FileByteDevice};
use h2_chain::{ChainId, ChainStore};
use h2_error::{H2Error, Result};
use h2_ondisk::{Blockref, BrefType, VolumeHeader};
use h2_types::{HAMMER2_NUM_VOLHDRS, HAMMER2_VOLUME_BYTES, HAMMER2_ZONE_BYTES64};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of reading one header zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderCandidate {
    pub zone: usize,
    pub offset: u64,
    pub mirror_tid: Option<u64>,
    pub crc_ok: bool,
    pub error: Option<String>,
}

/// Read every header copy the device is large enough to hold and pick the
/// usable one with the highest `mirror_tid`.
pub fn select_header(
    dev: &dyn ByteDevice,
    policy: CrcPolicy,
) -> Result<(usize, VolumeHeader, Vec<HeaderCandidate>)> {
    let mut candidates = Vec::with_capacity(HAMMER2_NUM_VOLHDRS);
    let mut best: Option<(usize, VolumeHeader)> = None;
    let mut region = vec![0_u8; HAMMER2_VOLUME_BYTES];
    for zone in 0..HAMMER2_NUM_VOLHDRS {
        let offset = zone as u64 * HAMMER2_ZONE_BYTES64;
        if offset + HAMMER2_VOLUME_BYTES as u64 > dev.len_bytes() {
            break;
        }
        let mut cand = HeaderCandidate {
            zone,
            offset,
            mirror_tid: None,
            crc_ok: false,
            error: None,
        };
        if let Err(err) = dev.read_exact_at(offset, &mut region) {
            cand.error = Some(err.to_string());
            candidates.push(cand);
            continue;
        }
        let header = match VolumeHeader::parse(&region) {
            Ok(header) => header,
            Err(err) => {
                cand.error = Some(err.to_string());
                candidates.push(cand);
                continue;
            }
        };
        cand.mirror_tid = Some(header.mirror_tid);
        cand.crc_ok = VolumeHeader::verify_crcs(&region).all_good();
        let usable = cand.crc_ok || policy == CrcPolicy::Lenient;
        if !cand.crc_ok {
            warn!(
                target: "h2::volume",
                zone,
                offset,
                mirror_tid = header.mirror_tid,
                accepted = usable,
                "volume_header_crc_mismatch"
            );
        }
        if usable
            && best
                .as_ref()
                .is_none_or(|(_, cur)| header.mirror_tid > cur.mirror_tid)
        {
            best = Some((zone, header));
        }
        candidates.push(cand);
    }

    let Some((zone, header)) = best else {
        return Err(candidates
            .iter()
            .find_map(|p| p.error.clone())
            .map_or_else(
                || H2Error::Format("no volume header with valid CRCs".to_owned()),
                H2Error::Format,
            ));
    };
    info!(
        target: "h2::volume",
        zone,
        mirror_tid = header.mirror_tid,
        candidates = candidates.len(),
        "volume_header_select"
    );
    Ok((zone, header, candidates))
}

/// An opened HAMMER2 volume: the selected header, the chain store, and the
/// permanently referenced volume (`vchain`) and freemap (`fchain`) roots.
#[derive(Debug)]
pub struct Volume {
    header: VolumeHeader,
    zone: usize,
    candidates: Vec<HeaderCandidate>,
    store: Arc<ChainStore>,
    vchain: ChainId,
    fchain: ChainId,
    options: MountOptions,
}

impl Volume {
    pub fn open(dev: Arc<dyn ByteDevice>, options: &MountOptions) -> Result<Self> {
        let (zone, header, candidates) = select_header(dev.as_ref(), options.crc_policy)?;
        if header.volu_size > dev.len_bytes() {
            warn!(
                target: "h2::volume",
                volu_size = header.volu_size,
                device = dev.len_bytes(),
                "volume_truncated"
            );
        }
        let dio = Arc::new(DioCache::new(dev, options.dio_config()));
        let store = Arc::new(ChainStore::new(dio, options.chain_config()));

        let mut vbref = Blockref::new(BrefType::Volume, 0, 64);
        vbref.mirror_tid = header.mirror_tid;
        let vchain = store.alloc_root(vbref, &header.sroot_blockset);
        let mut fbref = Blockref::new(BrefType::Freemap, 0, 64);
        fbref.mirror_tid = header.freemap_tid;
        let fchain = store.alloc_root(fbref, &header.freemap_blockset);
        debug!(
            target: "h2::volume",
            vchain = %vchain,
            fchain = %fchain,
            volu_size = header.volu_size,
            version = header.version,
            "volume_open"
        );
        Ok(Self {
            header,
            zone,
            candidates,
            store,
            vchain,
            fchain,
            options: options.clone(),
        })
    }

    pub fn open_path(path: impl AsRef<Path>, options: &MountOptions) -> Result<Self> {
        let dev = FileByteDevice::open(path)?;
        Self::open(Arc::new(dev), options)
    }

    /// Parse a raw header region without touching a device.
    pub fn parse_header(region: &[u8]) -> Result<VolumeHeader> {
        VolumeHeader::parse(region).map_err(|e| parse_error_to_h2(&e))
    }

    #[must_use]
    pub fn header(&self) -> &VolumeHeader {
        &self.header
    }

    /// Zone the selected header came from.
    #[must_use]
    pub fn zone(&self) -> usize {
        self.zone
    }

    #[must_use]
    pub fn candidates(&self) -> &[HeaderCandidate] {
        &self.candidates
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ChainStore> {
        &self.store
    }

    #[must_use]
    pub fn vchain(&self) -> ChainId {
        self.vchain
    }

    #[must_use]
    pub fn fchain(&self) -> ChainId {
        self.fchain
    }

    #[must_use]
    pub fn options(&self) -> &MountOptions {
        &self.options
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        for root in [self.vchain, self.fchain] {
            if self.store.try_get(root).is_some() {
                self.store.drop_chain(root);
            }
        }
    }
}
