//! Clusters: one logical object across its backing copies.
//!
//! A cluster is an array of chain slots, one per backing copy, plus the
//! index of the authoritative member (the focus) and the error bits merged
//! across members. Only one copy is ever materialized today, but nothing
//! here assumes width 1.

use h2_chain::{ChainId, ChainStore};
use h2_error::ErrorFlags;
use h2_ondisk::Blockref;
use h2_types::HAMMER2_MAXCLUSTER;
use tracing::warn;

/// One member slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClusterItem {
    /// Referenced (not locked) backing chain.
    pub chain: Option<ChainId>,
    pub error: ErrorFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    items: Vec<ClusterItem>,
    focus: Option<usize>,
    error: ErrorFlags,
}

impl Cluster {
    /// A cluster of `width` empty slots.
    #[must_use]
    pub fn new(width: usize) -> Self {
        let width = width.clamp(1, HAMMER2_MAXCLUSTER);
        Self {
            items: vec![ClusterItem::default(); width],
            focus: None,
            error: ErrorFlags::empty(),
        }
    }

    /// A cluster whose first member is `chain`. The caller's reference on
    /// `chain` moves into the cluster.
    #[must_use]
    pub fn with_chain(width: usize, chain: ChainId, error: ErrorFlags) -> Self {
        let mut cluster = Self::new(width);
        cluster.set(0, Some(chain), error);
        cluster.resolve();
        cluster
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn items(&self) -> &[ClusterItem] {
        &self.items
    }

    #[must_use]
    pub fn chain(&self, clindex: usize) -> Option<ChainId> {
        self.items.get(clindex).and_then(|item| item.chain)
    }

    #[must_use]
    pub fn focus(&self) -> Option<usize> {
        self.focus
    }

    #[must_use]
    pub fn focus_chain(&self) -> Option<ChainId> {
        self.focus.and_then(|idx| self.chain(idx))
    }

    #[must_use]
    pub fn error(&self) -> ErrorFlags {
        self.error
    }

    /// Replace member `clindex`, returning the previous chain so the caller
    /// can drop its reference.
    pub fn set(
        &mut self,
        clindex: usize,
        chain: Option<ChainId>,
        error: ErrorFlags,
    ) -> Option<ChainId> {
        let item = &mut self.items[clindex];
        let old = item.chain;
        item.chain = chain;
        item.error = error;
        old
    }

    /// Recompute the focus and the aggregate error.
    ///
    /// The focus is the first member with a chain and no error, falling back
    /// to the first member with a chain. The aggregate error is empty when
    /// the focus is clean; otherwise it merges every member's bits, plus
    /// `INCOMPLETE` when no member has a chain at all.
    pub fn resolve(&mut self) -> ErrorFlags {
        let clean = self
            .items
            .iter()
            .position(|item| item.chain.is_some() && item.error.is_empty());
        let any = self.items.iter().position(|item| item.chain.is_some());
        self.focus = clean.or(any);
        self.error = match (clean, any) {
            (Some(_), _) => ErrorFlags::empty(),
            (None, Some(_)) => self
                .items
                .iter()
                .fold(ErrorFlags::empty(), |acc, item| acc | item.error),
            (None, None) => {
                self.items
                    .iter()
                    .fold(ErrorFlags::INCOMPLETE, |acc, item| acc | item.error)
            }
        };
        self.error
    }

    /// Compare the members' blockrefs for one logical result.
    ///
    /// A member that has a chain while another does not, or two members
    /// whose blockrefs disagree on type, key or media, is an integrity
    /// failure rather than something to skip over.
    pub fn check_members(&self, store: &ChainStore) -> ErrorFlags {
        let brefs: Vec<Option<Blockref>> = self
            .items
            .iter()
            .map(|item| item.chain.and_then(|id| store.try_get(id)).map(|c| *c.bref()))
            .collect();
        let Some(reference) = brefs.iter().flatten().next().copied() else {
            return ErrorFlags::empty();
        };
        let mut error = ErrorFlags::empty();
        for (clindex, bref) in brefs.iter().enumerate() {
            match bref {
                None => error |= ErrorFlags::INCOMPLETE,
                Some(bref)
                    if bref.btype != reference.btype
                        || bref.key != reference.key
                        || bref.keybits != reference.keybits
                        || bref.data_off != reference.data_off =>
                {
                    warn!(
                        target: "h2::cluster",
                        clindex,
                        expected = %reference,
                        actual = %bref,
                        "cluster_member_mismatch"
                    );
                    error |= ErrorFlags::BADBREF;
                }
                Some(_) => {}
            }
        }
        error
    }

    /// Drop every member's reference and empty the slots.
    pub fn release(&mut self, store: &ChainStore) {
        for item in &mut self.items {
            if let Some(id) = item.chain.take() {
                store.drop_chain(id);
            }
            item.error = ErrorFlags::empty();
        }
        self.focus = None;
        self.error = ErrorFlags::empty();
    }
}
