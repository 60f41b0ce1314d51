use crate::chain::ChainId;
use std::collections::BTreeMap;

/// Unreferenced, childless chains kept for reuse, oldest first.
#[derive(Debug, Default)]
pub(crate) struct LruList {
    next_seq: u64,
    entries: BTreeMap<u64, ChainId>,
}

impl LruList {
    pub(crate) fn push(&mut self, id: ChainId) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(seq, id);
        seq
    }

    pub(crate) fn remove(&mut self, seq: u64) -> bool {
        self.entries.remove(&seq).is_some()
    }

    pub(crate) fn pop_oldest(&mut self) -> Option<(u64, ChainId)> {
        self.entries.pop_first()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn ids(&self) -> Vec<ChainId> {
        self.entries.values().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_with_removal() {
        let mut lru = LruList::default();
        let a = lru.push(ChainId::new(1, 0));
        let b = lru.push(ChainId::new(2, 0));
        lru.push(ChainId::new(3, 0));
        assert!(lru.remove(b));
        assert!(!lru.remove(b));
        assert_eq!(lru.pop_oldest(), Some((a, ChainId::new(1, 0))));
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.ids(), vec![ChainId::new(3, 0)]);
    }
}
