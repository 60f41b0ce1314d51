//! Slot arena holding every live chain of one filesystem instance.
//!
//! Handles carry the slot generation, so a handle to a freed chain never
//! resolves to whatever later reuses the slot.

use crate::chain::{Chain, ChainId};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    chain: Option<Arc<Chain>>,
}

#[derive(Debug, Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

#[derive(Debug, Default)]
pub(crate) struct ChainArena {
    inner: RwLock<Slots>,
}

impl ChainArena {
    pub(crate) fn allocate(&self, make: impl FnOnce(ChainId) -> Chain) -> Arc<Chain> {
        let mut inner = self.inner.write();
        let slot = if let Some(slot) = inner.free.pop() {
            slot
        } else {
            let slot = u32::try_from(inner.slots.len()).unwrap_or(u32::MAX);
            inner.slots.push(Slot::default());
            slot
        };
        let idx = slot as usize;
        let id = ChainId::new(slot, inner.slots[idx].generation);
        let chain = Arc::new(make(id));
        inner.slots[idx].chain = Some(Arc::clone(&chain));
        inner.live += 1;
        drop(inner);
        chain
    }

    pub(crate) fn get(&self, id: ChainId) -> Option<Arc<Chain>> {
        let inner = self.inner.read();
        let slot = inner.slots.get(id.slot() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.chain.clone()
    }

    /// Vacate the slot behind `id`. Returns false for a stale handle.
    pub(crate) fn release(&self, id: ChainId) -> bool {
        let mut inner = self.inner.write();
        let idx = id.slot() as usize;
        let Some(slot) = inner.slots.get_mut(idx) else {
            return false;
        };
        if slot.generation != id.generation() || slot.chain.is_none() {
            return false;
        }
        slot.chain = None;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(id.slot());
        inner.live -= 1;
        true
    }

    pub(crate) fn live(&self) -> usize {
        self.inner.read().live
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Chain>> {
        self.inner
            .read()
            .slots
            .iter()
            .filter_map(|slot| slot.chain.clone())
            .collect()
    }
}
