//! Per-inode backend serialization.
//!
//! XOP backends that touch the same inode run one at a time. The serializer
//! is a sharded map from inode number to a held flag and a waiter count;
//! each shard has one condvar that waiters on any of its inodes sleep on.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

const IPDEP_SHARDS: usize = 16;

#[derive(Debug, Default)]
struct Entry {
    held: bool,
    waiters: usize,
}

#[derive(Debug, Default)]
struct Shard {
    map: Mutex<HashMap<u64, Entry>>,
    cv: Condvar,
}

#[derive(Debug)]
pub struct IpDep {
    shards: Vec<Shard>,
    contended: AtomicU64,
}

impl Default for IpDep {
    fn default() -> Self {
        Self::new()
    }
}

impl IpDep {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..IPDEP_SHARDS).map(|_| Shard::default()).collect(),
            contended: AtomicU64::new(0),
        }
    }

    fn shard(&self, inum: u64) -> &Shard {
        let idx = (inum ^ (inum >> 16)) as usize % IPDEP_SHARDS;
        &self.shards[idx]
    }

    /// Block until no other holder owns `inum`, then own it until the guard
    /// drops.
    pub fn acquire(&self, inum: u64) -> IpDepGuard<'_> {
        let shard = self.shard(inum);
        let mut map = shard.map.lock();
        let mut waited = false;
        loop {
            let entry = map.entry(inum).or_default();
            if !entry.held {
                entry.held = true;
                if waited {
                    entry.waiters -= 1;
                }
                break;
            }
            if !waited {
                entry.waiters += 1;
                waited = true;
                self.contended.fetch_add(1, Ordering::Relaxed);
                trace!(target: "h2::xop", inum, "ipdep_wait");
            }
            shard.cv.wait(&mut map);
        }
        drop(map);
        IpDepGuard { dep: self, inum }
    }

    /// Times an acquirer had to wait.
    #[must_use]
    pub fn contended(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }

    /// Inodes currently held or waited on.
    #[must_use]
    pub fn active(&self) -> usize {
        self.shards.iter().map(|s| s.map.lock().len()).sum()
    }

    fn release(&self, inum: u64) {
        let shard = self.shard(inum);
        let mut map = shard.map.lock();
        let wake = match map.get_mut(&inum) {
            Some(entry) => {
                entry.held = false;
                if entry.waiters == 0 {
                    map.remove(&inum);
                    false
                } else {
                    true
                }
            }
            None => false,
        };
        drop(map);
        if wake {
            shard.cv.notify_all();
        }
    }
}

/// Ownership of one inode's backend slot.
#[derive(Debug)]
pub struct IpDepGuard<'a> {
    dep: &'a IpDep,
    inum: u64,
}

impl Drop for IpDepGuard<'_> {
    fn drop(&mut self) {
        self.dep.release(self.inum);
    }
}
