//! Recursive shared/exclusive sleep lock.
//!
//! The exclusive holder may re-acquire in either mode; the extra acquisitions
//! count as exclusive depth. Queued exclusive waiters block new shared
//! acquisitions unless the caller asks for a lock-again acquisition, which is
//! how a thread that already holds the lock shared takes it a second time
//! without deadlocking behind a writer.

use parking_lot::{Condvar, Mutex};
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
struct LockState {
    shared: u32,
    owner: Option<ThreadId>,
    depth: u32,
    excl_waiters: u32,
}

#[derive(Debug, Default)]
pub struct SleepLock {
    state: Mutex<LockState>,
    cv: Condvar,
}

impl SleepLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_exclusive(&self) {
        let me = thread::current().id();
        let mut st = self.state.lock();
        loop {
            if st.owner == Some(me) {
                st.depth += 1;
                return;
            }
            if st.owner.is_none() && st.shared == 0 {
                st.owner = Some(me);
                st.depth = 1;
                return;
            }
            st.excl_waiters += 1;
            self.cv.wait(&mut st);
            st.excl_waiters -= 1;
        }
    }

    #[must_use]
    pub fn try_lock_exclusive(&self) -> bool {
        let me = thread::current().id();
        let mut st = self.state.lock();
        if st.owner == Some(me) {
            st.depth += 1;
            return true;
        }
        if st.owner.is_none() && st.shared == 0 {
            st.owner = Some(me);
            st.depth = 1;
            return true;
        }
        false
    }

    /// Acquire shared. `again` ignores queued exclusive waiters.
    pub fn lock_shared(&self, again: bool) {
        let me = thread::current().id();
        let mut st = self.state.lock();
        loop {
            if st.owner == Some(me) {
                st.depth += 1;
                return;
            }
            if st.owner.is_none() && (again || st.excl_waiters == 0) {
                st.shared += 1;
                return;
            }
            self.cv.wait(&mut st);
        }
    }

    #[must_use]
    pub fn try_lock_shared(&self, again: bool) -> bool {
        let me = thread::current().id();
        let mut st = self.state.lock();
        if st.owner == Some(me) {
            st.depth += 1;
            return true;
        }
        if st.owner.is_none() && (again || st.excl_waiters == 0) {
            st.shared += 1;
            return true;
        }
        false
    }

    /// Release one acquisition made by the calling thread.
    pub fn unlock(&self) {
        let me = thread::current().id();
        let mut st = self.state.lock();
        let wake = if st.owner == Some(me) {
            st.depth -= 1;
            if st.depth == 0 {
                st.owner = None;
                true
            } else {
                false
            }
        } else {
            assert!(st.shared > 0, "unlock of a sleep lock that is not held");
            st.shared -= 1;
            st.shared == 0
        };
        drop(st);
        if wake {
            self.cv.notify_all();
        }
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        let st = self.state.lock();
        st.owner.is_some() || st.shared > 0
    }

    #[must_use]
    pub fn shared_count(&self) -> u32 {
        self.state.lock().shared
    }

    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    #[must_use]
    pub fn held_exclusively_by_me(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    #[must_use]
    pub fn exclusive_waiters(&self) -> u32 {
        self.state.lock().excl_waiters
    }
}
