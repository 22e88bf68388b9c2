//! The segment lock: one exclusive, recursion-counted lock guarding the
//! partial segment and all accountant mutation.
//!
//! Re-entrancy is keyed by an explicit owner id handed out per logical
//! operation, so code that is called both from outside and from inside the
//! write path (the cleaner does this) passes its token down instead of
//! inferring ownership from a counter.

use spin::Mutex;

struct LockState {
    owner: u64,
    depth: u32,
}

pub struct SegLock {
    state: Mutex<LockState>,
}

impl SegLock {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(LockState { owner: 0, depth: 0 }),
        }
    }

    /// Acquire for `owner`, blocking cooperatively while another logical
    /// operation holds the lock. Re-acquisition by the same owner is
    /// reference-counted.
    pub fn acquire(&self, owner: u64) -> SegToken<'_> {
        debug_assert!(owner != 0);
        loop {
            {
                let mut st = self.state.lock();
                if st.owner == 0 {
                    st.owner = owner;
                    st.depth = 1;
                    return SegToken { lock: self, owner };
                }
                if st.owner == owner {
                    st.depth += 1;
                    return SegToken { lock: self, owner };
                }
            }
            core::hint::spin_loop();
        }
    }

    pub fn holder(&self) -> Option<u64> {
        let st = self.state.lock();
        if st.owner == 0 {
            None
        } else {
            Some(st.owner)
        }
    }
}

/// Capability proving the holder is the active segment builder. Builder
/// APIs take a reference to it rather than re-checking the lock.
pub struct SegToken<'a> {
    lock: &'a SegLock,
    owner: u64,
}

impl SegToken<'_> {
    pub fn owner(&self) -> u64 {
        self.owner
    }

    /// Nested acquisition for a sub-operation on the same logical owner.
    pub fn reenter(&self) -> SegToken<'_> {
        self.lock.acquire(self.owner)
    }
}

impl Drop for SegToken<'_> {
    fn drop(&mut self) {
        let mut st = self.lock.state.lock();
        debug_assert_eq!(st.owner, self.owner);
        st.depth -= 1;
        if st.depth == 0 {
            st.owner = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursive_acquire_and_release() {
        let lock = SegLock::new();
        let outer = lock.acquire(7);
        assert_eq!(lock.holder(), Some(7));
        {
            let _inner = outer.reenter();
            assert_eq!(lock.holder(), Some(7));
        }
        assert_eq!(lock.holder(), Some(7));
        drop(outer);
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn released_lock_admits_new_owner() {
        let lock = SegLock::new();
        drop(lock.acquire(1));
        let t = lock.acquire(2);
        assert_eq!(t.owner(), 2);
    }
}
