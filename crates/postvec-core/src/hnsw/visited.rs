//! Thread-local visited sets for graph search.
//!
//! Each set is an epoch array: a slot is "visited" when it holds the current
//! epoch, so clearing between searches is a counter bump instead of a memset.

use std::cell::RefCell;

const POOL_LIMIT: usize = 4;
const MIN_SLOTS: usize = 1024;

thread_local! {
    static POOL: RefCell<Vec<EpochSet>> = const { RefCell::new(Vec::new()) };
}

struct EpochSet {
    slots: Vec<u32>,
    epoch: u32,
}

impl EpochSet {
    fn with_slots(len: usize) -> Self {
        Self {
            slots: vec![0; len.max(MIN_SLOTS)],
            epoch: 0,
        }
    }

    fn reset(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        if self.epoch == 0 {
            self.slots.fill(0);
            self.epoch = 1;
        }
    }
}

/// Visited set borrowed from the calling thread's pool; returned on drop.
pub(crate) struct VisitedGuard {
    set: Option<EpochSet>,
}

impl VisitedGuard {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut set = POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            match pool.iter().position(|s| s.slots.len() >= capacity) {
                Some(idx) => pool.swap_remove(idx),
                None => EpochSet::with_slots(capacity),
            }
        });
        set.reset();
        Self { set: Some(set) }
    }

    /// Mark `id` visited. Returns `false` if it already was.
    #[inline]
    pub(crate) fn insert(&mut self, id: u32) -> bool {
        let Some(set) = self.set.as_mut() else {
            return false;
        };
        let idx = id as usize;
        if idx >= set.slots.len() {
            let len = (idx + 1).next_power_of_two();
            set.slots.resize(len, 0);
        }
        if set.slots[idx] == set.epoch {
            return false;
        }
        set.slots[idx] = set.epoch;
        true
    }
}

impl Drop for VisitedGuard {
    fn drop(&mut self) {
        if let Some(set) = self.set.take() {
            POOL.with(|pool| {
                let mut pool = pool.borrow_mut();
                if pool.len() < POOL_LIMIT {
                    pool.push(set);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_reports_first_visit() {
        let mut visited = VisitedGuard::new(16);
        assert!(visited.insert(3));
        assert!(!visited.insert(3));
        assert!(visited.insert(4));
    }

    #[test]
    fn test_reused_set_is_cleared() {
        {
            let mut visited = VisitedGuard::new(100);
            visited.insert(42);
        }
        let mut visited = VisitedGuard::new(100);
        assert!(visited.insert(42));
    }

    #[test]
    fn test_grows_past_initial_capacity() {
        let mut visited = VisitedGuard::new(8);
        assert!(visited.insert(5000));
        assert!(!visited.insert(5000));
    }
}
