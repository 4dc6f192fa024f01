//! Min-heap of `(deadline, scope)` pairs with lazy invalidation, so that a
//! scope whose deadline changes doesn't need an O(log n) heap removal.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::cancel_scope::CancelScope;

/// Below this many stale entries beyond what's strictly needed, we don't
/// bother compacting the heap; the amortized cost isn't worth it.
const COMPACTION_SLACK: usize = 1000;

struct Entry {
    deadline: f64,
    tiebreak: u64,
    scope: CancelScope,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.tiebreak == other.tiebreak
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest deadline sorts
        // highest (i.e. pops first).
        other
            .deadline
            .total_cmp(&self.deadline)
            .then_with(|| other.tiebreak.cmp(&self.tiebreak))
    }
}

/// A container of deadlined cancel scopes. Only scopes with a finite,
/// currently-registered deadline are meant to be tracked here.
#[derive(Default)]
pub struct Deadlines {
    heap: BinaryHeap<Entry>,
    /// Count of entries that are still live (i.e. haven't been superseded by
    /// a later registration for the same scope).
    active: usize,
}

impl Deadlines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, deadline: f64, scope: CancelScope) {
        let tiebreak = scope.id();
        self.heap.push(Entry {
            deadline,
            tiebreak,
            scope,
        });
        self.active += 1;
    }

    /// The entry isn't actually removed from the heap; it's left there to be
    /// lazily skipped by `next_deadline`/`expire` once it's stale.
    pub fn remove(&mut self) {
        self.active -= 1;
    }

    pub fn active(&self) -> usize {
        self.active
    }

    /// Discard stale tops, then report the live minimum (or `+inf`).
    pub fn next_deadline(&mut self) -> f64 {
        while let Some(top) = self.heap.peek() {
            if top.deadline == top.scope.0.registered_deadline.get() {
                return top.deadline;
            }
            self.heap.pop();
        }
        f64::INFINITY
    }

    /// Pop every live entry with `deadline <= now` and return the scopes
    /// that should be cancelled. Occasionally compacts the heap afterward.
    ///
    /// Deliberately does *not* call `scope.cancel()` itself: cancelling a
    /// scope re-enters `Runner::sync_registered_deadline`, which needs its
    /// own mutable borrow of this same `Deadlines` to re-register the
    /// now-infinite deadline. Calling `cancel()` while still inside a
    /// `deadlines.borrow_mut()` call (as the run loop's `expire` call is)
    /// would be a reentrant borrow and panic; the caller must drop its
    /// borrow first and cancel the returned scopes afterward.
    pub fn expire(&mut self, now: f64) -> Vec<CancelScope> {
        let mut fired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.heap.pop().unwrap();
            if entry.deadline == entry.scope.0.registered_deadline.get() {
                // Implicitly "removes" this entry's liveness; the scope's
                // own cancel() (called by our caller, once we've returned)
                // flips registered_deadline to +inf and re-registers through
                // the normal might-change-registered-deadline path.
                self.active -= 1;
                fired.push(entry.scope);
            }
        }
        if self.heap.len() > self.active * 2 + COMPACTION_SLACK {
            self.compact();
        }
        fired
    }

    fn compact(&mut self) {
        use rustc_hash::FxHashSet;
        let mut seen: FxHashSet<u64> = FxHashSet::default();
        let mut pruned = Vec::with_capacity(self.active);
        for entry in self.heap.drain() {
            if entry.deadline == entry.scope.0.registered_deadline.get() && seen.insert(entry.tiebreak)
            {
                pruned.push(entry);
            }
        }
        debug_assert_eq!(pruned.len(), self.active);
        self.heap = BinaryHeap::from(pruned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope_with_deadline(d: f64) -> CancelScope {
        let scope = CancelScope::new(d, false);
        scope.bind_root();
        scope
    }

    #[test]
    fn next_deadline_skips_stale_entries() {
        let mut deadlines = Deadlines::new();
        let scope = scope_with_deadline(5.0);
        deadlines.add(5.0, scope.clone());
        scope.set_deadline(10.0);
        scope.0.registered_deadline.set(10.0);
        deadlines.add(10.0, scope.clone());

        assert_eq!(deadlines.next_deadline(), 10.0);
    }

    #[test]
    fn expire_cancels_live_scopes_at_or_before_now() {
        let mut deadlines = Deadlines::new();
        let scope = scope_with_deadline(1.0);
        scope.0.registered_deadline.set(1.0);
        deadlines.add(1.0, scope.clone());

        assert!(!scope.cancel_called());
        let fired = deadlines.expire(1.0);
        assert_eq!(fired.len(), 1);
        for s in fired {
            s.cancel();
        }
        assert!(scope.cancel_called());
    }

    #[test]
    fn expire_ignores_future_deadlines() {
        let mut deadlines = Deadlines::new();
        let scope = scope_with_deadline(100.0);
        scope.0.registered_deadline.set(100.0);
        deadlines.add(100.0, scope.clone());

        assert!(deadlines.expire(1.0).is_empty());
        assert!(!scope.cancel_called());
    }
}
