//! Half-open `[start, end)` ranges over [`LifetimePosition`], chained in
//! ascending, non-overlapping order to represent one live range's coverage.

use cranelift_entity::{entity_impl, PrimaryMap};

use crate::position::LifetimePosition;

/// An index into a [`RangeArena`]'s interval pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntervalId(u32);
entity_impl!(IntervalId, "iv");

/// One link in a live range's interval chain.
#[derive(Clone, Copy, Debug)]
pub struct UseInterval {
    /// Start of the interval, inclusive.
    pub start: LifetimePosition,
    /// End of the interval, exclusive.
    pub end: LifetimePosition,
    /// The next interval in the chain, in ascending order. `None` at the
    /// tail.
    pub next: Option<IntervalId>,
}

impl UseInterval {
    /// Build a new, unchained interval.
    pub fn new(start: LifetimePosition, end: LifetimePosition) -> Self {
        debug_assert!(start < end, "interval must be non-empty");
        Self {
            start,
            end,
            next: None,
        }
    }

    /// Does this interval contain `p`?
    pub fn contains(&self, p: LifetimePosition) -> bool {
        self.start <= p && p < self.end
    }

    /// The earliest position contained in both `self` and `other`, or
    /// [`LifetimePosition::INVALID`] if they don't intersect.
    pub fn intersect(&self, other: &UseInterval) -> LifetimePosition {
        if self.start < other.start {
            if other.start < self.end {
                other.start
            } else {
                LifetimePosition::INVALID
            }
        } else if self.start < other.end {
            self.start
        } else {
            LifetimePosition::INVALID
        }
    }
}

/// Pool that owns every [`UseInterval`] allocated for a single allocation
/// pass. Chains never outlive the pool; nothing is ever freed before the
/// whole pool is dropped.
#[derive(Default)]
pub struct IntervalPool {
    intervals: PrimaryMap<IntervalId, UseInterval>,
}

impl IntervalPool {
    /// A new, empty pool.
    pub fn new() -> Self {
        Self {
            intervals: PrimaryMap::new(),
        }
    }

    /// Allocate a new interval, returning its id.
    pub fn alloc(&mut self, interval: UseInterval) -> IntervalId {
        self.intervals.push(interval)
    }

    /// Borrow an interval.
    pub fn get(&self, id: IntervalId) -> &UseInterval {
        &self.intervals[id]
    }

    /// Mutably borrow an interval.
    pub fn get_mut(&mut self, id: IntervalId) -> &mut UseInterval {
        &mut self.intervals[id]
    }

    /// `SplitAt(p)`: truncate `id` to `[start, p)` and return a freshly
    /// allocated interval `[p, end)`, splicing it in as `id`'s immediate
    /// successor ahead of whatever `id` used to point to.
    pub fn split_at(&mut self, id: IntervalId, p: LifetimePosition) -> IntervalId {
        let (old_end, old_next) = {
            let iv = &self.intervals[id];
            debug_assert!(iv.contains(p) || p == iv.end, "split point out of range");
            debug_assert!(p > iv.start, "split point must leave a non-empty head");
            (iv.end, iv.next)
        };
        let right = self.alloc(UseInterval {
            start: p,
            end: old_end,
            next: old_next,
        });
        let iv = &mut self.intervals[id];
        iv.end = p;
        iv.next = Some(right);
        right
    }

    /// Iterate a chain starting at `head`, in ascending order.
    pub fn iter_chain(&self, head: Option<IntervalId>) -> ChainIter<'_> {
        ChainIter {
            pool: self,
            cur: head,
        }
    }
}

/// Iterator over an interval chain.
pub struct ChainIter<'a> {
    pool: &'a IntervalPool,
    cur: Option<IntervalId>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = (IntervalId, &'a UseInterval);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cur?;
        let iv = self.pool.get(id);
        self.cur = iv.next;
        Some((id, iv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(i: u32) -> LifetimePosition {
        LifetimePosition::instr_start(i)
    }

    #[test]
    fn split_truncates_and_links() {
        let mut pool = IntervalPool::new();
        let id = pool.alloc(UseInterval::new(pos(0), pos(10)));
        let right = pool.split_at(id, pos(5));
        assert_eq!(pool.get(id).start, pos(0));
        assert_eq!(pool.get(id).end, pos(5));
        assert_eq!(pool.get(id).next, Some(right));
        assert_eq!(pool.get(right).start, pos(5));
        assert_eq!(pool.get(right).end, pos(10));
    }

    #[test]
    fn intersect_finds_earliest_common_point() {
        let a = UseInterval::new(pos(0), pos(10));
        let b = UseInterval::new(pos(5), pos(15));
        assert_eq!(a.intersect(&b), pos(5));
        let c = UseInterval::new(pos(10), pos(20));
        assert!(!a.intersect(&c).is_valid());
    }
}
