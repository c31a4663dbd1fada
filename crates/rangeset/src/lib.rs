//! A sparse set of `u32` ids stored as disjoint, coalesced `[start, end)`
//! ranges.
//!
//! Seeded with a full id space, [`RangeSet::take_first`] always hands out the
//! smallest free id, so live ids stay small and dense. Returning an id that
//! is still a member is a caller bug and panics.

#![no_std]

extern crate alloc;

use alloc::collections::BTreeMap;

/// Range start mapped to its exclusive end. Neighbouring ranges are always
/// merged, so no two entries touch.
pub struct RangeSet {
    map: BTreeMap<u32, u32>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// A set holding every id in `[lo, hi)`.
    pub fn full(lo: u32, hi: u32) -> Self {
        let mut map = BTreeMap::new();
        if lo < hi {
            map.insert(lo, hi);
        }
        Self { map }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.iter().map(|(s, e)| (e - s) as usize).sum()
    }

    /// The range starting at or before `id`, if any.
    fn pred(&self, id: u32) -> Option<(u32, u32)> {
        self.map.range(..=id).next_back().map(|(s, e)| (*s, *e))
    }

    pub fn contains(&self, id: u32) -> bool {
        self.pred(id).map_or(false, |(_, end)| id < end)
    }

    /// Removes and returns the smallest member.
    pub fn take_first(&mut self) -> Option<u32> {
        let (&start, &end) = self.map.iter().next()?;
        self.map.remove(&start);
        if start + 1 < end {
            self.map.insert(start + 1, end);
        }
        Some(start)
    }

    /// Adds `id` back, merging with adjacent ranges.
    ///
    /// # Panics
    /// Panics if `id` is already a member.
    pub fn insert(&mut self, id: u32) {
        assert!(id < u32::MAX);
        assert!(!self.contains(id), "rangeset: double insert of {}", id);
        let before = self.pred(id).filter(|&(_, end)| end == id);
        let after = self.map.get(&(id + 1)).copied();
        match (before, after) {
            (Some((start, _)), Some(end)) => {
                self.map.remove(&(id + 1));
                self.map.insert(start, end);
            }
            (Some((start, _)), None) => {
                self.map.insert(start, id + 1);
            }
            (None, Some(end)) => {
                self.map.remove(&(id + 1));
                self.map.insert(id, end);
            }
            (None, None) => {
                self.map.insert(id, id + 1);
            }
        }
    }
}

impl Default for RangeSet {
    fn default() -> Self {
        Self::new()
    }
}
