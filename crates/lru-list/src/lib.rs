//! An ordered recency list for evictable cache entries.
//!
//! Entries are opaque ids: the list decides *which* entry to give up next,
//! the owner decides how to dismantle it. The list is split into three
//! insertion zones (`top`, `mid`, `bot`) so that freshly learned entries can
//! start in the middle instead of displacing proven-hot ones, plus a
//! disjoint `pinned` segment that [`LruList::expire`] never touches.
//!
//! Within a segment the front is the most recent entry. Entries of equal
//! recency leave in insertion order.

#![no_std]

extern crate alloc;

use alloc::collections::VecDeque;

pub struct LruList<T> {
    top: VecDeque<T>,
    mid: VecDeque<T>,
    bot: VecDeque<T>,
    pinned: VecDeque<T>,
    max: usize,
}

fn take<T: PartialEq>(list: &mut VecDeque<T>, item: &T) -> bool {
    if let Some(pos) = list.iter().position(|x| x == item) {
        list.remove(pos);
        true
    } else {
        false
    }
}

impl<T: Copy + PartialEq> LruList<T> {
    pub fn new(max: usize) -> Self {
        Self {
            top: VecDeque::new(),
            mid: VecDeque::new(),
            bot: VecDeque::new(),
            pinned: VecDeque::new(),
            max,
        }
    }

    /// Number of entries in the list, pinned ones included.
    pub fn size(&self) -> usize {
        self.top.len() + self.mid.len() + self.bot.len() + self.pinned.len()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn set_max(&mut self, max: usize) {
        self.max = max;
    }

    pub fn contains(&self, item: T) -> bool {
        self.top.contains(&item)
            || self.mid.contains(&item)
            || self.bot.contains(&item)
            || self.pinned.contains(&item)
    }

    pub fn is_pinned(&self, item: T) -> bool {
        self.pinned.contains(&item)
    }

    /// Inserts as the hottest entry.
    ///
    /// The entry must not already be in the list.
    pub fn insert_top(&mut self, item: T) {
        debug_assert!(!self.contains(item));
        self.top.push_front(item);
    }

    /// Inserts ahead of the cold end but behind everything proven hot.
    pub fn insert_mid(&mut self, item: T) {
        debug_assert!(!self.contains(item));
        self.mid.push_front(item);
    }

    /// Inserts as the first eviction candidate.
    pub fn insert_bot(&mut self, item: T) {
        debug_assert!(!self.contains(item));
        self.bot.push_back(item);
    }

    /// Promotes an entry to the hottest position.
    ///
    /// A pinned entry moves to the front of the pinned segment instead, so
    /// its recency is preserved when it is unpinned later.
    pub fn touch(&mut self, item: T) -> bool {
        if take(&mut self.pinned, &item) {
            self.pinned.push_front(item);
            return true;
        }
        if take(&mut self.top, &item) || take(&mut self.mid, &item) || take(&mut self.bot, &item) {
            self.top.push_front(item);
            return true;
        }
        false
    }

    pub fn remove(&mut self, item: T) -> bool {
        take(&mut self.top, &item)
            || take(&mut self.mid, &item)
            || take(&mut self.bot, &item)
            || take(&mut self.pinned, &item)
    }

    /// Moves an entry into the pinned segment, excluding it from expiry.
    pub fn pin(&mut self, item: T) -> bool {
        if self.pinned.contains(&item) {
            return false;
        }
        if take(&mut self.top, &item) || take(&mut self.mid, &item) || take(&mut self.bot, &item) {
            self.pinned.push_front(item);
            true
        } else {
            false
        }
    }

    /// Returns a pinned entry to the evictable order at the hot end.
    pub fn unpin(&mut self, item: T) -> bool {
        if take(&mut self.pinned, &item) {
            self.top.push_front(item);
            true
        } else {
            false
        }
    }

    /// Removes and returns the least recently used unpinned entry.
    pub fn expire(&mut self) -> Option<T> {
        self.bot
            .pop_back()
            .or_else(|| self.mid.pop_back())
            .or_else(|| self.top.pop_back())
    }
}
