//! The ready queue: one FIFO bucket per priority level plus a bitmap of
//! non-empty buckets
use core::ops;

use crate::{
    cfg::{NUM_TASK_PRIORITY_LEVELS, READY_BITMAP_WORDS},
    utils::{
        intrusive_list::{ListAccessor, ListHead, Linked},
        PrioBitmap,
    },
};

/// Ready tasks, bucketed by priority.
///
/// Invariant: `bitmap.get(p)` iff `buckets[p]` is non-empty.
pub(crate) struct ReadyQueue {
    buckets: [ListHead<usize>; NUM_TASK_PRIORITY_LEVELS],
    bitmap: PrioBitmap<READY_BITMAP_WORDS>,
}

impl ReadyQueue {
    pub(crate) const INIT: Self = Self {
        buckets: [ListHead::new(); NUM_TASK_PRIORITY_LEVELS],
        bitmap: PrioBitmap::INIT,
    };

    /// Append `task` to the tail of the bucket `priority`.
    pub(crate) fn push_back<Pool, Element>(&mut self, pool: &mut Pool, task: usize, priority: usize)
    where
        Pool: ops::IndexMut<usize, Output = Element> + ?Sized,
        Element: Linked<usize>,
    {
        // `task` is unlinked, so this can't fail
        ListAccessor::new(&mut self.buckets[priority], pool)
            .push_back(task)
            .unwrap();
        self.bitmap.set(priority);
    }

    /// Unlink `task` from the bucket `priority`.
    pub(crate) fn remove<Pool, Element>(&mut self, pool: &mut Pool, task: usize, priority: usize)
    where
        Pool: ops::IndexMut<usize, Output = Element> + ?Sized,
        Element: Linked<usize>,
    {
        let mut accessor = ListAccessor::new(&mut self.buckets[priority], pool);
        accessor.remove(task).unwrap();
        if accessor.is_empty() {
            self.bitmap.clear(priority);
        }
    }

    /// Move `task` behind all of its peers in the bucket `priority`. The
    /// bucket stays non-empty throughout, so the bitmap is left untouched.
    pub(crate) fn move_to_back<Pool, Element>(
        &mut self,
        pool: &mut Pool,
        task: usize,
        priority: usize,
    ) where
        Pool: ops::IndexMut<usize, Output = Element> + ?Sized,
        Element: Linked<usize>,
    {
        let mut accessor = ListAccessor::new(&mut self.buckets[priority], pool);
        if accessor.back() == Some(task) {
            return;
        }
        if accessor.front() == Some(task) {
            accessor.rotate_front_to_back();
        } else {
            accessor.remove(task).unwrap();
            accessor.push_back(task).unwrap();
        }
    }

    /// Get the head of the most urgent non-empty bucket.
    #[inline]
    pub(crate) fn highest(&self) -> Option<usize> {
        let priority = self.bitmap.find_set()?;
        debug_assert!(self.bitmap.get(priority));
        self.buckets[priority].first
    }

    /// Get the bucket for `priority`.
    pub(crate) fn bucket(&mut self, priority: usize) -> &mut ListHead<usize> {
        &mut self.buckets[priority]
    }

    /// Enumerate the priorities whose bit is set in the bitmap.
    pub(crate) fn set_bits(&self) -> impl Iterator<Item = usize> + '_ {
        self.bitmap.iter_set()
    }
}
