//! Intrusive doubly linked list backed by a container implementing
//! `core::ops::IndexMut`.
//!
//! Every element embeds exactly one [`Link`] (exposed through [`Linked`]), so
//! an element can be a member of at most one list at a time. The lists are
//! circular: `head.first`'s `prev` is the last element.
use core::{fmt, ops};

/// Circular linked list header.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
}

impl<Index> Default for ListHead<Index> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Index: fmt::Debug> fmt::Debug for ListHead<Index> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?})", &self.first)
    }
}

impl<Index> ListHead<Index> {
    pub const fn new() -> Self {
        Self { first: None }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Links to neighbor items.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link<Index> {
    pub prev: Index,
    pub next: Index,
}

/// An element that embeds a list node.
pub trait Linked<Index> {
    fn link(&self) -> &Option<Link<Index>>;
    fn link_mut(&mut self) -> &mut Option<Link<Index>>;
}

/// Accessor to a linked list whose elements live in `Pool`.
///
/// The operations assume the list is structurally sound and panic otherwise.
pub struct ListAccessor<'a, Index, Pool: ?Sized> {
    head: &'a mut ListHead<Index>,
    pool: &'a mut Pool,
}

impl<'a, Index, Pool, Element> ListAccessor<'a, Index, Pool>
where
    Pool: ops::IndexMut<Index, Output = Element> + ?Sized,
    Element: Linked<Index>,
    Index: PartialEq + Copy + fmt::Debug,
{
    pub fn new(head: &'a mut ListHead<Index>, pool: &'a mut Pool) -> Self {
        Self { head, pool }
    }

    fn link(&self, i: Index) -> Link<Index> {
        match self.pool[i].link() {
            Some(link) => *link,
            None => panic!("inconsistent list: {i:?} is not linked"),
        }
    }

    fn link_mut<'b>(&'b mut self, i: Index) -> &'b mut Link<Index>
    where
        Element: 'b,
    {
        match self.pool[i].link_mut() {
            Some(link) => link,
            None => panic!("inconsistent list: {i:?} is not linked"),
        }
    }

    pub fn pool(&self) -> &Pool {
        &*self.pool
    }

    pub fn pool_mut(&mut self) -> &mut Pool {
        &mut *self.pool
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_empty()
    }

    #[inline]
    pub fn front(&self) -> Option<Index> {
        self.head.first
    }

    #[inline]
    pub fn back(&self) -> Option<Index> {
        self.head.first.map(|p| self.link(p).prev)
    }

    /// Insert `item` before the position `p` (if `at` is `Some(p)`) or to the
    /// the list's back (if `at` is `None`).
    pub fn insert(&mut self, item: Index, at: Option<Index>) -> Result<(), InsertError> {
        if self.pool[item].link().is_some() {
            return Err(InsertError::AlreadyLinked);
        }

        if let Some(first) = self.head.first {
            let (next, update_first) = match at {
                Some(at) => (at, at == first),
                None => (first, false),
            };

            let prev = self.link(next).prev;
            self.link_mut(prev).next = item;
            self.link_mut(next).prev = item;
            *self.pool[item].link_mut() = Some(Link { prev, next });

            if update_first {
                self.head.first = Some(item);
            }
        } else {
            debug_assert!(at.is_none());
            *self.pool[item].link_mut() = Some(Link {
                prev: item,
                next: item,
            });
            self.head.first = Some(item);
        }

        Ok(())
    }

    #[inline]
    pub fn push_back(&mut self, item: Index) -> Result<(), InsertError> {
        self.insert(item, None)
    }

    #[inline]
    pub fn push_front(&mut self, item: Index) -> Result<(), InsertError> {
        let at = self.front();
        self.insert(item, at)
    }

    /// Insert `item` right after `pos`.
    pub fn insert_after(&mut self, item: Index, pos: Index) -> Result<(), InsertError> {
        let at = self.next(pos)?;
        self.insert(item, at)
    }

    /// Remove `item` from the list. Returns `item`.
    pub fn remove(&mut self, item: Index) -> Result<Index, ItemError> {
        let link = (*self.pool[item].link()).ok_or(ItemError::NotLinked)?;

        if self.head.first == Some(item) {
            if link.next == item {
                // The list just became empty
                self.head.first = None;
                *self.pool[item].link_mut() = None;
                return Ok(item);
            }

            // Move the head pointer
            self.head.first = Some(link.next);
        }

        self.link_mut(link.prev).next = link.next;
        self.link_mut(link.next).prev = link.prev;
        *self.pool[item].link_mut() = None;

        Ok(item)
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<Index> {
        let item = self.front()?;
        self.remove(item).ok()
    }

    /// Get the next element of the specified element.
    #[inline]
    pub fn next(&self, i: Index) -> Result<Option<Index>, ItemError> {
        let next = (*self.pool[i].link()).ok_or(ItemError::NotLinked)?.next;
        Ok(if Some(next) == self.head.first {
            None
        } else {
            Some(next)
        })
    }

    /// Get the previous element of the specified element.
    #[inline]
    pub fn prev(&self, i: Index) -> Result<Option<Index>, ItemError> {
        let prev = (*self.pool[i].link()).ok_or(ItemError::NotLinked)?.prev;
        Ok(if Some(i) == self.head.first {
            None
        } else {
            Some(prev)
        })
    }

    /// Make the second element the new front, moving the old front to the
    /// back. The relative order of all other elements is preserved.
    pub fn rotate_front_to_back(&mut self) {
        if let Some(first) = self.head.first {
            self.head.first = Some(self.link(first).next);
        }
    }

    /// Detach the contiguous chain `first..=last` from this list and append
    /// it to the back of `dest`, preserving its order.
    pub fn move_chain_to_back(&mut self, first: Index, last: Index, dest: &mut ListHead<Index>) {
        let before = self.link(first).prev;
        let after = self.link(last).next;

        if after == first {
            // The chain is the whole list
            debug_assert_eq!(self.head.first, Some(first));
            self.head.first = None;
        } else {
            self.link_mut(before).next = after;
            self.link_mut(after).prev = before;
            if self.head.first == Some(first) {
                self.head.first = Some(after);
            }
        }

        if let Some(dest_first) = dest.first {
            let dest_last = self.link(dest_first).prev;
            self.link_mut(dest_last).next = first;
            self.link_mut(first).prev = dest_last;
            self.link_mut(last).next = dest_first;
            self.link_mut(dest_first).prev = last;
        } else {
            self.link_mut(first).prev = last;
            self.link_mut(last).next = first;
            dest.first = Some(first);
        }
    }

    /// Find the first element satisfying `pred`.
    pub fn find(&self, mut pred: impl FnMut(Index, &Element) -> bool) -> Option<Index> {
        self.iter().find(|&i| pred(i, &self.pool[i]))
    }

    pub fn iter(&self) -> Iter<'_, 'a, Index, Pool> {
        Iter {
            next: self.head.first,
            accessor: self,
        }
    }
}

/// An iterator over the elements of [`ListAccessor`].
pub struct Iter<'b, 'a, Index, Pool: ?Sized> {
    accessor: &'b ListAccessor<'a, Index, Pool>,
    next: Option<Index>,
}

impl<'b, 'a, Index, Pool, Element> Iterator for Iter<'b, 'a, Index, Pool>
where
    Pool: ops::IndexMut<Index, Output = Element> + ?Sized,
    Element: Linked<Index>,
    Index: PartialEq + Copy + fmt::Debug,
{
    type Item = Index;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = self.accessor.next(current).ok().flatten();
        Some(current)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    AlreadyLinked,
    /// The insertion position is not linked.
    PositionNotLinked,
}

impl From<ItemError> for InsertError {
    fn from(_: ItemError) -> Self {
        Self::PositionNotLinked
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemError {
    NotLinked,
}
