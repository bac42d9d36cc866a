//! Doubly linked list over an index space. The links are not stored in the
//! list header but in the elements themselves, which are reached through a
//! [`LinkAccess`] implementation.
use core::fmt;

use super::Init;

/// Linked list header.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
    pub last: Option<Index>,
}

impl<Index> Init for ListHead<Index> {
    const INIT: Self = Self {
        first: None,
        last: None,
    };
}

impl<Index: fmt::Debug> fmt::Debug for ListHead<Index> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?}..={:?})", self.first, self.last)
    }
}

/// Links to neighbor items.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link<Index> {
    pub prev: Option<Index>,
    pub next: Option<Index>,
}

impl<Index> Init for Link<Index> {
    const INIT: Self = Self {
        prev: None,
        next: None,
    };
}

/// Provides access to the [`Link`] of each element.
pub trait LinkAccess<Index: Copy> {
    fn link(&self, index: Index) -> Link<Index>;
    fn set_link(&mut self, index: Index, link: Link<Index>);

    #[inline]
    fn modify_link(&mut self, index: Index, f: impl FnOnce(&mut Link<Index>)) {
        let mut link = self.link(index);
        f(&mut link);
        self.set_link(index, link);
    }
}

impl<Index: Copy + PartialEq + fmt::Debug> ListHead<Index> {
    pub const fn new() -> Self {
        Self::INIT
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// Append `item` to the list. `item` must not be linked to any list.
    pub fn push_back(&mut self, access: &mut impl LinkAccess<Index>, item: Index) {
        access.set_link(
            item,
            Link {
                prev: self.last,
                next: None,
            },
        );

        if let Some(last) = self.last {
            access.modify_link(last, |link| link.next = Some(item));
        } else {
            self.first = Some(item);
        }

        self.last = Some(item);
    }

    /// Unlink `item` from the list. `item` must be a member of the list.
    pub fn remove(&mut self, access: &mut impl LinkAccess<Index>, item: Index) {
        let Link { prev, next } = access.link(item);

        if let Some(prev) = prev {
            access.modify_link(prev, |link| link.next = next);
        } else {
            debug_assert_eq!(self.first, Some(item));
            self.first = next;
        }

        if let Some(next) = next {
            access.modify_link(next, |link| link.prev = prev);
        } else {
            debug_assert_eq!(self.last, Some(item));
            self.last = prev;
        }

        access.set_link(item, Link::INIT);
    }

    /// Move `item` to the end of the list in constant time.
    pub fn move_to_back(&mut self, access: &mut impl LinkAccess<Index>, item: Index) {
        if self.last == Some(item) {
            return;
        }
        self.remove(access, item);
        self.push_back(access, item);
    }

    pub fn iter<'a, Access: LinkAccess<Index>>(&self, access: &'a Access) -> Iter<'a, Index, Access> {
        Iter {
            access,
            next: self.first,
        }
    }
}

/// An iterator over the elements of a [`ListHead`], front to back.
pub struct Iter<'a, Index, Access> {
    access: &'a Access,
    next: Option<Index>,
}

impl<Index: Copy, Access: LinkAccess<Index>> Iterator for Iter<'_, Index, Access> {
    type Item = Index;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = self.access.link(current).next;
        Some(current)
    }
}
