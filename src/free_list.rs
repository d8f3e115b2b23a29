//! Intrusive free list.
//!
//! Free descriptors are threaded through their own `next` link, so pushing
//! and popping moves a box and never allocates. The list is LIFO: the most
//! recently released descriptor is handed out first while its slot is still
//! warm in cache.

use crate::descriptor::NetBuffer;

/// A LIFO stack of free descriptors.
///
/// Callers serialize access; the pool keeps each list behind the critical
/// section that stands in for disabled interrupts.
#[derive(Default)]
pub struct FreeList {
    head: Option<Box<NetBuffer>>,
    len: usize,
}

impl FreeList {
    /// Creates a new empty free list.
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Returns the number of descriptors on the list.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the list is empty.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pushes a descriptor onto the list.
    ///
    /// The descriptor must already be unlinked from any chain.
    pub fn push(&mut self, mut buf: Box<NetBuffer>) {
        debug_assert!(buf.next.is_none(), "descriptor is still linked");
        buf.next = self.head.take();
        self.head = Some(buf);
        self.len += 1;
    }

    /// Pops the most recently pushed descriptor.
    ///
    /// Returns `None` if the list is empty.
    pub fn pop(&mut self) -> Option<Box<NetBuffer>> {
        let mut buf = self.head.take()?;
        self.head = buf.next.take();
        self.len -= 1;
        Some(buf)
    }

    /// Walks the list and counts its nodes without trusting the cached
    /// length.
    pub fn count_nodes(&self) -> usize {
        self.iter().count()
    }

    /// Iterates over the free descriptors, most recent first.
    pub fn iter(&self) -> impl Iterator<Item = &NetBuffer> {
        std::iter::successors(self.head.as_deref(), |buf| buf.next.as_deref())
    }
}

impl Drop for FreeList {
    fn drop(&mut self) {
        // Unlink one at a time so a long list does not recurse on drop.
        while self.pop().is_some() {}
    }
}
