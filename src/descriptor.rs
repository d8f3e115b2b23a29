//! Buffer descriptors.
//!
//! A [`NetBuffer`] is one fixed-size slot of packet storage plus its linkage
//! metadata. Descriptors are created once when the pool is built and then
//! move, boxed, between a free list and exactly one owner: a [`Descriptor`]
//! handle for a single buffer or a [`Packet`](crate::Packet) chain.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use bitflags::bitflags;

use crate::pool::PoolShared;

bitflags! {
    /// Per-descriptor flags.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
    pub struct BufFlags: u16 {
        /// First descriptor of one segment of a chain-of-chains transfer.
        const PARENT = 1 << 0;
        /// The chain carries a live running checksum in its head.
        const CHECKSUM = 1 << 1;
    }
}

/// Identifies one free-list partition of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FreeListId(pub(crate) u16);

impl FreeListId {
    /// The partition every pool has, holding whatever capacity was not
    /// assigned to explicit partitions.
    pub const DEFAULT: Self = Self(0);

    /// Partition `index`, counting from the default partition at 0. Extra
    /// partitions are numbered in the order they were added to the builder.
    #[must_use]
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    /// Position of this partition in the pool's free-list table.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FreeListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "free-list#{}", self.0)
    }
}

/// One fixed-capacity unit of packet storage.
///
/// The logical data is `len` bytes starting `offset` bytes into the slot.
/// `total_len`, `seqnum` and the running checksum are meaningful only on the
/// first descriptor of a packet.
pub struct NetBuffer {
    /// Start of this descriptor's slot in the pool region.
    base: NonNull<u8>,

    /// Slot size in bytes.
    capacity: usize,

    /// Data pointer, as an offset into the slot.
    offset: usize,

    /// Logical data length of this descriptor.
    len: usize,

    /// Next descriptor of the same packet, or next free descriptor while
    /// parked on a free list.
    pub(crate) next: Option<Box<NetBuffer>>,

    flags: BufFlags,

    /// Free list this descriptor returns to when released.
    free_list: FreeListId,

    /// Position of the slot in the pool region.
    index: usize,

    total_len: usize,
    seqnum: u32,
    chk_sum: u16,
}

// SAFETY: a descriptor is owned by exactly one free list or one chain at a
// time and its slot is disjoint from every other slot, so the raw base
// pointer is never aliased across threads.
unsafe impl Send for NetBuffer {}

// SAFETY: shared references only permit reads of the descriptor's own slot.
unsafe impl Sync for NetBuffer {}

impl NetBuffer {
    /// Creates a descriptor for one slot.
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `base` points to `capacity` bytes that belong to this slot alone
    /// - The memory remains valid while the descriptor can be reached
    pub(crate) const unsafe fn new(
        base: NonNull<u8>,
        capacity: usize,
        index: usize,
        free_list: FreeListId,
    ) -> Self {
        Self {
            base,
            capacity,
            offset: 0,
            len: 0,
            next: None,
            flags: BufFlags::empty(),
            free_list,
            index,
            total_len: 0,
            seqnum: 0,
            chk_sum: 0,
        }
    }

    /// Clears every mutable field before the descriptor is parked on
    /// `free_list`.
    pub(crate) fn reset(&mut self, free_list: FreeListId) {
        debug_assert!(self.next.is_none(), "descriptor reset while still linked");
        self.offset = 0;
        self.len = 0;
        self.next = None;
        self.flags = BufFlags::empty();
        self.free_list = free_list;
        self.total_len = 0;
        self.seqnum = 0;
        self.chk_sum = 0;
    }

    /// Position of this descriptor's slot in the pool.
    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Slot size in bytes.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Logical data length of this descriptor.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if this descriptor holds no logical data.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes between the start of the slot and the data pointer.
    #[inline]
    #[must_use]
    pub const fn headroom(&self) -> usize {
        self.offset
    }

    /// Bytes between the end of the data and the end of the slot.
    #[inline]
    #[must_use]
    pub const fn tailroom(&self) -> usize {
        self.capacity - self.offset - self.len
    }

    /// Flags set on this descriptor.
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> BufFlags {
        self.flags
    }

    /// Free list this descriptor returns to.
    #[inline]
    #[must_use]
    pub const fn free_list(&self) -> FreeListId {
        self.free_list
    }

    /// The following descriptor of the same packet.
    #[inline]
    #[must_use]
    pub fn next(&self) -> Option<&Self> {
        self.next.as_deref()
    }

    /// Logical data of this descriptor.
    #[inline]
    #[must_use]
    pub fn data(&self) -> &[u8] {
        // SAFETY: offset + len never exceeds capacity and the slot is ours
        unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(self.offset), self.len) }
    }

    /// Logical data of this descriptor, mutably.
    #[inline]
    #[must_use]
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: offset + len never exceeds capacity and we have exclusive
        // access to the slot
        unsafe {
            std::slice::from_raw_parts_mut(self.base.as_ptr().add(self.offset), self.len)
        }
    }

    /// Space after the logical data, up to the end of the slot.
    #[inline]
    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        let start = self.offset + self.len;
        // SAFETY: start <= capacity and we have exclusive access to the slot
        unsafe {
            std::slice::from_raw_parts_mut(self.base.as_ptr().add(start), self.capacity - start)
        }
    }

    #[inline]
    pub(crate) fn set_len(&mut self, len: usize) {
        debug_assert!(self.offset + len <= self.capacity);
        self.len = len;
    }

    /// Moves the data pointer; the end of the data stays where it is unless
    /// the new offset passes it.
    #[inline]
    pub(crate) fn set_offset(&mut self, offset: usize) {
        debug_assert!(offset <= self.capacity);
        let end = (self.offset + self.len).max(offset);
        self.offset = offset;
        self.len = end - offset;
    }

    /// Drops `n` bytes from the front of this descriptor's data.
    #[inline]
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.offset += n;
        self.len -= n;
    }

    /// Grows the data backwards into the headroom by `n` bytes.
    #[inline]
    pub(crate) fn retreat(&mut self, n: usize) {
        debug_assert!(n <= self.offset);
        self.offset -= n;
        self.len += n;
    }

    #[inline]
    pub(crate) fn insert_flags(&mut self, flags: BufFlags) {
        self.flags.insert(flags);
    }

    #[inline]
    pub(crate) fn remove_flags(&mut self, flags: BufFlags) {
        self.flags.remove(flags);
    }

    #[inline]
    pub(crate) fn set_free_list(&mut self, free_list: FreeListId) {
        self.free_list = free_list;
    }

    #[inline]
    pub(crate) const fn total_len(&self) -> usize {
        self.total_len
    }

    #[inline]
    pub(crate) fn set_total_len(&mut self, total_len: usize) {
        self.total_len = total_len;
    }

    #[inline]
    pub(crate) const fn seqnum(&self) -> u32 {
        self.seqnum
    }

    #[inline]
    pub(crate) fn set_seqnum(&mut self, seqnum: u32) {
        self.seqnum = seqnum;
    }

    #[inline]
    pub(crate) const fn chk_sum(&self) -> u16 {
        self.chk_sum
    }

    #[inline]
    pub(crate) fn set_chk_sum(&mut self, chk_sum: u16) {
        self.chk_sum = chk_sum;
    }
}

impl fmt::Debug for NetBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetBuffer")
            .field("index", &self.index)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("flags", &self.flags)
            .field("free_list", &self.free_list)
            .finish_non_exhaustive()
    }
}

/// A single descriptor taken from the pool.
///
/// Returned to its free list when dropped or passed to
/// [`BufferPool::release_one`](crate::BufferPool::release_one).
pub struct Descriptor {
    buf: Option<Box<NetBuffer>>,
    pool: Arc<PoolShared>,
}

impl Descriptor {
    pub(crate) const fn new(buf: Box<NetBuffer>, pool: Arc<PoolShared>) -> Self {
        Self {
            buf: Some(buf),
            pool,
        }
    }

    /// Sets the logical length, clamped to the space after the data pointer.
    pub fn set_len(&mut self, len: usize) {
        let max = self.capacity() - self.headroom();
        self.buf_mut().set_len(len.min(max));
    }

    /// Moves the data pointer `headroom` bytes into the slot, leaving room
    /// for headers to be prepended later. Clamped to the slot size.
    pub fn reserve_headroom(&mut self, headroom: usize) {
        let headroom = headroom.min(self.capacity());
        self.buf_mut().set_offset(headroom);
    }

    /// Sets the free list this descriptor returns to.
    pub fn set_free_list(&mut self, free_list: FreeListId) {
        self.buf_mut().set_free_list(free_list);
    }

    pub(crate) const fn pool_handle(&self) -> &Arc<PoolShared> {
        &self.pool
    }

    pub(crate) fn into_parts(mut self) -> (Box<NetBuffer>, Arc<PoolShared>) {
        let buf = self.buf.take().expect("descriptor already consumed");
        (buf, Arc::clone(&self.pool))
    }

    fn buf_mut(&mut self) -> &mut NetBuffer {
        self.buf.as_deref_mut().expect("descriptor already consumed")
    }
}

impl Deref for Descriptor {
    type Target = NetBuffer;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.buf.as_deref().expect("descriptor already consumed")
    }
}

impl DerefMut for Descriptor {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf_mut()
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let list = buf.free_list();
            self.pool.release(buf, list);
        }
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Descriptor").field(&self.buf).finish()
    }
}
