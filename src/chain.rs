//! Packet chains.
//!
//! A [`Packet`] is a linked chain of descriptors holding one logical packet;
//! the head carries the total length, sequence number and running checksum.
//! A [`ZeroCopyBuffer`] is a chain of such chains, one per transport segment,
//! produced by the zero-copy allocation path.

use std::fmt;
use std::sync::Arc;

use crate::checksum::{self, Accumulator};
use crate::descriptor::{BufFlags, Descriptor, FreeListId, NetBuffer};
use crate::pool::PoolShared;

/// One packet: a chain of descriptors owned as a unit.
///
/// Dropping a packet returns every descriptor to the free list it records.
pub struct Packet {
    head: Option<Box<NetBuffer>>,
    pool: Arc<PoolShared>,
}

impl Packet {
    pub(crate) fn from_head(head: Box<NetBuffer>, pool: Arc<PoolShared>) -> Self {
        Self {
            head: Some(head),
            pool,
        }
    }

    pub(crate) const fn pool_handle(&self) -> &Arc<PoolShared> {
        &self.pool
    }

    pub(crate) fn head(&self) -> &NetBuffer {
        // A packet always holds its head until it is consumed.
        self.head.as_deref().unwrap_or_else(|| unreachable!("packet already consumed"))
    }

    pub(crate) fn head_mut(&mut self) -> &mut NetBuffer {
        self.head
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("packet already consumed"))
    }

    /// Logical length of the whole packet.
    #[inline]
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.head().total_len()
    }

    /// Returns `true` if the packet holds no logical data.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Number of descriptors in the chain.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.iter().count()
    }

    /// Flags on the head descriptor.
    #[must_use]
    pub fn flags(&self) -> BufFlags {
        self.head().flags()
    }

    /// Iterates over the descriptors of the chain in order.
    pub fn iter(&self) -> impl Iterator<Item = &NetBuffer> {
        std::iter::successors(self.head.as_deref(), |buf| buf.next())
    }

    /// Calls `f` on the data of each descriptor in order.
    pub fn for_each_data_mut(&mut self, mut f: impl FnMut(&mut [u8])) {
        let mut cur = self.head.as_deref_mut();
        while let Some(buf) = cur {
            f(buf.data_mut());
            cur = buf.next.as_deref_mut();
        }
    }

    /// Sequence number stored on the head.
    #[must_use]
    pub fn seqnum(&self) -> u32 {
        self.head().seqnum()
    }

    /// Stores a sequence number on the head.
    pub fn set_seqnum(&mut self, seqnum: u32) {
        self.head_mut().set_seqnum(seqnum);
    }

    /// The running checksum, if the packet carries one.
    #[must_use]
    pub fn running_checksum(&self) -> Option<u16> {
        let head = self.head();
        head.flags()
            .contains(BufFlags::CHECKSUM)
            .then(|| head.chk_sum())
    }

    /// Records `sum` as the ones-complement sum of the packet's logical bytes.
    ///
    /// From here on, front trims keep it up to date.
    pub fn set_running_checksum(&mut self, sum: u16) {
        let head = self.head_mut();
        head.set_chk_sum(sum);
        head.insert_flags(BufFlags::CHECKSUM);
    }

    /// Sums the packet's logical bytes, records the result as the running
    /// checksum and returns it.
    pub fn compute_running_checksum(&mut self) -> u16 {
        let sum = self.data_sum();
        self.set_running_checksum(sum);
        sum
    }

    /// Drops the running checksum.
    pub fn clear_running_checksum(&mut self) {
        let head = self.head_mut();
        head.remove_flags(BufFlags::CHECKSUM);
        head.set_chk_sum(0);
    }

    /// Ones-complement sum of the logical bytes, computed from scratch.
    #[must_use]
    pub fn data_sum(&self) -> u16 {
        let mut acc = Accumulator::new();
        for buf in self.iter() {
            acc.update(buf.data());
        }
        acc.finish()
    }

    /// Copies `src` over the packet's logical bytes from the start. Returns
    /// the number of bytes copied, at most [`total_len`](Self::total_len).
    pub fn copy_from_slice(&mut self, src: &[u8]) -> usize {
        let mut copied = 0;
        self.for_each_data_mut(|data| {
            let n = data.len().min(src.len() - copied);
            data[..n].copy_from_slice(&src[copied..copied + n]);
            copied += n;
        });
        copied
    }

    /// Copies the packet's logical bytes into `dst`. Returns the number of
    /// bytes copied.
    pub fn copy_to_slice(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for buf in self.iter() {
            if copied == dst.len() {
                break;
            }
            let data = buf.data();
            let n = data.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&data[..n]);
            copied += n;
        }
        copied
    }

    /// Collects the packet's logical bytes.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        for buf in self.iter() {
            out.extend_from_slice(buf.data());
        }
        out
    }

    /// Appends bytes to the packet, filling the tail descriptor's free space
    /// first and then taking descriptors from the tail's free list.
    ///
    /// Returns the number of bytes appended, which is short if the free list
    /// runs dry. A running checksum is kept up to date.
    pub fn extend_from_slice(&mut self, mut src: &[u8]) -> usize {
        let start_len = self.total_len();
        let sum = self.running_checksum();
        let mut appended = 0;

        let tail = self.tail_mut();
        let list = tail.free_list();
        let n = src.len().min(tail.tailroom());
        tail.spare_mut()[..n].copy_from_slice(&src[..n]);
        let len = tail.len() + n;
        tail.set_len(len);
        appended += n;
        src = &src[n..];

        while !src.is_empty() {
            let Some(mut buf) = self.pool.take_chain(list, 1, 0, None) else {
                break;
            };
            let n = src.len().min(buf.capacity());
            buf.spare_mut()[..n].copy_from_slice(&src[..n]);
            buf.set_len(n);
            appended += n;
            src = &src[n..];
            self.tail_mut().next = Some(buf);
        }

        let head = self.head_mut();
        head.set_total_len(start_len + appended);
        if let Some(sum) = sum {
            let tail_sum = self.range_sum(start_len, appended);
            self.set_running_checksum(concat_sum(sum, start_len, tail_sum));
        }
        appended
    }

    /// Moves every descriptor of `other` onto the end of this packet.
    ///
    /// The running checksum survives only if both packets carry one.
    pub fn append(&mut self, mut other: Self) {
        debug_assert!(Arc::ptr_eq(&self.pool, &other.pool), "packets from different pools");
        let Some(mut other_head) = other.head.take() else {
            return;
        };

        let first_len = self.total_len();
        let other_len = other_head.total_len();
        let other_sum = other_head
            .flags()
            .contains(BufFlags::CHECKSUM)
            .then(|| other_head.chk_sum());

        // Head-only fields mean nothing in the middle of a chain.
        other_head.set_total_len(0);
        other_head.set_seqnum(0);
        other_head.set_chk_sum(0);
        other_head.remove_flags(BufFlags::PARENT | BufFlags::CHECKSUM);

        self.tail_mut().next = Some(other_head);
        self.head_mut().set_total_len(first_len + other_len);

        match (self.running_checksum(), other_sum) {
            (Some(sum), Some(other_sum)) => {
                self.set_running_checksum(concat_sum(sum, first_len, other_sum));
            }
            (Some(_), None) => self.clear_running_checksum(),
            _ => {}
        }
    }

    /// Links a single descriptor onto the end of the packet.
    pub fn push_back(&mut self, descriptor: Descriptor) {
        let (mut buf, pool) = descriptor.into_parts();
        debug_assert!(Arc::ptr_eq(&self.pool, &pool), "descriptor from a different pool");

        let added = buf.len();
        let start_len = self.total_len();
        buf.remove_flags(BufFlags::PARENT | BufFlags::CHECKSUM);
        let sum = self.running_checksum().map(|sum| (sum, checksum::memsum(buf.data())));

        self.tail_mut().next = Some(buf);
        self.head_mut().set_total_len(start_len + added);
        if let Some((sum, added_sum)) = sum {
            self.set_running_checksum(concat_sum(sum, start_len, added_sum));
        }
    }

    /// Grows the packet `n` bytes backwards into the head's headroom and
    /// returns the new bytes for a header to be written into.
    ///
    /// Returns `None` if the headroom is too small. Drops the running
    /// checksum, since the new bytes are not yet known.
    pub fn prepend(&mut self, n: usize) -> Option<&mut [u8]> {
        if self.head().headroom() < n {
            return None;
        }
        self.clear_running_checksum();
        let head = self.head_mut();
        head.retreat(n);
        head.set_total_len(head.total_len() + n);
        Some(&mut head.data_mut()[..n])
    }

    /// Sets the free list every descriptor of the chain returns to.
    pub fn set_free_list(&mut self, list: FreeListId) {
        let mut cur = self.head.as_deref_mut();
        while let Some(buf) = cur {
            buf.set_free_list(list);
            cur = buf.next.as_deref_mut();
        }
    }

    /// Returns every descriptor to the free list it records.
    pub fn free(mut self) {
        if let Some(head) = self.head.take() {
            self.pool.release_chain(head, None);
        }
    }

    /// Returns every descriptor to `target`.
    pub fn free_to(mut self, target: FreeListId) {
        if let Some(head) = self.head.take() {
            self.pool.release_chain(head, Some(target));
        }
    }

    pub(crate) fn set_parent(&mut self) {
        self.head_mut().insert_flags(BufFlags::PARENT);
    }

    fn tail_mut(&mut self) -> &mut NetBuffer {
        let mut cur = self.head_mut();
        while cur.next.is_some() {
            cur = cur
                .next
                .as_deref_mut()
                .unwrap_or_else(|| unreachable!("checked above"));
        }
        cur
    }

    /// Sum of `len` logical bytes starting `start` bytes into the packet.
    fn range_sum(&self, start: usize, len: usize) -> u16 {
        let mut acc = Accumulator::new();
        let mut skip = start;
        let mut left = len;
        for buf in self.iter() {
            if left == 0 {
                break;
            }
            let data = buf.data();
            if skip >= data.len() {
                skip -= data.len();
                continue;
            }
            let take = (data.len() - skip).min(left);
            acc.update(&data[skip..skip + take]);
            left -= take;
            skip = 0;
        }
        acc.finish()
    }
}

/// Sum of two byte runs laid end to end, given each run's own sum. A second
/// run starting at an odd offset lands byte-swapped.
const fn concat_sum(first: u16, first_len: usize, second: u16) -> u16 {
    let second = if first_len % 2 == 0 {
        second
    } else {
        second.swap_bytes()
    };
    checksum::ones_add(first, second)
}

impl From<Descriptor> for Packet {
    fn from(descriptor: Descriptor) -> Self {
        let (mut buf, pool) = descriptor.into_parts();
        let len = buf.len();
        buf.set_total_len(len);
        Self::from_head(buf, pool)
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(head) = self.head.take() {
            self.pool.release_chain(head, None);
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("total_len", &self.total_len())
            .field("segments", &self.segment_count())
            .field("flags", &self.flags())
            .finish_non_exhaustive()
    }
}

/// A chain of packets filled as one zero-copy transfer, one packet per
/// transport segment. Each segment's head carries [`BufFlags::PARENT`].
///
/// Dropping the buffer frees every segment.
#[derive(Debug, Default)]
pub struct ZeroCopyBuffer {
    segments: Vec<Packet>,
}

impl ZeroCopyBuffer {
    /// Creates an empty transfer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Total logical bytes across all segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.iter().map(Packet::total_len).sum()
    }

    /// Returns `true` if no bytes are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// The segments in order.
    #[must_use]
    pub fn segments(&self) -> &[Packet] {
        &self.segments
    }

    /// The segments in order, mutably, for filling in data.
    pub fn segments_mut(&mut self) -> &mut [Packet] {
        &mut self.segments
    }

    /// Adds a segment to the end of the transfer.
    pub fn push(&mut self, mut segment: Packet) {
        segment.set_parent();
        self.segments.push(segment);
    }

    /// Splits the transfer into its segments.
    #[must_use]
    pub fn into_segments(self) -> Vec<Packet> {
        self.segments
    }

    /// Bytes of segment `segment` from `offset` to its end. Zero if the
    /// position lies past the end of the segment or of the transfer.
    #[must_use]
    pub fn bytes_left(&self, segment: usize, offset: usize) -> usize {
        self.segments
            .get(segment)
            .map_or(0, |packet| packet.total_len().saturating_sub(offset))
    }

    /// Copies `src` across the segments in order. Returns the number of
    /// bytes copied.
    pub fn copy_from_slice(&mut self, src: &[u8]) -> usize {
        let mut copied = 0;
        for segment in &mut self.segments {
            copied += segment.copy_from_slice(&src[copied..]);
        }
        copied
    }

    /// Collects the logical bytes of every segment.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for segment in &self.segments {
            out.extend(segment.iter().flat_map(NetBuffer::data));
        }
        out
    }

    /// Frees every segment.
    pub fn free(self) {
        drop(self);
    }
}

impl From<Packet> for ZeroCopyBuffer {
    fn from(packet: Packet) -> Self {
        let mut buffer = Self::new();
        buffer.push(packet);
        buffer
    }
}
