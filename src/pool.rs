//! Buffer pool implementation.
//!
//! This module provides the [`BufferPool`] and [`BufferPoolBuilder`] types.
//! A pool is one storage region carved into fixed-size descriptor slots that
//! are spread over one or more free-list partitions. The pool never grows or
//! shrinks after it is built.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;
use tracing::info;

use crate::allocator::{Allocator, DefaultAllocator};
use crate::chain::Packet;
use crate::descriptor::{Descriptor, FreeListId, NetBuffer};
use crate::error::{Error, Result};
use crate::free_list::FreeList;
use crate::suspend::{SuspensionList, WakeReason};

/// Default number of descriptors in a pool.
pub const DEFAULT_CAPACITY: usize = 200;

/// Default storage size of one descriptor, in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 512;

/// Smallest accepted descriptor size. IP and transport headers must always
/// fit in the first descriptor of a packet.
pub const MIN_BUFFER_SIZE: usize = 128;

/// Default number of free descriptors held back for the receive path.
pub const DEFAULT_RESERVED_THRESHOLD: usize = 10;

/// Builder for creating a [`BufferPool`] with custom configuration.
///
/// # Example
///
/// ```rust
/// use netbuf_pool::BufferPoolBuilder;
///
/// # fn main() -> netbuf_pool::Result<()> {
/// let pool = BufferPoolBuilder::new()
///     .capacity(64)
///     .buffer_size(256)
///     .reserved_threshold(4)
///     .build()?;
/// assert_eq!(pool.available(), 64);
/// # Ok(())
/// # }
/// ```
pub struct BufferPoolBuilder {
    capacity: usize,
    buffer_size: usize,
    reserved_threshold: usize,
    partitions: Vec<usize>,
    allocator: Box<dyn Allocator>,
}

impl Default for BufferPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPoolBuilder {
    /// Creates a new builder with default settings.
    ///
    /// Default settings:
    /// - Capacity: 200 descriptors
    /// - Buffer size: 512 bytes
    /// - Reserved threshold: 10 descriptors
    /// - Allocator: [`DefaultAllocator`]
    #[must_use]
    pub fn new() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            buffer_size: DEFAULT_BUFFER_SIZE,
            reserved_threshold: DEFAULT_RESERVED_THRESHOLD,
            partitions: Vec::new(),
            allocator: Box::new(DefaultAllocator::new()),
        }
    }

    /// Sets the total number of descriptors.
    #[must_use]
    pub const fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the storage size of each descriptor in bytes.
    #[must_use]
    pub const fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Sets the number of free descriptors the zero-copy allocation path
    /// leaves untouched.
    ///
    /// When the free count is at or below this value, transmit-side
    /// allocation is refused so that incoming traffic can still be received.
    #[must_use]
    pub const fn reserved_threshold(mut self, reserved_threshold: usize) -> Self {
        self.reserved_threshold = reserved_threshold;
        self
    }

    /// Carves an additional free-list partition of `count` descriptors out of
    /// the capacity.
    ///
    /// Partitions are numbered from 1 in the order they are added; partition
    /// 0 ([`FreeListId::DEFAULT`]) keeps whatever capacity remains.
    #[must_use]
    pub fn partition(mut self, count: usize) -> Self {
        self.partitions.push(count);
        self
    }

    /// Sets a custom allocator for the pool's storage region.
    #[must_use]
    pub fn allocator(mut self, allocator: Box<dyn Allocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Builds the buffer pool with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the capacity is zero, the buffer
    /// size is below [`MIN_BUFFER_SIZE`], the threshold is not below the
    /// capacity, or the partitions exceed the capacity. Returns
    /// [`Error::OutOfMemory`] if the storage region cannot be allocated.
    pub fn build(self) -> Result<BufferPool> {
        let config = self.validate()?;

        let region_len = config
            .capacity
            .checked_mul(config.buffer_size)
            .ok_or_else(|| Error::InvalidConfig("pool storage size overflows".into()))?;
        let region = NonNull::new(self.allocator.allocate(region_len)?).ok_or(Error::OutOfMemory)?;

        let default_count = config.capacity - self.partitions.iter().sum::<usize>();
        let counts: Vec<usize> = std::iter::once(default_count)
            .chain(self.partitions.iter().copied())
            .collect();

        let mut free_lists: Vec<Mutex<FreeList>> = Vec::with_capacity(counts.len());
        let mut slot = 0;
        for (list_index, &count) in counts.iter().enumerate() {
            // Partition count was bounded in validate().
            #[allow(clippy::cast_possible_truncation)]
            let id = FreeListId(list_index as u16);
            let mut list = FreeList::new();
            // Push in reverse so the lowest slot is handed out first.
            for index in (slot..slot + count).rev() {
                // SAFETY: index < capacity, so the slot lies inside the region
                // and no other descriptor is given the same slot
                let buf = unsafe {
                    let base = NonNull::new_unchecked(region.as_ptr().add(index * config.buffer_size));
                    NetBuffer::new(base, config.buffer_size, index, id)
                };
                list.push(Box::new(buf));
            }
            slot += count;
            free_lists.push(Mutex::new(list));
        }

        info!(
            capacity = config.capacity,
            buffer_size = config.buffer_size,
            reserved_threshold = config.reserved_threshold,
            partitions = counts.len(),
            "buffer pool created"
        );

        let shared = PoolShared {
            config,
            allocator: self.allocator,
            region,
            region_len,
            free_lists: free_lists.into_boxed_slice(),
            partition_sizes: counts.into_boxed_slice(),
            in_use: AtomicUsize::new(0),
            waiters: Mutex::new(SuspensionList::new()),
        };

        Ok(BufferPool {
            shared: Arc::new(shared),
        })
    }

    fn validate(&self) -> Result<PoolConfig> {
        if self.capacity == 0 {
            return Err(Error::InvalidConfig("capacity must be > 0".into()));
        }
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(Error::InvalidConfig(format!(
                "buffer size {} is below the minimum of {MIN_BUFFER_SIZE}",
                self.buffer_size
            )));
        }
        if self.reserved_threshold >= self.capacity {
            return Err(Error::InvalidConfig(format!(
                "reserved threshold {} must be below capacity {}",
                self.reserved_threshold, self.capacity
            )));
        }
        if self.partitions.len() >= usize::from(u16::MAX) {
            return Err(Error::InvalidConfig("too many partitions".into()));
        }
        let partitioned = self
            .partitions
            .iter()
            .try_fold(0usize, |acc, &count| acc.checked_add(count));
        if partitioned.is_none_or(|total| total > self.capacity) {
            return Err(Error::InvalidConfig(format!(
                "partitions exceed capacity {}",
                self.capacity
            )));
        }

        Ok(PoolConfig {
            capacity: self.capacity,
            buffer_size: self.buffer_size,
            reserved_threshold: self.reserved_threshold,
        })
    }
}

/// Fixed configuration of a built pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Total number of descriptors.
    pub capacity: usize,
    /// Storage size of each descriptor in bytes.
    pub buffer_size: usize,
    /// Free descriptors held back from the zero-copy allocation path.
    pub reserved_threshold: usize,
}

/// A fixed-capacity pool of packet buffer descriptors.
///
/// Cloning a pool produces another handle to the same descriptors. Packets
/// and descriptors keep the pool's storage alive until they are released.
///
/// # Example
///
/// ```rust
/// use netbuf_pool::BufferPoolBuilder;
///
/// # fn main() -> netbuf_pool::Result<()> {
/// let pool = BufferPoolBuilder::new().build()?;
///
/// // A 1200-byte frame spans three 512-byte descriptors
/// let packet = pool.acquire_chain(1200).expect("pool exhausted");
/// assert_eq!(packet.segment_count(), 3);
/// assert_eq!(pool.in_use(), 3);
///
/// // Descriptors go back to their free list when the packet is freed
/// pool.free_chain(packet);
/// assert_eq!(pool.in_use(), 0);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BufferPool {
    pub(crate) shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Returns a builder with default settings.
    #[must_use]
    pub fn builder() -> BufferPoolBuilder {
        BufferPoolBuilder::new()
    }

    /// Removes one descriptor from the default free list.
    ///
    /// Returns `None` if the list is empty. Safe to call from interrupt
    /// context: it never blocks and never logs.
    #[must_use]
    pub fn acquire_one(&self) -> Option<Descriptor> {
        self.acquire_one_from(FreeListId::DEFAULT)
    }

    /// Removes one descriptor from the given free list.
    #[must_use]
    pub fn acquire_one_from(&self, list: FreeListId) -> Option<Descriptor> {
        let buf = self.shared.take_chain(list, 1, 0, None)?;
        Some(Descriptor::new(buf, Arc::clone(&self.shared)))
    }

    /// Returns a descriptor to the free list it records, after resetting it.
    ///
    /// Every release also takes the wait-queue lock to resume the oldest
    /// suspended sender. Releases are expected to run in task context; an
    /// interrupt-style caller that can preempt a lock holder must defer the
    /// release to a task instead.
    pub fn release_one(&self, descriptor: Descriptor) {
        debug_assert!(
            self.owns(descriptor.pool_handle()),
            "descriptor belongs to another pool"
        );
        drop(descriptor);
    }

    /// Takes enough descriptors from the default free list to hold
    /// `total_len` bytes and links them into one packet.
    ///
    /// Every descriptor but the last is filled to capacity. Returns `None`
    /// without taking anything if the list cannot supply the whole chain.
    #[must_use]
    pub fn acquire_chain(&self, total_len: usize) -> Option<Packet> {
        self.acquire_chain_from(FreeListId::DEFAULT, total_len)
    }

    /// Like [`acquire_chain`](Self::acquire_chain), drawing from `list`.
    #[must_use]
    pub fn acquire_chain_from(&self, list: FreeListId, total_len: usize) -> Option<Packet> {
        self.acquire_chain_with(list, total_len, 0, None)
    }

    /// Like [`acquire_chain`](Self::acquire_chain), leaving `headroom` bytes
    /// in front of the data of the first descriptor so headers can be
    /// prepended later.
    ///
    /// Returns `None` if `headroom` does not leave room for data.
    #[must_use]
    pub fn acquire_chain_with_headroom(&self, total_len: usize, headroom: usize) -> Option<Packet> {
        self.acquire_chain_with(FreeListId::DEFAULT, total_len, headroom, None)
    }

    /// Returns every descriptor of `packet` to the free list each one
    /// records.
    pub fn free_chain(&self, packet: Packet) {
        debug_assert!(self.owns(packet.pool_handle()), "packet belongs to another pool");
        packet.free();
    }

    /// Returns every descriptor of `packet` to `target`.
    pub fn free_chain_to(&self, packet: Packet, target: FreeListId) {
        debug_assert!(self.owns(packet.pool_handle()), "packet belongs to another pool");
        packet.free_to(target);
    }

    /// Fixed configuration of this pool.
    #[must_use]
    pub fn config(&self) -> PoolConfig {
        self.shared.config
    }

    /// Total number of descriptors.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.config.capacity
    }

    /// Storage size of each descriptor in bytes.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.shared.config.buffer_size
    }

    /// Free descriptors held back from the zero-copy allocation path.
    #[must_use]
    pub fn reserved_threshold(&self) -> usize {
        self.shared.config.reserved_threshold
    }

    /// Number of free-list partitions.
    #[must_use]
    pub fn partitions(&self) -> usize {
        self.shared.free_lists.len()
    }

    /// Number of descriptors currently handed out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.shared.in_use()
    }

    /// Number of free descriptors across all partitions.
    #[must_use]
    pub fn available(&self) -> usize {
        self.shared.available()
    }

    /// Number of free descriptors on one partition, or `None` if the
    /// partition does not exist.
    #[must_use]
    pub fn free_count(&self, list: FreeListId) -> Option<usize> {
        self.shared
            .free_lists
            .get(list.index())
            .map(|list| list.lock().len())
    }

    /// Number of descriptors `list` was seeded with, or `None` if there is
    /// no such free list.
    #[must_use]
    pub fn partition_capacity(&self, list: FreeListId) -> Option<usize> {
        (list.index() < self.shared.free_lists.len()).then(|| self.shared.partition_size(list))
    }

    pub(crate) fn acquire_chain_with(
        &self,
        list: FreeListId,
        total_len: usize,
        headroom: usize,
        reserve: Option<usize>,
    ) -> Option<Packet> {
        if headroom >= self.shared.config.buffer_size {
            return None;
        }
        let count = self.shared.descriptors_for(total_len, headroom);
        let mut head = self.shared.take_chain(list, count, headroom, reserve)?;
        PoolShared::lay_out(&mut head, total_len, headroom);
        Some(Packet::from_head(head, Arc::clone(&self.shared)))
    }

    fn owns(&self, other: &Arc<PoolShared>) -> bool {
        Arc::ptr_eq(&self.shared, other)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("config", &self.shared.config)
            .field("in_use", &self.in_use())
            .field("partitions", &self.partitions())
            .finish_non_exhaustive()
    }
}

/// State shared by a pool and every descriptor handed out from it.
pub(crate) struct PoolShared {
    config: PoolConfig,

    /// The allocator the storage region came from.
    allocator: Box<dyn Allocator>,

    /// Storage region carved into `capacity` slots.
    region: NonNull<u8>,
    region_len: usize,

    /// One free list per partition. Each lock is the critical section that
    /// interrupt handlers share with tasks; it is held only for a push or
    /// a pop.
    pub(crate) free_lists: Box<[Mutex<FreeList>]>,

    /// Descriptors each free list was seeded with, indexed like `free_lists`.
    partition_sizes: Box<[usize]>,

    /// Descriptors handed out. Only changed while a free-list lock is held.
    pub(crate) in_use: AtomicUsize,

    /// Tasks waiting for descriptors.
    pub(crate) waiters: Mutex<SuspensionList>,
}

// SAFETY: the region pointer is only dereferenced through descriptors, each
// of which owns a disjoint slot; all other state is behind locks or atomics.
unsafe impl Send for PoolShared {}
unsafe impl Sync for PoolShared {}

impl PoolShared {
    pub(crate) fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub(crate) fn available(&self) -> usize {
        self.config.capacity.saturating_sub(self.in_use())
    }

    /// Descriptors `list` holds when nothing is in use.
    pub(crate) fn partition_size(&self, list: FreeListId) -> usize {
        self.partition_sizes.get(list.index()).copied().unwrap_or(0)
    }

    /// Number of descriptors needed for `total_len` bytes when the first one
    /// starts `headroom` bytes into its slot. Always at least one.
    pub(crate) const fn descriptors_for(&self, total_len: usize, headroom: usize) -> usize {
        let first = self.config.buffer_size - headroom;
        if total_len <= first {
            1
        } else {
            1 + (total_len - first).div_ceil(self.config.buffer_size)
        }
    }

    /// Pops `count` descriptors from `list` and links them into a chain, or
    /// takes nothing if the list is short.
    ///
    /// With `reserve` set, nothing is taken unless the pool-wide free count
    /// is above it.
    pub(crate) fn take_chain(
        &self,
        list: FreeListId,
        count: usize,
        headroom: usize,
        reserve: Option<usize>,
    ) -> Option<Box<NetBuffer>> {
        let free_list = self.free_lists.get(list.index())?;
        let mut guard = free_list.lock();

        if guard.len() < count {
            return None;
        }
        if reserve.is_some_and(|reserve| self.available() <= reserve) {
            return None;
        }

        let mut head: Option<Box<NetBuffer>> = None;
        for _ in 0..count {
            let mut buf = guard.pop()?;
            buf.next = head.take();
            head = Some(buf);
        }
        self.in_use.fetch_add(count, Ordering::AcqRel);
        drop(guard);

        let mut head = head?;
        head.set_offset(headroom);
        Some(head)
    }

    /// Assigns data lengths along a freshly taken chain: every descriptor is
    /// full except the last, which holds the remainder.
    pub(crate) fn lay_out(head: &mut NetBuffer, total_len: usize, headroom: usize) {
        let mut remaining = total_len;
        let mut room = head.capacity() - headroom;
        let mut cur = Some(&mut *head);
        while let Some(buf) = cur {
            let len = remaining.min(room);
            buf.set_len(len);
            remaining -= len;
            room = buf.capacity();
            cur = buf.next.as_deref_mut();
        }
        head.set_total_len(total_len);
    }

    /// Resets `buf` and pushes it onto `list`, then resumes one suspended
    /// task.
    pub(crate) fn release(&self, mut buf: Box<NetBuffer>, list: FreeListId) {
        buf.next = None;
        self.push_free(buf, list);
        self.resume_one();
    }

    /// Returns a whole chain, descriptor by descriptor, then resumes one
    /// suspended task.
    ///
    /// Each descriptor goes to `target` if given, otherwise to the free
    /// list it records.
    pub(crate) fn release_chain(&self, head: Box<NetBuffer>, target: Option<FreeListId>) {
        let mut cur = Some(head);
        while let Some(mut buf) = cur {
            cur = buf.next.take();
            let list = target.unwrap_or_else(|| buf.free_list());
            self.push_free(buf, list);
        }
        self.resume_one();
    }

    fn push_free(&self, mut buf: Box<NetBuffer>, list: FreeListId) {
        let list = if list.index() < self.free_lists.len() {
            list
        } else {
            FreeListId::DEFAULT
        };
        buf.reset(list);
        let mut guard = self.free_lists[list.index()].lock();
        guard.push(buf);
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }

    /// Wakes the oldest suspended task, if any.
    ///
    /// Blocks on the wait-queue lock, which the zero-copy path holds across
    /// an allocation attempt. Must not be reached from a context that can
    /// preempt that holder.
    pub(crate) fn resume_one(&self) {
        let mut waiters = self.waiters.lock();
        if !waiters.is_empty() {
            waiters.wake_one(WakeReason::BufferReleased);
        }
    }

    /// Wakes the oldest suspended task if the zero-copy path could serve it
    /// right now. Used to hand a wake-up on when a resumed task leaves
    /// descriptors behind.
    pub(crate) fn resume_if_available(&self) {
        let mut waiters = self.waiters.lock();
        if !waiters.is_empty() && self.available() > self.config.reserved_threshold {
            waiters.wake_one(WakeReason::BufferReleased);
        }
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        // Descriptors never touch their slots on drop, so the region can go
        // first.
        // SAFETY: region was allocated by our allocator with region_len
        unsafe {
            self.allocator.deallocate(self.region.as_ptr(), self.region_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(capacity: usize) -> BufferPool {
        BufferPoolBuilder::new()
            .capacity(capacity)
            .buffer_size(MIN_BUFFER_SIZE)
            .reserved_threshold(0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_pool_builder_defaults() {
        let pool = BufferPoolBuilder::new().build().unwrap();
        assert_eq!(pool.capacity(), DEFAULT_CAPACITY);
        assert_eq!(pool.buffer_size(), DEFAULT_BUFFER_SIZE);
        assert_eq!(pool.reserved_threshold(), DEFAULT_RESERVED_THRESHOLD);
        assert_eq!(pool.available(), DEFAULT_CAPACITY);
        assert_eq!(pool.partitions(), 1);
    }

    #[test]
    fn test_pool_builder_rejects_bad_config() {
        assert!(matches!(
            BufferPoolBuilder::new().capacity(0).build(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            BufferPoolBuilder::new().buffer_size(MIN_BUFFER_SIZE - 1).build(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            BufferPoolBuilder::new().capacity(10).reserved_threshold(10).build(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            BufferPoolBuilder::new().capacity(10).reserved_threshold(0).partition(6).partition(5).build(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_acquire_release_one() {
        let pool = small_pool(3);

        let a = pool.acquire_one().unwrap();
        let b = pool.acquire_one().unwrap();
        let c = pool.acquire_one().unwrap();
        assert!(pool.acquire_one().is_none());
        assert_eq!(pool.in_use(), 3);

        // Lowest slots are handed out first
        assert_eq!([a.index(), b.index(), c.index()], [0, 1, 2]);

        pool.release_one(b);
        assert_eq!(pool.available(), 1);

        // LIFO: the released slot comes straight back
        let again = pool.acquire_one().unwrap();
        assert_eq!(again.index(), 1);
    }

    #[test]
    fn test_release_resets_descriptor() {
        let pool = small_pool(1);

        let mut desc = pool.acquire_one().unwrap();
        desc.reserve_headroom(16);
        desc.set_len(20);
        pool.release_one(desc);

        let desc = pool.acquire_one().unwrap();
        assert_eq!(desc.headroom(), 0);
        assert_eq!(desc.len(), 0);
        assert!(desc.flags().is_empty());
        assert!(desc.next().is_none());
    }

    #[test]
    fn test_acquire_chain_lengths() {
        let pool = small_pool(8);

        let packet = pool.acquire_chain(300).unwrap();
        assert_eq!(packet.total_len(), 300);
        let lens: Vec<usize> = packet.iter().map(NetBuffer::len).collect();
        assert_eq!(lens, vec![128, 128, 44]);
        assert!(packet.iter().last().unwrap().next().is_none());
        assert_eq!(pool.in_use(), 3);
    }

    #[test]
    fn test_acquire_chain_zero_length() {
        let pool = small_pool(2);
        let packet = pool.acquire_chain(0).unwrap();
        assert_eq!(packet.segment_count(), 1);
        assert_eq!(packet.total_len(), 0);
    }

    #[test]
    fn test_acquire_chain_all_or_nothing() {
        let pool = small_pool(4);
        let _held = pool.acquire_one().unwrap();

        // Needs 4 descriptors, only 3 are free
        assert!(pool.acquire_chain(4 * MIN_BUFFER_SIZE).is_none());
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.in_use(), 1);

        assert!(pool.acquire_chain(3 * MIN_BUFFER_SIZE).is_some());
    }

    #[test]
    fn test_acquire_chain_with_headroom() {
        let pool = small_pool(4);

        let packet = pool.acquire_chain_with_headroom(200, 40).unwrap();
        let first = packet.iter().next().unwrap();
        assert_eq!(first.headroom(), 40);
        assert_eq!(first.len(), MIN_BUFFER_SIZE - 40);
        assert_eq!(packet.segment_count(), 2);
        assert_eq!(packet.total_len(), 200);

        assert!(pool.acquire_chain_with_headroom(10, MIN_BUFFER_SIZE).is_none());
    }

    #[test]
    fn test_partitions_are_separate() {
        let pool = BufferPoolBuilder::new()
            .capacity(10)
            .reserved_threshold(0)
            .partition(4)
            .build()
            .unwrap();

        let high = FreeListId(1);
        assert_eq!(pool.partitions(), 2);
        assert_eq!(pool.free_count(FreeListId::DEFAULT), Some(6));
        assert_eq!(pool.free_count(high), Some(4));
        assert_eq!(pool.free_count(FreeListId(2)), None);

        let packet = pool.acquire_chain_from(high, 4 * pool.buffer_size()).unwrap();
        assert!(packet.iter().all(|buf| buf.free_list() == high));
        assert!(pool.acquire_one_from(high).is_none());
        assert_eq!(pool.free_count(FreeListId::DEFAULT), Some(6));

        // Seeded sizes do not move with use
        assert_eq!(pool.partition_capacity(FreeListId::DEFAULT), Some(6));
        assert_eq!(pool.partition_capacity(high), Some(4));
        assert_eq!(pool.partition_capacity(FreeListId(2)), None);

        pool.free_chain(packet);
        assert_eq!(pool.free_count(high), Some(4));
    }

    #[test]
    fn test_free_chain_to_target() {
        let pool = BufferPoolBuilder::new()
            .capacity(6)
            .reserved_threshold(0)
            .partition(2)
            .build()
            .unwrap();

        let packet = pool.acquire_chain(2 * pool.buffer_size()).unwrap();
        pool.free_chain_to(packet, FreeListId(1));
        assert_eq!(pool.free_count(FreeListId::DEFAULT), Some(2));
        assert_eq!(pool.free_count(FreeListId(1)), Some(4));
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_storage_is_distinct_per_slot() {
        let pool = small_pool(2);
        let mut a = pool.acquire_one().unwrap();
        let mut b = pool.acquire_one().unwrap();
        a.set_len(MIN_BUFFER_SIZE);
        b.set_len(MIN_BUFFER_SIZE);
        a.data_mut().fill(0xAA);
        b.data_mut().fill(0xBB);
        assert!(a.data().iter().all(|&byte| byte == 0xAA));
        assert!(b.data().iter().all(|&byte| byte == 0xBB));
    }

    #[test]
    fn test_packet_outlives_pool_handle() {
        let pool = small_pool(2);
        let mut packet = pool.acquire_chain(4).unwrap();
        drop(pool);
        packet.copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(packet.to_vec(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_clone_pool_shares_state() {
        let pool = small_pool(1);
        let pool_clone = pool.clone();

        let desc = pool.acquire_one().unwrap();
        assert!(pool_clone.acquire_one().is_none());
        drop(desc);
        assert!(pool_clone.acquire_one().is_some());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Chain(usize),
        One,
        Free(usize),
    }

    fn op() -> impl proptest::strategy::Strategy<Value = Op> {
        use proptest::prelude::*;
        prop_oneof![
            (0usize..700).prop_map(Op::Chain),
            Just(Op::One),
            any::<usize>().prop_map(Op::Free),
        ]
    }

    proptest::proptest! {
        #[test]
        fn prop_descriptors_are_conserved(ops in proptest::collection::vec(op(), 1..60)) {
            let pool = small_pool(16);
            let mut held: Vec<Packet> = Vec::new();

            for op in ops {
                match op {
                    Op::Chain(len) => held.extend(pool.acquire_chain(len)),
                    Op::One => held.extend(pool.acquire_one().map(Packet::from)),
                    Op::Free(i) if !held.is_empty() => {
                        let i = i % held.len();
                        pool.free_chain(held.swap_remove(i));
                    }
                    Op::Free(_) => {}
                }

                let out: usize = held.iter().map(Packet::segment_count).sum();
                proptest::prop_assert_eq!(pool.in_use(), out);
                proptest::prop_assert_eq!(pool.in_use() + pool.available(), pool.capacity());
                proptest::prop_assert_eq!(pool.validate_pool_accounting(), Ok(()));
            }

            drop(held);
            proptest::prop_assert_eq!(pool.in_use(), 0);
        }
    }
}
