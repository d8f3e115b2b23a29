//! Queues of whole packets.
//!
//! Protocol layers keep received, unacknowledged or out-of-order packets on
//! a [`PacketQueue`]. A queue owns its packets; freeing the head or clearing
//! the queue returns the descriptors to the pool.

use std::collections::VecDeque;

use tracing::trace;

use crate::chain::Packet;
use crate::pool::BufferPool;

/// FIFO of packets.
#[derive(Debug, Default)]
pub struct PacketQueue {
    packets: VecDeque<Packet>,
}

impl PacketQueue {
    /// Creates an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            packets: VecDeque::new(),
        }
    }

    /// Number of packets queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Returns `true` if no packets are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Number of descriptors held by all queued packets.
    #[must_use]
    pub fn descriptor_count(&self) -> usize {
        self.packets.iter().map(Packet::segment_count).sum()
    }

    /// Logical bytes held by all queued packets.
    #[must_use]
    pub fn byte_count(&self) -> usize {
        self.packets.iter().map(Packet::total_len).sum()
    }

    /// Appends a packet at the tail.
    pub fn enqueue(&mut self, packet: Packet) {
        self.packets.push_back(packet);
    }

    /// Removes the packet at the head.
    pub fn dequeue(&mut self) -> Option<Packet> {
        self.packets.pop_front()
    }

    /// The packet at the head.
    #[must_use]
    pub fn peek(&self) -> Option<&Packet> {
        self.packets.front()
    }

    /// The packet at the head, mutably.
    pub fn peek_mut(&mut self) -> Option<&mut Packet> {
        self.packets.front_mut()
    }

    /// Iterates over the queued packets from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.packets.iter()
    }

    /// Frees the packet at the head. Returns `false` if the queue was empty.
    pub fn free_head(&mut self) -> bool {
        match self.packets.pop_front() {
            Some(packet) => {
                packet.free();
                true
            }
            None => false,
        }
    }

    /// Moves the packet at the head of this queue to the tail of `dst`.
    /// Returns `false` if this queue was empty.
    pub fn move_head(&mut self, dst: &mut Self) -> bool {
        match self.packets.pop_front() {
            Some(packet) => {
                dst.packets.push_back(packet);
                true
            }
            None => false,
        }
    }

    /// Frees every queued packet. Returns the number of packets freed.
    pub fn free_all(&mut self) -> usize {
        let count = self.packets.len();
        for packet in self.packets.drain(..) {
            packet.free();
        }
        if count > 0 {
            trace!(count, "freed queued packets");
        }
        count
    }
}

impl Extend<Packet> for PacketQueue {
    fn extend<I: IntoIterator<Item = Packet>>(&mut self, iter: I) {
        self.packets.extend(iter);
    }
}

impl BufferPool {
    /// Frees every packet on `queue`. Returns the number of packets freed.
    pub fn free_all(&self, queue: &mut PacketQueue) -> usize {
        queue.free_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferPoolBuilder;

    fn pool() -> BufferPool {
        BufferPoolBuilder::new()
            .capacity(16)
            .buffer_size(128)
            .reserved_threshold(0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_enqueue_dequeue_fifo() {
        let pool = pool();
        let mut queue = PacketQueue::new();
        for len in [10, 20, 30] {
            queue.enqueue(pool.acquire_chain(len).unwrap());
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.byte_count(), 60);
        assert_eq!(queue.peek().unwrap().total_len(), 10);

        assert_eq!(queue.dequeue().unwrap().total_len(), 10);
        assert_eq!(queue.dequeue().unwrap().total_len(), 20);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_free_head() {
        let pool = pool();
        let mut queue = PacketQueue::new();
        queue.enqueue(pool.acquire_chain(300).unwrap());
        queue.enqueue(pool.acquire_chain(10).unwrap());
        assert_eq!(pool.in_use(), 4);

        assert!(queue.free_head());
        assert_eq!(pool.in_use(), 1);
        assert!(queue.free_head());
        assert!(!queue.free_head());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_move_head() {
        let pool = pool();
        let mut src = PacketQueue::new();
        let mut dst = PacketQueue::new();
        src.enqueue(pool.acquire_chain(5).unwrap());

        assert!(src.move_head(&mut dst));
        assert!(!src.move_head(&mut dst));
        assert_eq!(dst.len(), 1);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn test_free_all() {
        let pool = pool();
        let mut queue = PacketQueue::new();
        queue.extend((0..5).map(|_| pool.acquire_chain(200).unwrap()));
        assert_eq!(queue.descriptor_count(), 10);
        assert_eq!(pool.available(), 6);

        assert_eq!(pool.free_all(&mut queue), 5);
        assert!(queue.is_empty());
        assert_eq!(pool.available(), 16);
        assert_eq!(pool.free_all(&mut queue), 0);
    }
}
