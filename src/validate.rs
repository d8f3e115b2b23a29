//! Debug-time accounting checks.
//!
//! Both checks hold every free-list lock at once, which stalls all
//! allocation and release for the duration of a full list walk. Use them
//! from tests and diagnostics, not from the data path.

use std::sync::atomic::Ordering;

use tracing::error;

use crate::error::Imbalance;
use crate::pool::BufferPool;
use crate::queue::PacketQueue;

/// Where every descriptor of a pool was found by [`BufferPool::census`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferCensus {
    /// Fixed pool capacity.
    pub capacity: usize,
    /// Nodes counted on each free-list partition, in partition order.
    pub free: Vec<usize>,
    /// In-use counter at the time of the walk.
    pub in_use: usize,
    /// Descriptors held by the packets on the queues passed in.
    pub queued: usize,
}

impl BufferCensus {
    /// Free descriptors across all partitions.
    #[must_use]
    pub fn total_free(&self) -> usize {
        self.free.iter().sum()
    }

    /// In-use descriptors not found on any of the queues walked. Nonzero
    /// values point at packets held elsewhere, or leaked.
    #[must_use]
    pub const fn unaccounted(&self) -> usize {
        self.in_use.saturating_sub(self.queued)
    }
}

impl BufferPool {
    /// Walks every free list and checks that the nodes found plus the
    /// in-use counter equal the capacity.
    ///
    /// A mismatch is logged and returned; nothing is repaired.
    ///
    /// # Errors
    ///
    /// Returns the [`Imbalance`] found.
    pub fn validate_pool_accounting(&self) -> Result<(), Imbalance> {
        let shared = &self.shared;
        let guards: Vec<_> = shared.free_lists.iter().map(|list| list.lock()).collect();

        let free: usize = guards.iter().map(|list| list.count_nodes()).sum();
        let in_use = shared.in_use.load(Ordering::Acquire);
        drop(guards);

        let found = free + in_use;
        let expected = self.capacity();
        let imbalance = match found.cmp(&expected) {
            std::cmp::Ordering::Equal => return Ok(()),
            std::cmp::Ordering::Greater => Imbalance::TooMany { found, expected },
            std::cmp::Ordering::Less => Imbalance::TooFew { found, expected },
        };
        error!(free, in_use, %imbalance, "buffer accounting mismatch");
        Err(imbalance)
    }

    /// Counts descriptors on every free list and on `queues`.
    ///
    /// The counts are taken while all free lists are locked, but the queues
    /// are only as stable as the caller keeps them.
    #[must_use]
    pub fn census(&self, queues: &[&PacketQueue]) -> BufferCensus {
        let queued = queues.iter().map(|queue| queue.descriptor_count()).sum();

        let shared = &self.shared;
        let guards: Vec<_> = shared.free_lists.iter().map(|list| list.lock()).collect();
        let free = guards.iter().map(|list| list.count_nodes()).collect();
        let in_use = shared.in_use.load(Ordering::Acquire);
        drop(guards);

        BufferCensus {
            capacity: self.capacity(),
            free,
            in_use,
            queued,
        }
    }
}
