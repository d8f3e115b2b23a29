//! # netbuf-pool
//!
//! Packet buffer pool for a small TCP/IP stack. All packet storage comes from
//! one fixed-capacity region, carved at build time into equal-size
//! descriptors that are chained together to hold packets of any length.
//!
//! ## Features
//!
//! - **Fixed Capacity**: No allocation after build; descriptors move between free lists and owners
//! - **Chained Packets**: A [`Packet`] links descriptors; a [`ZeroCopyBuffer`] links packets, one per transport segment
//! - **Receive Reserve**: The transmit path is refused once free descriptors fall to the reserved threshold
//! - **FIFO Suspension**: Blocking allocations wait in arrival order and are resumed on release
//! - **Running Checksums**: Front trims keep a packet's ones-complement sum valid without rescanning
//! - **Partitioned Free Lists**: Descriptors can be carved into separate free lists and redirected between them
//! - **Custom Storage**: Pluggable [`Allocator`] for the backing region
//!
//! ## Example
//!
//! ```rust
//! use netbuf_pool::BufferPoolBuilder;
//!
//! # fn main() -> netbuf_pool::Result<()> {
//! let pool = BufferPoolBuilder::new()
//!     .capacity(200)
//!     .buffer_size(512)
//!     .reserved_threshold(10)
//!     .build()?;
//!
//! // Receive path: take a chain for an incoming frame
//! let mut frame = pool.acquire_chain(1400).expect("pool exhausted");
//! frame.copy_from_slice(&[0u8; 1400]);
//! frame.compute_running_checksum();
//!
//! // Strip a 14-byte link header; the running checksum follows
//! frame.trim(14);
//! assert_eq!(frame.total_len(), 1386);
//!
//! // Descriptors go back to the pool when the packet is dropped
//! drop(frame);
//! assert_eq!(pool.in_use(), 0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Async Example
//!
//! ```rust
//! use netbuf_pool::{BufferPool, SocketId, SocketRegistry};
//!
//! # async fn example(pool: BufferPool, sockets: &dyn SocketRegistry) -> netbuf_pool::Result<()> {
//! // Transmit path: suspends until enough descriptors are free
//! let allocation = pool.allocate(sockets, SocketId(3), 8192, true).await?;
//! assert!(!allocation.is_partial());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(unsafe_op_in_unsafe_fn)]

mod allocator;
mod chain;
pub mod checksum;
mod descriptor;
mod error;
mod free_list;
mod pool;
mod queue;
mod socket;
mod suspend;
mod trim;
mod validate;
mod zero_copy;

pub use allocator::{Allocator, DefaultAllocator, REGION_ALIGN, StaticRegion};
pub use chain::{Packet, ZeroCopyBuffer};
pub use descriptor::{BufFlags, Descriptor, FreeListId, NetBuffer};
pub use error::{Error, Imbalance, Result};
pub use pool::{
    BufferPool, BufferPoolBuilder, DEFAULT_BUFFER_SIZE, DEFAULT_CAPACITY,
    DEFAULT_RESERVED_THRESHOLD, MIN_BUFFER_SIZE, PoolConfig,
};
pub use queue::PacketQueue;
pub use socket::{SocketId, SocketRegistry, SocketSnapshot, Transport};
pub use validate::BufferCensus;
pub use zero_copy::Allocation;
