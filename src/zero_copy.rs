//! Zero-copy allocation for the transmit path.
//!
//! A request is cut into protocol units (one per MSS for streams, one for
//! the whole request otherwise) and each unit gets its own chain. Requests
//! are refused while the free count is at or below the reserved threshold,
//! so reception never starves behind transmit allocations.
//!
//! A blocking request that cannot be served suspends the calling task on
//! the pool's FIFO wait queue. Every release resumes the oldest waiter,
//! which retries from where it left off. After a suspension the socket is
//! looked up again; if it was closed or reused in the meantime the partial
//! allocation is freed and [`Error::SocketClosed`] is returned.

use std::ops::Deref;

use tracing::debug;

use crate::chain::ZeroCopyBuffer;
use crate::descriptor::FreeListId;
use crate::error::{Error, Result};
use crate::pool::{BufferPool, PoolShared};
use crate::socket::{SocketId, SocketRegistry, SocketSnapshot};
use crate::suspend::{WaitToken, WakeReason};

/// Result of a zero-copy allocation.
///
/// Non-blocking requests may come back short; compare
/// [`bytes`](Self::bytes) with [`requested`](Self::requested).
#[derive(Debug)]
pub struct Allocation {
    buffer: ZeroCopyBuffer,
    requested: usize,
}

impl Allocation {
    /// Bytes the caller asked for.
    #[must_use]
    pub const fn requested(&self) -> usize {
        self.requested
    }

    /// Bytes actually allocated.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Returns `true` if fewer bytes than requested were allocated.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.bytes() < self.requested
    }

    /// Takes the allocated segments.
    #[must_use]
    pub fn into_buffer(self) -> ZeroCopyBuffer {
        self.buffer
    }
}

impl Deref for Allocation {
    type Target = ZeroCopyBuffer;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

enum Fill {
    Complete,
    Short,
    Suspended(WaitToken, tokio::sync::oneshot::Receiver<WakeReason>),
}

/// Request parameters fixed when the allocation starts.
struct Request {
    socket: SocketId,
    size: usize,
    unit: usize,
    before: SocketSnapshot,
}

impl Request {
    fn new(
        shared: &PoolShared,
        sockets: &dyn SocketRegistry,
        socket: SocketId,
        size: usize,
    ) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidSize(size));
        }
        let before = sockets
            .snapshot(socket)
            .filter(SocketSnapshot::can_send)
            .ok_or(Error::InvalidSocket(socket))?;
        let unit = match before.transport.unit_cap() {
            Some(0) => return Err(Error::InvalidSize(size)),
            Some(cap) => cap.min(size),
            None => size,
        };
        // A unit is one chain from the default list and must fit there whole.
        if shared.descriptors_for(unit, 0) > shared.partition_size(FreeListId::DEFAULT) {
            return Err(Error::InvalidSize(size));
        }
        Ok(Self {
            socket,
            size,
            unit,
            before,
        })
    }

    fn finish(self, buffer: ZeroCopyBuffer) -> Result<Allocation> {
        if buffer.is_empty() {
            return Err(Error::NoBuffers);
        }
        Ok(Allocation {
            buffer,
            requested: self.size,
        })
    }
}

/// Cancels a suspension record if the waiting future is dropped before it
/// is resumed.
struct WaitGuard<'a> {
    shared: &'a PoolShared,
    token: Option<WaitToken>,
}

impl WaitGuard<'_> {
    fn disarm(&mut self) {
        self.token = None;
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        let Some(token) = self.token else {
            return;
        };
        let cancelled = self.shared.waiters.lock().cancel(token);
        if cancelled {
            debug!(token, "buffer wait cancelled");
        } else {
            // Resumed but never ran; pass the wake-up on.
            self.shared.resume_if_available();
        }
    }
}

impl BufferPool {
    /// Allocates `size` bytes for `socket` without suspending.
    ///
    /// Whole protocol units are taken until the request is met or the pool
    /// refuses; a short result is returned as a partial [`Allocation`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSize`] if `size` is zero, or if one protocol unit
    ///   needs more descriptors than the default free list holds
    /// - [`Error::InvalidSocket`] if `socket` is not open
    /// - [`Error::NoBuffers`] if not even one unit could be allocated
    pub fn try_allocate(
        &self,
        sockets: &dyn SocketRegistry,
        socket: SocketId,
        size: usize,
    ) -> Result<Allocation> {
        let request = Request::new(&self.shared, sockets, socket, size)?;
        let mut buffer = ZeroCopyBuffer::new();
        self.fill(&mut buffer, &request, None);
        request.finish(buffer)
    }

    /// Allocates `size` bytes for `socket`.
    ///
    /// With `blocking` set, the task is suspended whenever the pool refuses
    /// and resumed in FIFO order as descriptors are released, until the
    /// whole request is met. Without it, this behaves like
    /// [`try_allocate`](Self::try_allocate).
    ///
    /// Dropping the returned future cancels the wait and frees whatever was
    /// already allocated, so it can be wrapped in a timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSize`] if `size` is zero, or if one protocol unit
    ///   needs more descriptors than the default free list holds
    /// - [`Error::InvalidSocket`] if `socket` is not open
    /// - [`Error::NoBuffers`] if non-blocking and nothing could be allocated
    /// - [`Error::SocketClosed`] if the socket closed while suspended
    ///
    /// # Example
    ///
    /// ```rust
    /// use netbuf_pool::{BufferPoolBuilder, SocketId, SocketRegistry, SocketSnapshot, Transport};
    ///
    /// struct OneSocket;
    ///
    /// impl SocketRegistry for OneSocket {
    ///     fn snapshot(&self, _socket: SocketId) -> Option<SocketSnapshot> {
    ///         Some(SocketSnapshot {
    ///             generation: 1,
    ///             transport: Transport::Stream { mss: 1460 },
    ///             established: true,
    ///         })
    ///     }
    /// }
    ///
    /// # async fn example() -> netbuf_pool::Result<()> {
    /// let pool = BufferPoolBuilder::new().build()?;
    /// let allocation = pool.allocate(&OneSocket, SocketId(3), 4000, true).await?;
    /// assert_eq!(allocation.segment_count(), 3);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn allocate(
        &self,
        sockets: &dyn SocketRegistry,
        socket: SocketId,
        size: usize,
        blocking: bool,
    ) -> Result<Allocation> {
        let request = Request::new(&self.shared, sockets, socket, size)?;
        let mut buffer = ZeroCopyBuffer::new();
        let mut resumed = false;

        loop {
            let wait = blocking.then_some((request.socket, resumed));
            let (token, receiver) = match self.fill(&mut buffer, &request, wait) {
                Fill::Complete => break,
                Fill::Short => return request.finish(buffer),
                Fill::Suspended(token, receiver) => (token, receiver),
            };

            debug!(socket = %request.socket, token, have = buffer.len(), want = request.size, "suspending for buffers");
            let mut guard = WaitGuard {
                shared: &self.shared,
                token: Some(token),
            };
            let reason = receiver.await;
            guard.disarm();

            let still_open = sockets
                .snapshot(request.socket)
                .is_some_and(|now| now.still_valid(&request.before));
            if !still_open {
                debug!(socket = %request.socket, token, "socket closed while suspended");
                drop(buffer);
                self.shared.resume_if_available();
                return Err(Error::SocketClosed);
            }
            debug!(socket = %request.socket, token, ?reason, "resumed");
            resumed = true;
        }

        if resumed {
            self.shared.resume_if_available();
        }
        request.finish(buffer)
    }

    /// Resumes every task suspended on behalf of `socket` so that it can see
    /// the socket is gone. Returns the number of tasks resumed.
    ///
    /// Called by the socket layer while closing a socket.
    pub fn abandon_waiters(&self, socket: SocketId) -> usize {
        let woken = self.shared.waiters.lock().wake_socket(socket);
        if woken > 0 {
            debug!(%socket, woken, "abandoned buffer waiters");
        }
        woken
    }

    /// Number of tasks suspended waiting for descriptors.
    #[must_use]
    pub fn suspended(&self) -> usize {
        self.shared.waiters.lock().len()
    }

    /// Number of tasks suspended on behalf of `socket`.
    #[must_use]
    pub fn suspended_for(&self, socket: SocketId) -> usize {
        self.shared.waiters.lock().socket_len(socket)
    }

    /// Takes units until `buffer` holds the whole request.
    ///
    /// Each attempt runs under the wait-queue lock, and a failed attempt
    /// registers the waiter before the lock is dropped, so a release
    /// between the two cannot be missed.
    fn fill(
        &self,
        buffer: &mut ZeroCopyBuffer,
        request: &Request,
        wait: Option<(SocketId, bool)>,
    ) -> Fill {
        let reserve = Some(self.reserved_threshold());
        while buffer.len() < request.size {
            let want = request.unit.min(request.size - buffer.len());
            let mut waiters = self.shared.waiters.lock();
            if let Some(segment) = self.acquire_chain_with(FreeListId::DEFAULT, want, 0, reserve) {
                drop(waiters);
                buffer.push(segment);
                continue;
            }
            return match wait {
                Some((socket, at_front)) => {
                    let (token, receiver) = waiters.register(socket, at_front);
                    Fill::Suspended(token, receiver)
                }
                None => Fill::Short,
            };
        }
        Fill::Complete
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::socket::Transport;
    use crate::{BufFlags, BufferPoolBuilder};

    #[derive(Default)]
    struct Sockets(Mutex<HashMap<SocketId, SocketSnapshot>>);

    impl Sockets {
        fn open(&self, socket: SocketId, transport: Transport) {
            self.0.lock().unwrap().insert(
                socket,
                SocketSnapshot {
                    generation: 1,
                    transport,
                    established: true,
                },
            );
        }
    }

    impl Sockets {
        fn close(&self, socket: SocketId) {
            self.0.lock().unwrap().remove(&socket);
        }

        fn reopen(&self, socket: SocketId) {
            if let Some(snapshot) = self.0.lock().unwrap().get_mut(&socket) {
                snapshot.generation += 1;
            }
        }
    }

    impl SocketRegistry for Sockets {
        fn snapshot(&self, socket: SocketId) -> Option<SocketSnapshot> {
            self.0.lock().unwrap().get(&socket).copied()
        }
    }

    const TCP: SocketId = SocketId(1);
    const UDP: SocketId = SocketId(2);

    fn setup(capacity: usize, threshold: usize) -> (BufferPool, Sockets) {
        let pool = BufferPoolBuilder::new()
            .capacity(capacity)
            .buffer_size(128)
            .reserved_threshold(threshold)
            .build()
            .unwrap();
        let sockets = Sockets::default();
        sockets.open(TCP, Transport::Stream { mss: 200 });
        sockets.open(UDP, Transport::Datagram);
        (pool, sockets)
    }

    #[test]
    fn test_stream_request_split_by_mss() {
        let (pool, sockets) = setup(20, 0);
        let allocation = pool.try_allocate(&sockets, TCP, 500).unwrap();

        assert!(!allocation.is_partial());
        assert_eq!(allocation.bytes(), 500);
        let lens: Vec<usize> = allocation.segments().iter().map(|s| s.total_len()).collect();
        assert_eq!(lens, vec![200, 200, 100]);
        assert!(allocation
            .segments()
            .iter()
            .all(|s| s.flags().contains(BufFlags::PARENT)));
        // 2 + 2 + 1 descriptors
        assert_eq!(pool.in_use(), 5);
    }

    #[test]
    fn test_datagram_is_one_unit() {
        let (pool, sockets) = setup(20, 0);
        let allocation = pool.try_allocate(&sockets, UDP, 500).unwrap();
        assert_eq!(allocation.segment_count(), 1);
        assert_eq!(allocation.segments()[0].segment_count(), 4);
    }

    #[test]
    fn test_rejects_bad_requests() {
        let (pool, sockets) = setup(4, 0);
        assert_eq!(
            pool.try_allocate(&sockets, TCP, 0).unwrap_err(),
            Error::InvalidSize(0)
        );
        assert_eq!(
            pool.try_allocate(&sockets, SocketId(99), 10).unwrap_err(),
            Error::InvalidSocket(SocketId(99))
        );
    }

    #[test]
    fn test_reserved_threshold_refuses() {
        let (pool, sockets) = setup(10, 4);

        // Six descriptors usable, the last four are held back
        let held = pool.try_allocate(&sockets, UDP, 6 * 128).unwrap();
        assert_eq!(pool.available(), 4);
        assert_eq!(
            pool.try_allocate(&sockets, UDP, 1).unwrap_err(),
            Error::NoBuffers
        );

        // The reserve is still there for the receive path
        let rx = pool.acquire_chain(4 * 128).unwrap();
        drop((held, rx));
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_partial_non_blocking() {
        let (pool, sockets) = setup(6, 1);

        // Each 200-byte unit takes two descriptors. The check runs before
        // every unit, so the third unit still gets through with two free.
        let allocation = pool.try_allocate(&sockets, TCP, 1000).unwrap();
        assert!(allocation.is_partial());
        assert_eq!(allocation.requested(), 1000);
        assert_eq!(allocation.bytes(), 600);
        assert_eq!(allocation.segment_count(), 3);
        assert_eq!(pool.available(), 0);

        drop(allocation);
        assert_eq!(pool.available(), 6);
    }

    #[tokio::test]
    async fn test_blocking_waits_for_release() {
        let (pool, sockets) = setup(4, 0);
        let sockets = Arc::new(sockets);
        let held = pool.acquire_chain(4 * 128).unwrap();

        let task = {
            let pool = pool.clone();
            let sockets = Arc::clone(&sockets);
            tokio::spawn(async move { pool.allocate(sockets.as_ref(), UDP, 100, true).await })
        };

        while pool.suspended() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.suspended_for(UDP), 1);

        drop(held);
        let allocation = task.await.unwrap().unwrap();
        assert_eq!(allocation.bytes(), 100);
        assert_eq!(pool.suspended(), 0);
    }

    #[tokio::test]
    async fn test_non_blocking_never_suspends() {
        let (pool, sockets) = setup(2, 0);
        let _held = pool.acquire_chain(256).unwrap();
        assert_eq!(
            pool.allocate(&sockets, UDP, 10, false).await.unwrap_err(),
            Error::NoBuffers
        );
        assert_eq!(pool.suspended(), 0);
    }

    #[tokio::test]
    async fn test_dropped_wait_is_cancelled() {
        let (pool, sockets) = setup(2, 0);
        let _held = pool.acquire_chain(256).unwrap();

        let result = timeout(
            Duration::from_millis(20),
            pool.allocate(&sockets, UDP, 10, true),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(pool.suspended(), 0);
    }

    #[test]
    fn test_backpressure_leaves_reserve() {
        let (pool, sockets) = setup(20, 5);
        let mut held = Vec::new();
        for _ in 0..15 {
            held.push(pool.try_allocate(&sockets, UDP, 1).unwrap());
        }
        assert_eq!(
            pool.try_allocate(&sockets, UDP, 1).unwrap_err(),
            Error::NoBuffers
        );
        assert_eq!(pool.available(), 5);
    }

    #[test]
    fn test_unestablished_stream_is_invalid() {
        let (pool, sockets) = setup(4, 0);
        sockets.0.lock().unwrap().get_mut(&TCP).unwrap().established = false;
        assert_eq!(
            pool.try_allocate(&sockets, TCP, 10).unwrap_err(),
            Error::InvalidSocket(TCP)
        );
    }

    async fn wait_for_suspended(pool: &BufferPool, count: usize) {
        while pool.suspended() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_waiters_resume_in_order() {
        let (pool, sockets) = setup(2, 0);
        let sockets = Arc::new(sockets);
        let first = pool.acquire_one().unwrap();
        let second = pool.acquire_one().unwrap();

        let spawn = |socket| {
            let pool = pool.clone();
            let sockets = Arc::clone(&sockets);
            tokio::spawn(async move { pool.allocate(sockets.as_ref(), socket, 50, true).await })
        };

        let a = spawn(UDP);
        wait_for_suspended(&pool, 1).await;
        let b = spawn(TCP);
        wait_for_suspended(&pool, 2).await;

        drop(first);
        let a = timeout(Duration::from_secs(1), a).await.unwrap().unwrap().unwrap();
        assert_eq!(a.bytes(), 50);
        tokio::task::yield_now().await;
        assert!(!b.is_finished());
        assert_eq!(pool.suspended_for(TCP), 1);

        drop(second);
        let b = timeout(Duration::from_secs(1), b).await.unwrap().unwrap().unwrap();
        assert_eq!(b.bytes(), 50);
        assert_eq!(pool.suspended(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_frees_partial() {
        let (pool, sockets) = setup(4, 0);
        let sockets = Arc::new(sockets);
        let _held = pool.acquire_chain(256).unwrap();

        let task = {
            let pool = pool.clone();
            let sockets = Arc::clone(&sockets);
            tokio::spawn(async move { pool.allocate(sockets.as_ref(), TCP, 600, true).await })
        };
        wait_for_suspended(&pool, 1).await;
        // First 200-byte unit was taken before suspending
        assert_eq!(pool.in_use(), 4);

        sockets.close(TCP);
        assert_eq!(pool.abandon_waiters(TCP), 1);
        let result = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(result.unwrap_err(), Error::SocketClosed);
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.suspended(), 0);
        assert_eq!(pool.validate_pool_accounting(), Ok(()));
    }

    #[tokio::test]
    async fn test_reused_socket_is_detected_on_resume() {
        let (pool, sockets) = setup(2, 0);
        let sockets = Arc::new(sockets);
        let held = pool.acquire_chain(256).unwrap();

        let task = {
            let pool = pool.clone();
            let sockets = Arc::clone(&sockets);
            tokio::spawn(async move { pool.allocate(sockets.as_ref(), UDP, 10, true).await })
        };
        wait_for_suspended(&pool, 1).await;

        sockets.reopen(UDP);
        drop(held);
        let result = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(result.unwrap_err(), Error::SocketClosed);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_oversized_unit_is_rejected() {
        let (pool, sockets) = setup(4, 0);

        // One datagram would need eight descriptors out of four
        assert_eq!(
            pool.allocate(&sockets, UDP, 1000, true).await.unwrap_err(),
            Error::InvalidSize(1000)
        );

        // Stream units are sized by the MSS instead
        sockets.open(TCP, Transport::Stream { mss: 600 });
        assert_eq!(
            pool.try_allocate(&sockets, TCP, 1000).unwrap_err(),
            Error::InvalidSize(1000)
        );
        sockets.open(TCP, Transport::Stream { mss: 200 });
        assert_eq!(pool.try_allocate(&sockets, TCP, 1000).unwrap().bytes(), 400);

        assert_eq!(pool.suspended(), 0);
    }

    #[test]
    fn test_unit_sized_to_default_partition() {
        let pool = BufferPoolBuilder::new()
            .capacity(6)
            .buffer_size(128)
            .reserved_threshold(0)
            .partition(2)
            .build()
            .unwrap();
        let sockets = Sockets::default();
        sockets.open(UDP, Transport::Datagram);

        // Six descriptors in the pool, but only four in the default list
        assert_eq!(
            pool.try_allocate(&sockets, UDP, 5 * 128).unwrap_err(),
            Error::InvalidSize(5 * 128)
        );
        assert_eq!(pool.try_allocate(&sockets, UDP, 4 * 128).unwrap().bytes(), 512);
    }

    #[tokio::test]
    async fn test_closed_waiter_passes_wake_on() {
        let (pool, sockets) = setup(2, 0);
        let sockets = Arc::new(sockets);
        let held = pool.acquire_chain(256).unwrap();

        let spawn = |socket| {
            let pool = pool.clone();
            let sockets = Arc::clone(&sockets);
            tokio::spawn(async move { pool.allocate(sockets.as_ref(), socket, 50, true).await })
        };
        let a = spawn(UDP);
        wait_for_suspended(&pool, 1).await;
        let b = spawn(TCP);
        wait_for_suspended(&pool, 2).await;

        // Closed without abandoning its waiters; the release wakes it first
        sockets.close(UDP);
        drop(held);

        let a = timeout(Duration::from_secs(1), a).await.unwrap().unwrap();
        assert_eq!(a.unwrap_err(), Error::SocketClosed);
        let b = timeout(Duration::from_secs(1), b).await.unwrap().unwrap().unwrap();
        assert_eq!(b.bytes(), 50);
        assert_eq!(pool.suspended(), 0);
    }

    #[tokio::test]
    async fn test_dropped_after_wake_passes_wake_on() {
        let (pool, sockets) = setup(2, 0);
        let sockets = Arc::new(sockets);
        let held = pool.acquire_chain(256).unwrap();

        let spawn = |socket| {
            let pool = pool.clone();
            let sockets = Arc::clone(&sockets);
            tokio::spawn(async move { pool.allocate(sockets.as_ref(), socket, 50, true).await })
        };
        let a = spawn(UDP);
        wait_for_suspended(&pool, 1).await;
        let b = spawn(TCP);
        wait_for_suspended(&pool, 2).await;

        // The release wakes `a`, which is aborted before it gets to run
        drop(held);
        assert_eq!(pool.suspended(), 1);
        a.abort();
        assert!(a.await.unwrap_err().is_cancelled());

        let b = timeout(Duration::from_secs(1), b).await.unwrap().unwrap().unwrap();
        assert_eq!(b.bytes(), 50);
        assert_eq!(pool.suspended(), 0);
    }

    #[test]
    fn test_abandon_without_waiters() {
        let (pool, _sockets) = setup(2, 0);
        assert_eq!(pool.abandon_waiters(TCP), 0);
    }
}
