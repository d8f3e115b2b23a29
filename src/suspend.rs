//! Tasks suspended waiting for free descriptors.
//!
//! Every waiter sits on two lists at once: the pool-wide queue that
//! releases resume from in FIFO order, and the owning socket's queue that
//! [`BufferPool::abandon_waiters`](crate::BufferPool::abandon_waiters) drains
//! when the socket closes. Waking hands the task a [`WakeReason`] over a
//! oneshot channel; the task retries on its own.

use std::collections::{HashMap, VecDeque};

use tokio::sync::oneshot;

use crate::socket::SocketId;

/// Identifies one suspension record.
pub(crate) type WaitToken = u64;

/// Why a suspended task was resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeReason {
    /// A descriptor went back to a free list.
    BufferReleased,
    /// The task's socket is being torn down.
    SocketAbandoned,
}

struct SuspensionRecord {
    token: WaitToken,
    socket: SocketId,
    wake: oneshot::Sender<WakeReason>,
}

/// Pool-wide and per-socket queues of suspended tasks.
#[derive(Default)]
pub(crate) struct SuspensionList {
    next_token: WaitToken,
    queue: VecDeque<SuspensionRecord>,
    by_socket: HashMap<SocketId, VecDeque<WaitToken>>,
}

impl SuspensionList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of tasks suspended on behalf of `socket`.
    pub(crate) fn socket_len(&self, socket: SocketId) -> usize {
        self.by_socket.get(&socket).map_or(0, VecDeque::len)
    }

    /// Enqueues a new waiter for `socket`. A task that was already woken once
    /// and still came up short goes back to the front so it keeps its place.
    pub(crate) fn register(
        &mut self,
        socket: SocketId,
        at_front: bool,
    ) -> (WaitToken, oneshot::Receiver<WakeReason>) {
        let token = self.next_token;
        self.next_token += 1;

        let (wake, receiver) = oneshot::channel();
        let record = SuspensionRecord {
            token,
            socket,
            wake,
        };
        let per_socket = self.by_socket.entry(socket).or_default();
        if at_front {
            self.queue.push_front(record);
            per_socket.push_front(token);
        } else {
            self.queue.push_back(record);
            per_socket.push_back(token);
        }
        (token, receiver)
    }

    /// Resumes the oldest waiter. Records whose task has already gone away
    /// are skipped. Returns the token of the task resumed.
    pub(crate) fn wake_one(&mut self, reason: WakeReason) -> Option<WaitToken> {
        while let Some(record) = self.queue.pop_front() {
            self.forget_socket_entry(record.socket, record.token);
            if record.wake.send(reason).is_ok() {
                return Some(record.token);
            }
        }
        None
    }

    /// Resumes every waiter of `socket` with
    /// [`WakeReason::SocketAbandoned`]. Returns how many were resumed.
    pub(crate) fn wake_socket(&mut self, socket: SocketId) -> usize {
        let Some(tokens) = self.by_socket.remove(&socket) else {
            return 0;
        };

        let mut woken = 0;
        for token in tokens {
            if let Some(pos) = self.queue.iter().position(|r| r.token == token) {
                if let Some(record) = self.queue.remove(pos) {
                    if record.wake.send(WakeReason::SocketAbandoned).is_ok() {
                        woken += 1;
                    }
                }
            }
        }
        woken
    }

    /// Removes a waiter that stopped waiting on its own. Returns `false` if
    /// it had already been resumed.
    pub(crate) fn cancel(&mut self, token: WaitToken) -> bool {
        let Some(pos) = self.queue.iter().position(|r| r.token == token) else {
            return false;
        };
        match self.queue.remove(pos) {
            Some(record) => {
                self.forget_socket_entry(record.socket, token);
                true
            }
            None => false,
        }
    }

    fn forget_socket_entry(&mut self, socket: SocketId, token: WaitToken) {
        if let Some(tokens) = self.by_socket.get_mut(&socket) {
            tokens.retain(|&t| t != token);
            if tokens.is_empty() {
                self.by_socket.remove(&socket);
            }
        }
    }
}
