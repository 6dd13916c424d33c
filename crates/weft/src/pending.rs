//! Queue of requests parked on a lane that is out of send resources.

use std::collections::VecDeque;

/// Token identifying a protocol request parked on a lane.
///
/// The transport layer does not interpret the token: the protocol core
/// allocates requests in its own table and hands the table key down when a
/// lane must park the send. This replaces the intrusive queue node the
/// runtime would otherwise embed inside the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingReq {
    /// Opaque request key assigned by the owner of the request table.
    pub req: u64,
}

/// FIFO queue of [`PendingReq`]s owned by a lane endpoint.
///
/// Requests parked on a single lane are retried strictly in the order they
/// were parked; no ordering is promised across lanes.
#[derive(Debug, Default)]
pub struct PendingQueue {
    queue: VecDeque<PendingReq>,
}

impl PendingQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the number of parked requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Gets if no requests are parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Parks a request at the tail of the queue.
    pub fn push_back(&mut self, req: PendingReq) {
        self.queue.push_back(req);
    }

    /// Returns a request to the head of the queue.
    ///
    /// Used when a retry made no progress: the request keeps its place so
    /// FIFO order is preserved.
    pub fn push_front(&mut self, req: PendingReq) {
        self.queue.push_front(req);
    }

    /// Takes the request at the head of the queue.
    pub fn pop_front(&mut self) -> Option<PendingReq> {
        self.queue.pop_front()
    }

    /// Drains the queue in FIFO order, handing each request to `release`.
    ///
    /// The callback must complete the request out-of-band (through its
    /// completion channel); it must not call back into the lane.
    pub fn purge(&mut self, release: &mut dyn FnMut(PendingReq)) {
        while let Some(req) = self.queue.pop_front() {
            release(req);
        }
    }
}
