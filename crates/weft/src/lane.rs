//! Transport lane endpoints and the narrow operation surface the protocol
//! core drives them through.
//!
//! A *lane* is one underlying transport endpoint - a shared-memory
//! channel, a TCP socket, or a stub that buffers traffic until wireup
//! rebinds it to a real transport. An endpoint in the protocol core
//! aggregates several lanes and picks one per operation.

use octs::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::{
    error::Error,
    flow::CreditBucket,
    pending::{PendingQueue, PendingReq},
    tcp::TcpLane,
};

/// Default size reserved for a packed active message.
const DEFAULT_AM_CAP: usize = 256;

/// Operations every lane endpoint implements.
///
/// This is the entire surface the protocol core needs: park a request,
/// drain parked requests, send a packed active message, tear down. The
/// concrete lane set is sealed in [`LaneEndpoint`]; dispatch happens by
/// `match` at the lane-call sites.
pub trait LaneOps {
    /// Parks `req` on this lane, to be retried once the lane regains send
    /// resources.
    ///
    /// # Errors
    ///
    /// If the lane currently *has* send resources the request is handed
    /// back and the caller must retry the operation immediately instead of
    /// parking it.
    fn pending_add(&mut self, req: PendingReq) -> Result<(), PendingReq>;

    /// Drains every parked request in FIFO order into `release`.
    ///
    /// The callback completes each request through its completion channel;
    /// it must not call back into the lane.
    fn pending_purge(&mut self, release: &mut dyn FnMut(PendingReq));

    /// Sends an active message, letting `pack` write the payload into a
    /// scratch buffer owned by the lane.
    ///
    /// Returns the packed payload length.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::NoResource`] when the lane is out of send
    /// resources; the caller should park the request with
    /// [`LaneOps::pending_add`].
    fn am_bcopy(
        &mut self,
        id: u8,
        pack: &mut dyn FnMut(&mut BytesMut),
    ) -> Result<usize, Error>;

    /// Releases transport resources. Parked requests must have been purged
    /// first.
    fn destroy(&mut self);
}

/// The sealed set of lane endpoint implementations.
#[derive(Debug)]
pub enum LaneEndpoint {
    /// Placeholder lane buffering traffic until wireup completes.
    Stub(StubLane),
    /// Socket-backed lane.
    Tcp(TcpLane),
}

impl LaneEndpoint {
    fn ops(&mut self) -> &mut dyn LaneOps {
        match self {
            Self::Stub(lane) => lane,
            Self::Tcp(lane) => lane,
        }
    }

    /// See [`LaneOps::pending_add`].
    pub fn pending_add(&mut self, req: PendingReq) -> Result<(), PendingReq> {
        self.ops().pending_add(req)
    }

    /// See [`LaneOps::pending_purge`].
    pub fn pending_purge(&mut self, release: &mut dyn FnMut(PendingReq)) {
        self.ops().pending_purge(release);
    }

    /// See [`LaneOps::am_bcopy`].
    pub fn am_bcopy(
        &mut self,
        id: u8,
        pack: &mut dyn FnMut(&mut BytesMut),
    ) -> Result<usize, Error> {
        self.ops().am_bcopy(id, pack)
    }

    /// See [`LaneOps::destroy`].
    pub fn destroy(&mut self) {
        self.ops().destroy();
    }

    /// Gets the flow-control bucket of this lane.
    #[must_use]
    pub fn flow(&self) -> &CreditBucket {
        match self {
            Self::Stub(lane) => &lane.flow,
            Self::Tcp(lane) => &lane.flow,
        }
    }

    /// Gets the flow-control bucket of this lane, mutably.
    ///
    /// Refilling it is how the progress loop (or a test) signals that the
    /// transport completed earlier sends.
    pub fn flow_mut(&mut self) -> &mut CreditBucket {
        match self {
            Self::Stub(lane) => &mut lane.flow,
            Self::Tcp(lane) => &mut lane.flow,
        }
    }

    /// Gets the number of requests parked on this lane.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        match self {
            Self::Stub(lane) => lane.pending.len(),
            Self::Tcp(lane) => lane.pending.len(),
        }
    }

    /// Takes the request at the head of this lane's pending queue.
    pub fn pending_pop(&mut self) -> Option<PendingReq> {
        match self {
            Self::Stub(lane) => lane.pending.pop_front(),
            Self::Tcp(lane) => lane.pending.pop_front(),
        }
    }

    /// Returns a request to the head of this lane's pending queue.
    pub fn pending_requeue(&mut self, req: PendingReq) {
        match self {
            Self::Stub(lane) => lane.pending.push_front(req),
            Self::Tcp(lane) => lane.pending.push_front(req),
        }
    }
}

/// Lane used while a peer's transports are not yet known.
///
/// Outgoing active messages are buffered in order; once wireup resolves
/// the real transport set, the owner drains the buffer and replays it on a
/// real lane.
#[derive(Debug)]
pub struct StubLane {
    pub(crate) pending: PendingQueue,
    pub(crate) flow: CreditBucket,
    outbox: Vec<(u8, Bytes)>,
}

impl Default for StubLane {
    fn default() -> Self {
        Self::new()
    }
}

impl StubLane {
    /// Creates a stub lane with effectively unlimited send credit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: PendingQueue::new(),
            flow: CreditBucket::new(usize::MAX),
            outbox: Vec::new(),
        }
    }

    /// Gets the buffered messages, oldest first.
    #[must_use]
    pub fn outbox(&self) -> &[(u8, Bytes)] {
        &self.outbox
    }

    /// Takes the buffered messages, oldest first.
    pub fn drain_outbox(&mut self) -> Vec<(u8, Bytes)> {
        std::mem::take(&mut self.outbox)
    }
}

impl LaneOps for StubLane {
    fn pending_add(&mut self, req: PendingReq) -> Result<(), PendingReq> {
        if self.flow.has(1) {
            return Err(req);
        }
        self.pending.push_back(req);
        Ok(())
    }

    fn pending_purge(&mut self, release: &mut dyn FnMut(PendingReq)) {
        self.pending.purge(release);
    }

    fn am_bcopy(
        &mut self,
        id: u8,
        pack: &mut dyn FnMut(&mut BytesMut),
    ) -> Result<usize, Error> {
        if self.flow.consume(1).is_err() {
            return Err(Error::NoResource);
        }

        let mut buf = BytesMut::with_capacity(DEFAULT_AM_CAP);
        pack(&mut buf);
        let len = buf.len();
        trace!(id, len, "buffered active message on stub lane");
        self.outbox.push((id, buf.freeze()));
        Ok(len)
    }

    fn destroy(&mut self) {
        debug_assert!(self.pending.is_empty(), "destroying lane with parked requests");
        if !self.outbox.is_empty() {
            debug!(dropped = self.outbox.len(), "destroying stub lane with buffered messages");
        }
        self.outbox.clear();
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn stub_buffers_messages_in_order() {
        let mut lane = StubLane::new();
        lane.am_bcopy(7, &mut |buf| buf.extend_from_slice(b"one")).unwrap();
        lane.am_bcopy(9, &mut |buf| buf.extend_from_slice(b"two")).unwrap();

        let outbox = lane.drain_outbox();
        assert_eq!(2, outbox.len());
        assert_eq!((7, Bytes::from_static(b"one")), outbox[0]);
        assert_eq!((9, Bytes::from_static(b"two")), outbox[1]);
        assert!(lane.outbox().is_empty());
    }

    #[test]
    fn pending_add_rejects_while_credit_remains() {
        let mut lane = StubLane::new();
        assert_matches!(lane.pending_add(PendingReq { req: 1 }), Err(PendingReq { req: 1 }));
    }

    #[test]
    fn pending_add_queues_once_exhausted() {
        let mut lane = StubLane::new();
        lane.flow.set_cap(0);
        assert_matches!(lane.am_bcopy(1, &mut |_| {}), Err(Error::NoResource));
        assert_matches!(lane.pending_add(PendingReq { req: 5 }), Ok(()));
        assert_eq!(1, lane.pending.len());

        let mut released = Vec::new();
        lane.pending_purge(&mut |req| released.push(req.req));
        assert_eq!(vec![5], released);
    }
}
