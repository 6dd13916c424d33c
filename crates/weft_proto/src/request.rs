//! Requests: the unit of work tracked by a worker.
//!
//! A request is created by the upper layer when an operation is posted and
//! released by the core when the operation completes or is canceled.
//! Requests live in a per-worker table and are addressed by [`ReqId`];
//! lanes park the raw id when they must defer a send, and completion is
//! delivered through a channel owned by the request, never by calling back
//! into a lane.

use std::fmt;

use octs::Bytes;
use weft::{
    error::{Completion, Error},
    sysv::SysvSegment,
};

use crate::{
    ep::{config::LaneIndex, EpId},
    tag::Tag,
    worker::Worker,
};

/// Handle of a request inside its worker's table.
///
/// The high half carries a generation stamp, so an id kept across the
/// request's completion never aliases a newer request that reused the
/// slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReqId(pub(crate) u64);

impl ReqId {
    pub(crate) fn new(slot: u32, generation: u32) -> Self {
        Self(u64::from(generation) << 32 | u64::from(slot))
    }

    pub(crate) fn slot(self) -> u32 {
        self.0 as u32
    }

    pub(crate) fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Gets the raw table key, as parked on lanes.
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// Rebuilds an id from [`ReqId::to_raw`].
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Function driving one step of a parked or freshly started request.
///
/// Returns `Ok` when the step completed; [`Error::NoResource`] parks the
/// request for a later retry; any other error fails the request.
pub type ProgressFn = fn(&mut Worker, ReqId) -> Result<(), Error>;

/// Where the payload of an outgoing message lives.
#[derive(Debug)]
pub enum SendBuffer {
    /// Payload in an owned shared-memory segment; peers on the same host
    /// can pull it zero-copy through the packed remote key.
    Sysv {
        /// Segment holding the payload, starting at its base address.
        seg: SysvSegment,
        /// Payload length in bytes.
        len: usize,
    },
    /// Payload in plain memory with no remote key; only header-level
    /// exchange is possible.
    Inline(Bytes),
}

impl SendBuffer {
    /// Gets the payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Sysv { len, .. } => *len,
            Self::Inline(data) => data.len(),
        }
    }

    /// Gets if the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gets the payload address in the owning process, as shipped inside
    /// a rendezvous header.
    #[must_use]
    pub fn address(&self) -> u64 {
        match self {
            Self::Sysv { seg, .. } => seg.address().as_ptr() as u64,
            Self::Inline(data) => data.as_ptr() as u64,
        }
    }
}

/// Memory kind of a user buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MemType {
    /// Ordinary host memory.
    #[default]
    Host,
}

/// Send-side request state.
#[derive(Debug)]
pub(crate) struct SendState {
    pub ep: EpId,
    pub lane: LaneIndex,
    pub tag: Tag,
    pub buffer: SendBuffer,
    pub mem_type: MemType,
    /// Progress function retried by the pending discipline. Must be set
    /// before the request is parked on a lane.
    pub progress: Option<ProgressFn>,
    /// Wire id bound while an acknowledgement is outstanding.
    pub send_id: Option<u64>,
    /// Remote key bytes packed when the buffer was registered.
    pub packed_rkey: Option<Bytes>,
    /// Set once protocol initialization (id binding + registration) ran.
    pub proto_initialized: bool,
}

/// Receive-side request state.
#[derive(Debug)]
pub(crate) struct RecvState {
    pub tag: Tag,
    pub tag_mask: u64,
    pub buffer: Vec<u8>,
    /// Tag observed on the matched rendezvous request-to-send.
    pub sender_tag: Option<Tag>,
    /// Length observed on the matched rendezvous request-to-send.
    pub length: Option<u64>,
    /// The receive was pre-posted to a transport with hardware tag
    /// matching and may need a force-cancel when software matching wins.
    pub offloaded: bool,
}

/// Internal acknowledgement send, driven through the same pending
/// discipline as user sends.
#[derive(Debug)]
pub(crate) struct AckState {
    pub ep: EpId,
    pub lane: LaneIndex,
    /// Peer request id echoed in the acknowledgement header.
    pub req_id: u64,
    /// Wire status byte carried to the peer.
    pub status: u8,
    pub progress: Option<ProgressFn>,
}

#[derive(Debug)]
pub(crate) enum ReqKind {
    Send(SendState),
    Recv(RecvState),
    Ack(AckState),
}

/// Everything a completed receive hands back to its caller.
#[derive(Debug)]
pub struct RecvOutcome {
    /// Final status of the receive.
    pub status: Completion,
    /// Tag observed on the matched message, if one arrived.
    pub sender_tag: Option<Tag>,
    /// Payload length announced by the sender, if one arrived.
    pub length: Option<u64>,
    /// The receive buffer, returned to its owner.
    pub buffer: Vec<u8>,
}

/// Completion channel of a request, matching its kind.
pub(crate) enum DoneChannel {
    Completion(oneshot::Sender<Completion>),
    Recv(oneshot::Sender<RecvOutcome>),
}

impl fmt::Debug for DoneChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Completion(_) => f.write_str("Completion(..)"),
            Self::Recv(_) => f.write_str("Recv(..)"),
        }
    }
}

/// One entry of the worker's request table.
#[derive(Debug)]
pub(crate) struct Request {
    pub kind: ReqKind,
    /// Completion channel; [`None`] for internal requests.
    pub done: Option<DoneChannel>,
}

impl Request {
    pub(crate) fn new_send(
        ep: EpId,
        lane: LaneIndex,
        tag: Tag,
        buffer: SendBuffer,
        done: oneshot::Sender<Completion>,
    ) -> Self {
        Self {
            kind: ReqKind::Send(SendState {
                ep,
                lane,
                tag,
                buffer,
                mem_type: MemType::Host,
                progress: None,
                send_id: None,
                packed_rkey: None,
                proto_initialized: false,
            }),
            done: Some(DoneChannel::Completion(done)),
        }
    }

    pub(crate) fn new_recv(
        tag: Tag,
        tag_mask: u64,
        buffer: Vec<u8>,
        done: oneshot::Sender<RecvOutcome>,
    ) -> Self {
        Self {
            kind: ReqKind::Recv(RecvState {
                tag,
                tag_mask,
                buffer,
                sender_tag: None,
                length: None,
                offloaded: false,
            }),
            done: Some(DoneChannel::Recv(done)),
        }
    }

    pub(crate) fn new_ack(
        ep: EpId,
        lane: LaneIndex,
        req_id: u64,
        status: u8,
        progress: ProgressFn,
    ) -> Self {
        Self {
            kind: ReqKind::Ack(AckState {
                ep,
                lane,
                req_id,
                status,
                progress: Some(progress),
            }),
            done: None,
        }
    }

    pub(crate) fn send(&self) -> Option<&SendState> {
        match &self.kind {
            ReqKind::Send(state) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn send_mut(&mut self) -> Option<&mut SendState> {
        match &mut self.kind {
            ReqKind::Send(state) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn recv_mut(&mut self) -> Option<&mut RecvState> {
        match &mut self.kind {
            ReqKind::Recv(state) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn ack(&self) -> Option<&AckState> {
        match &self.kind {
            ReqKind::Ack(state) => Some(state),
            _ => None,
        }
    }

    /// Gets the progress function the pending discipline retries for this
    /// request.
    pub(crate) fn progress_fn(&self) -> Option<ProgressFn> {
        match &self.kind {
            ReqKind::Send(state) => state.progress,
            ReqKind::Ack(state) => state.progress,
            ReqKind::Recv(_) => None,
        }
    }
}

/// Caller-side handle of a posted send.
///
/// Completion is pulled, not pushed: the core sends the final status down
/// the request's channel and the caller observes it here.
pub struct RequestHandle {
    pub(crate) id: ReqId,
    pub(crate) rx: oneshot::Receiver<Completion>,
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RequestHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

impl RequestHandle {
    /// Gets the id of the underlying request, usable for cancellation.
    #[must_use]
    pub const fn id(&self) -> ReqId {
        self.id
    }

    /// Takes the completion status if the operation has finished.
    pub fn try_completion(&mut self) -> Option<Completion> {
        self.rx.try_recv().ok()
    }
}

/// Caller-side handle of a posted receive.
pub struct RecvHandle {
    pub(crate) id: ReqId,
    pub(crate) rx: oneshot::Receiver<RecvOutcome>,
}

impl fmt::Debug for RecvHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RecvHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

impl RecvHandle {
    /// Gets the id of the underlying request.
    #[must_use]
    pub const fn id(&self) -> ReqId {
        self.id
    }

    /// Takes the outcome - status, observed sender tag and length, and
    /// the buffer - if the receive has finished.
    pub fn try_outcome(&mut self) -> Option<RecvOutcome> {
        self.rx.try_recv().ok()
    }
}

/// Slotted table of live requests with generation-stamped ids.
#[derive(Debug, Default)]
pub(crate) struct ReqTable {
    slots: Vec<(u32, Option<Request>)>,
    free: Vec<u32>,
}

impl ReqTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, req: Request) -> ReqId {
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.1 = Some(req);
            ReqId::new(slot, entry.0)
        } else {
            let slot = self.slots.len() as u32;
            self.slots.push((0, Some(req)));
            ReqId::new(slot, 0)
        }
    }

    pub(crate) fn get(&self, id: ReqId) -> Option<&Request> {
        self.slots
            .get(id.slot() as usize)
            .filter(|(generation, _)| *generation == id.generation())
            .and_then(|(_, req)| req.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: ReqId) -> Option<&mut Request> {
        self.slots
            .get_mut(id.slot() as usize)
            .filter(|(generation, _)| *generation == id.generation())
            .and_then(|(_, req)| req.as_mut())
    }

    pub(crate) fn remove(&mut self, id: ReqId) -> Option<Request> {
        let entry = self.slots.get_mut(id.slot() as usize)?;
        if entry.0 != id.generation() {
            return None;
        }
        let req = entry.1.take()?;
        entry.0 = entry.0.wrapping_add(1);
        self.free.push(id.slot());
        Some(req)
    }

    /// Gets the number of live requests.
    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy(done: oneshot::Sender<RecvOutcome>) -> Request {
        Request::new_recv(Tag(1), u64::MAX, Vec::new(), done)
    }

    #[test]
    fn stale_id_does_not_alias_reused_slot() {
        let mut table = ReqTable::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();

        let first = table.insert(dummy(tx1));
        assert!(table.remove(first).is_some());

        let second = table.insert(dummy(tx2));
        assert_eq!(first.slot(), second.slot());
        assert_ne!(first, second);

        assert!(table.get(first).is_none());
        assert!(table.remove(first).is_none());
        assert!(table.get(second).is_some());
        assert_eq!(1, table.len());
    }

    #[test]
    fn raw_round_trip() {
        let id = ReqId::new(7, 3);
        assert_eq!(id, ReqId::from_raw(id.to_raw()));
    }
}
