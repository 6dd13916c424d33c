//! Tag rendezvous protocol: request-to-send dispatch, matching,
//! cancellation, and the send-side progress function.
//!
//! A rendezvous send binds a wire id, registers its buffer, and ships an
//! [`RtsHdr`] (plus packed remote key) on the active-message lane. The
//! receiver matches the tag against its expected queue - or parks the
//! header as an unexpected descriptor - pulls the payload through the
//! remote key, and answers with an [`AtsHdr`] that completes the sender.
//! Cancellation is symmetric and id-keyed: a second RTS with the canceled
//! opcode and the same ids removes the parked descriptor and is
//! acknowledged with a canceled status.

use std::convert::Infallible;

use octs::{BufTooShortOr, Bytes, BytesMut, Decode, Encode, FixedEncodeLen, Read, Write};
use tracing::{debug, trace, warn};
use weft::{
    error::{completion_from_wire, completion_to_wire, Completion, Error},
    sysv::{SysvRemoteSeg, SysvRkey},
};

use crate::{
    ep::config::LaneIndex,
    request::{ReqId, Request, SendBuffer},
    tag::{
        matching::{RecvDesc, RecvDescFlags},
        offload, Tag,
    },
    worker::{AmId, Worker},
};

/// Opcode of a rendezvous request-to-send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtsOpcode {
    /// Normal request-to-send.
    TagOk,
    /// The sender cancels a previously sent request-to-send.
    TagCanceled,
}

impl RtsOpcode {
    /// Gets the wire byte of this opcode.
    #[must_use]
    pub const fn to_raw(self) -> u8 {
        match self {
            Self::TagOk => 1,
            Self::TagCanceled => 2,
        }
    }

    /// Decodes a wire byte.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::TagOk,
            2 => Self::TagCanceled,
            _ => return None,
        })
    }
}

/// The sender-side identity of a request, carried in every rendezvous
/// header so the peer can address replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct RemoteRequest {
    /// The receiver's id for its endpoint toward the sender.
    pub ep_id: u64,
    /// The sender's bound request id.
    pub req_id: u64,
}

impl FixedEncodeLen for RemoteRequest {
    const ENCODE_LEN: usize = u64::ENCODE_LEN + u64::ENCODE_LEN;
}

impl Encode for RemoteRequest {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.ep_id)?;
        dst.write(&self.req_id)?;
        Ok(())
    }
}

impl Decode for RemoteRequest {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            ep_id: src.read()?,
            req_id: src.read()?,
        })
    }
}

/// Rendezvous request-to-send header.
///
/// On the wire it is followed by the packed remote key of the send
/// buffer, whose length is whatever remains of the active message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct RtsHdr {
    /// Raw opcode byte; see [`RtsOpcode`].
    pub opcode: u8,
    /// Payload size in bytes.
    pub size: u64,
    /// Identity of the sending request.
    pub sreq: RemoteRequest,
    /// Match tag.
    pub tag: Tag,
    /// Payload address in the sender's address space, translated through
    /// the packed remote key.
    pub address: u64,
}

impl FixedEncodeLen for RtsHdr {
    const ENCODE_LEN: usize = u8::ENCODE_LEN
        + u64::ENCODE_LEN
        + RemoteRequest::ENCODE_LEN
        + u64::ENCODE_LEN
        + Tag::ENCODE_LEN;
}

impl Encode for RtsHdr {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.opcode)?;
        dst.write(&self.size)?;
        dst.write(&self.sreq)?;
        dst.write(&self.tag)?;
        dst.write(&self.address)?;
        Ok(())
    }
}

impl Decode for RtsHdr {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            opcode: src.read()?,
            size: src.read()?,
            sreq: src.read()?,
            tag: src.read()?,
            address: src.read()?,
        })
    }
}

/// Rendezvous acknowledgement header, completing the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct AtsHdr {
    /// The sender's request id, as carried in the request-to-send.
    pub req_id: u64,
    /// Wire status byte; `0` for success.
    pub status: u8,
}

impl FixedEncodeLen for AtsHdr {
    const ENCODE_LEN: usize = u64::ENCODE_LEN + u8::ENCODE_LEN;
}

impl Encode for AtsHdr {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.req_id)?;
        dst.write(&self.status)?;
        Ok(())
    }
}

impl Decode for AtsHdr {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            req_id: src.read()?,
            status: src.read()?,
        })
    }
}

/// Handles an incoming request-to-send active message.
///
/// Cancellations remove the matching unexpected descriptor and
/// acknowledge with a canceled status. Normal requests match the expected
/// queue and start the receive engine, or park as an unexpected
/// descriptor; a request from an endpoint this worker cannot resolve is
/// silently dropped.
///
/// # Errors
///
/// Errors with [`Error::Protocol`] on a malformed header and
/// [`Error::NoMemory`] when the unexpected-descriptor cap is reached.
pub fn process_rts(worker: &mut Worker, packed: Bytes) -> Result<(), Error> {
    let mut src = packed.clone();
    let hdr = src.read::<RtsHdr>().map_err(|_| Error::Protocol)?;
    let rkey = src;

    match RtsOpcode::from_raw(hdr.opcode) {
        Some(RtsOpcode::TagCanceled) => {
            unexp_cancel(worker, &hdr);
            return Ok(());
        }
        Some(RtsOpcode::TagOk) => {}
        None => return Err(Error::Protocol),
    }

    if let Some(rreq) = worker.tm.exp_search(hdr.tag) {
        // the transport matcher saw this message as unexpected even
        // though software matching found a receive
        offload::try_cancel(worker, rreq, true);
        rndv_matched(worker, rreq, &hdr, rkey);
        worker.stats.rndv_exp += 1;
        return Ok(());
    }

    if worker.ep_by_id(hdr.sreq.ep_id).is_none() {
        debug!(
            tag = %hdr.tag,
            ep_id = hdr.sreq.ep_id,
            "dropping rts from unknown source endpoint"
        );
        return Ok(());
    }

    let desc = RecvDesc {
        flags: RecvDescFlags::RNDV,
        tag: hdr.tag,
        ep_id: hdr.sreq.ep_id,
        req_id: hdr.sreq.req_id,
        payload: packed,
    };
    worker.tm.unexp_recv(desc)?;
    worker.stats.rndv_unexp += 1;
    Ok(())
}

/// Hands a matched request-to-send to the rendezvous receive engine.
///
/// Stamps the sender tag and length on the receive request, then
/// dispatches to the protocol-select or legacy path; the two are
/// observationally equivalent and differ only in which lane carries the
/// payload.
pub(crate) fn rndv_matched(worker: &mut Worker, rreq: ReqId, hdr: &RtsHdr, rkey: Bytes) {
    if let Some(recv) = worker.reqs.get_mut(rreq).and_then(Request::recv_mut) {
        recv.sender_tag = Some(hdr.tag);
        recv.length = Some(hdr.size);
    }

    if worker.context().config.proto_enable {
        proto_rndv_receive(worker, rreq, hdr, rkey);
    } else {
        rndv_receive(worker, rreq, hdr, rkey);
    }
}

/// Protocol-select receive path: prefers a remote-memory lane for the
/// payload pull.
fn proto_rndv_receive(worker: &mut Worker, rreq: ReqId, hdr: &RtsHdr, rkey: Bytes) {
    let lane = worker.ep_by_id(hdr.sreq.ep_id).and_then(|ep| {
        let endpoint = worker.ep(ep)?;
        worker
            .ep_config(endpoint.cfg_index())
            .rma_lanes
            .first()
            .copied()
            .or(endpoint.am_lane())
    });
    rndv_recv_payload(worker, rreq, hdr, &rkey, lane);
}

/// Legacy receive path: the payload moves on the active-message lane.
fn rndv_receive(worker: &mut Worker, rreq: ReqId, hdr: &RtsHdr, rkey: Bytes) {
    let lane = worker
        .ep_by_id(hdr.sreq.ep_id)
        .and_then(|ep| worker.ep(ep))
        .and_then(crate::ep::Endpoint::am_lane);
    rndv_recv_payload(worker, rreq, hdr, &rkey, lane);
}

/// Pulls the payload, acknowledges the sender, and completes the
/// receive.
fn rndv_recv_payload(
    worker: &mut Worker,
    rreq: ReqId,
    hdr: &RtsHdr,
    rkey: &Bytes,
    lane: Option<LaneIndex>,
) {
    trace!(req = ?rreq, ?lane, size = hdr.size, "pulling rendezvous payload");
    let pulled = pull_payload(worker, rreq, hdr, rkey);

    // local truncation is not the sender's problem; its buffer was
    // consumed either way
    let ats_status = match pulled {
        Err(Error::Truncated) => Ok(()),
        other => other,
    };
    send_ack(worker, hdr.sreq.ep_id, hdr.sreq.req_id, ats_status);
    worker.complete(rreq, pulled);
}

/// Copies the payload out of the sender's registered memory.
fn pull_payload(worker: &mut Worker, rreq: ReqId, hdr: &RtsHdr, rkey: &Bytes) -> Completion {
    if rkey.is_empty() {
        // the sender shipped no remote key; nothing to pull from
        return Err(Error::Unsupported);
    }
    let mut src = rkey.clone();
    let rkey = src.read::<SysvRkey>().map_err(|_| Error::Protocol)?;
    let remote = SysvRemoteSeg::attach(&rkey)?;

    let Some(recv) = worker.reqs.get_mut(rreq).and_then(Request::recv_mut) else {
        return Err(Error::Canceled);
    };
    let len = hdr.size as usize;
    let copy_len = len.min(recv.buffer.len());
    unsafe { remote.get(hdr.address, &mut recv.buffer[..copy_len]) };

    if len > recv.buffer.len() {
        Err(Error::Truncated)
    } else {
        Ok(())
    }
}

/// Sends an acknowledgement to the endpoint identified by a wire id,
/// through an internal request so lane backpressure is honored.
pub(crate) fn send_ack(worker: &mut Worker, ep_id: u64, req_id: u64, completion: Completion) {
    let Some(ep) = worker.ep_by_id(ep_id) else {
        debug!(req_id, "dropping acknowledgement for unknown endpoint");
        return;
    };
    let Some(lane) = worker.ep(ep).and_then(crate::ep::Endpoint::am_lane) else {
        debug!(req_id, "dropping acknowledgement: endpoint has no active-message lane");
        return;
    };

    let rid = worker.reqs.insert(Request::new_ack(
        ep,
        lane,
        req_id,
        completion_to_wire(completion),
        ack_progress,
    ));
    match ack_progress(worker, rid) {
        Ok(()) => {}
        Err(Error::NoResource) => worker.ep_add_pending(ep, lane, rid, false),
        Err(err) => {
            warn!(%err, req_id, "failed to send acknowledgement");
            worker.complete(rid, Err(err));
        }
    }
}

/// Progress function of an internal acknowledgement send.
fn ack_progress(worker: &mut Worker, rid: ReqId) -> Result<(), Error> {
    let Some(ack) = worker.reqs.get(rid).and_then(Request::ack) else {
        return Ok(());
    };
    let (ep, lane, req_id, status) = (ack.ep, ack.lane, ack.req_id, ack.status);

    let hdr = AtsHdr { req_id, status };
    let Some(lane_ep) = worker.ep_lane_mut(ep, lane) else {
        worker.complete(rid, Err(Error::Canceled));
        return Ok(());
    };
    lane_ep.am_bcopy(AmId::RndvAts.to_raw(), &mut |buf| {
        let _ = buf.write(&hdr);
    })?;

    trace!(req_id, status, "sent rendezvous acknowledgement");
    worker.complete(rid, Ok(()));
    Ok(())
}

/// Removes the unexpected descriptor a cancellation refers to and
/// acknowledges the cancellation.
///
/// Finding nothing is normal: the descriptor may already have matched an
/// expected receive, in which case the payload protocol proceeds and the
/// cancellation is a no-op here.
fn unexp_cancel(worker: &mut Worker, hdr: &RtsHdr) {
    let removed = worker.tm.unexp_remove_where(hdr.tag, |desc| {
        desc.flags.contains(RecvDescFlags::RNDV)
            && desc.tag == hdr.tag
            && desc.ep_id == hdr.sreq.ep_id
            && desc.req_id == hdr.sreq.req_id
    });

    match removed {
        Some(desc) => {
            debug!(
                tag = %hdr.tag,
                ep_id = hdr.sreq.ep_id,
                req_id = hdr.sreq.req_id,
                "canceling unexpected rendezvous descriptor"
            );
            send_ack(worker, hdr.sreq.ep_id, hdr.sreq.req_id, Err(Error::Canceled));
            drop(desc);
        }
        None => debug!(
            tag = %hdr.tag,
            ep_id = hdr.sreq.ep_id,
            req_id = hdr.sreq.req_id,
            "unexpected descriptor for canceled rts not found"
        ),
    }
}

/// Starts a rendezvous send: resolves the peer, binds the wire id, and
/// arms the request-to-send progress function.
///
/// # Errors
///
/// Errors with [`Error::Unreachable`] while the peer's endpoint id is
/// unknown, and with [`Error::Unsupported`] when routed at a dedicated
/// tag lane (no built-in transport provides one).
pub(crate) fn send_start(worker: &mut Worker, sreq: ReqId) -> Result<(), Error> {
    let Some(send) = worker.reqs.get(sreq).and_then(Request::send) else {
        return Err(Error::Canceled);
    };
    let (ep, lane, tag) = (send.ep, send.lane, send.tag);
    trace!(
        req = ?sreq,
        ep = ep.to_raw(),
        %tag,
        len = send.buffer.len(),
        mem_type = ?send.mem_type,
        "starting rendezvous send"
    );

    worker.ep_resolve_remote_id(ep, lane)?;
    worker.bind_send_id(sreq);

    let has_tag_lane = {
        let cfg_index = worker.ep(ep).ok_or(Error::Unreachable)?.cfg_index();
        worker.ep_config(cfg_index).tag_lane.is_some()
    };
    if has_tag_lane {
        offload::start_rndv(worker, sreq)
    } else {
        debug_assert_eq!(
            worker.ep(ep).and_then(crate::ep::Endpoint::am_lane),
            Some(lane),
            "rendezvous rts must travel on the active-message lane"
        );
        if let Some(send) = worker.reqs.get_mut(sreq).and_then(Request::send_mut) {
            send.progress = Some(rts_progress);
        }
        reg_send_buffer(worker, sreq);
        Ok(())
    }
}

/// Registers the send buffer for the rendezvous payload, packing its
/// remote key.
pub(crate) fn reg_send_buffer(worker: &mut Worker, sreq: ReqId) {
    let Some(send) = worker.reqs.get_mut(sreq).and_then(Request::send_mut) else {
        return;
    };
    let packed = match &send.buffer {
        SendBuffer::Sysv { seg, .. } => {
            let mut buf = BytesMut::with_capacity(SysvRkey::ENCODE_LEN);
            let _ = buf.write(&seg.pack_rkey());
            buf.freeze()
        }
        SendBuffer::Inline(_) => Bytes::new(),
    };
    send.packed_rkey = Some(packed);
    send.proto_initialized = true;
}

/// Packs and sends the request-to-send on the active-message lane.
///
/// On success the request stays bound in the sender's id table awaiting
/// either an acknowledgement or a cancellation.
///
/// # Errors
///
/// Errors with [`Error::NoResource`] when the lane is out of send
/// resources; the pending discipline retries.
pub(crate) fn rts_progress(worker: &mut Worker, sreq: ReqId) -> Result<(), Error> {
    let Some(send) = worker.reqs.get(sreq).and_then(Request::send) else {
        return Ok(());
    };
    let (ep, lane, tag) = (send.ep, send.lane, send.tag);
    let size = send.buffer.len() as u64;
    let address = send.buffer.address();
    let Some(req_id) = send.send_id else {
        debug_assert!(false, "rts progress without a bound send id");
        return Ok(());
    };
    let rkey = send.packed_rkey.clone().unwrap_or_default();

    let remote_id = match worker.ep_resolve_remote_id(ep, lane) {
        Ok(remote_id) => remote_id,
        Err(err) => {
            abort(worker, sreq, err);
            return Ok(());
        }
    };

    let hdr = RtsHdr {
        opcode: RtsOpcode::TagOk.to_raw(),
        size,
        sreq: RemoteRequest {
            ep_id: remote_id,
            req_id,
        },
        address,
        tag,
    };
    let Some(lane_ep) = worker.ep_lane_mut(ep, lane) else {
        abort(worker, sreq, Error::Canceled);
        return Ok(());
    };
    lane_ep.am_bcopy(AmId::RndvRts.to_raw(), &mut |buf| {
        let _ = buf.write(&hdr);
        let _ = buf.write_from(rkey.clone());
    })?;

    trace!(req = ?sreq, %tag, size, "sent rendezvous request-to-send");
    Ok(())
}

/// Aborts a rendezvous send: releases the wire id and the buffer
/// registration if protocol initialization ran, then completes the send
/// with `status`.
pub(crate) fn abort(worker: &mut Worker, sreq: ReqId, status: Error) {
    let initialized = worker
        .reqs
        .get(sreq)
        .and_then(Request::send)
        .is_some_and(|send| send.proto_initialized);
    if initialized {
        worker.release_send_id(sreq);
        if let Some(send) = worker.reqs.get_mut(sreq).and_then(Request::send_mut) {
            send.packed_rkey = None;
        }
    }
    worker.complete(sreq, Err(status));
}

/// Handles an incoming acknowledgement, completing the bound send.
///
/// A stale id - the request was already aborted or canceled - is ignored
/// with a debug log.
///
/// # Errors
///
/// Errors with [`Error::Protocol`] on a malformed header or status byte.
pub fn process_ats(worker: &mut Worker, payload: Bytes) -> Result<(), Error> {
    let mut src = payload;
    let hdr = src.read::<AtsHdr>().map_err(|_| Error::Protocol)?;
    let completion = completion_from_wire(hdr.status)?;

    let Some(sreq) = worker.take_send_id(hdr.req_id) else {
        debug!(req_id = hdr.req_id, "acknowledgement for an unbound request id");
        return Ok(());
    };

    if let Some(send) = worker.reqs.get_mut(sreq).and_then(Request::send_mut) {
        send.send_id = None;
        send.packed_rkey = None;
    }
    worker.complete(sreq, completion);
    Ok(())
}

/// Cancels an in-flight rendezvous send by shipping a canceled
/// request-to-send with the same ids.
///
/// Completion (with a canceled status) arrives through the cancellation
/// acknowledgement. A send whose id was never bound completes locally.
///
/// # Errors
///
/// Errors with [`Error::NoResource`] when the lane cannot take the
/// cancellation message right now; retry after progress.
pub(crate) fn cancel(worker: &mut Worker, sreq: ReqId) -> Result<(), Error> {
    let Some(send) = worker.reqs.get(sreq).and_then(Request::send) else {
        return Ok(());
    };
    let (ep, lane, tag) = (send.ep, send.lane, send.tag);
    let Some(req_id) = send.send_id else {
        abort(worker, sreq, Error::Canceled);
        return Ok(());
    };

    let remote_id = worker.ep_resolve_remote_id(ep, lane)?;
    let hdr = RtsHdr {
        opcode: RtsOpcode::TagCanceled.to_raw(),
        size: 0,
        sreq: RemoteRequest {
            ep_id: remote_id,
            req_id,
        },
        address: 0,
        tag,
    };
    let Some(lane_ep) = worker.ep_lane_mut(ep, lane) else {
        abort(worker, sreq, Error::Canceled);
        return Ok(());
    };
    lane_ep.am_bcopy(AmId::RndvRts.to_raw(), &mut |buf| {
        let _ = buf.write(&hdr);
    })?;

    trace!(req = ?sreq, %tag, req_id, "sent rendezvous cancellation");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rts_hdr_encode_decode() {
        let hdr = RtsHdr {
            opcode: RtsOpcode::TagOk.to_raw(),
            size: 4096,
            sreq: RemoteRequest { ep_id: 1, req_id: 7 },
            address: 0xdead_0000,
            tag: Tag(0xdead_beef),
        };
        let mut buf = BytesMut::with_capacity(RtsHdr::ENCODE_LEN);

        buf.write(&hdr).unwrap();
        assert_eq!(RtsHdr::ENCODE_LEN, buf.len());

        let parsed = buf.freeze().read::<RtsHdr>().unwrap();
        assert_eq!(hdr, parsed);
        assert_eq!(Some(RtsOpcode::TagOk), RtsOpcode::from_raw(parsed.opcode));
    }

    #[test]
    fn rts_hdr_survives_trailing_rkey_blob() {
        let hdr = RtsHdr {
            opcode: RtsOpcode::TagOk.to_raw(),
            size: 10,
            sreq: RemoteRequest { ep_id: 3, req_id: 9 },
            address: 0x1000,
            tag: Tag(5),
        };
        let mut buf = BytesMut::new();
        buf.write(&hdr).unwrap();
        buf.extend_from_slice(&[0xaa; 12]);

        let mut src = buf.freeze();
        assert_eq!(hdr, src.read::<RtsHdr>().unwrap());
        assert_eq!(12, src.len());
    }

    #[test]
    fn ats_hdr_encode_decode() {
        let hdr = AtsHdr {
            req_id: 7,
            status: Error::Canceled.to_wire(),
        };
        let mut buf = BytesMut::with_capacity(AtsHdr::ENCODE_LEN);

        buf.write(&hdr).unwrap();
        assert_eq!(AtsHdr::ENCODE_LEN, buf.len());
        assert_eq!(hdr, buf.freeze().read::<AtsHdr>().unwrap());
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert_eq!(None, RtsOpcode::from_raw(0));
        assert_eq!(None, RtsOpcode::from_raw(3));
    }
}
