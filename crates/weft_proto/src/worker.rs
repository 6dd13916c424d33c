//! The worker: a single-threaded cooperative progress engine owning
//! endpoints, configurations, requests, and the tag-match structure.
//!
//! All mutation runs through `&mut Worker`, which plays the role of an
//! asynchronous-context lock: callers and progress callbacks are
//! serialized by construction. One worker per thread; traffic between
//! threads uses endpoints of distinct workers.

use ahash::AHashMap;
use octs::{Bytes, Read};
use tracing::{debug, trace, warn};
use weft::{
    error::{Completion, Error},
    iface::{DomainAttr, IfaceAttr},
};

use crate::{
    address::{AddressEntry, WorkerAddress},
    context::{Context, ContextConfig},
    ep::{
        config::{CfgIndex, EpConfig, EpConfigKey},
        EpId, Endpoint,
    },
    request::{
        DoneChannel, RecvHandle, RecvOutcome, ReqId, ReqKind, ReqTable, Request, RequestHandle,
        SendBuffer,
    },
    tag::{
        matching::{RecvDescFlags, TagMatch},
        rndv, Tag,
    },
    wireup,
};

/// One transport resource available to a worker's endpoints.
#[derive(Debug, Clone)]
pub struct TlResource {
    /// Transport name, e.g. `"sysv"` or `"tcp"`. Debug only.
    pub tl_name: String,
    /// Capabilities of the resource's interface.
    pub iface_attr: IfaceAttr,
    /// Index of the memory domain backing this resource.
    pub domain_index: usize,
}

/// Counters a worker keeps about its protocol activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Rendezvous requests matched against a posted receive.
    pub rndv_exp: u64,
    /// Rendezvous requests parked as unexpected descriptors.
    pub rndv_unexp: u64,
    /// Requests completed with a cancellation during a pending purge.
    pub pending_purged: u64,
}

/// Active-message ids dispatched by [`Worker::dispatch_am`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmId {
    /// Wireup control message.
    Wireup,
    /// Rendezvous request-to-send.
    RndvRts,
    /// Rendezvous acknowledgement.
    RndvAts,
}

impl AmId {
    /// Gets the wire byte of this id.
    #[must_use]
    pub const fn to_raw(self) -> u8 {
        match self {
            Self::Wireup => 1,
            Self::RndvRts => 10,
            Self::RndvAts => 11,
        }
    }

    /// Decodes a wire byte.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::Wireup,
            10 => Self::RndvRts,
            11 => Self::RndvAts,
            _ => return None,
        })
    }
}

/// Single-threaded progress engine owning a set of endpoints.
#[derive(Debug)]
pub struct Worker {
    uuid: u64,
    name: String,
    context: Context,
    rscs: Vec<TlResource>,
    domains: Vec<DomainAttr>,

    pub(crate) eps: Vec<Option<Endpoint>>,
    pub(crate) ep_hash: AHashMap<u64, EpId>,

    cfg_table: Vec<EpConfig>,
    cfg_intern: AHashMap<EpConfigKey, CfgIndex>,

    pub(crate) reqs: ReqTable,
    send_ids: AHashMap<u64, ReqId>,
    next_send_id: u64,

    pub(crate) tm: TagMatch,
    pub(crate) stats: WorkerStats,
}

impl Worker {
    /// Creates a worker over the given transport resources and memory
    /// domains.
    #[must_use]
    pub fn new(
        uuid: u64,
        name: &str,
        rscs: Vec<TlResource>,
        domains: Vec<DomainAttr>,
        config: ContextConfig,
    ) -> Self {
        let mut worker = Self {
            uuid,
            name: name.to_owned(),
            tm: TagMatch::new(config.max_unexp_descs),
            context: Context { config },
            rscs,
            domains,
            eps: Vec::new(),
            ep_hash: AHashMap::new(),
            cfg_table: Vec::new(),
            cfg_intern: AHashMap::new(),
            reqs: ReqTable::new(),
            send_ids: AHashMap::new(),
            next_send_id: 1,
            stats: WorkerStats::default(),
        };
        // configuration index 0 always exists: the stub composition
        worker.get_ep_config(&EpConfigKey::stub());
        worker
    }

    /// Gets this worker's identifier.
    #[must_use]
    pub const fn uuid(&self) -> u64 {
        self.uuid
    }

    /// Gets this worker's human-readable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the context this worker runs under.
    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.context
    }

    /// Gets the protocol counters.
    #[must_use]
    pub const fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Gets the tag-match structure.
    #[must_use]
    pub const fn tag_match(&self) -> &TagMatch {
        &self.tm
    }

    /// Gets the number of live requests.
    #[must_use]
    pub fn num_requests(&self) -> usize {
        self.reqs.len()
    }

    /// Gets a transport resource.
    #[must_use]
    pub fn rsc(&self, index: crate::ep::config::RscIndex) -> Option<&TlResource> {
        self.rscs.get(index.index())
    }

    /// Builds this worker's address from the given lane entries, ready to
    /// be packed and shipped out-of-band.
    #[must_use]
    pub fn address(&self, entries: Vec<AddressEntry>) -> WorkerAddress {
        WorkerAddress {
            uuid: self.uuid,
            name: self.name.clone(),
            entries,
        }
    }

    /// Interns `key`, deriving its configuration on first sight.
    ///
    /// Endpoints with equal keys share the returned index; equality is
    /// the sole sharing criterion.
    pub fn get_ep_config(&mut self, key: &EpConfigKey) -> CfgIndex {
        if let Some(&index) = self.cfg_intern.get(key) {
            return index;
        }

        let config = EpConfig::init(key.clone(), &self.rscs, &self.domains, &self.context.config);
        let index = CfgIndex(self.cfg_table.len());
        self.cfg_table.push(config);
        self.cfg_intern.insert(key.clone(), index);
        trace!(index = index.0, "interned endpoint configuration");
        index
    }

    /// Gets an interned configuration.
    ///
    /// # Panics
    ///
    /// Panics if `index` did not come from this worker's
    /// [`Worker::get_ep_config`].
    #[must_use]
    pub fn ep_config(&self, index: CfgIndex) -> &EpConfig {
        &self.cfg_table[index.0]
    }

    /// Binds a wire id to a send request so a later acknowledgement can
    /// find it.
    pub(crate) fn bind_send_id(&mut self, sreq: ReqId) -> u64 {
        let wire = self.next_send_id;
        self.next_send_id += 1;
        self.send_ids.insert(wire, sreq);
        if let Some(send) = self.reqs.get_mut(sreq).and_then(Request::send_mut) {
            send.send_id = Some(wire);
        }
        wire
    }

    /// Releases a send request's wire id, if one is bound.
    pub(crate) fn release_send_id(&mut self, sreq: ReqId) {
        if let Some(send) = self.reqs.get_mut(sreq).and_then(Request::send_mut) {
            if let Some(wire) = send.send_id.take() {
                self.send_ids.remove(&wire);
            }
        }
    }

    /// Resolves and unbinds a wire id carried by an acknowledgement.
    pub(crate) fn take_send_id(&mut self, wire: u64) -> Option<ReqId> {
        self.send_ids.remove(&wire)
    }

    /// Completes a request: releases its wire id, removes it from the
    /// table, and delivers the outcome through its channel.
    pub(crate) fn complete(&mut self, rid: ReqId, completion: Completion) {
        let Some(mut req) = self.reqs.remove(rid) else {
            return;
        };
        if let Some(send) = req.send() {
            if let Some(wire) = send.send_id {
                self.send_ids.remove(&wire);
            }
        }

        trace!(req = ?rid, ?completion, "completing request");
        let done = req.done.take();
        match (req.kind, done) {
            (ReqKind::Recv(recv), Some(DoneChannel::Recv(tx))) => {
                let _ = tx.send(RecvOutcome {
                    status: completion,
                    sender_tag: recv.sender_tag,
                    length: recv.length,
                    buffer: recv.buffer,
                });
            }
            (_, Some(DoneChannel::Completion(tx))) => {
                let _ = tx.send(completion);
            }
            _ => {}
        }
    }

    /// Retries parked requests on every lane that has regained send
    /// resources. Returns the number of requests that made progress.
    pub fn progress(&mut self) -> usize {
        let mut count = 0;

        for slot in 0..self.eps.len() {
            let num_lanes = match &self.eps[slot] {
                Some(endpoint) => endpoint.lanes.len(),
                None => continue,
            };

            for lane_index in 0..num_lanes {
                loop {
                    let token = {
                        let Some(endpoint) = self.eps[slot].as_mut() else {
                            break;
                        };
                        let Some(lane) = endpoint.lanes.get_mut(lane_index) else {
                            break;
                        };
                        if !lane.flow().has(1) {
                            break;
                        }
                        match lane.pending_pop() {
                            Some(token) => token,
                            None => break,
                        }
                    };

                    let rid = ReqId::from_raw(token.req);
                    let Some(func) = self.reqs.get(rid).and_then(Request::progress_fn) else {
                        // the request completed or died while parked
                        continue;
                    };
                    match func(self, rid) {
                        Ok(()) => count += 1,
                        Err(Error::NoResource) => {
                            if let Some(lane) = self.eps[slot]
                                .as_mut()
                                .and_then(|endpoint| endpoint.lanes.get_mut(lane_index))
                            {
                                lane.pending_requeue(token);
                            }
                            break;
                        }
                        Err(err) => {
                            warn!(%err, req = ?rid, "parked request failed");
                            if self.reqs.get(rid).and_then(Request::send).is_some() {
                                rndv::abort(self, rid, err);
                            } else {
                                self.complete(rid, Err(err));
                            }
                            count += 1;
                        }
                    }
                }
            }
        }

        count
    }

    /// Dispatches an incoming active message to its protocol handler.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::Protocol`] on an unknown id or malformed
    /// payload, and propagates handler failures.
    pub fn dispatch_am(&mut self, id: u8, payload: Bytes) -> Result<(), Error> {
        match AmId::from_raw(id) {
            Some(AmId::Wireup) => wireup::handle_msg(self, payload),
            Some(AmId::RndvRts) => rndv::process_rts(self, payload),
            Some(AmId::RndvAts) => rndv::process_ats(self, payload),
            None => {
                warn!(id, "active message with unknown id");
                Err(Error::Protocol)
            }
        }
    }

    /// Posts a rendezvous send of `buffer` to `ep` under `tag`.
    ///
    /// The request-to-send goes out immediately if the active-message
    /// lane has resources, and is parked on the lane otherwise.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::Unreachable`] while the peer is not wired,
    /// and with [`Error::Unsupported`] if the endpoint has no
    /// active-message lane.
    pub fn tag_send_rndv(
        &mut self,
        ep: EpId,
        tag: Tag,
        buffer: SendBuffer,
    ) -> Result<RequestHandle, Error> {
        let Some(am_lane) = self.ep(ep).ok_or(Error::Unreachable)?.am_lane() else {
            return Err(Error::Unsupported);
        };

        let (tx, rx) = oneshot::channel();
        let rid = self.reqs.insert(Request::new_send(ep, am_lane, tag, buffer, tx));

        if let Err(err) = rndv::send_start(self, rid) {
            self.release_send_id(rid);
            self.reqs.remove(rid);
            return Err(err);
        }

        match self.reqs.get(rid).and_then(Request::progress_fn) {
            Some(func) => match func(self, rid) {
                Ok(()) => {}
                Err(Error::NoResource) => self.ep_add_pending(ep, am_lane, rid, false),
                Err(err) => rndv::abort(self, rid, err),
            },
            None => rndv::abort(self, rid, Error::Unsupported),
        }

        Ok(RequestHandle { id: rid, rx })
    }

    /// Posts a receive for `(tag, tag_mask)` into `buffer`.
    ///
    /// A rendezvous message already parked in the unexpected list is
    /// consumed immediately; otherwise the receive waits in the expected
    /// queue.
    pub fn tag_recv(&mut self, tag: Tag, tag_mask: u64, buffer: Vec<u8>) -> RecvHandle {
        let (tx, rx) = oneshot::channel();
        let rid = self.reqs.insert(Request::new_recv(tag, tag_mask, buffer, tx));

        if let Some(desc) = self.tm.unexp_match(tag, tag_mask) {
            if desc.flags.contains(RecvDescFlags::RNDV) {
                let mut src = desc.payload.clone();
                match src.read::<rndv::RtsHdr>() {
                    Ok(hdr) => rndv::rndv_matched(self, rid, &hdr, src),
                    Err(_) => self.complete(rid, Err(Error::Protocol)),
                }
            } else {
                // eager unexpected data belongs to the eager engine,
                // which sits above this core
                debug!(%tag, "unexpected descriptor without rendezvous flag");
                self.complete(rid, Err(Error::Unsupported));
            }
        } else {
            self.tm.exp_post(rid, tag, tag_mask);
        }

        RecvHandle { id: rid, rx }
    }

    /// Cancels an in-flight rendezvous send.
    ///
    /// Completion with a canceled status arrives through the send's
    /// handle once the peer acknowledges (or immediately, if the
    /// request-to-send was never shipped).
    ///
    /// # Errors
    ///
    /// Errors with [`Error::NoResource`] when the cancellation message
    /// cannot be sent right now; retry after progress.
    pub fn tag_cancel_send(&mut self, id: ReqId) -> Result<(), Error> {
        rndv::cancel(self, id)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use octs::Write;
    use weft::{
        lane::LaneEndpoint,
        sysv::{HugetlbMode, SegFlags, SysvSegment},
    };

    use super::*;
    use crate::{
        address::LaneAddrKind,
        ep::config::{LaneIndex, MAX_LANES, RscIndex},
        tag::TAG_MASK_FULL,
    };

    fn worker(uuid: u64) -> Worker {
        worker_with(uuid, ContextConfig::default())
    }

    fn worker_with(uuid: u64, config: ContextConfig) -> Worker {
        Worker::new(uuid, &format!("w-{uuid:x}"), Vec::new(), Vec::new(), config)
    }

    fn stub_entry() -> AddressEntry {
        AddressEntry {
            rsc_index: None,
            kind: LaneAddrKind::Stub,
            data: Bytes::new(),
        }
    }

    /// Drains the stub outbox of `ep`'s lanes and feeds the messages to
    /// `to`. Returns how many messages were delivered.
    fn pump(from: &mut Worker, ep: EpId, to: &mut Worker) -> usize {
        let mut messages = Vec::new();
        let num_lanes = from.ep(ep).map_or(0, Endpoint::num_lanes);
        for lane in 0..num_lanes {
            if let Some(LaneEndpoint::Stub(stub)) = from.ep_lane_mut(ep, LaneIndex::new(lane as u8))
            {
                messages.extend(stub.drain_outbox());
            }
        }
        let count = messages.len();
        for (id, payload) in messages {
            to.dispatch_am(id, payload).expect("dispatch");
        }
        count
    }

    /// Two workers wired to each other through stub lanes, via the real
    /// address + wireup path.
    fn pair() -> (Worker, Worker, EpId, EpId) {
        let mut a = worker(0xaaaa);
        let mut b = worker(0xbbbb);

        let addr_b = b.address(vec![stub_entry()]).pack().expect("pack");
        let ep_ab = a.ep_create(&addr_b).expect("ep create");
        assert_eq!(1, pump(&mut a, ep_ab, &mut b), "wireup request");

        let ep_ba = b.ep_find(0xaaaa).expect("reverse endpoint");
        assert_eq!(1, pump(&mut b, ep_ba, &mut a), "wireup ack");

        (a, b, ep_ab, ep_ba)
    }

    fn payload_segment(data: &[u8]) -> SysvSegment {
        let mut seg = SysvSegment::alloc(
            data.len().max(1),
            None,
            SegFlags::empty(),
            HugetlbMode::No,
            "test payload",
        )
        .expect("segment");
        unsafe { seg.as_mut_slice()[..data.len()].copy_from_slice(data) };
        seg
    }

    #[test]
    fn intern_is_deterministic() {
        let iface = IfaceAttr::default();
        let rscs = (0..6)
            .map(|index| TlResource {
                tl_name: format!("tl{index}"),
                iface_attr: iface,
                domain_index: 0,
            })
            .collect::<Vec<_>>();
        let domains = vec![DomainAttr::default()];
        let mut w = Worker::new(1, "w", rscs, domains, ContextConfig::default());

        let mut lanes = [None; MAX_LANES];
        lanes[0] = Some(RscIndex(3));
        lanes[1] = Some(RscIndex(5));
        let key = EpConfigKey {
            num_lanes: 2,
            am_lane: Some(LaneIndex::new(0)),
            wireup_msg_lane: Some(LaneIndex::new(0)),
            rma_lanes_map: 0b11,
            amo_lanes_map: 0,
            lanes,
        };

        let first = w.get_ep_config(&key);
        let second = w.get_ep_config(&key);
        assert_eq!(first, second);

        let mut other = key.clone();
        other.rma_lanes_map = 0b01;
        assert_ne!(first, w.get_ep_config(&other));
    }

    #[test]
    fn stub_endpoint_shape() {
        let mut w = worker(1);
        let ep = w.ep_create_stub(0xbeef, "test");

        assert!(w.ep_is_stub(ep));
        assert_eq!(Some(ep), w.ep_find(0xbeef));
        assert_eq!(Some(ep), w.ep_by_id(ep.to_raw()));

        let cfg = w.ep_config(w.ep(ep).unwrap().cfg_index());
        assert_eq!(Some(256), cfg.max_am_bcopy);

        // stub compositions share one interned configuration
        let ep2 = w.ep_create_stub(0xcafe, "test");
        assert_eq!(
            w.ep(ep).unwrap().cfg_index(),
            w.ep(ep2).unwrap().cfg_index()
        );
    }

    #[test]
    fn create_returns_existing_endpoint_even_before_wireup_completes() {
        let mut a = worker(0xaaaa);
        let b = worker(0xbbbb);

        let addr_b = b.address(vec![stub_entry()]).pack().unwrap();
        let first = a.ep_create(&addr_b).unwrap();
        // wireup has not completed: no ack was pumped back
        assert!(!a.ep_flags(first).contains(crate::ep::EpFlags::REMOTE_CONNECTED));

        let second = a.ep_create(&addr_b).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn wireup_resolves_remote_ids_both_ways() {
        let (a, b, ep_ab, ep_ba) = pair();

        assert_eq!(Some(ep_ba.to_raw()), a.ep(ep_ab).unwrap().remote_id);
        assert_eq!(Some(ep_ab.to_raw()), b.ep(ep_ba).unwrap().remote_id);
        assert!(a
            .ep_flags(ep_ab)
            .contains(crate::ep::EpFlags::LOCAL_CONNECTED | crate::ep::EpFlags::REMOTE_CONNECTED));
    }

    #[test]
    fn rndv_loopback_through_shared_memory() {
        let (mut a, mut b, ep_ab, ep_ba) = pair();

        let mut recv = b.tag_recv(Tag(0xdead_beef), TAG_MASK_FULL, vec![0; 64]);
        let seg = payload_segment(b"hello rendezvous");
        let mut send = a
            .tag_send_rndv(ep_ab, Tag(0xdead_beef), SendBuffer::Sysv { seg, len: 16 })
            .expect("send");
        assert!(send.try_completion().is_none());

        // rts reaches the receiver: matched against the posted receive
        assert_eq!(1, pump(&mut a, ep_ab, &mut b));
        assert_eq!(1, b.stats().rndv_exp);
        assert_eq!(0, b.stats().rndv_unexp);

        let outcome = recv.try_outcome().expect("receive completed");
        assert_eq!(Ok(()), outcome.status);
        assert_eq!(Some(Tag(0xdead_beef)), outcome.sender_tag);
        assert_eq!(Some(16), outcome.length);
        assert_eq!(b"hello rendezvous", &outcome.buffer[..16]);

        // ats flows back and completes the sender
        assert_eq!(1, pump(&mut b, ep_ba, &mut a));
        assert_eq!(Some(Ok(())), send.try_completion());
    }

    #[test]
    fn rts_with_no_posted_receive_parks_then_matches() {
        let (mut a, mut b, ep_ab, ep_ba) = pair();

        let seg = payload_segment(b"late receiver");
        let mut send = a
            .tag_send_rndv(ep_ab, Tag(77), SendBuffer::Sysv { seg, len: 13 })
            .expect("send");

        assert_eq!(1, pump(&mut a, ep_ab, &mut b));
        assert_eq!(1, b.stats().rndv_unexp);
        assert_eq!(1, b.tag_match().unexp_len(Tag(77)));

        // the late receive consumes the parked descriptor
        let mut recv = b.tag_recv(Tag(77), TAG_MASK_FULL, vec![0; 32]);
        let outcome = recv.try_outcome().expect("receive completed");
        assert_eq!(Ok(()), outcome.status);
        assert_eq!(b"late receiver", &outcome.buffer[..13]);
        assert_eq!(0, b.tag_match().unexp_len(Tag(77)));

        assert_eq!(1, pump(&mut b, ep_ba, &mut a));
        assert_eq!(Some(Ok(())), send.try_completion());
    }

    #[test]
    fn cancel_removes_unexpected_descriptor_and_acks_canceled() {
        let (mut a, mut b, ep_ab, ep_ba) = pair();

        let seg = payload_segment(b"to be canceled");
        let mut send = a
            .tag_send_rndv(ep_ab, Tag(0xf00d), SendBuffer::Sysv { seg, len: 14 })
            .expect("send");
        assert_eq!(1, pump(&mut a, ep_ab, &mut b));
        assert_eq!(1, b.tag_match().unexp_len(Tag(0xf00d)));

        a.tag_cancel_send(send.id()).expect("cancel");
        assert_eq!(1, pump(&mut a, ep_ab, &mut b));
        assert_eq!(0, b.tag_match().unexp_len(Tag(0xf00d)));

        // exactly one ats, carrying the canceled status
        let frames = match b.ep_lane_mut(ep_ba, LaneIndex::new(0)).unwrap() {
            LaneEndpoint::Stub(stub) => stub.drain_outbox(),
            LaneEndpoint::Tcp(_) => unreachable!(),
        };
        assert_eq!(1, frames.len());
        assert_eq!(AmId::RndvAts.to_raw(), frames[0].0);
        let ats = frames[0].1.clone().read::<rndv::AtsHdr>().unwrap();
        assert_eq!(Error::Canceled.to_wire(), ats.status);

        // feed the ats to the sender: the send completes as canceled
        a.dispatch_am(AmId::RndvAts.to_raw(), frames[0].1.clone()).unwrap();
        assert_eq!(Some(Err(Error::Canceled)), send.try_completion());
    }

    #[test]
    fn cancel_after_match_is_a_no_op_and_protocol_proceeds() {
        let (mut a, mut b, ep_ab, ep_ba) = pair();

        let mut recv = b.tag_recv(Tag(5), TAG_MASK_FULL, vec![0; 16]);
        let seg = payload_segment(b"quick");
        let mut send = a
            .tag_send_rndv(ep_ab, Tag(5), SendBuffer::Sysv { seg, len: 5 })
            .expect("send");
        assert_eq!(1, pump(&mut a, ep_ab, &mut b));

        // the receive already matched; the cancellation finds nothing
        a.tag_cancel_send(send.id()).expect("cancel");
        assert_eq!(1, pump(&mut a, ep_ab, &mut b));

        assert_eq!(Ok(()), recv.try_outcome().unwrap().status);
        assert_eq!(1, pump(&mut b, ep_ba, &mut a));
        assert_eq!(Some(Ok(())), send.try_completion());
    }

    #[test]
    fn truncated_pull_completes_receive_with_truncation() {
        let (mut a, mut b, ep_ab, _ep_ba) = pair();

        let mut recv = b.tag_recv(Tag(1), TAG_MASK_FULL, vec![0; 4]);
        let seg = payload_segment(b"way too long");
        a.tag_send_rndv(ep_ab, Tag(1), SendBuffer::Sysv { seg, len: 12 })
            .expect("send");
        assert_eq!(1, pump(&mut a, ep_ab, &mut b));

        let outcome = recv.try_outcome().expect("receive completed");
        assert_eq!(Err(Error::Truncated), outcome.status);
        assert_eq!(b"way ", &outcome.buffer[..]);
    }

    #[test]
    fn unexpected_descriptor_cap_raises_no_memory() {
        let mut a = worker(0xaaaa);
        let mut b = worker_with(
            0xbbbb,
            ContextConfig {
                max_unexp_descs: 0,
                ..ContextConfig::default()
            },
        );

        let addr_b = b.address(vec![stub_entry()]).pack().unwrap();
        let ep_ab = a.ep_create(&addr_b).unwrap();
        pump(&mut a, ep_ab, &mut b);
        let ep_ba = b.ep_find(0xaaaa).unwrap();
        pump(&mut b, ep_ba, &mut a);

        let seg = payload_segment(b"nope");
        a.tag_send_rndv(ep_ab, Tag(2), SendBuffer::Sysv { seg, len: 4 })
            .expect("send");

        let frames = match a.ep_lane_mut(ep_ab, LaneIndex::new(0)).unwrap() {
            LaneEndpoint::Stub(stub) => stub.drain_outbox(),
            LaneEndpoint::Tcp(_) => unreachable!(),
        };
        assert_eq!(1, frames.len());
        assert_eq!(
            Err(Error::NoMemory),
            b.dispatch_am(frames[0].0, frames[0].1.clone())
        );
    }

    #[test]
    fn stale_acknowledgement_is_ignored() {
        let (mut a, _b, _ep_ab, _ep_ba) = pair();

        let mut buf = octs::BytesMut::new();
        buf.write(&rndv::AtsHdr {
            req_id: 0xdead,
            status: 0,
        })
        .unwrap();
        assert_eq!(Ok(()), a.dispatch_am(AmId::RndvAts.to_raw(), buf.freeze()));
    }

    #[test]
    fn send_to_unwired_peer_is_unreachable() {
        let mut a = worker(1);
        let ep = a.ep_create_stub(0x77, "test");
        let result = a.tag_send_rndv(ep, Tag(1), SendBuffer::Inline(Bytes::from_static(b"x")));
        assert_matches!(result, Err(Error::Unreachable));
        assert_eq!(0, a.num_requests(), "failed send must not leak a request");
    }

    #[test]
    fn add_pending_contract_forces_progress_when_lane_has_resources() {
        let (mut a, _b, ep_ab, _ep_ba) = pair();

        let (tx, _rx) = oneshot::channel();
        let rid = a.reqs.insert(Request::new_send(
            ep_ab,
            LaneIndex::new(0),
            Tag(9),
            SendBuffer::Inline(Bytes::from_static(b"pending")),
            tx,
        ));
        rndv::send_start(&mut a, rid).expect("start");

        // the stub lane has credit, so the park is rejected and the
        // forced progress step ships the rts instead
        assert_eq!(Ok(()), a.ep_add_pending_once(ep_ab, LaneIndex::new(0), rid));
        let frames = match a.ep_lane_mut(ep_ab, LaneIndex::new(0)).unwrap() {
            LaneEndpoint::Stub(stub) => stub.drain_outbox(),
            LaneEndpoint::Tcp(_) => unreachable!(),
        };
        assert_eq!(1, frames.len());
        assert_eq!(AmId::RndvRts.to_raw(), frames[0].0);
    }

    #[test]
    fn exhausted_lane_parks_and_progress_retries() {
        let (mut a, mut b, ep_ab, _ep_ba) = pair();

        // exhaust the lane before sending
        {
            let lane = a.ep_lane_mut(ep_ab, LaneIndex::new(0)).unwrap();
            lane.flow_mut().set_cap(0);
        }
        let seg = payload_segment(b"parked");
        let mut send = a
            .tag_send_rndv(ep_ab, Tag(3), SendBuffer::Sysv { seg, len: 6 })
            .expect("send");
        assert_eq!(
            1,
            a.ep(ep_ab).unwrap().lane(LaneIndex::new(0)).unwrap().pending_len()
        );
        assert!(send.try_completion().is_none());

        // nothing moves while the lane stays exhausted
        assert_eq!(0, a.progress());

        // restore credit: progress ships the parked rts
        {
            let lane = a.ep_lane_mut(ep_ab, LaneIndex::new(0)).unwrap();
            lane.flow_mut().set_cap(1);
            lane.flow_mut().refill();
        }
        assert_eq!(1, a.progress());
        assert_eq!(
            0,
            a.ep(ep_ab).unwrap().lane(LaneIndex::new(0)).unwrap().pending_len()
        );
        assert_eq!(1, pump(&mut a, ep_ab, &mut b));
        assert_eq!(1, b.stats().rndv_unexp);
    }

    #[test]
    fn blocking_add_pending_terminates_when_lane_admits() {
        let (mut a, _b, ep_ab, _ep_ba) = pair();

        {
            let lane = a.ep_lane_mut(ep_ab, LaneIndex::new(0)).unwrap();
            lane.flow_mut().set_cap(0);
        }
        let (tx, _rx) = oneshot::channel();
        let rid = a.reqs.insert(Request::new_send(
            ep_ab,
            LaneIndex::new(0),
            Tag(4),
            SendBuffer::Inline(Bytes::from_static(b"block")),
            tx,
        ));
        rndv::send_start(&mut a, rid).expect("start");

        a.ep_add_pending(ep_ab, LaneIndex::new(0), rid, true);
        assert_eq!(
            1,
            a.ep(ep_ab).unwrap().lane(LaneIndex::new(0)).unwrap().pending_len()
        );
    }

    #[test]
    fn destroy_purges_pending_across_all_lanes() {
        let mut a = worker(0xaaaa);
        let b = worker(0xbbbb);

        // two stub lanes so requests can park on both
        let addr_b = b.address(vec![stub_entry(), stub_entry()]).pack().unwrap();
        let ep = a.ep_create(&addr_b).unwrap();
        for lane in 0..2 {
            let lane = a.ep_lane_mut(ep, LaneIndex::new(lane)).unwrap();
            lane.flow_mut().set_cap(0);
        }

        let mut handles = Vec::new();
        for lane in 0..2_u8 {
            for _ in 0..3 {
                let (tx, rx) = oneshot::channel();
                let rid = a.reqs.insert(Request::new_send(
                    ep,
                    LaneIndex::new(lane),
                    Tag(6),
                    SendBuffer::Inline(Bytes::from_static(b"doomed")),
                    tx,
                ));
                a.reqs
                    .get_mut(rid)
                    .unwrap()
                    .send_mut()
                    .unwrap()
                    .progress = Some(rndv::rts_progress);
                a.ep_add_pending(ep, LaneIndex::new(lane), rid, false);
                handles.push(rx);
            }
        }
        assert_eq!(6, a.num_requests());

        a.ep_destroy(ep);

        for mut rx in handles {
            assert_eq!(Ok(Err(Error::Canceled)), rx.try_recv().map_err(|_| ()));
        }
        assert_eq!(6, a.stats().pending_purged);
        assert_eq!(0, a.num_requests(), "no request leaked");
        assert_eq!(None, a.ep_find(0xbbbb));
        assert!(a.ep(ep).is_none());
    }

    #[test]
    fn unknown_am_id_is_a_protocol_error() {
        let mut w = worker(1);
        assert_eq!(
            Err(Error::Protocol),
            w.dispatch_am(0xee, Bytes::from_static(b""))
        );
    }
}
