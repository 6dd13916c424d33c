//! Lane construction from decoded address entries and the wireup control
//! message.
//!
//! Full wireup - transport scoring, lane negotiation, stub replay - lives
//! above this core. What is here is the part endpoints cannot exist
//! without: building the lane array and interned configuration from a
//! peer's address entries, announcing the local endpoint id to the peer,
//! and learning the peer's id from its announcement.

use std::convert::Infallible;

use octs::{BufTooShortOr, Bytes, Decode, Encode, FixedEncodeLen, Read, Write};
use tracing::{debug, warn};
use weft::{
    error::Error,
    iface::IfaceCapFlags,
    lane::{LaneEndpoint, StubLane},
    tcp::{TcpIfaceConfig, TcpLane},
};

use crate::{
    address::{unpack_tcp_entry_data, AddressEntry, LaneAddrKind},
    ep::{
        config::{EpConfigKey, LaneIndex, MAX_LANES},
        EpFlags, EpId,
    },
    worker::{AmId, Worker},
};

/// The initiator announces its endpoint id.
pub(crate) const WIREUP_REQUEST: u8 = 1;
/// The responder answers with its own endpoint id.
pub(crate) const WIREUP_ACK: u8 = 2;

/// Wireup control message, sent on the wireup lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireupMsg {
    /// [`WIREUP_REQUEST`] or [`WIREUP_ACK`].
    pub ty: u8,
    /// Identifier of the sending worker.
    pub src_uuid: u64,
    /// The sender's id for its endpoint toward the receiver.
    pub src_ep_id: u64,
}

impl FixedEncodeLen for WireupMsg {
    const ENCODE_LEN: usize = u8::ENCODE_LEN + u64::ENCODE_LEN + u64::ENCODE_LEN;
}

impl Encode for WireupMsg {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.ty)?;
        dst.write(&self.src_uuid)?;
        dst.write(&self.src_ep_id)?;
        Ok(())
    }
}

impl Decode for WireupMsg {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            ty: src.read()?,
            src_uuid: src.read()?,
            src_ep_id: src.read()?,
        })
    }
}

/// Builds an endpoint's lanes and interned configuration from a peer's
/// address entries.
///
/// The active-message lane is the first lane whose resource advertises an
/// active-message capability, falling back to the first stub entry; the
/// wireup lane follows it. Stub entries serve every operation class until
/// a later wireup round rebinds them.
pub(crate) fn init_lanes(
    worker: &mut Worker,
    ep: EpId,
    entries: &[AddressEntry],
) -> Result<(), Error> {
    if entries.is_empty() || entries.len() > MAX_LANES {
        return Err(Error::Protocol);
    }

    let mut key = EpConfigKey {
        num_lanes: entries.len() as u8,
        am_lane: None,
        wireup_msg_lane: None,
        rma_lanes_map: 0,
        amo_lanes_map: 0,
        lanes: [None; MAX_LANES],
    };
    let mut lanes = Vec::with_capacity(entries.len());
    let mut am_lane = None;
    let mut first_stub = None;

    for (index, entry) in entries.iter().enumerate() {
        key.lanes[index] = entry.rsc_index;

        let lane_ep = match entry.kind {
            LaneAddrKind::Stub => {
                first_stub.get_or_insert(index);
                LaneEndpoint::Stub(StubLane::new())
            }
            LaneAddrKind::Tcp => {
                let addr = unpack_tcp_entry_data(&entry.data)?;
                LaneEndpoint::Tcp(TcpLane::connect(addr.into(), &TcpIfaceConfig::default())?)
            }
        };
        lanes.push(lane_ep);

        let caps = entry
            .rsc_index
            .and_then(|rsc| worker.rsc(rsc))
            .map(|rsc| rsc.iface_attr.flags);
        match caps {
            Some(flags) => {
                if am_lane.is_none()
                    && flags.intersects(
                        IfaceCapFlags::AM_SHORT | IfaceCapFlags::AM_BCOPY | IfaceCapFlags::AM_ZCOPY,
                    )
                {
                    am_lane = Some(index);
                }
                if flags.intersects(
                    IfaceCapFlags::PUT_SHORT
                        | IfaceCapFlags::PUT_BCOPY
                        | IfaceCapFlags::PUT_ZCOPY
                        | IfaceCapFlags::GET_BCOPY
                        | IfaceCapFlags::GET_ZCOPY,
                ) {
                    key.rma_lanes_map |= 1 << index;
                }
                if flags.intersects(IfaceCapFlags::AMO32 | IfaceCapFlags::AMO64) {
                    key.amo_lanes_map |= 1 << index;
                }
            }
            None => {
                // a stub serves every operation class until rebound
                key.rma_lanes_map |= 1 << index;
                key.amo_lanes_map |= 1 << index;
            }
        }
    }

    let am_lane = am_lane.or(first_stub).map(|index| LaneIndex::new(index as u8));
    key.am_lane = am_lane;
    key.wireup_msg_lane = am_lane;

    let cfg_index = worker.get_ep_config(&key);
    let Some(endpoint) = worker.ep_mut(ep) else {
        return Err(Error::Protocol);
    };
    endpoint.lanes = lanes;
    endpoint.cfg_index = cfg_index;
    endpoint.am_lane = am_lane;
    Ok(())
}

/// Announces the local endpoint to the peer and marks the endpoint
/// locally connected.
///
/// # Errors
///
/// Errors with [`Error::Unsupported`] if the endpoint has no wireup lane,
/// and propagates transport send failures.
pub(crate) fn send_request(worker: &mut Worker, ep: EpId) -> Result<(), Error> {
    let cfg_index = worker.ep(ep).ok_or(Error::Unreachable)?.cfg_index;
    let Some(lane) = worker.ep_config(cfg_index).key.wireup_msg_lane else {
        return Err(Error::Unsupported);
    };

    let msg = WireupMsg {
        ty: WIREUP_REQUEST,
        src_uuid: worker.uuid(),
        src_ep_id: ep.to_raw(),
    };
    let lane_ep = worker.ep_lane_mut(ep, lane).ok_or(Error::Unreachable)?;
    lane_ep.am_bcopy(AmId::Wireup.to_raw(), &mut |buf| {
        let _ = buf.write(&msg);
    })?;

    if let Some(endpoint) = worker.ep_mut(ep) {
        endpoint.flags |= EpFlags::LOCAL_CONNECTED;
    }
    debug!(ep = ep.0, %lane, "sent wireup request");
    Ok(())
}

/// Handles an incoming wireup control message.
pub(crate) fn handle_msg(worker: &mut Worker, payload: Bytes) -> Result<(), Error> {
    let mut src = payload;
    let msg = src.read::<WireupMsg>().map_err(|_| Error::Protocol)?;

    match msg.ty {
        WIREUP_REQUEST => {
            let ep = match worker.ep_find(msg.src_uuid) {
                Some(ep) => ep,
                None => worker.ep_create_stub(msg.src_uuid, "remote wireup request"),
            };
            let Some(endpoint) = worker.ep_mut(ep) else {
                return Err(Error::Protocol);
            };
            endpoint.remote_id = Some(msg.src_ep_id);
            endpoint.flags |= EpFlags::REMOTE_CONNECTED;
            debug!(
                ep = ep.0,
                uuid = %format!("{:#x}", msg.src_uuid),
                remote_id = msg.src_ep_id,
                "handled wireup request"
            );
            send_ack(worker, ep);
            Ok(())
        }
        WIREUP_ACK => {
            let Some(ep) = worker.ep_find(msg.src_uuid) else {
                debug!(uuid = %format!("{:#x}", msg.src_uuid), "wireup ack for unknown peer");
                return Ok(());
            };
            let Some(endpoint) = worker.ep_mut(ep) else {
                return Ok(());
            };
            endpoint.remote_id = Some(msg.src_ep_id);
            endpoint.flags |= EpFlags::REMOTE_CONNECTED;
            debug!(ep = ep.0, remote_id = msg.src_ep_id, "handled wireup ack");
            Ok(())
        }
        _ => Err(Error::Protocol),
    }
}

/// Best-effort reply announcing the responder's endpoint id.
fn send_ack(worker: &mut Worker, ep: EpId) {
    let Some(am_lane) = worker.ep(ep).and_then(|endpoint| endpoint.am_lane) else {
        return;
    };
    let msg = WireupMsg {
        ty: WIREUP_ACK,
        src_uuid: worker.uuid(),
        src_ep_id: ep.to_raw(),
    };
    if let Some(lane_ep) = worker.ep_lane_mut(ep, am_lane) {
        if let Err(err) = lane_ep.am_bcopy(AmId::Wireup.to_raw(), &mut |buf| {
            let _ = buf.write(&msg);
        }) {
            warn!(%err, ep = ep.0, "failed to send wireup ack");
        }
    }
}
