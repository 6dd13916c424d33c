//! Per-peer endpoints: multi-lane composition, lifecycle, and the
//! pending-request discipline.

pub mod config;

use tracing::{debug, error, trace};
use weft::{
    error::Error,
    lane::LaneEndpoint,
    pending::PendingReq,
};

use crate::{
    address::WorkerAddress,
    ep::config::{CfgIndex, LaneIndex, RscIndex},
    request::{ReqId, Request},
    wireup,
    worker::Worker,
};

/// Handle of an endpoint inside its worker.
///
/// The raw value is what travels inside rendezvous headers so the peer
/// can address this endpoint; it is invalidated by
/// [`Worker::ep_destroy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EpId(pub(crate) u64);

impl EpId {
    /// Gets the raw id carried on the wire.
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        self.0
    }
}

bitflags::bitflags! {
    /// Endpoint state bits.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct EpFlags: u32 {
        /// The local side has sent its wireup request.
        const LOCAL_CONNECTED  = 1 << 0;
        /// The remote side's wireup message has been processed.
        const REMOTE_CONNECTED = 1 << 1;
    }
}

/// A per-peer handle aggregating one or more transport lanes.
///
/// Owned by a worker; all mutation goes through the owning worker, which
/// serializes callers and progress callbacks.
#[derive(Debug)]
pub struct Endpoint {
    pub(crate) dest_uuid: u64,
    pub(crate) peer_name: String,
    pub(crate) lanes: Vec<LaneEndpoint>,
    pub(crate) cfg_index: CfgIndex,
    pub(crate) am_lane: Option<LaneIndex>,
    /// The peer worker's id for its endpoint back to us, learned during
    /// wireup.
    pub(crate) remote_id: Option<u64>,
    pub(crate) flags: EpFlags,
}

impl Endpoint {
    /// Gets the identifier of the remote worker.
    #[must_use]
    pub const fn dest_uuid(&self) -> u64 {
        self.dest_uuid
    }

    /// Gets the peer's human-readable name. Debug only; not unique.
    #[must_use]
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    /// Gets the endpoint state bits.
    #[must_use]
    pub const fn flags(&self) -> EpFlags {
        self.flags
    }

    /// Gets the number of lanes.
    #[must_use]
    pub fn num_lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Gets the lane carrying active messages, if one was selected.
    #[must_use]
    pub const fn am_lane(&self) -> Option<LaneIndex> {
        self.am_lane
    }

    /// Gets the interned configuration index.
    #[must_use]
    pub const fn cfg_index(&self) -> CfgIndex {
        self.cfg_index
    }

    /// Gets a lane endpoint.
    #[must_use]
    pub fn lane(&self, lane: LaneIndex) -> Option<&LaneEndpoint> {
        self.lanes.get(lane.index())
    }

    /// Gets a lane endpoint, mutably.
    pub fn lane_mut(&mut self, lane: LaneIndex) -> Option<&mut LaneEndpoint> {
        self.lanes.get_mut(lane.index())
    }
}

impl Worker {
    /// Allocates an endpoint shell and hashes it under `dest_uuid`.
    fn ep_new(&mut self, dest_uuid: u64, peer_name: &str, message: &str) -> EpId {
        let endpoint = Endpoint {
            dest_uuid,
            peer_name: peer_name.to_owned(),
            lanes: Vec::new(),
            cfg_index: CfgIndex(0),
            am_lane: None,
            remote_id: None,
            flags: EpFlags::empty(),
        };

        let slot = self.eps.iter().position(Option::is_none).unwrap_or_else(|| {
            self.eps.push(None);
            self.eps.len() - 1
        });
        self.eps[slot] = Some(endpoint);
        let id = EpId(slot as u64);

        debug_assert!(!self.ep_hash.contains_key(&dest_uuid));
        self.ep_hash.insert(dest_uuid, id);

        debug!(
            ep = id.0,
            peer = peer_name,
            uuid = %format!("{:#x}->{:#x}", self.uuid(), dest_uuid),
            message,
            "created endpoint"
        );
        id
    }

    /// Removes an endpoint shell without touching its lanes.
    fn ep_delete(&mut self, ep: EpId) {
        if let Some(endpoint) = self.eps.get_mut(ep.0 as usize).and_then(Option::take) {
            self.ep_hash.remove(&endpoint.dest_uuid);
        }
    }

    /// Creates an endpoint to the worker described by a packed remote
    /// address.
    ///
    /// If an endpoint to that worker already exists it is returned as-is,
    /// even when its wireup has not completed yet.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::Protocol`] when the address blob cannot be
    /// unpacked, and propagates lane-wireup and wireup-send failures
    /// after destroying the partially constructed endpoint.
    pub fn ep_create(&mut self, address: &[u8]) -> Result<EpId, Error> {
        let address = WorkerAddress::unpack(address).map_err(|err| {
            error!(%err, "failed to unpack remote address");
            err
        })?;

        if let Some(existing) = self.ep_find(address.uuid) {
            // TODO handle the case where the existing endpoint has not
            // completed wireup
            debug!(
                ep = existing.0,
                uuid = %format!("{:#x}", address.uuid),
                "returning existing endpoint"
            );
            return Ok(existing);
        }

        let ep = self.ep_create_connected(
            address.uuid,
            &address.name,
            &address.entries,
            "from api call",
        )?;

        if !self.ep_flags(ep).contains(EpFlags::LOCAL_CONNECTED) {
            if let Err(err) = wireup::send_request(self, ep) {
                self.ep_destroy(ep);
                return Err(err);
            }
        }

        Ok(ep)
    }

    /// Creates an endpoint with lanes wired from decoded address entries.
    pub(crate) fn ep_create_connected(
        &mut self,
        dest_uuid: u64,
        peer_name: &str,
        entries: &[crate::address::AddressEntry],
        message: &str,
    ) -> Result<EpId, Error> {
        let ep = self.ep_new(dest_uuid, peer_name, message);
        if let Err(err) = wireup::init_lanes(self, ep, entries) {
            self.ep_delete(ep);
            return Err(err);
        }
        Ok(ep)
    }

    /// Creates a stub endpoint: a single placeholder lane that buffers
    /// operations until wireup rebinds the peer's real transports.
    pub fn ep_create_stub(&mut self, dest_uuid: u64, message: &str) -> EpId {
        let ep = self.ep_new(dest_uuid, "??", message);

        // all operations use the first lane, which is a stub
        let key = config::EpConfigKey::stub();
        let cfg_index = self.get_ep_config(&key);

        if let Some(endpoint) = self.ep_mut(ep) {
            endpoint.cfg_index = cfg_index;
            endpoint.am_lane = Some(LaneIndex::new(0));
            endpoint.lanes = vec![LaneEndpoint::Stub(weft::lane::StubLane::new())];
        }
        ep
    }

    /// Gets if `ep` is a stub endpoint.
    #[must_use]
    pub fn ep_is_stub(&self, ep: EpId) -> bool {
        self.ep_rsc_index(ep, LaneIndex::new(0)).is_none()
    }

    /// Looks up the endpoint to `dest_uuid`, if one exists.
    #[must_use]
    pub fn ep_find(&self, dest_uuid: u64) -> Option<EpId> {
        self.ep_hash.get(&dest_uuid).copied()
    }

    /// Resolves a raw wire id back to an endpoint handle.
    #[must_use]
    pub fn ep_by_id(&self, raw: u64) -> Option<EpId> {
        self.eps
            .get(raw as usize)
            .and_then(Option::as_ref)
            .map(|_| EpId(raw))
    }

    /// Gets an endpoint.
    #[must_use]
    pub fn ep(&self, ep: EpId) -> Option<&Endpoint> {
        self.eps.get(ep.0 as usize).and_then(Option::as_ref)
    }

    /// Gets an endpoint, mutably.
    pub(crate) fn ep_mut(&mut self, ep: EpId) -> Option<&mut Endpoint> {
        self.eps.get_mut(ep.0 as usize).and_then(Option::as_mut)
    }

    /// Gets a lane of an endpoint, mutably.
    pub(crate) fn ep_lane_mut(&mut self, ep: EpId, lane: LaneIndex) -> Option<&mut LaneEndpoint> {
        self.ep_mut(ep).and_then(|endpoint| endpoint.lane_mut(lane))
    }

    /// Gets the endpoint's state bits, or empty if the endpoint is gone.
    #[must_use]
    pub fn ep_flags(&self, ep: EpId) -> EpFlags {
        self.ep(ep).map_or(EpFlags::empty(), |endpoint| endpoint.flags)
    }

    /// Gets the transport resource behind one lane of an endpoint.
    #[must_use]
    pub fn ep_rsc_index(&self, ep: EpId, lane: LaneIndex) -> Option<RscIndex> {
        let endpoint = self.ep(ep)?;
        self.ep_config(endpoint.cfg_index).key.lane_rsc(lane)
    }

    /// Resolves the peer's id for its endpoint back to us, needed before
    /// a rendezvous header can address the peer.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::Unreachable`] while wireup has not delivered
    /// the peer id yet.
    pub(crate) fn ep_resolve_remote_id(&self, ep: EpId, lane: LaneIndex) -> Result<u64, Error> {
        match self.ep(ep).and_then(|endpoint| endpoint.remote_id) {
            Some(remote_id) => Ok(remote_id),
            None => {
                debug!(ep = ep.0, %lane, "remote endpoint id not resolved yet");
                Err(Error::Unreachable)
            }
        }
    }

    /// Destroys an endpoint: removes it from the worker hash, purges
    /// every lane's pending queue (completing each parked request with
    /// [`Error::Canceled`]), then tears the lanes down.
    ///
    /// Never fails; destroying an unknown endpoint is a no-op. Not safe
    /// to call while user operations on the same endpoint are still being
    /// posted - quiesce first.
    pub fn ep_destroy(&mut self, ep: EpId) {
        let Some(mut endpoint) = self.eps.get_mut(ep.0 as usize).and_then(Option::take) else {
            return;
        };
        debug!(ep = ep.0, uuid = %format!("{:#x}", endpoint.dest_uuid), "destroying endpoint");
        self.ep_hash.remove(&endpoint.dest_uuid);

        for (index, lane) in endpoint.lanes.iter_mut().enumerate() {
            let mut parked = Vec::new();
            lane.pending_purge(&mut |token| parked.push(token));
            for token in parked {
                self.pending_release(token);
            }
            debug!(ep = ep.0, lane = index, "destroying lane endpoint");
            lane.destroy();
        }
    }

    /// Completes a purged pending request with a cancellation status.
    fn pending_release(&mut self, token: PendingReq) {
        self.stats.pending_purged += 1;
        self.complete(ReqId::from_raw(token.req), Err(Error::Canceled));
    }

    /// One add-pending cycle.
    ///
    /// Parks the request on the lane; if the lane reports that resources
    /// are available again, runs the request's progress function once
    /// instead.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::NoProgress`] when the lane rejected the park
    /// and the forced progress step did not complete either; the caller
    /// retries later.
    pub(crate) fn ep_add_pending_once(
        &mut self,
        ep: EpId,
        lane: LaneIndex,
        rid: ReqId,
    ) -> Result<(), Error> {
        let func = self.reqs.get(rid).and_then(Request::progress_fn);
        debug_assert!(func.is_some(), "parking request {rid:?} without progress function");

        let token = PendingReq { req: rid.to_raw() };
        let Some(lane_ep) = self.ep_lane_mut(ep, lane) else {
            // endpoint died under the caller; cancel instead of spinning
            self.complete(rid, Err(Error::Canceled));
            return Ok(());
        };

        match lane_ep.pending_add(token) {
            Ok(()) => {
                trace!(ep = ep.0, %lane, req = ?rid, "parked pending request");
                Ok(())
            }
            Err(_rejected) => {
                // forced progress
                let Some(func) = func else {
                    return Err(Error::NoProgress);
                };
                match func(self, rid) {
                    Ok(()) => Ok(()),
                    Err(_) => Err(Error::NoProgress),
                }
            }
        }
    }

    /// Parks a request, retrying until the lane either admits it or the
    /// operation completes.
    ///
    /// With `progress` set this drives [`Worker::progress`] between
    /// attempts; it is the one place the core actively spins on progress.
    pub fn ep_add_pending(&mut self, ep: EpId, lane: LaneIndex, rid: ReqId, progress: bool) {
        while self.ep_add_pending_once(ep, lane, rid).is_err() {
            if progress {
                self.progress();
            }
        }
    }
}
