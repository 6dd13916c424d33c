//! Hooks for transport-side (hardware) tag matching.
//!
//! None of the built-in transports advertises hardware tag matching, so
//! these entry points only keep the software path honest: a receive that
//! was pre-posted to hardware must be pulled back when software matching
//! wins the race, and a rendezvous send routed at a dedicated tag lane
//! reports that the feature is unavailable so the caller can fall back.

use tracing::trace;
use weft::error::Error;

use crate::{request::ReqId, worker::Worker};

/// Force-cancels a transport-offloaded pre-posted receive.
///
/// No-op unless `rreq` was actually handed to a transport matcher.
pub(crate) fn try_cancel(worker: &mut Worker, rreq: ReqId, force: bool) {
    let Some(recv) = worker.reqs.get_mut(rreq).and_then(crate::request::Request::recv_mut)
    else {
        return;
    };
    if recv.offloaded {
        recv.offloaded = false;
        trace!(req = ?rreq, force, "canceled transport-offloaded receive");
    }
}

/// Rendezvous send through a dedicated tag lane.
///
/// # Errors
///
/// Always errors with [`Error::Unsupported`] in this build.
pub(crate) fn start_rndv(_worker: &mut Worker, _sreq: ReqId) -> Result<(), Error> {
    Err(Error::Unsupported)
}
