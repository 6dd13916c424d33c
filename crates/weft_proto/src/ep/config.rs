//! Per-endpoint configuration: keys, interning, and derived thresholds.
//!
//! Endpoints sharing the same lane composition share one derived
//! configuration, interned in the worker. The key normalizes everything
//! that influences behavior; the derived record is read-only after
//! initialization and lives as long as the worker.

use std::{
    fmt,
    hash::{Hash, Hasher},
};

use static_assertions::const_assert;
use weft::iface::{DomainCapFlags, IfaceCapFlags};

use octs::FixedEncodeLen;

use crate::{
    context::{ContextConfig, ThreshConfig},
    tag::EagerHdr,
    worker::TlResource,
};

/// Most lanes an endpoint can aggregate.
pub const MAX_LANES: usize = 8;

// lane selection maps are one byte wide
const_assert!(MAX_LANES <= u8::BITS as usize);

/// Buffered-copy limit assumed for a stub lane, which has no transport to
/// ask.
pub const STUB_MAX_BCOPY: usize = 256;

/// Index of a lane within its endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LaneIndex(u8);

impl LaneIndex {
    /// Creates a lane index from a raw value.
    ///
    /// # Panics
    ///
    /// Panics if `raw` is not below [`MAX_LANES`].
    #[must_use]
    pub fn new(raw: u8) -> Self {
        assert!(usize::from(raw) < MAX_LANES);
        Self(raw)
    }

    /// Gets the raw index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LaneIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a transport resource within the worker's resource table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RscIndex(pub u8);

impl RscIndex {
    /// Gets the raw index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of an interned configuration within the worker's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CfgIndex(pub(crate) usize);

/// Everything that determines an endpoint's derived configuration.
///
/// Two keys are equal iff the five scalar fields match and the first
/// `num_lanes` resource indices match elementwise; entries beyond
/// `num_lanes` are ignored, so stale tail data never splits an intern
/// bucket. Equality is the sole criterion for configuration sharing -
/// configurations are never compared by table position.
#[derive(Debug, Clone)]
pub struct EpConfigKey {
    /// Number of lanes in use; prefix length of `lanes`.
    pub num_lanes: u8,
    /// Lane carrying active messages, if any.
    pub am_lane: Option<LaneIndex>,
    /// Lane carrying wireup control messages, if any.
    pub wireup_msg_lane: Option<LaneIndex>,
    /// Bitmap of lanes serving remote-memory access.
    pub rma_lanes_map: u8,
    /// Bitmap of lanes serving remote atomics.
    pub amo_lanes_map: u8,
    /// Transport resource behind each lane; [`None`] marks a stub lane.
    pub lanes: [Option<RscIndex>; MAX_LANES],
}

impl EpConfigKey {
    /// Key of a stub endpoint: a single placeholder lane serving
    /// everything.
    #[must_use]
    pub fn stub() -> Self {
        Self {
            num_lanes: 1,
            am_lane: Some(LaneIndex::new(0)),
            wireup_msg_lane: Some(LaneIndex::new(0)),
            rma_lanes_map: 1,
            amo_lanes_map: 1,
            lanes: [None; MAX_LANES],
        }
    }

    /// Gets the transport resource behind `lane`.
    #[must_use]
    pub fn lane_rsc(&self, lane: LaneIndex) -> Option<RscIndex> {
        self.lanes[..usize::from(self.num_lanes)]
            .get(lane.index())
            .copied()
            .flatten()
    }

    fn lanes_prefix(&self) -> &[Option<RscIndex>] {
        &self.lanes[..usize::from(self.num_lanes)]
    }
}

impl PartialEq for EpConfigKey {
    fn eq(&self, other: &Self) -> bool {
        self.num_lanes == other.num_lanes
            && self.am_lane == other.am_lane
            && self.wireup_msg_lane == other.wireup_msg_lane
            && self.rma_lanes_map == other.rma_lanes_map
            && self.amo_lanes_map == other.amo_lanes_map
            && self.lanes_prefix() == other.lanes_prefix()
    }
}

impl Eq for EpConfigKey {}

impl Hash for EpConfigKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.num_lanes.hash(state);
        self.am_lane.hash(state);
        self.wireup_msg_lane.hash(state);
        self.rma_lanes_map.hash(state);
        self.amo_lanes_map.hash(state);
        self.lanes_prefix().hash(state);
    }
}

/// Data-movement mode selected for an outgoing message size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Inline send inside the active-message header.
    EagerShort,
    /// Eager send through a bounce buffer.
    EagerBcopy,
    /// Eager send from registered memory.
    EagerZcopy,
    /// Rendezvous handshake.
    Rndv,
}

/// Configuration derived from an [`EpConfigKey`]; read-only after
/// initialization.
///
/// Size limits are [`None`] when the chosen lane does not advertise the
/// capability; thresholds saturate to [`usize::MAX`] when the path is
/// disabled.
#[derive(Debug, Clone, PartialEq)]
pub struct EpConfig {
    /// The interned key this configuration was derived from.
    pub key: EpConfigKey,
    /// Lanes serving remote-memory access, ascending.
    pub rma_lanes: Vec<LaneIndex>,
    /// Lanes serving remote atomics, ascending.
    pub amo_lanes: Vec<LaneIndex>,
    /// Lane with hardware tag matching; never set by the built-in
    /// transports.
    pub tag_lane: Option<LaneIndex>,

    /// Largest eager payload that fits an inline send.
    pub max_eager_short: Option<usize>,
    /// Largest inline active message after the 8-byte protocol header.
    pub max_am_short: Option<usize>,
    /// Largest buffered-copy active message.
    pub max_am_bcopy: Option<usize>,
    /// Largest zero-copy active message.
    pub max_am_zcopy: Option<usize>,
    /// Largest inline remote put.
    pub max_put_short: Option<usize>,
    /// Largest buffered-copy remote put.
    pub max_put_bcopy: Option<usize>,
    /// Largest buffered-copy remote get.
    pub max_get_bcopy: Option<usize>,
    /// Largest zero-copy remote put.
    pub max_put_zcopy: Option<usize>,
    /// Largest zero-copy remote get.
    pub max_get_zcopy: Option<usize>,

    /// Smallest size preferring buffered copy over inline.
    pub bcopy_thresh: usize,
    /// Smallest size preferring zero-copy over buffered copy.
    pub zcopy_thresh: usize,
    /// Zero-copy threshold for synchronous sends; [`None`] while unset.
    pub sync_zcopy_thresh: Option<usize>,
    /// Smallest size switching to the rendezvous protocol.
    pub rndv_thresh: usize,
    /// Rendezvous threshold for synchronous sends.
    pub sync_rndv_thresh: usize,
}

impl EpConfig {
    /// Derives the configuration for `key` from the worker's resource and
    /// memory-domain tables.
    #[must_use]
    pub fn init(
        key: EpConfigKey,
        rscs: &[TlResource],
        domains: &[weft::iface::DomainAttr],
        config: &ContextConfig,
    ) -> Self {
        let mut rma_lanes = Vec::new();
        let mut amo_lanes = Vec::new();
        for lane in 0..usize::from(key.num_lanes) {
            if key.rma_lanes_map & (1 << lane) != 0 {
                rma_lanes.push(LaneIndex::new(lane as u8));
            }
            if key.amo_lanes_map & (1 << lane) != 0 {
                amo_lanes.push(LaneIndex::new(lane as u8));
            }
        }
        debug_assert_eq!(key.rma_lanes_map.count_ones() as usize, rma_lanes.len());
        debug_assert_eq!(key.amo_lanes_map.count_ones() as usize, amo_lanes.len());

        let (rndv_thresh, sync_rndv_thresh) = match config.rndv_thresh {
            ThreshConfig::Auto => (usize::MAX, usize::MAX),
            ThreshConfig::Fixed(thresh) => (thresh, thresh),
        };

        let mut derived = Self {
            key,
            rma_lanes,
            amo_lanes,
            tag_lane: None,
            max_eager_short: None,
            max_am_short: None,
            max_am_bcopy: None,
            max_am_zcopy: None,
            max_put_short: None,
            max_put_bcopy: None,
            max_get_bcopy: None,
            max_put_zcopy: None,
            max_get_zcopy: None,
            bcopy_thresh: config.bcopy_thresh,
            zcopy_thresh: usize::MAX,
            sync_zcopy_thresh: None,
            rndv_thresh,
            sync_rndv_thresh,
        };

        derived.init_am(rscs, domains, config);
        derived.init_rma(rscs);
        derived
    }

    /// Active-message limits and the zero-copy threshold.
    fn init_am(
        &mut self,
        rscs: &[TlResource],
        domains: &[weft::iface::DomainAttr],
        config: &ContextConfig,
    ) {
        let Some(am_lane) = self.key.am_lane else {
            return;
        };
        let Some(rsc) = self.key.lane_rsc(am_lane) else {
            self.max_am_bcopy = Some(STUB_MAX_BCOPY);
            return;
        };

        let iface = &rscs[rsc.index()].iface_attr;
        let domain = &domains[rscs[rsc.index()].domain_index];

        if iface.flags.contains(IfaceCapFlags::AM_SHORT) {
            self.max_eager_short = Some(iface.am.max_short.saturating_sub(EagerHdr::ENCODE_LEN));
            self.max_am_short = Some(iface.am.max_short.saturating_sub(u64::ENCODE_LEN));
        }

        if iface.flags.contains(IfaceCapFlags::AM_BCOPY) {
            self.max_am_bcopy = Some(iface.am.max_bcopy);
        }

        if iface.flags.contains(IfaceCapFlags::AM_ZCOPY)
            && domain.flags.contains(DomainCapFlags::REG)
        {
            self.max_am_zcopy = Some(iface.am.max_zcopy);
            self.max_put_zcopy = Some(iface.put.max_zcopy);
            self.max_get_zcopy = Some(iface.get.max_zcopy);

            match config.zcopy_thresh {
                ThreshConfig::Auto => {
                    let denom = (1.0 / config.bcopy_bw)
                        - (1.0 / iface.bandwidth)
                        - domain.reg_cost.growth;
                    let thresh = domain.reg_cost.overhead / denom;
                    if thresh.is_finite() && thresh >= 0.0 {
                        self.zcopy_thresh = thresh as usize;
                        self.sync_zcopy_thresh = Some(thresh as usize);
                    } else {
                        // registration never pays off
                        self.zcopy_thresh = usize::MAX;
                        self.sync_zcopy_thresh = None;
                    }
                }
                ThreshConfig::Fixed(thresh) => {
                    self.zcopy_thresh = thresh;
                    self.sync_zcopy_thresh = Some(thresh);
                }
            }
        }
    }

    /// Remote-memory-access limits, scanning RMA lanes in ascending bit
    /// order.
    fn init_rma(&mut self, rscs: &[TlResource]) {
        let mut map = self.key.rma_lanes_map;
        while map > 0 {
            let lane = LaneIndex::new(map.trailing_zeros() as u8);
            map &= map - 1;

            let Some(rsc) = self.key.lane_rsc(lane) else {
                self.max_put_bcopy = Some(STUB_MAX_BCOPY);
                continue;
            };
            let iface = &rscs[rsc.index()].iface_attr;

            // TODO take the minimum across lanes, or keep per-lane RMA
            // limits; the last scanned lane currently wins
            if iface.flags.contains(IfaceCapFlags::PUT_SHORT) {
                self.max_put_short = Some(iface.put.max_short);
            }
            if iface.flags.contains(IfaceCapFlags::PUT_BCOPY) {
                self.max_put_bcopy = Some(iface.put.max_bcopy);
            }
            if iface.flags.contains(IfaceCapFlags::GET_BCOPY) {
                self.max_get_bcopy = Some(iface.get.max_bcopy);
            }
        }
    }

    /// Picks the data-movement mode for a message of `len` bytes.
    ///
    /// Inline short is used when the payload fits and sits below the
    /// buffered-copy floor (a floor of `0` disables the floor).
    #[must_use]
    pub fn send_mode(&self, len: usize) -> SendMode {
        if len >= self.rndv_thresh {
            SendMode::Rndv
        } else if len >= self.zcopy_thresh {
            SendMode::EagerZcopy
        } else if self
            .max_eager_short
            .is_some_and(|max| len <= max && (self.bcopy_thresh == 0 || len < self.bcopy_thresh))
        {
            SendMode::EagerShort
        } else {
            SendMode::EagerBcopy
        }
    }
}

#[cfg(test)]
mod tests {
    use weft::iface::{DomainAttr, IfaceAttr, LinearCost, OpCaps};

    use super::*;

    fn rsc(iface_attr: IfaceAttr, domain_index: usize) -> TlResource {
        TlResource {
            tl_name: "test".to_owned(),
            iface_attr,
            domain_index,
        }
    }

    fn am_iface(flags: IfaceCapFlags, bandwidth: f64) -> IfaceAttr {
        IfaceAttr {
            flags,
            am: OpCaps {
                max_short: 128,
                max_bcopy: 8192,
                max_zcopy: 1 << 20,
            },
            put: OpCaps {
                max_short: 96,
                max_bcopy: 4096,
                max_zcopy: 1 << 20,
            },
            get: OpCaps {
                max_bcopy: 2048,
                max_zcopy: 1 << 20,
                ..OpCaps::default()
            },
            bandwidth,
            latency: 1e-6,
        }
    }

    fn reg_domain(overhead: f64, growth: f64) -> DomainAttr {
        DomainAttr {
            flags: DomainCapFlags::REG,
            reg_cost: LinearCost { overhead, growth },
            rkey_packed_size: 12,
        }
    }

    fn one_lane_key(rsc_index: Option<RscIndex>) -> EpConfigKey {
        let mut lanes = [None; MAX_LANES];
        lanes[0] = rsc_index;
        EpConfigKey {
            num_lanes: 1,
            am_lane: Some(LaneIndex::new(0)),
            wireup_msg_lane: Some(LaneIndex::new(0)),
            rma_lanes_map: 1,
            amo_lanes_map: 0,
            lanes,
        }
    }

    #[test]
    fn key_equality_ignores_tail_beyond_num_lanes() {
        let mut a = one_lane_key(Some(RscIndex(3)));
        let mut b = one_lane_key(Some(RscIndex(3)));
        a.lanes[5] = Some(RscIndex(7));
        b.lanes[5] = None;

        assert_eq!(a, a);
        assert_eq!(a, b);
        assert_eq!(b, a);

        b.lanes[0] = Some(RscIndex(4));
        assert_ne!(a, b);
    }

    #[test]
    fn am_short_absent_when_not_advertised() {
        let rscs = vec![rsc(am_iface(IfaceCapFlags::AM_BCOPY, 10e9), 0)];
        let domains = vec![DomainAttr::default()];
        let cfg = EpConfig::init(
            one_lane_key(Some(RscIndex(0))),
            &rscs,
            &domains,
            &ContextConfig::default(),
        );

        assert_eq!(None, cfg.max_eager_short);
        assert_eq!(None, cfg.max_am_short);
        assert_eq!(Some(8192), cfg.max_am_bcopy);
        // no registration support: zero-copy path disabled
        assert_eq!(usize::MAX, cfg.zcopy_thresh);
        assert_eq!(None, cfg.sync_zcopy_thresh);
    }

    #[test]
    fn am_short_subtracts_headers() {
        let rscs = vec![rsc(
            am_iface(IfaceCapFlags::AM_SHORT | IfaceCapFlags::AM_BCOPY, 10e9),
            0,
        )];
        let domains = vec![DomainAttr::default()];
        let cfg = EpConfig::init(
            one_lane_key(Some(RscIndex(0))),
            &rscs,
            &domains,
            &ContextConfig::default(),
        );

        assert_eq!(Some(128 - EagerHdr::ENCODE_LEN), cfg.max_eager_short);
        assert_eq!(Some(128 - 8), cfg.max_am_short);
    }

    #[test]
    fn auto_zcopy_thresh_saturates_when_registration_never_pays_off() {
        // denominator: 1/5e9 - 1/10e9 - 1e-9 = 2e-10 - 1e-10 - 1e-9 < 0
        let rscs = vec![rsc(
            am_iface(IfaceCapFlags::AM_ZCOPY | IfaceCapFlags::AM_BCOPY, 10e9),
            0,
        )];
        let domains = vec![reg_domain(1e-7, 1e-9)];
        let config = ContextConfig {
            bcopy_bw: 5e9,
            ..ContextConfig::default()
        };
        let cfg = EpConfig::init(one_lane_key(Some(RscIndex(0))), &rscs, &domains, &config);

        assert_eq!(usize::MAX, cfg.zcopy_thresh);
        assert_eq!(None, cfg.sync_zcopy_thresh);
    }

    #[test]
    fn auto_zcopy_thresh_positive_denominator() {
        // denominator: 1/5e9 - 1/100e9 - 0 = 1.9e-10; 1e-7 / 1.9e-10 ~ 526
        let rscs = vec![rsc(
            am_iface(IfaceCapFlags::AM_ZCOPY | IfaceCapFlags::AM_BCOPY, 100e9),
            0,
        )];
        let domains = vec![reg_domain(1e-7, 0.0)];
        let config = ContextConfig {
            bcopy_bw: 5e9,
            ..ContextConfig::default()
        };
        let cfg = EpConfig::init(one_lane_key(Some(RscIndex(0))), &rscs, &domains, &config);

        let thresh = cfg.zcopy_thresh;
        assert!(thresh > 0 && thresh < usize::MAX);
        assert_eq!(Some(thresh), cfg.sync_zcopy_thresh);
        assert_eq!(Some(1 << 20), cfg.max_am_zcopy);
    }

    #[test]
    fn fixed_zcopy_thresh_is_taken_literally() {
        let rscs = vec![rsc(
            am_iface(IfaceCapFlags::AM_ZCOPY | IfaceCapFlags::AM_BCOPY, 10e9),
            0,
        )];
        let domains = vec![reg_domain(1e-7, 1e-9)];
        let config = ContextConfig {
            zcopy_thresh: ThreshConfig::Fixed(4096),
            ..ContextConfig::default()
        };
        let cfg = EpConfig::init(one_lane_key(Some(RscIndex(0))), &rscs, &domains, &config);

        assert_eq!(4096, cfg.zcopy_thresh);
        assert_eq!(Some(4096), cfg.sync_zcopy_thresh);
    }

    #[test]
    fn stub_lane_falls_back_to_small_bcopy() {
        let cfg = EpConfig::init(
            EpConfigKey::stub(),
            &[],
            &[],
            &ContextConfig::default(),
        );

        assert_eq!(Some(STUB_MAX_BCOPY), cfg.max_am_bcopy);
        assert_eq!(Some(STUB_MAX_BCOPY), cfg.max_put_bcopy);
        assert_eq!(1, cfg.rma_lanes.len());
        assert_eq!(1, cfg.amo_lanes.len());
    }

    #[test]
    fn rma_last_scanned_lane_wins() {
        let rscs = vec![
            rsc(am_iface(IfaceCapFlags::PUT_BCOPY, 10e9), 0),
            rsc(
                IfaceAttr {
                    flags: IfaceCapFlags::PUT_BCOPY,
                    put: OpCaps {
                        max_bcopy: 1111,
                        ..OpCaps::default()
                    },
                    ..IfaceAttr::default()
                },
                0,
            ),
        ];
        let domains = vec![DomainAttr::default()];

        let mut lanes = [None; MAX_LANES];
        lanes[0] = Some(RscIndex(0));
        lanes[1] = Some(RscIndex(1));
        let key = EpConfigKey {
            num_lanes: 2,
            am_lane: None,
            wireup_msg_lane: None,
            rma_lanes_map: 0b11,
            amo_lanes_map: 0,
            lanes,
        };
        let cfg = EpConfig::init(key, &rscs, &domains, &ContextConfig::default());

        assert_eq!(vec![LaneIndex::new(0), LaneIndex::new(1)], cfg.rma_lanes);
        assert_eq!(Some(1111), cfg.max_put_bcopy);
    }

    #[test]
    fn send_mode_honors_thresholds() {
        let rscs = vec![rsc(
            am_iface(IfaceCapFlags::AM_SHORT | IfaceCapFlags::AM_BCOPY, 10e9),
            0,
        )];
        let domains = vec![DomainAttr::default()];
        let config = ContextConfig {
            rndv_thresh: ThreshConfig::Fixed(1 << 16),
            ..ContextConfig::default()
        };
        let mut cfg = EpConfig::init(one_lane_key(Some(RscIndex(0))), &rscs, &domains, &config);
        cfg.zcopy_thresh = 4096;

        assert_eq!(SendMode::EagerShort, cfg.send_mode(64));
        assert_eq!(SendMode::EagerBcopy, cfg.send_mode(1024));
        assert_eq!(SendMode::EagerZcopy, cfg.send_mode(8192));
        assert_eq!(SendMode::Rndv, cfg.send_mode(1 << 16));
    }
}
