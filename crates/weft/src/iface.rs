//! Capability records advertised by transport interfaces and memory
//! domains.
//!
//! The protocol core derives per-endpoint size thresholds from these
//! records; see the endpoint configuration logic in `weft_proto`. The
//! records are plain data - each transport fills one in at interface
//! creation time and the worker keeps them in its resource table.

bitflags::bitflags! {
    /// Operations an interface advertises.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct IfaceCapFlags: u32 {
        /// Inline active-message send.
        const AM_SHORT  = 1 << 0;
        /// Buffered-copy active-message send.
        const AM_BCOPY  = 1 << 1;
        /// Zero-copy active-message send from registered memory.
        const AM_ZCOPY  = 1 << 2;
        /// Inline remote put.
        const PUT_SHORT = 1 << 3;
        /// Buffered-copy remote put.
        const PUT_BCOPY = 1 << 4;
        /// Zero-copy remote put.
        const PUT_ZCOPY = 1 << 5;
        /// Buffered-copy remote get.
        const GET_BCOPY = 1 << 6;
        /// Zero-copy remote get.
        const GET_ZCOPY = 1 << 7;
        /// 32-bit remote atomics.
        const AMO32     = 1 << 8;
        /// 64-bit remote atomics.
        const AMO64     = 1 << 9;
    }
}

/// Size maxima for one operation family (active message, put, or get).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OpCaps {
    /// Largest inline payload, in bytes.
    pub max_short: usize,
    /// Largest buffered-copy payload, in bytes.
    pub max_bcopy: usize,
    /// Largest zero-copy payload, in bytes.
    pub max_zcopy: usize,
}

/// Capabilities of one transport interface.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IfaceAttr {
    /// Advertised operation flags.
    pub flags: IfaceCapFlags,
    /// Active-message size maxima.
    pub am: OpCaps,
    /// Remote-put size maxima.
    pub put: OpCaps,
    /// Remote-get size maxima.
    pub get: OpCaps,
    /// Sustained bandwidth estimate, in bytes per second.
    pub bandwidth: f64,
    /// One-way latency estimate, in seconds.
    pub latency: f64,
}

#[cfg(feature = "serde")]
mod cap_flags_serde {
    // bitflags carries its own serde support only behind its `serde`
    // feature; encoding the raw bits keeps the config format stable.
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::IfaceCapFlags;

    impl Serialize for IfaceCapFlags {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            self.bits().serialize(serializer)
        }
    }

    impl<'de> Deserialize<'de> for IfaceCapFlags {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            Ok(Self::from_bits_truncate(u32::deserialize(deserializer)?))
        }
    }
}

bitflags::bitflags! {
    /// Operations a memory domain advertises.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DomainCapFlags: u32 {
        /// The domain can register arbitrary user memory for zero-copy.
        const REG = 1 << 0;
    }
}

/// Linear cost model `overhead + growth * size`, in seconds.
///
/// Used to estimate memory-registration cost when deciding whether a
/// zero-copy send pays off over a buffered copy.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinearCost {
    /// Fixed cost per operation.
    pub overhead: f64,
    /// Cost per byte.
    pub growth: f64,
}

/// Attributes of one memory domain.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DomainAttr {
    /// Advertised domain flags.
    pub flags: DomainCapFlags,
    /// Registration cost model; meaningful only with
    /// [`DomainCapFlags::REG`].
    pub reg_cost: LinearCost,
    /// Size in bytes of a remote key packed by this domain.
    pub rkey_packed_size: usize,
}
