//! Runtime-wide configuration injected into a worker at creation.

/// A size threshold that is either tuned automatically or pinned by the
/// user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ThreshConfig {
    /// Derive the threshold from transport and memory-domain attributes.
    #[default]
    Auto,
    /// Use this exact byte count.
    Fixed(usize),
}

/// Tunables shared by every worker of a context.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContextConfig {
    /// Smallest message size at which buffered copy is preferred over an
    /// inline short send. `0` keeps inline sends whenever the lane allows
    /// them.
    pub bcopy_thresh: usize,
    /// Message size at which zero-copy from registered memory is
    /// preferred over buffered copy.
    pub zcopy_thresh: ThreshConfig,
    /// Message size at which the rendezvous protocol kicks in.
    ///
    /// [`ThreshConfig::Auto`] currently leaves the size-driven switch
    /// disabled; rendezvous is still available by starting it explicitly.
    pub rndv_thresh: ThreshConfig,
    /// Effective memcpy bandwidth assumed for buffered copies, in bytes
    /// per second. Feeds the automatic zero-copy threshold.
    pub bcopy_bw: f64,
    /// Selects the protocol-select rendezvous receive path instead of the
    /// legacy one. The two are observationally equivalent; they differ in
    /// how the payload lane is chosen.
    pub proto_enable: bool,
    /// Most unexpected receive descriptors a worker may buffer before
    /// incoming rendezvous requests fail with out-of-memory.
    pub max_unexp_descs: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            bcopy_thresh: 0,
            zcopy_thresh: ThreshConfig::Auto,
            rndv_thresh: ThreshConfig::Auto,
            bcopy_bw: 5.8e9,
            proto_enable: true,
            max_unexp_descs: usize::MAX,
        }
    }
}

/// The context object a worker runs under.
///
/// Configuration parsing and resource discovery live outside the core;
/// whatever performs them hands the result in here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    /// Context-wide tunables.
    pub config: ContextConfig,
}
