//! See [`Error`].

/// Status raised or propagated by the runtime core.
///
/// This is deliberately a small, `Copy` code rather than a chain of error
/// sources: statuses cross the wire (an acknowledgement header carries the
/// completion status of the remote operation) and are stored inside
/// requests, so they must be cheap to move and to encode. Call sites that
/// have richer context (an `errno`, a socket address) log it via
/// [`tracing`] at the point of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Allocation failed, or a buffering limit was reached.
    #[error("out of memory")]
    NoMemory,
    /// The transport is momentarily out of send resources; retry after
    /// progress.
    #[error("no resources are available to initiate the operation")]
    NoResource,
    /// The operation could neither complete nor be queued this instant.
    #[error("no progress was made")]
    NoProgress,
    /// The request was aborted by an explicit cancel or by endpoint
    /// destruction.
    #[error("operation canceled")]
    Canceled,
    /// A shared-memory segment call (`shmget`/`shmat`) failed.
    #[error("shared memory segment operation failed")]
    ShmemSegment,
    /// The requested size exceeds the configured limit.
    #[error("size exceeds limit")]
    ExceedsLimit,
    /// The feature is not compiled in or no transport provides it.
    #[error("operation not supported")]
    Unsupported,
    /// The peer sent something the protocol cannot interpret.
    #[error("protocol error")]
    Protocol,
    /// The remote endpoint identifier has not been resolved yet.
    #[error("remote endpoint is unreachable")]
    Unreachable,
    /// The incoming message does not fit the posted receive buffer.
    #[error("message truncated")]
    Truncated,
    /// Opaque transport I/O failure; details are logged at the source.
    #[error("transport input/output error")]
    Io,
}

/// Outcome delivered through a request's completion channel.
pub type Completion = Result<(), Error>;

impl Error {
    /// Encodes this status as a wire byte. `0` is reserved for success.
    #[must_use]
    pub const fn to_wire(self) -> u8 {
        match self {
            Self::NoMemory => 1,
            Self::NoResource => 2,
            Self::NoProgress => 3,
            Self::Canceled => 4,
            Self::ShmemSegment => 5,
            Self::ExceedsLimit => 6,
            Self::Unsupported => 7,
            Self::Protocol => 8,
            Self::Unreachable => 9,
            Self::Truncated => 10,
            Self::Io => 11,
        }
    }

    /// Decodes a wire byte produced by [`Error::to_wire`].
    ///
    /// Returns [`None`] for `0` (success) and for bytes outside the known
    /// range.
    #[must_use]
    pub const fn from_wire(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::NoMemory,
            2 => Self::NoResource,
            3 => Self::NoProgress,
            4 => Self::Canceled,
            5 => Self::ShmemSegment,
            6 => Self::ExceedsLimit,
            7 => Self::Unsupported,
            8 => Self::Protocol,
            9 => Self::Unreachable,
            10 => Self::Truncated,
            11 => Self::Io,
            _ => return None,
        })
    }
}

/// Encodes a completion as a wire status byte.
#[must_use]
pub const fn completion_to_wire(completion: Completion) -> u8 {
    match completion {
        Ok(()) => 0,
        Err(err) => err.to_wire(),
    }
}

/// Decodes a wire status byte into a completion.
///
/// # Errors
///
/// Errors with [`Error::Protocol`] if the byte is not a known status code.
pub const fn completion_from_wire(raw: u8) -> Result<Completion, Error> {
    if raw == 0 {
        return Ok(Ok(()));
    }
    match Error::from_wire(raw) {
        Some(err) => Ok(Err(err)),
        None => Err(Error::Protocol),
    }
}
