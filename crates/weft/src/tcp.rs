//! Socket-backed lane: framing, interface surface, and small socket
//! helpers.

use std::{
    convert::Infallible,
    io::{self, Read as _, Write as _},
    net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    os::fd::{AsRawFd, RawFd},
};

use ahash::AHashMap;
use octs::{BufTooShortOr, Bytes, BytesMut, Decode, Encode, FixedEncodeLen, Read, Write};
use socket2::{Domain, Socket, Type};
use tracing::{debug, trace, warn};

use crate::{
    error::Error,
    flow::CreditBucket,
    iface::{IfaceAttr, IfaceCapFlags, OpCaps},
    lane::LaneOps,
    pending::{PendingQueue, PendingReq},
};

/// Default largest buffered-copy payload for a TCP lane.
pub const DEFAULT_MAX_BCOPY: usize = 8 * 1024;

/// Fallback link speed when the interface does not report one, in Mbit/s.
const DEFAULT_SPEED_MBPS: f64 = 10_000.0;

/// Fixed one-way latency estimate for a TCP path, in seconds.
const TCP_LATENCY: f64 = 10e-6;

/// Header in front of every active message on a TCP lane.
///
/// With the `debug-data` feature each frame additionally carries a
/// per-lane sequence number, for tracing lost or reordered frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct TcpAmHdr {
    /// Active-message id dispatched on the receiver.
    pub am_id: u16,
    /// Payload length in bytes, excluding this header.
    pub length: u16,
    /// Frame sequence number.
    #[cfg(feature = "debug-data")]
    pub sn: u32,
}

impl FixedEncodeLen for TcpAmHdr {
    #[cfg(feature = "debug-data")]
    const ENCODE_LEN: usize = u16::ENCODE_LEN + u16::ENCODE_LEN + u32::ENCODE_LEN;
    #[cfg(not(feature = "debug-data"))]
    const ENCODE_LEN: usize = u16::ENCODE_LEN + u16::ENCODE_LEN;
}

impl Encode for TcpAmHdr {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.am_id)?;
        dst.write(&self.length)?;
        #[cfg(feature = "debug-data")]
        dst.write(&self.sn)?;
        Ok(())
    }
}

impl Decode for TcpAmHdr {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            am_id: src.read()?,
            length: src.read()?,
            #[cfg(feature = "debug-data")]
            sn: src.read()?,
        })
    }
}

/// User-facing configuration of a TCP interface.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TcpIfaceConfig {
    /// Prefer the host's default-route interface when no name is given.
    pub prefer_default: bool,
    /// Listen backlog.
    pub backlog: u32,
    /// Socket send buffer size; `0` keeps the kernel default.
    pub sndbuf: usize,
    /// Socket receive buffer size; `0` keeps the kernel default.
    pub rcvbuf: usize,
    /// Largest buffered-copy payload accepted by lanes of this interface.
    pub max_bcopy: usize,
}

impl Default for TcpIfaceConfig {
    fn default() -> Self {
        Self {
            prefer_default: true,
            backlog: 128,
            sndbuf: 0,
            rcvbuf: 0,
            max_bcopy: DEFAULT_MAX_BCOPY,
        }
    }
}

/// A listening TCP interface.
///
/// Tracks the sockets of lanes it accepted, keyed by file descriptor.
#[derive(Debug)]
pub struct TcpIface {
    listener: TcpListener,
    if_name: String,
    fd_hash: AHashMap<RawFd, SocketAddr>,
    config: TcpIfaceConfig,
}

impl TcpIface {
    /// Opens a listening interface on an ephemeral port.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::Io`] if the listening socket cannot be set up;
    /// the underlying error is logged.
    pub fn open(if_name: &str, config: TcpIfaceConfig) -> Result<Self, Error> {
        let listener = (|| {
            let socket = socket_create(&config)?;
            socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
            socket.listen(config.backlog as i32)?;
            Ok::<_, io::Error>(TcpListener::from(socket))
        })()
        .map_err(|err| {
            warn!(%err, if_name, "failed to open tcp interface");
            Error::Io
        })?;

        debug!(if_name, addr = ?listener.local_addr().ok(), "opened tcp interface");
        Ok(Self {
            listener,
            if_name: if_name.to_owned(),
            fd_hash: AHashMap::new(),
            config,
        })
    }

    /// Gets the bound listening address.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::Io`] if the socket has been shut down.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener.local_addr().map_err(|_| Error::Io)
    }

    /// Accepts one incoming connection as a new lane.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::Io`] if the accept fails.
    pub fn accept(&mut self) -> Result<TcpLane, Error> {
        let (stream, peer) = self.listener.accept().map_err(|err| {
            warn!(%err, "tcp accept failed");
            Error::Io
        })?;
        self.fd_hash.insert(stream.as_raw_fd(), peer);
        trace!(%peer, "accepted tcp lane");
        Ok(TcpLane::from_stream(stream, self.config.max_bcopy))
    }

    /// Gets the peer address of an accepted socket, if it is still
    /// tracked.
    #[must_use]
    pub fn lookup_fd(&self, fd: RawFd) -> Option<SocketAddr> {
        self.fd_hash.get(&fd).copied()
    }

    /// Gets the interface name this interface was opened against.
    #[must_use]
    pub fn if_name(&self) -> &str {
        &self.if_name
    }

    /// Builds the capability record for lanes of this interface.
    #[must_use]
    pub fn iface_attr(&self) -> IfaceAttr {
        let (latency, bandwidth) = netif_caps(&self.if_name);
        IfaceAttr {
            flags: IfaceCapFlags::AM_BCOPY,
            am: OpCaps {
                max_bcopy: self.config.max_bcopy,
                ..OpCaps::default()
            },
            put: OpCaps::default(),
            get: OpCaps::default(),
            bandwidth,
            latency,
        }
    }
}

/// One connected TCP socket serving as a lane endpoint.
#[derive(Debug)]
pub struct TcpLane {
    stream: TcpStream,
    pub(crate) pending: PendingQueue,
    pub(crate) flow: CreditBucket,
    max_bcopy: usize,
    #[cfg(feature = "debug-data")]
    sn: u32,
}

impl TcpLane {
    /// Send credit of a freshly connected lane.
    ///
    /// A TCP socket applies its own backpressure through the send buffer;
    /// the credit pool exists so that the pending discipline behaves the
    /// same on every lane kind.
    const DEFAULT_CREDITS: usize = 64;

    /// Connects to a peer interface.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::Io`] if the connection fails; the underlying
    /// error is logged.
    pub fn connect(addr: SocketAddr, config: &TcpIfaceConfig) -> Result<Self, Error> {
        let stream = (|| {
            let socket = socket_create(config)?;
            socket.connect(&addr.into())?;
            Ok::<_, io::Error>(TcpStream::from(socket))
        })()
        .map_err(|err| {
            warn!(%err, %addr, "tcp connect failed");
            Error::Io
        })?;

        trace!(%addr, "connected tcp lane");
        Ok(Self::from_stream(stream, config.max_bcopy))
    }

    /// Wraps an already connected socket.
    #[must_use]
    pub fn from_stream(stream: TcpStream, max_bcopy: usize) -> Self {
        Self {
            stream,
            pending: PendingQueue::new(),
            flow: CreditBucket::new(Self::DEFAULT_CREDITS),
            max_bcopy,
            #[cfg(feature = "debug-data")]
            sn: 0,
        }
    }

    /// Gets the peer address.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::Io`] if the socket has been shut down.
    pub fn peer_addr(&self) -> Result<SocketAddr, Error> {
        self.stream.peer_addr().map_err(|_| Error::Io)
    }
}

impl LaneOps for TcpLane {
    fn pending_add(&mut self, req: PendingReq) -> Result<(), PendingReq> {
        if self.flow.has(1) {
            return Err(req);
        }
        self.pending.push_back(req);
        Ok(())
    }

    fn pending_purge(&mut self, release: &mut dyn FnMut(PendingReq)) {
        self.pending.purge(release);
    }

    fn am_bcopy(
        &mut self,
        id: u8,
        pack: &mut dyn FnMut(&mut BytesMut),
    ) -> Result<usize, Error> {
        if self.flow.consume(1).is_err() {
            return Err(Error::NoResource);
        }

        let mut frame = BytesMut::with_capacity(TcpAmHdr::ENCODE_LEN + self.max_bcopy);
        // Reserve space for the header, pack the payload, then patch the
        // header in once the length is known.
        frame.resize(TcpAmHdr::ENCODE_LEN, 0);
        pack(&mut frame);
        let len = frame.len() - TcpAmHdr::ENCODE_LEN;
        if len > self.max_bcopy || len > usize::from(u16::MAX) {
            self.flow.refill_exact(1);
            return Err(Error::ExceedsLimit);
        }

        let hdr = TcpAmHdr {
            am_id: u16::from(id),
            length: len as u16,
            #[cfg(feature = "debug-data")]
            sn: {
                let sn = self.sn;
                self.sn = self.sn.wrapping_add(1);
                sn
            },
        };
        let mut hdr_buf = BytesMut::with_capacity(TcpAmHdr::ENCODE_LEN);
        hdr_buf
            .write(&hdr)
            .map_err(|_| Error::Protocol)?;
        frame[..TcpAmHdr::ENCODE_LEN].copy_from_slice(&hdr_buf);

        send_exact(&mut self.stream, &frame)?;
        trace!(id, len, "sent tcp active message");
        Ok(len)
    }

    fn destroy(&mut self) {
        debug_assert!(self.pending.is_empty(), "destroying lane with parked requests");
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Reads one framed active message off a socket.
///
/// # Errors
///
/// Errors with [`Error::Io`] on socket failure or truncated frames.
pub fn recv_frame(stream: &mut TcpStream) -> Result<(TcpAmHdr, Bytes), Error> {
    let mut hdr_buf = vec![0_u8; TcpAmHdr::ENCODE_LEN];
    recv_exact(stream, &mut hdr_buf)?;
    let hdr = Bytes::from(hdr_buf)
        .read::<TcpAmHdr>()
        .map_err(|_| Error::Protocol)?;

    let mut payload = vec![0_u8; usize::from(hdr.length)];
    recv_exact(stream, &mut payload)?;
    Ok((hdr, Bytes::from(payload)))
}

/// Writes all of `data` to the socket.
///
/// # Errors
///
/// Errors with [`Error::Io`] on socket failure; the underlying error is
/// logged.
pub fn send_exact(stream: &mut TcpStream, data: &[u8]) -> Result<(), Error> {
    stream.write_all(data).map_err(|err| {
        warn!(%err, "tcp send failed");
        Error::Io
    })
}

/// Fills all of `data` from the socket.
///
/// # Errors
///
/// Errors with [`Error::Io`] on socket failure or early end-of-stream.
pub fn recv_exact(stream: &mut TcpStream, data: &mut [u8]) -> Result<(), Error> {
    stream.read_exact(data).map_err(|err| {
        warn!(%err, "tcp recv failed");
        Error::Io
    })
}

/// Creates a stream socket with the configured buffer sizes applied.
fn socket_create(config: &TcpIfaceConfig) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_nodelay(true)?;
    if config.sndbuf > 0 {
        socket.set_send_buffer_size(config.sndbuf)?;
    }
    if config.rcvbuf > 0 {
        socket.set_recv_buffer_size(config.rcvbuf)?;
    }
    Ok(socket)
}

/// Gets if `if_name` names a network interface on this host.
#[must_use]
pub fn netif_check(if_name: &str) -> bool {
    let Ok(name) = std::ffi::CString::new(if_name) else {
        return false;
    };
    unsafe { libc::if_nametoindex(name.as_ptr()) != 0 }
}

/// Estimates `(latency, bandwidth)` of an interface in seconds and bytes
/// per second.
///
/// Reads the advertised link speed from sysfs, falling back to a 10GbE
/// estimate for interfaces that do not report one (loopback, virtual
/// devices).
#[must_use]
pub fn netif_caps(if_name: &str) -> (f64, f64) {
    let speed_mbps = std::fs::read_to_string(format!("/sys/class/net/{if_name}/speed"))
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|speed| *speed > 0.0)
        .unwrap_or(DEFAULT_SPEED_MBPS);
    (TCP_LATENCY, speed_mbps * 1e6 / 8.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn am_hdr_encode_decode() {
        let hdr = TcpAmHdr {
            am_id: 0x0102,
            length: 1200,
            #[cfg(feature = "debug-data")]
            sn: 42,
        };
        let mut buf = BytesMut::with_capacity(TcpAmHdr::ENCODE_LEN);

        buf.write(&hdr).unwrap();
        assert_eq!(TcpAmHdr::ENCODE_LEN, buf.len());

        assert_eq!(hdr, buf.freeze().read::<TcpAmHdr>().unwrap());
    }

    #[test]
    fn loopback_frame_round_trip() {
        let mut iface = TcpIface::open("lo", TcpIfaceConfig::default()).unwrap();
        let addr = iface.local_addr().unwrap();

        let mut lane = TcpLane::connect(addr, &TcpIfaceConfig::default()).unwrap();
        let mut accepted = iface.accept().unwrap();

        let sent = lane
            .am_bcopy(3, &mut |buf| buf.extend_from_slice(b"hello, lane"))
            .unwrap();
        assert_eq!(11, sent);

        let (hdr, payload) = recv_frame(&mut accepted.stream).unwrap();
        assert_eq!(3, hdr.am_id);
        assert_eq!(11, hdr.length);
        assert_eq!(Bytes::from_static(b"hello, lane"), payload);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut iface = TcpIface::open("lo", TcpIfaceConfig::default()).unwrap();
        let addr = iface.local_addr().unwrap();
        let mut lane = TcpLane::connect(addr, &TcpIfaceConfig::default()).unwrap();
        let _accepted = iface.accept().unwrap();

        let before = lane.flow.rem();
        let big = vec![0_u8; DEFAULT_MAX_BCOPY + 1];
        let result = lane.am_bcopy(1, &mut |buf| buf.extend_from_slice(&big));
        assert_eq!(Err(Error::ExceedsLimit), result);
        // a rejected send does not leak credit
        assert_eq!(before, lane.flow.rem());
    }

    #[test]
    fn loopback_interface_exists() {
        assert!(netif_check("lo"));
        assert!(!netif_check("definitely-not-an-interface-0"));

        let (latency, bandwidth) = netif_caps("lo");
        assert!(latency > 0.0);
        assert!(bandwidth > 0.0);
    }
}
