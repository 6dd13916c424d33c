//! Packed worker addresses, as exchanged out-of-band before endpoints can
//! be wired.
//!
//! A worker address carries the worker's identity plus one entry per
//! transport lane the peer may wire: which resource backs it, which
//! transport family it speaks, and the transport-specific address bytes
//! (for TCP: IPv4 address and port).

use octs::{Bytes, BytesMut, FixedEncodeLen, Read, Write};
use weft::error::Error;

use crate::ep::config::{RscIndex, MAX_LANES};

/// Wire marker for "no resource index" (a stub entry).
const RSC_NONE: u8 = 0xff;

/// Transport family of one address entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneAddrKind {
    /// Placeholder entry; the lane buffers until wireup completes.
    Stub,
    /// Socket-backed lane; the entry data is an IPv4 address and port.
    Tcp,
}

impl LaneAddrKind {
    const fn to_raw(self) -> u8 {
        match self {
            Self::Stub => 0,
            Self::Tcp => 1,
        }
    }

    const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Stub,
            1 => Self::Tcp,
            _ => return None,
        })
    }
}

/// One wireable lane advertised in a worker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    /// Resource behind the lane in the advertising worker's table;
    /// [`None`] for a stub entry.
    pub rsc_index: Option<RscIndex>,
    /// Transport family of the lane.
    pub kind: LaneAddrKind,
    /// Transport-specific address bytes.
    pub data: Bytes,
}

/// Decoded form of a packed worker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAddress {
    /// Identifier of the advertising worker.
    pub uuid: u64,
    /// Human-readable worker name. Debug only.
    pub name: String,
    /// Wireable lanes, in the order the advertiser prefers them.
    pub entries: Vec<AddressEntry>,
}

impl WorkerAddress {
    /// Packs this address into its wire form.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::ExceedsLimit`] if the name, an entry's data,
    /// or the entry count does not fit the one-byte length fields.
    pub fn pack(&self) -> Result<Bytes, Error> {
        if self.name.len() > usize::from(u8::MAX)
            || self.entries.len() > MAX_LANES
            || self.entries.iter().any(|e| e.data.len() > usize::from(u8::MAX))
        {
            return Err(Error::ExceedsLimit);
        }

        let mut buf = BytesMut::with_capacity(
            u64::ENCODE_LEN + 2 + self.name.len()
                + self.entries.iter().map(|e| 3 + e.data.len()).sum::<usize>(),
        );
        buf.write(&self.uuid).map_err(|_| Error::Protocol)?;
        buf.write(&(self.name.len() as u8)).map_err(|_| Error::Protocol)?;
        buf.write_from(self.name.as_bytes()).map_err(|_| Error::Protocol)?;
        buf.write(&(self.entries.len() as u8)).map_err(|_| Error::Protocol)?;
        for entry in &self.entries {
            let rsc = entry.rsc_index.map_or(RSC_NONE, |rsc| rsc.0);
            buf.write(&rsc).map_err(|_| Error::Protocol)?;
            buf.write(&entry.kind.to_raw()).map_err(|_| Error::Protocol)?;
            buf.write(&(entry.data.len() as u8)).map_err(|_| Error::Protocol)?;
            buf.write_from(entry.data.clone()).map_err(|_| Error::Protocol)?;
        }
        Ok(buf.freeze())
    }

    /// Unpacks a wire-form address.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::Protocol`] on truncated input, an unknown
    /// entry kind, or a malformed name.
    pub fn unpack(raw: &[u8]) -> Result<Self, Error> {
        let mut src = Bytes::copy_from_slice(raw);

        let uuid = src.read::<u64>().map_err(|_| Error::Protocol)?;
        let name_len = src.read::<u8>().map_err(|_| Error::Protocol)?;
        let name_bytes = src
            .read_next(usize::from(name_len))
            .map_err(|_| Error::Protocol)?;
        let name =
            String::from_utf8(name_bytes.to_vec()).map_err(|_| Error::Protocol)?;

        let count = src.read::<u8>().map_err(|_| Error::Protocol)?;
        if usize::from(count) > MAX_LANES {
            return Err(Error::Protocol);
        }

        let mut entries = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let rsc = src.read::<u8>().map_err(|_| Error::Protocol)?;
            let kind_raw = src.read::<u8>().map_err(|_| Error::Protocol)?;
            let kind = LaneAddrKind::from_raw(kind_raw).ok_or(Error::Protocol)?;
            let data_len = src.read::<u8>().map_err(|_| Error::Protocol)?;
            let data = src
                .read_next(usize::from(data_len))
                .map_err(|_| Error::Protocol)?;
            entries.push(AddressEntry {
                rsc_index: (rsc != RSC_NONE).then_some(RscIndex(rsc)),
                kind,
                data,
            });
        }

        Ok(Self { uuid, name, entries })
    }
}

/// Encodes a TCP entry's data bytes from an IPv4 socket address.
#[must_use]
pub fn pack_tcp_entry_data(addr: std::net::SocketAddrV4) -> Bytes {
    let mut buf = BytesMut::with_capacity(6);
    buf.extend_from_slice(&addr.ip().octets());
    buf.extend_from_slice(&addr.port().to_be_bytes());
    buf.freeze()
}

/// Decodes a TCP entry's data bytes.
///
/// # Errors
///
/// Errors with [`Error::Protocol`] unless the data is exactly an IPv4
/// address and port.
pub fn unpack_tcp_entry_data(data: &[u8]) -> Result<std::net::SocketAddrV4, Error> {
    let octets: [u8; 4] = data.get(..4).and_then(|b| b.try_into().ok()).ok_or(Error::Protocol)?;
    let port: [u8; 2] = data.get(4..6).and_then(|b| b.try_into().ok()).ok_or(Error::Protocol)?;
    if data.len() != 6 {
        return Err(Error::Protocol);
    }
    Ok(std::net::SocketAddrV4::new(
        octets.into(),
        u16::from_be_bytes(port),
    ))
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let address = WorkerAddress {
            uuid: 0xfeed_face_dead_beef,
            name: "worker-a".to_owned(),
            entries: vec![
                AddressEntry {
                    rsc_index: Some(RscIndex(2)),
                    kind: LaneAddrKind::Tcp,
                    data: pack_tcp_entry_data(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4242)),
                },
                AddressEntry {
                    rsc_index: None,
                    kind: LaneAddrKind::Stub,
                    data: Bytes::new(),
                },
            ],
        };

        let packed = address.pack().unwrap();
        assert_eq!(address, WorkerAddress::unpack(&packed).unwrap());
    }

    #[test]
    fn unpack_rejects_truncation_and_garbage() {
        let address = WorkerAddress {
            uuid: 1,
            name: "w".to_owned(),
            entries: Vec::new(),
        };
        let packed = address.pack().unwrap();

        assert_eq!(Err(Error::Protocol), WorkerAddress::unpack(&packed[..packed.len() - 1]));
        assert_eq!(Err(Error::Protocol), WorkerAddress::unpack(&[1, 2, 3]));
    }

    #[test]
    fn tcp_entry_data_round_trip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 65000);
        let data = pack_tcp_entry_data(addr);
        assert_eq!(Ok(addr), unpack_tcp_entry_data(&data));
        assert_eq!(Err(Error::Protocol), unpack_tcp_entry_data(&data[..5]));
    }
}
