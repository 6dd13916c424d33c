//! SysV shared-memory segments and their packed remote keys.
//!
//! A process that owns data to expose allocates a [`SysvSegment`] and
//! ships the [`SysvRkey`] to its peer inside a rendezvous header; the peer
//! [attaches](SysvRemoteSeg::attach) the segment and translates the
//! owner's virtual addresses into its own mapping. Only the allocator ever
//! destroys the segment; an attacher merely detaches.

use std::{convert::Infallible, io, ptr::NonNull};

use octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write};
use tracing::{debug, error, trace};

use crate::error::Error;

/// SysV permission bits for created segments: read/write for user and
/// group.
const SYSV_PERM: i32 = 0o660;

/// Page sizes used to round segment lengths up.
const PAGE_SIZE: usize = 4096;
#[cfg(target_os = "linux")]
const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Whether segment allocation may, must, or must not use huge pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HugetlbMode {
    /// Never request huge pages.
    No,
    /// Request huge pages first, silently falling back to regular pages.
    #[default]
    Try,
    /// Require huge pages; allocation fails if they are unavailable.
    Yes,
}

bitflags::bitflags! {
    /// Flags controlling segment allocation.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct SegFlags: u32 {
        /// Map the segment exactly at the caller-supplied address.
        const FIXED = 1 << 0;
    }
}

/// An owned SysV shared-memory segment.
///
/// Dropping the segment detaches it and marks it for destruction; peers
/// that attached before the drop keep their mapping until they detach.
#[derive(Debug)]
pub struct SysvSegment {
    seg_id: u32,
    address: NonNull<u8>,
    length: usize,
}

// The segment is plain memory; the raw pointer is not thread-affine.
unsafe impl Send for SysvSegment {}

impl SysvSegment {
    /// Allocates a segment of at least `length` bytes.
    ///
    /// With [`HugetlbMode::Try`] (or [`Yes`](HugetlbMode::Yes)) the first
    /// attempt requests huge pages and allows the rounded size to grow up
    /// to twice `length`; on failure (unless huge pages were required) a
    /// second attempt uses regular pages with no size cap.
    ///
    /// Unless [`SegFlags::FIXED`] is set, `address` is discarded and the
    /// kernel picks the mapping address.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::NoMemory`] when the kernel is out of pages,
    /// [`Error::Unsupported`] when huge pages were required but the
    /// platform has none, and [`Error::ShmemSegment`] for other `shmget` /
    /// `shmat` failures.
    pub fn alloc(
        length: usize,
        mut address: Option<NonNull<u8>>,
        flags: SegFlags,
        hugetlb: HugetlbMode,
        name: &str,
    ) -> Result<Self, Error> {
        if !flags.contains(SegFlags::FIXED) {
            // TODO treat the address as a placement hint instead of
            // dropping it
            address = None;
        }

        #[allow(unused_assignments)]
        let mut status = Error::Unsupported;

        #[cfg(target_os = "linux")]
        if hugetlb != HugetlbMode::No {
            match Self::alloc_once(
                length,
                length.saturating_mul(2),
                HUGE_PAGE_SIZE,
                libc::SHM_HUGETLB,
                address,
            ) {
                Ok(seg) => return Ok(seg),
                Err(err) => {
                    debug!(length, name, "failed to allocate segment with hugetlb");
                    status = err;
                }
            }
        }
        if hugetlb != HugetlbMode::Yes {
            match Self::alloc_once(length, usize::MAX, PAGE_SIZE, 0, address) {
                Ok(seg) => return Ok(seg),
                Err(err) => {
                    debug!(length, name, "failed to allocate segment without hugetlb");
                    status = err;
                }
            }
        }

        error!(length, name, "failed to allocate shared memory segment");
        Err(status)
    }

    /// One `shmget` + `shmat` attempt with the given page granularity.
    fn alloc_once(
        length: usize,
        max_size: usize,
        page_size: usize,
        extra_flags: i32,
        address: Option<NonNull<u8>>,
    ) -> Result<Self, Error> {
        let rounded = length
            .checked_add(page_size - 1)
            .ok_or(Error::ExceedsLimit)?
            / page_size
            * page_size;
        if rounded > max_size {
            return Err(Error::ExceedsLimit);
        }

        let create_flags = SYSV_PERM | libc::IPC_CREAT | libc::IPC_EXCL | extra_flags;
        let shmid = unsafe { libc::shmget(libc::IPC_PRIVATE, rounded, create_flags) };
        if shmid < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOMEM | libc::ENOSPC) => Error::NoMemory,
                _ => {
                    debug!(%err, "shmget failed");
                    Error::ShmemSegment
                }
            });
        }

        let hint = address.map_or(std::ptr::null(), |a| a.as_ptr().cast_const().cast());
        let attached = unsafe { libc::shmat(shmid, hint, 0) };
        let Some(address) = attach_address(attached) else {
            let err = io::Error::last_os_error();
            error!(shmid, %err, "shmat failed on freshly created segment");
            unsafe { libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut()) };
            return Err(Error::ShmemSegment);
        };

        trace!(shmid, len = rounded, "allocated shared memory segment");
        Ok(Self {
            seg_id: shmid as u32,
            address,
            length: rounded,
        })
    }

    /// Gets the SysV segment identifier (`shmid`).
    #[must_use]
    pub const fn seg_id(&self) -> u32 {
        self.seg_id
    }

    /// Gets the mapped address in the owning process.
    #[must_use]
    pub const fn address(&self) -> NonNull<u8> {
        self.address
    }

    /// Gets the rounded-up segment length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.length
    }

    /// Gets if the segment has zero length.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Views the segment as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no attached peer accesses the same range
    /// concurrently.
    #[must_use]
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.address.as_ptr(), self.length) }
    }

    /// Packs the remote key a peer needs to attach this segment.
    #[must_use]
    pub fn pack_rkey(&self) -> SysvRkey {
        SysvRkey {
            shmid: self.seg_id,
            owner_ptr: self.address.as_ptr() as u64,
        }
    }
}

impl Drop for SysvSegment {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.address.as_ptr().cast_const().cast());
            // Destruction is the allocator's job; attached peers keep the
            // mapping until they detach.
            libc::shmctl(self.seg_id as i32, libc::IPC_RMID, std::ptr::null_mut());
        }
    }
}

/// Remote key for a [`SysvSegment`], as shipped on the wire.
///
/// Packs to exactly 12 bytes: the segment id followed by the owner's
/// mapping address, which the attacher uses to translate owner-side
/// addresses into its own mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct SysvRkey {
    /// SysV segment identifier.
    pub shmid: u32,
    /// Address of the segment in the owning process.
    pub owner_ptr: u64,
}

impl FixedEncodeLen for SysvRkey {
    const ENCODE_LEN: usize = u32::ENCODE_LEN + u64::ENCODE_LEN;
}

impl Encode for SysvRkey {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.shmid)?;
        dst.write(&self.owner_ptr)?;
        Ok(())
    }
}

impl Decode for SysvRkey {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            shmid: src.read()?,
            owner_ptr: src.read()?,
        })
    }
}

/// A peer's segment attached into the local address space.
///
/// Dropping detaches the mapping. The attacher never destroys the
/// segment.
#[derive(Debug)]
pub struct SysvRemoteSeg {
    address: NonNull<u8>,
    owner_ptr: u64,
}

unsafe impl Send for SysvRemoteSeg {}

impl SysvRemoteSeg {
    /// Attaches the segment described by `rkey`.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::ShmemSegment`] if `shmat` fails - typically
    /// because the owner already destroyed the segment.
    pub fn attach(rkey: &SysvRkey) -> Result<Self, Error> {
        let attached = unsafe { libc::shmat(rkey.shmid as i32, std::ptr::null(), 0) };
        let Some(address) = attach_address(attached) else {
            let err = io::Error::last_os_error();
            error!(shmid = rkey.shmid, %err, "shmat failed");
            return Err(Error::ShmemSegment);
        };

        trace!(shmid = rkey.shmid, ?address, "attached remote segment");
        Ok(Self {
            address,
            owner_ptr: rkey.owner_ptr,
        })
    }

    /// Gets the local mapping address.
    #[must_use]
    pub const fn address(&self) -> NonNull<u8> {
        self.address
    }

    /// Translates an address in the owner's mapping into the local
    /// mapping.
    #[must_use]
    pub fn translate(&self, remote_addr: u64) -> *mut u8 {
        let offset = remote_addr.wrapping_sub(self.owner_ptr);
        self.address.as_ptr().wrapping_add(offset as usize)
    }

    /// Copies `dst.len()` bytes out of the segment, starting at the
    /// owner-side address `remote_addr`.
    ///
    /// # Safety
    ///
    /// `remote_addr..remote_addr + dst.len()` must lie inside the segment
    /// as mapped by the owner.
    pub unsafe fn get(&self, remote_addr: u64, dst: &mut [u8]) {
        let src = self.translate(remote_addr);
        unsafe { std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
    }

    /// Copies `src.len()` bytes into the segment, starting at the
    /// owner-side address `remote_addr`.
    ///
    /// # Safety
    ///
    /// `remote_addr..remote_addr + src.len()` must lie inside the segment
    /// as mapped by the owner.
    pub unsafe fn put(&self, remote_addr: u64, src: &[u8]) {
        let dst = self.translate(remote_addr);
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
    }
}

impl Drop for SysvRemoteSeg {
    fn drop(&mut self) {
        unsafe { libc::shmdt(self.address.as_ptr().cast_const().cast()) };
    }
}

/// Interprets a `shmat` return value, which signals failure as `-1` rather
/// than null.
fn attach_address(attached: *mut libc::c_void) -> Option<NonNull<u8>> {
    if attached as isize == -1 {
        None
    } else {
        NonNull::new(attached.cast())
    }
}

#[cfg(test)]
mod tests {
    use octs::BytesMut;

    use super::*;

    #[test]
    fn rkey_packs_to_twelve_bytes() {
        let rkey = SysvRkey {
            shmid: 0x1234_5678,
            owner_ptr: 0xdead_beef_cafe_f00d,
        };
        let mut buf = BytesMut::with_capacity(SysvRkey::ENCODE_LEN);

        buf.write(&rkey).unwrap();
        assert_eq!(12, buf.len());
        assert_eq!(SysvRkey::ENCODE_LEN, buf.len());

        assert_eq!(rkey, buf.freeze().read::<SysvRkey>().unwrap());
    }

    #[test]
    fn alloc_try_falls_back_without_hugetlb() {
        // In most environments the hugetlb pool is empty, so this exercises
        // the fallback attempt; where huge pages exist the first attempt
        // succeeds, which is just as valid.
        let seg = SysvSegment::alloc(8192, None, SegFlags::empty(), HugetlbMode::Try, "test")
            .expect("plain SysV allocation must succeed");
        assert!(seg.seg_id() > 0);
        assert!(seg.len() >= 8192);
    }

    #[test]
    fn non_fixed_address_is_discarded() {
        let bogus = NonNull::new(0x10 as *mut u8);
        let seg = SysvSegment::alloc(64, bogus, SegFlags::empty(), HugetlbMode::No, "test")
            .expect("alloc");
        assert_ne!(0x10, seg.address().as_ptr() as usize);
    }

    #[test]
    fn attach_round_trip_put_get() {
        let mut seg =
            SysvSegment::alloc(4096, None, SegFlags::empty(), HugetlbMode::No, "test").expect("alloc");
        let base = seg.address().as_ptr() as u64;
        unsafe { seg.as_mut_slice()[..4].copy_from_slice(b"weft") };

        let remote = SysvRemoteSeg::attach(&seg.pack_rkey()).expect("attach");
        let mut read_back = [0_u8; 4];
        unsafe { remote.get(base, &mut read_back) };
        assert_eq!(b"weft", &read_back);

        unsafe { remote.put(base + 4, b"lane") };
        assert_eq!(b"lane", unsafe { &seg.as_mut_slice()[4..8] });
    }

    #[test]
    fn attach_bogus_shmid_fails() {
        let rkey = SysvRkey {
            shmid: u32::MAX - 1,
            owner_ptr: 0,
        };
        assert_eq!(Err(Error::ShmemSegment), SysvRemoteSeg::attach(&rkey).map(|_| ()));
    }
}
