//! Tagged messaging: match tags, the tag-match structure, and the
//! rendezvous protocol.

pub mod matching;
pub(crate) mod offload;
pub mod rndv;

use std::{convert::Infallible, fmt};

use octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write};

/// Application-provided 64-bit matching key for tagged messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct Tag(pub u64);

/// Mask matching every tag bit exactly.
pub const TAG_MASK_FULL: u64 = u64::MAX;

impl Tag {
    /// Gets if a posted receive for `self` under `mask` matches an
    /// incoming `tag`.
    #[must_use]
    pub const fn matches(self, tag: Tag, mask: u64) -> bool {
        (self.0 ^ tag.0) & mask == 0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl FixedEncodeLen for Tag {
    const ENCODE_LEN: usize = u64::ENCODE_LEN;
}

impl Encode for Tag {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.0)
    }
}

impl Decode for Tag {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self(src.read()?))
    }
}

/// Header in front of an eager tagged message.
///
/// Its encoded size is what the inline eager limit is derived against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct EagerHdr {
    /// Match tag of the message.
    pub tag: Tag,
}

impl FixedEncodeLen for EagerHdr {
    const ENCODE_LEN: usize = Tag::ENCODE_LEN;
}

impl Encode for EagerHdr {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.tag)
    }
}

impl Decode for EagerHdr {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self { tag: src.read()? })
    }
}

#[cfg(test)]
mod tests {
    use octs::BytesMut;

    use super::*;

    #[test]
    fn tag_matching_respects_mask() {
        let posted = Tag(0xdead_beef);
        assert!(posted.matches(Tag(0xdead_beef), TAG_MASK_FULL));
        assert!(!posted.matches(Tag(0xdead_beee), TAG_MASK_FULL));
        // wildcard low byte
        assert!(posted.matches(Tag(0xdead_be00), !0xff));
        assert!(posted.matches(Tag(0), 0));
    }

    #[test]
    fn eager_hdr_encode_decode() {
        let hdr = EagerHdr { tag: Tag(0x0123_4567_89ab_cdef) };
        let mut buf = BytesMut::with_capacity(EagerHdr::ENCODE_LEN);

        buf.write(&hdr).unwrap();
        assert_eq!(8, buf.len());

        assert_eq!(hdr, buf.freeze().read::<EagerHdr>().unwrap());
    }
}
