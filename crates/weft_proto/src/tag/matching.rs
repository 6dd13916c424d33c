//! The worker's tag-match structure: the expected queue and the
//! unexpected descriptor lists.

use std::collections::VecDeque;

use ahash::AHashMap;
use octs::Bytes;
use tracing::trace;
use weft::error::Error;

use crate::{request::ReqId, tag::Tag};

bitflags::bitflags! {
    /// Flags on an unexpected receive descriptor.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct RecvDescFlags: u32 {
        /// The descriptor holds a rendezvous request-to-send, not eager
        /// data.
        const RNDV = 1 << 0;
    }
}

/// A message that arrived before a matching receive was posted.
///
/// Holds a copy of the incoming header (for rendezvous: the full
/// request-to-send including the packed remote key) plus the fields the
/// matcher and the cancellation path key on.
#[derive(Debug, Clone)]
pub struct RecvDesc {
    /// Descriptor flags.
    pub flags: RecvDescFlags,
    /// Match tag carried by the message.
    pub tag: Tag,
    /// Sender's endpoint id as carried in the header.
    pub ep_id: u64,
    /// Sender's request id as carried in the header.
    pub req_id: u64,
    /// Copied header bytes.
    pub payload: Bytes,
}

#[derive(Debug)]
struct ExpEntry {
    req: ReqId,
    tag: Tag,
    tag_mask: u64,
}

/// Expected queue plus per-tag unexpected lists, owned by a worker.
///
/// Mutated only through the owning worker, which serializes callers and
/// progress callbacks.
#[derive(Debug)]
pub struct TagMatch {
    expected: VecDeque<ExpEntry>,
    unexpected: AHashMap<u64, VecDeque<RecvDesc>>,
    unexp_count: usize,
    unexp_cap: usize,
}

impl TagMatch {
    /// Creates an empty structure buffering at most `unexp_cap`
    /// unexpected descriptors.
    #[must_use]
    pub fn new(unexp_cap: usize) -> Self {
        Self {
            expected: VecDeque::new(),
            unexpected: AHashMap::new(),
            unexp_count: 0,
            unexp_cap,
        }
    }

    /// Appends a receive request to the expected queue.
    pub(crate) fn exp_post(&mut self, req: ReqId, tag: Tag, tag_mask: u64) {
        self.expected.push_back(ExpEntry { req, tag, tag_mask });
    }

    /// Finds and removes the oldest expected receive matching `tag`.
    pub(crate) fn exp_search(&mut self, tag: Tag) -> Option<ReqId> {
        let pos = self
            .expected
            .iter()
            .position(|entry| entry.tag.matches(tag, entry.tag_mask))?;
        self.expected.remove(pos).map(|entry| entry.req)
    }

    /// Gets the number of posted expected receives.
    #[must_use]
    pub fn exp_len(&self) -> usize {
        self.expected.len()
    }

    /// Parks an unexpected descriptor in its tag's list.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::NoMemory`] when the descriptor cap is
    /// reached.
    pub(crate) fn unexp_recv(&mut self, desc: RecvDesc) -> Result<(), Error> {
        if self.unexp_count >= self.unexp_cap {
            return Err(Error::NoMemory);
        }
        trace!(tag = %desc.tag, ep_id = desc.ep_id, "parking unexpected receive descriptor");
        self.unexpected.entry(desc.tag.0).or_default().push_back(desc);
        self.unexp_count += 1;
        Ok(())
    }

    /// Finds and removes the oldest unexpected descriptor matching
    /// `(tag, tag_mask)`.
    ///
    /// With a full mask this is one bucket lookup. Under a wildcard mask,
    /// arrival order is preserved within each tag but not across tags.
    pub(crate) fn unexp_match(&mut self, tag: Tag, tag_mask: u64) -> Option<RecvDesc> {
        if tag_mask == crate::tag::TAG_MASK_FULL {
            return self.unexp_take(tag.0, |_| true);
        }
        let key = self
            .unexpected
            .iter()
            .find(|(key, list)| tag.matches(Tag(**key), tag_mask) && !list.is_empty())
            .map(|(key, _)| *key)?;
        self.unexp_take(key, |_| true)
    }

    /// Finds and removes the oldest descriptor with exact tag `tag`
    /// satisfying `pred`.
    pub(crate) fn unexp_remove_where(
        &mut self,
        tag: Tag,
        pred: impl Fn(&RecvDesc) -> bool,
    ) -> Option<RecvDesc> {
        self.unexp_take(tag.0, pred)
    }

    /// Gets the number of parked descriptors with exact tag `tag`.
    #[must_use]
    pub fn unexp_len(&self, tag: Tag) -> usize {
        self.unexpected.get(&tag.0).map_or(0, VecDeque::len)
    }

    fn unexp_take(&mut self, key: u64, pred: impl Fn(&RecvDesc) -> bool) -> Option<RecvDesc> {
        let list = self.unexpected.get_mut(&key)?;
        let pos = list.iter().position(pred)?;
        let desc = list.remove(pos)?;
        if list.is_empty() {
            self.unexpected.remove(&key);
        }
        self.unexp_count -= 1;
        Some(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(tag: Tag, req_id: u64) -> RecvDesc {
        RecvDesc {
            flags: RecvDescFlags::RNDV,
            tag,
            ep_id: 1,
            req_id,
            payload: Bytes::new(),
        }
    }

    #[test]
    fn expected_search_is_fifo_per_tag() {
        let mut tm = TagMatch::new(usize::MAX);
        let (a, b) = (ReqId::new(0, 0), ReqId::new(1, 0));
        tm.exp_post(a, Tag(7), crate::tag::TAG_MASK_FULL);
        tm.exp_post(b, Tag(7), crate::tag::TAG_MASK_FULL);

        assert_eq!(Some(a), tm.exp_search(Tag(7)));
        assert_eq!(Some(b), tm.exp_search(Tag(7)));
        assert_eq!(None, tm.exp_search(Tag(7)));
    }

    #[test]
    fn wildcard_expected_matches() {
        let mut tm = TagMatch::new(usize::MAX);
        let req = ReqId::new(0, 0);
        tm.exp_post(req, Tag(0xa0), !0xf);

        assert_eq!(Some(req), tm.exp_search(Tag(0xa7)));
    }

    #[test]
    fn unexpected_cap_maps_to_no_memory() {
        let mut tm = TagMatch::new(1);
        assert_eq!(Ok(()), tm.unexp_recv(desc(Tag(1), 1)));
        assert_eq!(Err(Error::NoMemory), tm.unexp_recv(desc(Tag(2), 2)));

        // removing one frees capacity again
        assert!(tm.unexp_match(Tag(1), crate::tag::TAG_MASK_FULL).is_some());
        assert_eq!(Ok(()), tm.unexp_recv(desc(Tag(2), 2)));
    }

    #[test]
    fn unexp_remove_where_is_id_keyed() {
        let mut tm = TagMatch::new(usize::MAX);
        tm.unexp_recv(desc(Tag(9), 10)).unwrap();
        tm.unexp_recv(desc(Tag(9), 11)).unwrap();

        let taken = tm
            .unexp_remove_where(Tag(9), |d| d.req_id == 11)
            .expect("descriptor with req_id 11");
        assert_eq!(11, taken.req_id);
        assert_eq!(1, tm.unexp_len(Tag(9)));
    }
}
