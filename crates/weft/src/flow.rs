//! See [`CreditBucket`].

/// Tracks how many send resources a lane has left, in a token bucket
/// style.
///
/// A lane endpoint owns a fixed pool of send resources (descriptors, queue
/// slots). Initiating a send [consumes] one credit; when the pool is
/// exhausted the lane reports [`Error::NoResource`] and the caller parks
/// the request on the lane's pending queue. Completions [refill] the
/// bucket - in this crate that refill is driven explicitly, either by the
/// owning progress loop or by tests steering flow control.
///
/// [consumes]: CreditBucket::consume
/// [refill]: CreditBucket::refill_exact
/// [`Error::NoResource`]: crate::Error::NoResource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditBucket {
    cap: usize,
    rem: usize,
}

/// Attempted to consume more credit than the bucket holds.
#[derive(Debug, Clone, thiserror::Error)]
#[error("out of send credit")]
pub struct OutOfCredit;

impl CreditBucket {
    /// Creates a new bucket with the given capacity, initially full.
    #[must_use]
    pub const fn new(cap: usize) -> Self {
        Self { cap, rem: cap }
    }

    /// Gets the capacity.
    #[must_use]
    pub const fn cap(&self) -> usize {
        self.cap
    }

    /// Gets the credit remaining.
    #[must_use]
    pub const fn rem(&self) -> usize {
        self.rem
    }

    /// Gets if at least `n` credits are left in this bucket.
    #[must_use]
    pub const fn has(&self, n: usize) -> bool {
        self.rem >= n
    }

    /// Attempts to consume `n` credits from this bucket.
    ///
    /// # Errors
    ///
    /// Errors if fewer than `n` credits are left.
    pub fn consume(&mut self, n: usize) -> Result<(), OutOfCredit> {
        match self.rem.checked_sub(n) {
            Some(new_rem) => {
                self.rem = new_rem;
                Ok(())
            }
            None => Err(OutOfCredit),
        }
    }

    /// Restores exactly `n` credits, saturating at the capacity.
    pub fn refill_exact(&mut self, n: usize) {
        self.rem = self.rem.saturating_add(n).min(self.cap);
    }

    /// Restores the bucket to full capacity.
    pub fn refill(&mut self) {
        self.rem = self.cap;
    }

    /// Replaces the capacity, clamping the remaining credit to it.
    ///
    /// Used when a lane is rebound to a transport with a different resource
    /// pool.
    pub fn set_cap(&mut self, cap: usize) {
        self.cap = cap;
        self.rem = self.rem.min(cap);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn consume_and_refill() {
        let mut bucket = CreditBucket::new(2);
        assert!(bucket.has(2));
        assert_matches!(bucket.consume(1), Ok(()));
        assert_matches!(bucket.consume(1), Ok(()));
        assert_matches!(bucket.consume(1), Err(OutOfCredit));
        assert_eq!(0, bucket.rem());

        bucket.refill_exact(1);
        assert_eq!(1, bucket.rem());
        bucket.refill();
        assert_eq!(2, bucket.rem());
    }

    #[test]
    fn refill_saturates_at_cap() {
        let mut bucket = CreditBucket::new(4);
        bucket.refill_exact(100);
        assert_eq!(4, bucket.rem());
    }

    #[test]
    fn set_cap_clamps() {
        let mut bucket = CreditBucket::new(8);
        bucket.set_cap(2);
        assert_eq!(2, bucket.rem());
        assert_eq!(2, bucket.cap());
    }
}
