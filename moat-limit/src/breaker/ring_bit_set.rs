const WORD_BITS: usize = u64::BITS as usize;

/// A fixed-capacity ring of outcome bits, `true` meaning failure.
///
/// Once full, every new bit overwrites the oldest one.
#[derive(Debug, Clone)]
pub(crate) struct RingBitSet {
    words: Vec<u64>,
    size: usize,
    index: usize,
    length: usize,
    cardinality: usize,
}

impl RingBitSet {
    pub(crate) fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            words: vec![0; size.div_ceil(WORD_BITS)],
            size,
            index: 0,
            length: 0,
            cardinality: 0,
        }
    }

    /// Records the next outcome and returns the number of failures buffered.
    pub(crate) fn set_next(&mut self, failure: bool) -> usize {
        let word = self.index / WORD_BITS;
        let mask = 1u64 << (self.index % WORD_BITS);
        let previous = self.words[word] & mask != 0;

        if failure {
            self.words[word] |= mask;
        } else {
            self.words[word] &= !mask;
        }

        match (previous, failure) {
            (false, true) => self.cardinality += 1,
            (true, false) => self.cardinality -= 1,
            _ => {}
        }

        if self.length < self.size {
            self.length += 1;
        }
        self.index = (self.index + 1) % self.size;
        self.cardinality
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn length(&self) -> usize {
        self.length
    }

    pub(crate) fn cardinality(&self) -> usize {
        self.cardinality
    }

    pub(crate) fn is_full(&self) -> bool {
        self.length == self.size
    }

    /// Failure percentage over the buffer, or `None` until it is full.
    pub(crate) fn failure_rate(&self) -> Option<f32> {
        self.is_full()
            .then(|| self.cardinality as f32 * 100.0 / self.length as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_rate_only_when_full() {
        let mut ring = RingBitSet::new(4);
        ring.set_next(true);
        ring.set_next(false);
        ring.set_next(true);
        assert_eq!(ring.failure_rate(), None);

        ring.set_next(false);
        assert_eq!(ring.failure_rate(), Some(50.0));
    }

    #[test]
    fn evicts_oldest_outcomes() {
        let mut ring = RingBitSet::new(3);
        for _ in 0..3 {
            ring.set_next(true);
        }
        assert_eq!(ring.cardinality(), 3);

        assert_eq!(ring.set_next(false), 2);
        assert_eq!(ring.set_next(false), 1);
        assert_eq!(ring.set_next(false), 0);
        assert_eq!(ring.length(), 3);
        assert_eq!(ring.failure_rate(), Some(0.0));
    }

    #[test]
    fn spans_multiple_words() {
        let mut ring = RingBitSet::new(130);
        for i in 0..260 {
            ring.set_next(i % 2 == 0);
        }
        assert_eq!(ring.size(), 130);
        assert_eq!(ring.cardinality(), 65);
        assert_eq!(ring.failure_rate(), Some(50.0));
    }
}
