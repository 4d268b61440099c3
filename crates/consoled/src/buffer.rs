//! Outbound (ring -> terminal) byte buffer with a backpressure policy.
//!
//! Invariant: `consumed <= size <= capacity`, and after
//! [`ChannelBuffer::apply_backpressure`] also `size <= max_capacity` whenever
//! `max_capacity` is non-zero.

use tracing::error;

#[derive(Debug, Default)]
pub struct ChannelBuffer {
    // data.len() is `size`, data.capacity() is `capacity`
    data: Vec<u8>,
    consumed: usize,
    max_capacity: usize,
}

impl ChannelBuffer {
    /// `max_capacity` of 0 means unbounded.
    #[must_use]
    pub fn new(max_capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            consumed: 0,
            max_capacity,
        }
    }

    /// Change the cap. Shrinking it below `size` drops the consumed
    /// prefix and then applies backpressure to what is still pending.
    pub fn set_max_capacity(&mut self, max_capacity: usize) {
        self.max_capacity = max_capacity;
        if max_capacity != 0 && self.data.len() > max_capacity {
            self.data.drain(..self.consumed);
            self.consumed = 0;
            self.apply_backpressure();
        }
    }

    #[must_use]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes appended but not yet handed to the terminal.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.data[self.consumed..]
    }

    /// Whole retained contents, consumed prefix included.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Make room for `additional` more bytes, growing geometrically.
    ///
    /// Running out of memory here is fatal for the whole daemon.
    pub fn reserve(&mut self, additional: usize) {
        if let Err(e) = self.data.try_reserve(additional) {
            error!("Memory allocation failed: {e}");
            std::process::exit(libc::ENOMEM);
        }
    }

    /// Spare room past `size`, for copying into before [`Self::commit`].
    pub(crate) fn spare(&mut self, len: usize) -> &mut [u8] {
        self.reserve(len);
        let start = self.data.len();
        self.data.resize(start + len, 0);
        &mut self.data[start..]
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.data.extend_from_slice(bytes);
    }

    /// Enforce `max_capacity` by deleting a middle slice.
    ///
    /// With `over = size - max_capacity`, the `over` bytes just before the
    /// newest `over` bytes are dropped: the oldest `max_capacity - over`
    /// bytes and the newest `over` bytes survive. Must run right after an
    /// append and before anything is consumed from it, which is what keeps
    /// the dropped region clear of the consumed prefix.
    ///
    /// Returns how many bytes were discarded.
    pub fn apply_backpressure(&mut self) -> usize {
        let max = self.max_capacity;
        let size = self.data.len();
        if max == 0 || size <= max {
            return 0;
        }
        let over = size - max;

        if over >= max {
            // the tail alone overflows the cap: keep only the newest bytes
            self.data.drain(..size - max);
            self.consumed = 0;
        } else {
            self.data.copy_within(max..size, max - over);
            self.data.truncate(max);
            self.consumed = self.consumed.min(max - over);
        }
        self.data.shrink_to(max);
        over
    }

    /// Mark `n` pending bytes as written out. Resets to empty once
    /// everything has been consumed, keeping the allocation.
    pub fn advance(&mut self, n: usize) {
        self.consumed = (self.consumed + n).min(self.data.len());
        if self.consumed == self.data.len() {
            self.consumed = 0;
            self.data.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(len: usize, max: usize) -> ChannelBuffer {
        let mut buf = ChannelBuffer::new(max);
        let bytes: Vec<u8> = (0..len).map(|i| i as u8).collect();
        buf.append(&bytes);
        buf
    }

    #[test]
    fn advance_resets_when_drained() {
        let mut buf = filled(10, 0);
        buf.advance(4);
        assert_eq!(buf.consumed(), 4);
        assert_eq!(buf.pending(), &[4, 5, 6, 7, 8, 9]);

        let cap = buf.capacity();
        buf.advance(6);
        assert!(buf.is_empty());
        assert_eq!(buf.consumed(), 0);
        assert_eq!(buf.capacity(), cap);
    }

    #[test]
    fn unbounded_buffer_is_never_truncated() {
        let mut buf = filled(5000, 0);
        assert_eq!(buf.apply_backpressure(), 0);
        assert_eq!(buf.size(), 5000);
    }

    #[test]
    fn truncation_keeps_head_and_tail() {
        let mut buf = filled(150, 100);
        buf.advance(40);

        assert_eq!(buf.apply_backpressure(), 50);
        assert_eq!(buf.size(), 100);
        assert!(buf.capacity() >= 100);
        assert_eq!(buf.consumed(), 40);

        let expected: Vec<u8> = (0..50u8).chain(100..150).collect();
        assert_eq!(buf.as_bytes(), expected.as_slice());
    }

    #[test]
    fn truncation_clamps_consumed() {
        let mut buf = filled(150, 100);
        buf.advance(80);
        buf.apply_backpressure();
        assert_eq!(buf.consumed(), 50);
        assert!(buf.consumed() <= buf.size());
    }

    #[test]
    fn oversized_tail_keeps_newest_bytes() {
        let mut buf = filled(250, 100);
        buf.apply_backpressure();
        let expected: Vec<u8> = (150..250).map(|i| i as u8).collect();
        assert_eq!(buf.as_bytes(), expected.as_slice());
        assert_eq!(buf.consumed(), 0);
    }

    #[test]
    fn lowering_the_limit_never_resends_written_bytes() {
        let mut buf = filled(100, 0);
        buf.advance(60);

        buf.set_max_capacity(30);
        assert_eq!(buf.consumed(), 0);
        assert_eq!(buf.size(), 30);
        let expected: Vec<u8> = (60..80u8).chain(90..100).collect();
        assert_eq!(buf.pending(), expected.as_slice());
    }

    #[test]
    fn raising_the_limit_keeps_everything() {
        let mut buf = filled(100, 0);
        buf.advance(10);
        buf.set_max_capacity(200);
        assert_eq!(buf.size(), 100);
        assert_eq!(buf.consumed(), 10);
    }

    #[test]
    fn repeated_appends_stay_bounded() {
        let mut buf = ChannelBuffer::new(64);
        for round in 0..20u8 {
            buf.append(&[round; 16]);
            buf.apply_backpressure();
            assert!(buf.size() <= 64);
            assert!(buf.consumed() <= buf.size());
        }
        // newest append is always intact at the end
        assert_eq!(&buf.as_bytes()[48..], &[19u8; 16]);
    }
}
