/// Fixed-capacity receive buffer filled by the peripheral.
///
/// `filled` is the hardware write position reported by the last idle event,
/// `cursor` is how far the parser got. `cursor <= filled <= N` always holds.
#[derive(Debug)]
pub struct RxBuffer<const N: usize> {
    data: [u8; N],
    cursor: usize,
    filled: usize,
    wrapped: bool,
}

impl<const N: usize> RxBuffer<N> {
    pub const fn new() -> Self {
        Self {
            data: [0; N],
            cursor: 0,
            filled: 0,
            wrapped: false,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub const fn cursor(&self) -> usize {
        self.cursor
    }

    /// Bytes received but not yet parsed.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.cursor..self.filled]
    }

    /// Room left for the frame starting at the cursor.
    pub const fn space_after_cursor(&self) -> usize {
        N - self.cursor
    }

    /// Record a new hardware write position. Returns false if the position
    /// is outside the buffer or behind the cursor.
    pub fn set_filled(&mut self, write_pos: usize) -> bool {
        if write_pos > N || write_pos < self.cursor {
            return false;
        }
        self.filled = write_pos;
        true
    }

    pub fn consume(&mut self, len: usize) {
        assert!(len <= self.pending().len());
        self.cursor += len;
    }

    /// The hardware wrapped around to the start of the buffer.
    pub fn mark_wrapped(&mut self) {
        self.wrapped = true;
    }

    /// Check whether the `pattern.len()` bytes just before `write_pos` equal
    /// `pattern`, reading across the end of the buffer after a wrap.
    pub fn tail_matches(&self, write_pos: usize, pattern: &[u8]) -> bool {
        let len = pattern.len();
        if write_pos > N || len > N || (write_pos < len && !self.wrapped) {
            return false;
        }
        let start = (write_pos + N - len) % N;
        pattern
            .iter()
            .enumerate()
            .all(|(i, byte)| self.data[(start + i) % N] == *byte)
    }

    /// Forget everything, the hardware starts over at offset zero.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.filled = 0;
        self.wrapped = false;
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl<const N: usize> Default for RxBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> AsRef<[u8]> for RxBuffer<N> {
    fn as_ref(&self) -> &[u8] {
        self.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_buffer() -> RxBuffer<16> {
        let mut buf = RxBuffer::new();
        buf.as_mut_slice()[..12].copy_from_slice(b"abcdabcdabcd");
        assert!(buf.set_filled(12));
        buf
    }

    #[test]
    fn test_consume() {
        let mut buf = get_buffer();
        assert_eq!(buf.pending(), b"abcdabcdabcd");
        buf.consume(4);
        assert_eq!(buf.cursor(), 4);
        assert_eq!(buf.pending().len(), 8);
        assert_eq!(buf.space_after_cursor(), 12);
        assert!(!buf.set_filled(3)); // behind the cursor
        assert!(!buf.set_filled(17)); // past the end
        buf.reset();
        assert_eq!(buf.pending(), b"");
    }

    #[test]
    fn test_tail() {
        let mut buf = get_buffer();
        assert!(buf.tail_matches(12, b"bcd"));
        assert!(!buf.tail_matches(12, b"abc"));
        assert!(!buf.tail_matches(2, b"abcd"));

        // wrapped: the last bytes of the buffer continue at offset zero
        buf.as_mut_slice()[14..].copy_from_slice(b"xy");
        buf.mark_wrapped();
        assert!(buf.tail_matches(2, b"xyab"));
    }
}
