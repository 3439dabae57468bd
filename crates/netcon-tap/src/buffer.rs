use std::collections::VecDeque;

/// Bounded FIFO byte buffer.
///
/// `append` never grows the buffer past its capacity; callers learn how much was stored from the
/// return value.
#[derive(Debug)]
pub struct ByteRing {
    buf: VecDeque<u8>,
    cap: usize,
}

impl ByteRing {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::new(),
            cap,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Free space left before the capacity is reached.
    pub fn available_len(&self) -> usize {
        self.cap.saturating_sub(self.buf.len())
    }

    /// Appends as much of `data` as fits and returns the number of bytes stored.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.available_len());
        self.buf.extend(&data[..n]);
        n
    }

    /// Appends the concatenation of `parts` only if all of it fits.
    pub fn append_whole(&mut self, parts: &[&[u8]]) -> bool {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        if total > self.available_len() {
            return false;
        }
        for part in parts {
            self.buf.extend(*part);
        }
        true
    }

    /// Removes and returns up to `n` bytes from the front.
    pub fn take(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.buf.len());
        self.buf.drain(..n).collect()
    }

    /// The buffered bytes as (at most) two slices, oldest first.
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        self.buf.as_slices()
    }

    /// Up to `n` bytes from the front in one slice.
    pub fn front(&mut self, n: usize) -> &[u8] {
        let n = n.min(self.buf.len());
        &self.buf.make_contiguous()[..n]
    }

    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_stops_at_capacity() {
        let mut ring = ByteRing::new(4);
        assert_eq!(ring.append(b"abcdef"), 4);
        assert_eq!(ring.available_len(), 0);
        assert_eq!(ring.take(2), b"ab");
        assert_eq!(ring.append(b"xyz"), 2);
        assert_eq!(ring.take(10), b"cdxy");
        assert!(ring.is_empty());
    }

    #[test]
    fn append_whole_is_all_or_nothing() {
        let mut ring = ByteRing::new(5);
        assert!(ring.append_whole(&[b"ab", b"cd"]));
        assert!(!ring.append_whole(&[b"ef"]));
        assert_eq!(ring.len(), 4);
    }

    #[test]
    fn front_spans_wraparound() {
        let mut ring = ByteRing::new(4);
        ring.append(b"abcd");
        ring.consume(3);
        ring.append(b"efg");
        assert_eq!(ring.front(4), b"defg");
        ring.consume(4);
        assert!(ring.is_empty());
    }
}
