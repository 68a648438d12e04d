//! Fixed-capacity byte buffer with linear cursors. Data is written at the
//! end cursor and consumed from the start cursor; draining to emptiness
//! resets both, so sustained use never shifts bytes around. Misuse (reading
//! past the end, writing past capacity) is a programming error and panics.

use std::io;

pub struct Buffer {
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

impl Buffer {
    #[inline]
    pub fn new(capacity: usize) -> Buffer {
        Buffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    /// Bytes currently held.
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Free bytes at the tail.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.data.len() - self.end
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Slice of readable data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Slice of writable tail space. Writes become visible after `commit`.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.end..]
    }

    /// Marks `count` bytes consumed from the front.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        if self.start + count > self.end {
            panic!("attempted to consume past buffer end");
        }

        self.start += count;
        self.compact();
    }

    /// Marks `count` bytes written at the tail.
    #[inline]
    pub fn commit(&mut self, count: usize) {
        if self.end + count > self.data.len() {
            panic!("attempted to commit beyond buffer capacity");
        }

        self.end += count;
    }

    /// Appends a slice. Panics if it does not fit; callers check
    /// `free_capacity` first.
    #[inline]
    pub fn append(&mut self, bytes: &[u8]) {
        self.data[self.end..self.end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
    }

    #[inline]
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Reads from `reader` into the tail space once, committing what arrived.
    #[inline]
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let count = reader.read(self.write_slice())?;
        self.commit(count);
        Ok(count)
    }

    /// Writes the buffered data out until the writer stops accepting it or
    /// the buffer empties. A zero-length write is an error.
    #[inline]
    pub fn egress<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let orig_len = self.len();

        while !self.is_empty() {
            let count = writer.write(&self.data[self.start..self.end])?;
            if count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            self.consume(count);
        }

        Ok(orig_len)
    }

    #[inline]
    fn compact(&mut self) {
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..count].copy_from_slice(&self.data[self.cursor..self.cursor + count]);
            self.cursor += count;
            Ok(count)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_append_consume_compacts() {
        let mut buffer = Buffer::new(16);

        buffer.append(&[1, 2, 3, 4]);
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.read_slice(), &[1, 2, 3, 4]);

        buffer.consume(2);
        assert_eq!(buffer.read_slice(), &[3, 4]);

        // Consuming the rest resets the cursors.
        buffer.consume(2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.free_capacity(), 16);
    }

    #[test]
    #[should_panic(expected = "attempted to consume past buffer end")]
    fn test_consume_past_end_panics() {
        let mut buffer = Buffer::new(8);
        buffer.append(&[1]);
        buffer.consume(2);
    }

    #[test]
    #[should_panic(expected = "attempted to commit beyond buffer capacity")]
    fn test_commit_past_capacity_panics() {
        let mut buffer = Buffer::new(8);
        buffer.commit(9);
    }

    #[test]
    fn test_write_slice_commit() {
        let mut buffer = Buffer::new(8);

        buffer.write_slice()[..3].copy_from_slice(&[7, 8, 9]);
        buffer.commit(3);

        assert_eq!(buffer.read_slice(), &[7, 8, 9]);
        assert_eq!(buffer.free_capacity(), 5);
    }

    #[test]
    fn test_ingress_egress_roundtrip() {
        let payload: Vec<u8> = (0..200u16).map(|value| value as u8).collect();
        let mut channel = MockChannel::new(payload.clone(), 33, usize::max_value());
        let mut buffer = Buffer::new(256);

        // Drain the mock in chunked reads until it would block.
        loop {
            match buffer.ingress(&mut channel) {
                Ok(_) => continue,
                Err(err) => {
                    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
                    break;
                }
            }
        }
        assert_eq!(buffer.read_slice(), &payload[..]);

        let mut sink = MockChannel::new(Vec::new(), 17, usize::max_value());
        let sent = buffer.egress(&mut sink).unwrap();

        assert_eq!(sent, payload.len());
        assert!(buffer.is_empty());
        assert_eq!(sink.data, payload);
    }

    #[test]
    fn test_egress_blocked_writer_surfaces() {
        let mut buffer = Buffer::new(8);
        buffer.append(&[1]);

        let mut full = MockChannel::new(Vec::new(), 4, 0);
        let err = buffer.egress(&mut full).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(buffer.len(), 1);
    }

    struct ZeroWriter;

    impl io::Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_egress_zero_write_is_error() {
        let mut buffer = Buffer::new(8);
        buffer.append(&[1]);

        let err = buffer.egress(&mut ZeroWriter).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_random_chunk_sizes_preserve_content() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let payload: Vec<u8> = (0..4096).map(|_| rng.gen()).collect();

        for _ in 0..16 {
            let chunk = rng.gen_range(1..512);
            let mut source = MockChannel::new(payload.clone(), chunk, usize::max_value());
            let mut buffer = Buffer::new(8192);

            while let Ok(_) = buffer.ingress(&mut source) {}
            assert_eq!(buffer.read_slice(), &payload[..]);

            let mut sink = MockChannel::new(Vec::new(), chunk, usize::max_value());
            buffer.egress(&mut sink).unwrap();
            assert_eq!(sink.data, payload);
        }
    }
}
