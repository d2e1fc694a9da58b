//! A dynamically sized FIFO byte buffer backed by a `Vec<u8>`, used for the
//! per-pipe upstream write buffer (`remoteOutBuffer`): data queued for a
//! socket that isn't writable yet, drained as capacity allows.

use relay_support::error::{RelayError, RelayResult};
use std::io;

pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    cap: usize,
}

impl Buffer {
    #[inline]
    pub fn new(cap: usize) -> Buffer {
        Buffer {
            data: Vec::new(),
            head: 0,
            cap,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.cap - self.len()
    }

    /// Appends `data` to the buffer. Callers must check `free_capacity`
    /// first; this never truncates or silently drops bytes.
    #[inline]
    pub fn push(&mut self, data: &[u8]) {
        self.compact_if_needed();
        self.data.extend_from_slice(data);
    }

    /// Writes as much buffered data as possible to `writer`, stopping on
    /// `WouldBlock`. Advances the read offset by however much was written.
    #[inline]
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> RelayResult<usize> {
        let start_len = self.len();

        while self.head < self.data.len() {
            match writer.write(&self.data[self.head..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => self.head += n,
                Err(err) => match RelayError::from(err) {
                    RelayError::Wait => break,
                    fatal => return Err(fatal),
                },
            }
        }

        self.compact_if_needed();
        Ok(start_len - self.len())
    }

    #[inline]
    fn compact_if_needed(&mut self) {
        if self.head > 0 && self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        } else if self.head > 0 && self.head * 2 > self.data.capacity() {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockWriter {
        written: Vec<u8>,
        block_after: usize,
    }

    impl io::Write for MockWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.written.len() >= self.block_after {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.block_after - self.written.len());
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn egress_stops_on_would_block_and_keeps_remainder() {
        let mut buffer = Buffer::new(1024);
        buffer.push(b"hello world");

        let mut writer = MockWriter {
            written: Vec::new(),
            block_after: 5,
        };

        let written = buffer.egress(&mut writer).unwrap();
        assert_eq!(written, 5);
        assert_eq!(&writer.written, b"hello");
        assert_eq!(buffer.len(), 6);
    }

    #[test]
    fn free_capacity_tracks_pending_bytes() {
        let mut buffer = Buffer::new(16);
        assert_eq!(buffer.free_capacity(), 16);
        buffer.push(b"1234");
        assert_eq!(buffer.free_capacity(), 12);
    }
}
