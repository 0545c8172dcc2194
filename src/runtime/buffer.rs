//! Fixed-capacity echo buffer.
//!
//! Each connection owns one buffer. Bytes are read into the free region
//! after `cursor` and sent back from `cursor - received` until nothing is
//! pending, at which point the cursor rewinds to the start.
//!
//! The buffer never grows. When it fills before the socket would block,
//! the caller has to flush it before more bytes can be read.

use std::io::{self, Read, Write};

/// Outcome of draining a source into the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The source would block. Zero or more bytes were read.
    WouldBlock,
    /// The buffer filled up before the source would block.
    Full,
    /// The source returned end-of-stream.
    Closed,
}

/// Outcome of flushing pending bytes to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Everything pending was written and the buffer was rewound.
    Flushed,
    /// The sink would block with bytes still pending.
    Partial,
}

/// Per-connection byte buffer.
///
/// Invariant: `received <= cursor <= storage.len()`.
#[derive(Debug)]
pub struct EchoBuffer {
    /// Backing storage, allocated once.
    storage: Box<[u8]>,
    /// Bytes read but not yet written back.
    received: usize,
    /// End of the received region.
    cursor: usize,
}

impl EchoBuffer {
    /// Create a zeroed buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            received: 0,
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Whether bytes are waiting to be written back.
    pub fn has_pending(&self) -> bool {
        self.received > 0
    }

    /// Bytes waiting to be written back.
    #[cfg(test)]
    pub fn pending(&self) -> &[u8] {
        &self.storage[self.cursor - self.received..self.cursor]
    }

    /// Bytes stored at or after `from`, up to the cursor.
    ///
    /// Used to look at what a single `read_from` call added.
    pub fn since(&self, from: usize) -> &[u8] {
        &self.storage[from.min(self.cursor)..self.cursor]
    }

    /// Read from `src` until the buffer is full or `src` would block.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> io::Result<ReadStatus> {
        while self.cursor < self.storage.len() {
            match src.read(&mut self.storage[self.cursor..]) {
                Ok(0) => return Ok(ReadStatus::Closed),
                Ok(n) => {
                    self.received += n;
                    self.cursor += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadStatus::WouldBlock)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(ReadStatus::Full)
    }

    /// Write pending bytes to `dst` until none remain or `dst` would block.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> io::Result<WriteStatus> {
        while self.received > 0 {
            let start = self.cursor - self.received;
            match dst.write(&self.storage[start..self.cursor]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.received -= n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteStatus::Partial)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.cursor = 0;
        Ok(WriteStatus::Flushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Reader that replays scripted results, then reports WouldBlock.
    struct ScriptedReader {
        steps: VecDeque<io::Result<Vec<u8>>>,
    }

    impl ScriptedReader {
        fn new(steps: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                steps: steps.into(),
            }
        }
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.steps.pop_front() {
                Some(Ok(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.steps.push_front(Ok(data.split_off(n)));
                    }
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    /// Writer accepting at most `chunk` bytes per call and `budget` in total.
    struct ThrottledWriter {
        out: Vec<u8>,
        chunk: usize,
        budget: usize,
    }

    impl Write for ThrottledWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.chunk).min(self.budget);
            self.out.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_new_buffer_is_empty() {
        let buf = EchoBuffer::new(16);
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.received(), 0);
        assert_eq!(buf.cursor(), 0);
        assert!(!buf.has_pending());
        assert!(buf.pending().is_empty());
    }

    #[test]
    fn test_read_until_would_block() {
        let mut buf = EchoBuffer::new(16);
        let mut src = ScriptedReader::new(vec![Ok(b"hel".to_vec()), Ok(b"lo".to_vec())]);

        assert_eq!(buf.read_from(&mut src).unwrap(), ReadStatus::WouldBlock);
        assert_eq!(buf.pending(), b"hello");
        assert_eq!(buf.cursor(), 5);
    }

    #[test]
    fn test_read_stops_when_full() {
        let mut buf = EchoBuffer::new(4);
        let mut src = ScriptedReader::new(vec![Ok(b"abcdefgh".to_vec())]);

        assert_eq!(buf.read_from(&mut src).unwrap(), ReadStatus::Full);
        assert_eq!(buf.pending(), b"abcd");

        // A full buffer reads nothing more.
        assert_eq!(buf.read_from(&mut src).unwrap(), ReadStatus::Full);
        assert_eq!(buf.pending(), b"abcd");

        let mut sink = Vec::new();
        assert_eq!(buf.write_to(&mut sink).unwrap(), WriteStatus::Flushed);
        assert_eq!(buf.read_from(&mut src).unwrap(), ReadStatus::Full);
        assert_eq!(buf.pending(), b"efgh");
    }

    #[test]
    fn test_read_eof_reports_closed() {
        let mut buf = EchoBuffer::new(16);
        let mut src = ScriptedReader::new(vec![Ok(b"bye".to_vec()), Ok(Vec::new())]);

        assert_eq!(buf.read_from(&mut src).unwrap(), ReadStatus::Closed);
        assert_eq!(buf.pending(), b"bye");
    }

    #[test]
    fn test_read_retries_interrupted() {
        let mut buf = EchoBuffer::new(16);
        let mut src = ScriptedReader::new(vec![
            Err(io::ErrorKind::Interrupted.into()),
            Ok(b"ok".to_vec()),
        ]);

        assert_eq!(buf.read_from(&mut src).unwrap(), ReadStatus::WouldBlock);
        assert_eq!(buf.pending(), b"ok");
    }

    #[test]
    fn test_read_error_propagates() {
        let mut buf = EchoBuffer::new(16);
        let mut src = ScriptedReader::new(vec![Err(io::ErrorKind::ConnectionReset.into())]);

        let err = buf.read_from(&mut src).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn test_write_flushes_and_rewinds() {
        let mut buf = EchoBuffer::new(16);
        let mut src = ScriptedReader::new(vec![Ok(b"hello".to_vec())]);
        buf.read_from(&mut src).unwrap();

        let mut sink = ThrottledWriter {
            out: Vec::new(),
            chunk: 2,
            budget: usize::MAX,
        };
        assert_eq!(buf.write_to(&mut sink).unwrap(), WriteStatus::Flushed);
        assert_eq!(sink.out, b"hello");
        assert_eq!(buf.cursor(), 0);
        assert_eq!(buf.received(), 0);
    }

    #[test]
    fn test_partial_write_keeps_state() {
        let mut buf = EchoBuffer::new(16);
        let mut src = ScriptedReader::new(vec![Ok(b"abcdef".to_vec())]);
        buf.read_from(&mut src).unwrap();

        let mut sink = ThrottledWriter {
            out: Vec::new(),
            chunk: 16,
            budget: 4,
        };
        assert_eq!(buf.write_to(&mut sink).unwrap(), WriteStatus::Partial);
        assert_eq!(buf.pending(), b"ef");
        assert_eq!(buf.cursor(), 6);

        // New bytes land after the cursor and go out after the leftover.
        let mut src = ScriptedReader::new(vec![Ok(b"gh".to_vec())]);
        buf.read_from(&mut src).unwrap();
        assert_eq!(buf.pending(), b"efgh");
        assert_eq!(buf.since(6), b"gh");

        sink.budget = usize::MAX;
        assert_eq!(buf.write_to(&mut sink).unwrap(), WriteStatus::Flushed);
        assert_eq!(sink.out, b"abcdefgh");
        assert_eq!(buf.cursor(), 0);
    }

    #[test]
    fn test_write_zero_is_error() {
        let mut buf = EchoBuffer::new(8);
        let mut src = ScriptedReader::new(vec![Ok(b"x".to_vec())]);
        buf.read_from(&mut src).unwrap();

        let mut sink = ThrottledWriter {
            out: Vec::new(),
            chunk: 0,
            budget: usize::MAX,
        };
        let err = buf.write_to(&mut sink).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_flush_with_nothing_pending() {
        let mut buf = EchoBuffer::new(8);
        let mut sink = Vec::new();
        assert_eq!(buf.write_to(&mut sink).unwrap(), WriteStatus::Flushed);
        assert!(sink.is_empty());
    }
}
