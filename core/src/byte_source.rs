// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Peekable byte source (component A).
//!
//! Wraps a raw [`Read`] with one byte of lookahead. `peek_byte` is
//! idempotent: whatever it returns, the next `read_byte` returns the same
//! value. A single byte of lookahead is all the grammar walker needs to
//! dispatch on the next tag before consuming it.

use std::io::Read;

pub trait ByteSource {
    /// Reads and consumes one byte, or `None` at end of stream.
    fn read_byte(&mut self) -> std::io::Result<Option<u8>>;

    /// Reads the next byte without consuming it. Idempotent.
    fn peek_byte(&mut self) -> std::io::Result<Option<u8>>;

    /// Reads exactly `n` bytes, or fails if the stream runs out first.
    fn read_exact(&mut self, n: usize) -> std::io::Result<Vec<u8>>;

    /// A best-effort lower bound on bytes immediately available. Zero does
    /// not imply end of stream; callers must still attempt a read.
    fn available_hint(&self) -> usize;

    /// Discards `n` bytes, failing on premature end of stream.
    fn skip(&mut self, n: usize) -> std::io::Result<()> {
        self.read_exact(n).map(|_| ())
    }

    fn close(&mut self);
}

/// [`ByteSource`] over any [`Read`], buffering a single byte of lookahead.
pub struct PeekableReader<R> {
    inner: R,
    lookahead: Option<u8>,
    closed: bool,
}

impl<R: Read> PeekableReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            lookahead: None,
            closed: false,
        }
    }

    fn fill_one(&mut self) -> std::io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.inner.read(&mut byte)? {
            0 => Ok(None),
            1 => Ok(Some(byte[0])),
            _ => unreachable!("Read::read on a 1-byte buffer returns 0 or 1"),
        }
    }
}

impl<R: Read> ByteSource for PeekableReader<R> {
    fn read_byte(&mut self) -> std::io::Result<Option<u8>> {
        if let Some(byte) = self.lookahead.take() {
            return Ok(Some(byte));
        }
        self.fill_one()
    }

    fn peek_byte(&mut self) -> std::io::Result<Option<u8>> {
        if self.lookahead.is_none() {
            self.lookahead = self.fill_one()?;
        }
        Ok(self.lookahead)
    }

    fn read_exact(&mut self, n: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(n);
        if n > 0 {
            if let Some(byte) = self.lookahead.take() {
                buf.push(byte);
            }
        }
        if buf.len() < n {
            let mut rest = vec![0u8; n - buf.len()];
            self.inner.read_exact(&mut rest)?;
            buf.extend_from_slice(&rest);
        }
        Ok(buf)
    }

    fn available_hint(&self) -> usize {
        usize::from(self.lookahead.is_some())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_is_idempotent() {
        let mut src = PeekableReader::new(&b"ab"[..]);
        assert_eq!(src.peek_byte().unwrap(), Some(b'a'));
        assert_eq!(src.peek_byte().unwrap(), Some(b'a'));
        assert_eq!(src.read_byte().unwrap(), Some(b'a'));
        assert_eq!(src.read_byte().unwrap(), Some(b'b'));
        assert_eq!(src.read_byte().unwrap(), None);
    }

    #[test]
    fn read_exact_consumes_lookahead_first() {
        let mut src = PeekableReader::new(&b"abcd"[..]);
        assert_eq!(src.peek_byte().unwrap(), Some(b'a'));
        assert_eq!(src.read_exact(3).unwrap(), b"abc");
        assert_eq!(src.read_byte().unwrap(), Some(b'd'));
    }

    #[test]
    fn read_exact_past_eof_errors() {
        let mut src = PeekableReader::new(&b"ab"[..]);
        assert!(src.read_exact(3).is_err());
    }
}
