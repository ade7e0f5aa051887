// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Block-data framed reader (component B).
//!
//! A dual-mode reader over [`ByteSource`]. In `Raw` mode every primitive
//! read goes straight to the underlying source. In `Block` mode, reads are
//! served from an internal buffer that is transparently refilled across
//! block-data frame boundaries (`TC_BLOCKDATA` / `TC_BLOCKDATALONG`,
//! swallowing `TC_RESET` between frames) without the caller ever seeing the
//! frame headers.
//!
//! ```text
//!  block mode, one logical primitive read crossing a frame boundary
//!
//!  ...| byte byte BYTE |  <blockdata header>  | BYTE byte ... |
//!              └───────┬──────────┘  └───┬────┘
//!           tail of frame N      refill loads frame N+1
//! ```

use crate::byte_source::ByteSource;
use crate::error::{ScanError, ScanResult};
use crate::tags;

/// Block bodies are buffered in chunks no larger than this, regardless of
/// how large the frame's declared length is.
pub const MAX_BLOCK_SIZE: usize = 1024;
/// Upper bound on a block header's own encoding: tag byte + 4-byte length.
pub const MAX_HEADER_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderMode {
    Raw,
    /// `pos == end == -1` is the "no more blocks here" sentinel reached
    /// after a header scan finds a non-block, non-reset tag (or EOF).
    Block { pos: i64, end: i64, unread: i64 },
}

pub struct BlockReader<S> {
    source: S,
    mode: ReaderMode,
    buf: Vec<u8>,
}

fn eof(context: impl Into<String>) -> ScanError {
    ScanError::UnexpectedEof(context.into())
}

fn io_eof(e: std::io::Error) -> ScanError {
    ScanError::UnexpectedEof(e.to_string())
}

fn malformed() -> ScanError {
    ScanError::MalformedUtf("invalid modified-UTF-8 byte sequence".into())
}

impl<S: ByteSource> BlockReader<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            mode: ReaderMode::Raw,
            buf: Vec::new(),
        }
    }

    pub fn is_block_mode(&self) -> bool {
        matches!(self.mode, ReaderMode::Block { .. })
    }

    /// Switches to block mode, resetting `(pos, end, unread)` to zero.
    pub fn enter_block_mode(&mut self) {
        tracing::trace!("entering block mode");
        self.mode = ReaderMode::Block {
            pos: 0,
            end: 0,
            unread: 0,
        };
    }

    /// Switches back to raw mode. Fails if unconsumed block bytes remain;
    /// that is a programming error, not a stream-data error.
    pub fn exit_block_mode(&mut self) -> ScanResult<()> {
        match self.mode {
            ReaderMode::Raw => Ok(()),
            ReaderMode::Block { pos, end, unread } if pos == end && unread == 0 => {
                tracing::trace!("exiting block mode");
                self.mode = ReaderMode::Raw;
                Ok(())
            }
            ReaderMode::Block { pos, end, unread } => Err(ScanError::BlockStateViolation(
                format!("{} unconsumed block byte(s) remain", (end - pos) + unread),
            )),
        }
    }

    /// `(end - pos) + unread` in block mode; zero in raw mode (caller
    /// contract: only meaningful while in block mode).
    pub fn current_block_remaining(&self) -> i64 {
        match self.mode {
            ReaderMode::Block { pos, end, unread } if pos >= 0 => (end - pos) + unread,
            _ => 0,
        }
    }

    /// Consumes and discards bytes until a non-block, non-reset tag (or
    /// EOF) is found. Only valid in block mode; does not change mode.
    pub fn skip_to_end_of_blocks(&mut self) -> ScanResult<()> {
        self.require_block_mode()?;
        loop {
            if let ReaderMode::Block { pos, end, .. } = &mut self.mode {
                *pos = *end;
            }
            if let ReaderMode::Block { unread, .. } = self.mode {
                if unread > 0 {
                    self.source.skip(unread as usize).map_err(io_eof)?;
                    if let ReaderMode::Block { unread, .. } = &mut self.mode {
                        *unread = 0;
                    }
                }
            }
            if !self.discover_next_block_header()? {
                return Ok(());
            }
        }
    }

    // ---- raw-mode direct tag access, used by the grammar walker ----

    pub fn peek_tag(&mut self) -> ScanResult<Option<u8>> {
        self.source.peek_byte().map_err(io_eof)
    }

    pub fn read_tag(&mut self) -> ScanResult<Option<u8>> {
        self.source.read_byte().map_err(io_eof)
    }

    /// Raw-mode byte skip, used by the top-level `TC_BLOCKDATA[LONG]`
    /// dispatch row, which skips its payload byte-for-byte without
    /// entering the buffered block-mode machinery at all.
    pub fn skip_raw(&mut self, n: usize) -> ScanResult<()> {
        self.source.skip(n).map_err(io_eof)
    }

    // ---- primitive reads, mode-aware ----

    pub fn read_i8(&mut self) -> ScanResult<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u8(&mut self) -> ScanResult<u8> {
        match self.mode {
            ReaderMode::Raw => self.read_raw_u8(),
            ReaderMode::Block { .. } => self
                .next_block_byte()?
                .ok_or_else(|| eof("u8 read past end of block data")),
        }
    }

    pub fn read_i16(&mut self) -> ScanResult<i16> {
        Ok(i16::from_be_bytes(self.read_bytes::<2>()?))
    }

    /// `char` on the wire: an unsigned 16-bit big-endian quantity.
    pub fn read_u16(&mut self) -> ScanResult<u16> {
        Ok(u16::from_be_bytes(self.read_bytes::<2>()?))
    }

    pub fn read_i32(&mut self) -> ScanResult<i32> {
        Ok(i32::from_be_bytes(self.read_bytes::<4>()?))
    }

    pub fn read_u32(&mut self) -> ScanResult<u32> {
        Ok(u32::from_be_bytes(self.read_bytes::<4>()?))
    }

    pub fn read_i64(&mut self) -> ScanResult<i64> {
        Ok(i64::from_be_bytes(self.read_bytes::<8>()?))
    }

    pub fn read_u64(&mut self) -> ScanResult<u64> {
        Ok(u64::from_be_bytes(self.read_bytes::<8>()?))
    }

    pub fn read_f32(&mut self) -> ScanResult<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> ScanResult<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// `TC_STRING`-style body: `u16` length prefix, then that many
    /// modified-UTF-8 bytes.
    pub fn read_utf(&mut self) -> ScanResult<String> {
        let len = self.read_u16()? as usize;
        self.read_modified_utf8(len)
    }

    /// `TC_LONGSTRING`-style body: `u64` length prefix, decoded in full
    /// rather than skipped.
    pub fn read_long_utf(&mut self) -> ScanResult<String> {
        let len = self.read_u64()?;
        let len = usize::try_from(len)
            .map_err(|_| ScanError::CorruptedStream("TC_LONGSTRING length overflow".into()))?;
        self.read_modified_utf8(len)
    }

    fn read_modified_utf8(&mut self, len: usize) -> ScanResult<String> {
        let mut bytes = Vec::with_capacity(len);
        for _ in 0..len {
            bytes.push(self.read_u8()?);
        }
        // `bytes` is exactly `len` long even if decoding fails below, so
        // the cursor is already positioned at `start + len`.
        decode_modified_utf8(&bytes)
    }

    fn read_bytes<const N: usize>(&mut self) -> ScanResult<[u8; N]> {
        let mut out = [0u8; N];
        for slot in out.iter_mut() {
            *slot = self.read_u8()?;
        }
        Ok(out)
    }

    // ---- internals ----

    fn require_block_mode(&self) -> ScanResult<()> {
        match self.mode {
            ReaderMode::Block { .. } => Ok(()),
            ReaderMode::Raw => Err(ScanError::BlockStateViolation(
                "operation requires block mode".into(),
            )),
        }
    }

    fn read_raw_u8(&mut self) -> ScanResult<u8> {
        self.source
            .read_byte()
            .map_err(io_eof)?
            .ok_or_else(|| eof("u8"))
    }

    fn read_raw_i32(&mut self) -> ScanResult<i32> {
        let bytes = self.source.read_exact(4).map_err(io_eof)?;
        Ok(i32::from_be_bytes(bytes.try_into().unwrap()))
    }

    /// Fetches one byte from the active block, transparently refilling
    /// across frame boundaries. `Ok(None)` means the block region is
    /// exhausted (next tag in the raw stream is not a block header).
    fn next_block_byte(&mut self) -> ScanResult<Option<u8>> {
        loop {
            let ReaderMode::Block { pos, end, .. } = self.mode else {
                unreachable!("next_block_byte called outside block mode")
            };
            if pos < 0 {
                return Ok(None);
            }
            if pos < end {
                let byte = self.buf[pos as usize];
                if let ReaderMode::Block { pos, .. } = &mut self.mode {
                    *pos += 1;
                }
                return Ok(Some(byte));
            }
            if !self.ensure_next_chunk()? {
                return Ok(None);
            }
        }
    }

    /// Loads the next chunk of the current block (or the next block
    /// entirely, swallowing resets) into `self.buf`. Returns `false` once
    /// no more block data is available.
    fn ensure_next_chunk(&mut self) -> ScanResult<bool> {
        let ReaderMode::Block { unread, .. } = self.mode else {
            unreachable!()
        };
        if unread > 0 {
            let chunk_len = std::cmp::min(unread, MAX_BLOCK_SIZE as i64) as usize;
            self.buf = self.source.read_exact(chunk_len).map_err(io_eof)?;
            if let ReaderMode::Block { pos, end, unread } = &mut self.mode {
                *pos = 0;
                *end = chunk_len as i64;
                *unread -= chunk_len as i64;
            }
            return Ok(true);
        }
        self.discover_next_block_header()
    }

    /// Peeks the raw tag stream for the next block header, swallowing any
    /// `TC_RESET` tags in between. On success, sets `(pos, end, unread)`
    /// to describe the newly discovered block (with `pos == end == 0`, so
    /// the caller's next `ensure_next_chunk` loads its first chunk).
    /// On failure (non-block tag, or EOF) sets the `(-1, -1)` sentinel and
    /// leaves the triggering tag byte unconsumed.
    fn discover_next_block_header(&mut self) -> ScanResult<bool> {
        loop {
            let Some(tag) = self.source.peek_byte().map_err(io_eof)? else {
                self.mode = ReaderMode::Block {
                    pos: -1,
                    end: -1,
                    unread: 0,
                };
                return Ok(false);
            };
            match tag {
                tags::TC_RESET => {
                    self.source.read_byte().map_err(io_eof)?;
                    continue;
                }
                tags::TC_BLOCKDATA => {
                    self.source.read_byte().map_err(io_eof)?;
                    let len = self.read_raw_u8()? as i64;
                    tracing::debug!(len, long = false, "found block data header");
                    self.mode = ReaderMode::Block {
                        pos: 0,
                        end: 0,
                        unread: len,
                    };
                    return Ok(true);
                }
                tags::TC_BLOCKDATALONG => {
                    self.source.read_byte().map_err(io_eof)?;
                    let len = self.read_raw_i32()?;
                    if len < 0 {
                        return Err(ScanError::CorruptedStream(
                            "TC_BLOCKDATALONG length is negative".into(),
                        ));
                    }
                    tracing::debug!(len, long = true, "found block data header");
                    self.mode = ReaderMode::Block {
                        pos: 0,
                        end: 0,
                        unread: len as i64,
                    };
                    return Ok(true);
                }
                _ => {
                    self.mode = ReaderMode::Block {
                        pos: -1,
                        end: -1,
                        unread: 0,
                    };
                    return Ok(false);
                }
            }
        }
    }
}

/// Decodes the three modified-UTF-8 byte-pattern classes the format
/// allows: 1-byte `0xxxxxxx`, 2-byte `110xxxxx 10xxxxxx`, 3-byte
/// `1110xxxx 10xxxxxx 10xxxxxx`. Anything else, including a dangling
/// continuation byte, is `MalformedUtf`.
fn decode_modified_utf8(bytes: &[u8]) -> ScanResult<String> {
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b0 = bytes[i];
        if b0 & 0x80 == 0 {
            out.push(b0 as char);
            i += 1;
        } else if b0 & 0xE0 == 0xC0 {
            let b1 = *bytes.get(i + 1).ok_or_else(malformed)?;
            if b1 & 0xC0 != 0x80 {
                return Err(malformed());
            }
            let cp = (u32::from(b0 & 0x1F) << 6) | u32::from(b1 & 0x3F);
            out.push(char::from_u32(cp).ok_or_else(malformed)?);
            i += 2;
        } else if b0 & 0xF0 == 0xE0 {
            let b1 = *bytes.get(i + 1).ok_or_else(malformed)?;
            let b2 = *bytes.get(i + 2).ok_or_else(malformed)?;
            if b1 & 0xC0 != 0x80 || b2 & 0xC0 != 0x80 {
                return Err(malformed());
            }
            let cp =
                (u32::from(b0 & 0x0F) << 12) | (u32::from(b1 & 0x3F) << 6) | u32::from(b2 & 0x3F);
            out.push(char::from_u32(cp).ok_or_else(malformed)?);
            i += 3;
        } else {
            return Err(malformed());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_source::PeekableReader;

    fn reader(bytes: &[u8]) -> BlockReader<PeekableReader<&[u8]>> {
        BlockReader::new(PeekableReader::new(bytes))
    }

    #[test]
    fn raw_mode_reads_big_endian_primitives() {
        let mut r = reader(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(r.read_u16().unwrap(), 1);
        assert_eq!(r.read_i32().unwrap(), 2);
    }

    #[test]
    fn modified_utf8_round_trips_ascii() {
        let mut r = reader(&[0x00, 0x03, b'f', b'o', b'o']);
        assert_eq!(r.read_utf().unwrap(), "foo");
    }

    #[test]
    fn malformed_utf8_positions_cursor_at_declared_length() {
        // length 2, but second byte is not a valid continuation byte
        let mut r = reader(&[0x00, 0x02, 0xC0, 0x00, 0xFF]);
        assert!(r.read_utf().is_err());
        // cursor should be right after the declared 2-byte body
        assert_eq!(r.read_u8().unwrap(), 0xFF);
    }

    #[test]
    fn block_mode_transparently_crosses_frame_boundary() {
        // TC_BLOCKDATA len=2 [0xAA,0xBB], TC_BLOCKDATA len=2 [0xCC,0xDD], TC_ENDBLOCKDATA
        let bytes = [
            tags::TC_BLOCKDATA,
            0x02,
            0xAA,
            0xBB,
            tags::TC_BLOCKDATA,
            0x02,
            0xCC,
            0xDD,
            tags::TC_ENDBLOCKDATA,
        ];
        let mut r = reader(&bytes);
        r.enter_block_mode();
        // this u32 straddles the two block frames
        assert_eq!(r.read_u32().unwrap(), 0xAABBCCDDu32);
        r.skip_to_end_of_blocks().unwrap();
        r.exit_block_mode().unwrap();
        assert_eq!(r.read_tag().unwrap(), Some(tags::TC_ENDBLOCKDATA));
    }

    #[test]
    fn block_mode_swallows_reset_between_frames() {
        let bytes = [
            tags::TC_BLOCKDATA,
            0x01,
            0x11,
            tags::TC_RESET,
            tags::TC_BLOCKDATA,
            0x01,
            0x22,
            tags::TC_ENDBLOCKDATA,
        ];
        let mut r = reader(&bytes);
        r.enter_block_mode();
        assert_eq!(r.read_u8().unwrap(), 0x11);
        assert_eq!(r.read_u8().unwrap(), 0x22);
        r.skip_to_end_of_blocks().unwrap();
        r.exit_block_mode().unwrap();
        assert_eq!(r.read_tag().unwrap(), Some(tags::TC_ENDBLOCKDATA));
    }

    #[test]
    fn exit_block_mode_fails_with_unconsumed_bytes() {
        let bytes = [tags::TC_BLOCKDATA, 0x02, 0xAA, 0xBB, tags::TC_ENDBLOCKDATA];
        let mut r = reader(&bytes);
        r.enter_block_mode();
        assert_eq!(r.read_u8().unwrap(), 0xAA);
        assert!(r.exit_block_mode().is_err());
    }

    #[test]
    fn skip_to_end_of_blocks_stops_before_endblockdata() {
        let bytes = [tags::TC_BLOCKDATA, 0x02, 0xAA, 0xBB, tags::TC_ENDBLOCKDATA];
        let mut r = reader(&bytes);
        r.enter_block_mode();
        r.skip_to_end_of_blocks().unwrap();
        r.exit_block_mode().unwrap();
        assert_eq!(r.read_tag().unwrap(), Some(tags::TC_ENDBLOCKDATA));
    }
}
