//! Buffered byte source shared by all importers.
//!
//! Importers mix sequential reads with small look-aheads (`show_*`) and
//! occasional back-seeks to a frame boundary they have already buffered.
//! `ByteStream` keeps a sliding window over the underlying reader so those
//! back-seeks usually never touch it; only a seek outside the window
//! requires the input to be truly seekable.

use std::io::{Read, Seek, SeekFrom};

use failure::{bail, Error};

/// Initial and per-call read size. The buffer grows past this on demand
/// when a `show_*` peeks beyond it.
const DEFAULT_BUFFER_SIZE: usize = 1 << 16;

pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

enum Input {
    Seekable(Box<dyn ReadSeek>),
    Unseekable(Box<dyn Read>),
}

impl Input {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Input::Seekable(r) => r.read(buf),
            Input::Unseekable(r) => r.read(buf),
        }
    }
}

/// A byte stream with an internal buffer, bounded look-ahead, and a
/// buffered-window back-seek.
///
/// Failures are sticky: once `error` is set, every read quietly produces
/// zeros so that parsers fail at their next validity check instead of
/// consuming stale data.
pub struct ByteStream {
    input: Input,
    buf: Vec<u8>,
    /// Bytes of `buf` holding valid data.
    store: usize,
    /// Read position within `buf`; `pos <= store`.
    pos: usize,
    /// Absolute stream offset of the end of the buffer.
    offset: u64,
    max_read_size: usize,
    eof: bool,
    eob: bool,
    error: bool,
}

impl ByteStream {
    pub fn new<R: Read + Seek + 'static>(input: R) -> Self {
        Self::with_input(Input::Seekable(Box::new(input)))
    }

    /// For pipe-like inputs. Seeks outside the buffered window fail, so
    /// the two-pass NAL importers reject such streams at open time.
    pub fn unseekable<R: Read + 'static>(input: R) -> Self {
        Self::with_input(Input::Unseekable(Box::new(input)))
    }

    fn with_input(input: Input) -> Self {
        ByteStream {
            input,
            buf: vec![0; DEFAULT_BUFFER_SIZE],
            store: 0,
            pos: 0,
            offset: 0,
            max_read_size: DEFAULT_BUFFER_SIZE,
            eof: false,
            eob: false,
            error: false,
        }
    }

    pub fn is_seekable(&self) -> bool {
        matches!(self.input, Input::Seekable(_))
    }

    pub fn error(&self) -> bool {
        self.error
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    pub fn eob(&self) -> bool {
        self.eob
    }

    /// Readable bytes currently in the buffer.
    pub fn remaining(&self) -> usize {
        self.store - self.pos
    }

    /// Absolute offset of the next byte `get_byte` would return.
    pub fn stream_pos(&self) -> u64 {
        self.offset - self.remaining() as u64
    }

    /// Slice of unread buffered data. Valid until the next read or seek.
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..self.store]
    }

    fn fill(&mut self) {
        if self.eof || self.error {
            return;
        }
        // Drop consumed bytes, then top the buffer up.
        if self.pos > 0 {
            self.buf.copy_within(self.pos..self.store, 0);
            self.store -= self.pos;
            self.pos = 0;
        }
        while self.store < self.buf.len() {
            let want = std::cmp::min(self.buf.len() - self.store, self.max_read_size);
            match self.input.read(&mut self.buf[self.store..self.store + want]) {
                Ok(0) => {
                    self.eof = true;
                    return;
                }
                Ok(n) => {
                    self.store += n;
                    self.offset += n as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.error = true;
                    return;
                }
            }
        }
    }

    /// Peeks the byte at `offset` bytes past the current position without
    /// consuming anything, growing the buffer if the peek reaches past it.
    /// Returns 0 past the end of stream or after an error.
    pub fn show_byte(&mut self, offset: usize) -> u8 {
        if self.error {
            return 0;
        }
        if offset >= self.remaining() {
            self.fill();
            if self.error {
                return 0;
            }
            if offset >= self.remaining() {
                if self.eof {
                    return 0;
                }
                self.buf.resize(self.pos + offset + 1, 0);
                self.fill();
                if self.error || offset >= self.remaining() {
                    return 0;
                }
            }
        }
        self.buf[self.pos + offset]
    }

    pub fn show_be16(&mut self, offset: usize) -> u16 {
        (u16::from(self.show_byte(offset)) << 8) | u16::from(self.show_byte(offset + 1))
    }

    pub fn show_be24(&mut self, offset: usize) -> u32 {
        (u32::from(self.show_byte(offset)) << 16) | u32::from(self.show_be16(offset + 1))
    }

    pub fn show_be32(&mut self, offset: usize) -> u32 {
        (u32::from(self.show_be16(offset)) << 16) | u32::from(self.show_be16(offset + 2))
    }

    pub fn show_be64(&mut self, offset: usize) -> u64 {
        (u64::from(self.show_be32(offset)) << 32) | u64::from(self.show_be32(offset + 4))
    }

    pub fn show_le16(&mut self, offset: usize) -> u16 {
        u16::from(self.show_byte(offset)) | (u16::from(self.show_byte(offset + 1)) << 8)
    }

    pub fn show_le32(&mut self, offset: usize) -> u32 {
        u32::from(self.show_le16(offset)) | (u32::from(self.show_le16(offset + 2)) << 16)
    }

    pub fn show_le64(&mut self, offset: usize) -> u64 {
        u64::from(self.show_le32(offset)) | (u64::from(self.show_le32(offset + 4)) << 32)
    }

    pub fn get_byte(&mut self) -> u8 {
        if self.eob || self.error {
            return 0;
        }
        if self.pos == self.store {
            self.fill();
            if self.error {
                return 0;
            }
            if self.pos == self.store && self.eof {
                self.eob = true;
                return 0;
            }
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        b
    }

    pub fn get_be16(&mut self) -> u16 {
        (u16::from(self.get_byte()) << 8) | u16::from(self.get_byte())
    }

    pub fn get_be32(&mut self) -> u32 {
        (u32::from(self.get_be16()) << 16) | u32::from(self.get_be16())
    }

    pub fn get_le16(&mut self) -> u16 {
        u16::from(self.get_byte()) | (u16::from(self.get_byte()) << 8)
    }

    pub fn get_le32(&mut self) -> u32 {
        u32::from(self.get_le16()) | (u32::from(self.get_le16()) << 16)
    }

    pub fn get_le64(&mut self) -> u64 {
        u64::from(self.get_le32()) | (u64::from(self.get_le32()) << 32)
    }

    /// Copies up to `out.len()` bytes into `out`, returning the number
    /// actually copied. Short only at end of stream or on error.
    pub fn get(&mut self, out: &mut [u8]) -> usize {
        if self.eob || self.error || out.is_empty() {
            return 0;
        }
        let mut copied = 0;
        while copied < out.len() {
            if self.remaining() == 0 {
                if self.eof {
                    self.eob = true;
                    break;
                }
                self.fill();
                if self.error {
                    break;
                }
                continue;
            }
            let n = std::cmp::min(out.len() - copied, self.remaining());
            out[copied..copied + n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            copied += n;
        }
        copied
    }

    pub fn skip(&mut self, mut size: usize) {
        if self.eob || self.error || size == 0 {
            return;
        }
        loop {
            let n = std::cmp::min(size, self.remaining());
            self.pos += n;
            size -= n;
            if size == 0 {
                return;
            }
            if self.eof {
                self.eob = true;
                return;
            }
            self.fill();
            if self.error {
                return;
            }
        }
    }

    /// True when fewer than or exactly `depth` bytes remain in the whole
    /// stream; forces a buffer fill to find out.
    pub fn is_end(&mut self, depth: usize) -> bool {
        self.show_byte(depth);
        self.error || (self.eof && self.remaining() <= depth)
    }

    /// Seeks relative to the current read position.
    pub fn read_seek_cur(&mut self, delta: i64) -> Result<u64, Error> {
        let cur = self.stream_pos() as i64;
        let dst = if cur + delta < 0 { 0 } else { (cur + delta) as u64 };
        self.read_seek_set(dst)
    }

    /// Seeks to absolute position `dst`. Stays inside the buffered window
    /// when possible; otherwise requires a seekable input.
    pub fn read_seek_set(&mut self, dst: u64) -> Result<u64, Error> {
        let window_start = self.offset - self.store as u64;
        if dst >= window_start && dst < self.offset {
            self.pos = (dst - window_start) as usize;
            self.eob = false;
            return Ok(dst);
        }
        // `dst == self.offset` only works via the window when the buffer is
        // empty there; fall through to a real seek otherwise.
        if dst == self.offset {
            self.pos = self.store;
            self.eob = false;
            return Ok(dst);
        }
        match &mut self.input {
            Input::Seekable(r) => {
                let ret = r.seek(SeekFrom::Start(dst)).map_err(Error::from)?;
                self.offset = ret;
                self.store = 0;
                self.pos = 0;
                self.eof = false;
                self.eob = false;
                Ok(ret)
            }
            Input::Unseekable(_) => bail!("stream is not seekable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ByteStream;
    use std::io::Cursor;

    #[test]
    fn show_and_get() {
        let mut bs = ByteStream::new(Cursor::new(vec![0x01, 0x02, 0x03, 0x04, 0x05]));
        assert_eq!(bs.show_byte(0), 0x01);
        assert_eq!(bs.show_be16(1), 0x0203);
        assert_eq!(bs.show_le32(0), 0x04030201);
        assert_eq!(bs.get_byte(), 0x01);
        assert_eq!(bs.get_be16(), 0x0203);
        assert_eq!(bs.show_byte(0), 0x04);
        // Past the end: zeros, not panics.
        assert_eq!(bs.show_byte(10), 0);
        assert!(!bs.error());
    }

    #[test]
    fn is_end_semantics() {
        let mut bs = ByteStream::new(Cursor::new(vec![0u8; 4]));
        assert!(!bs.is_end(3));
        assert!(bs.is_end(4));
        bs.skip(4);
        assert!(bs.is_end(0));
    }

    #[test]
    fn back_seek_within_window() {
        let data: Vec<u8> = (0..=255).collect();
        let mut bs = ByteStream::new(Cursor::new(data));
        let mut out = [0u8; 16];
        assert_eq!(bs.get(&mut out), 16);
        bs.read_seek_set(4).unwrap();
        assert_eq!(bs.get_byte(), 4);
        assert_eq!(bs.stream_pos(), 5);
    }

    #[test]
    fn unseekable_rejects_out_of_window() {
        let data: Vec<u8> = (0..=255).collect();
        let mut bs = ByteStream::unseekable(Cursor::new(data));
        bs.show_byte(0); // prime the window
        assert!(bs.read_seek_set(0).is_ok());
        bs.skip(4);
        assert_eq!(bs.get_byte(), 4);
    }

    #[test]
    fn truncated_get_reports_short_count() {
        let mut bs = ByteStream::new(Cursor::new(vec![1, 2, 3]));
        let mut out = [0u8; 8];
        assert_eq!(bs.get(&mut out), 3);
        assert!(bs.eob());
    }
}
