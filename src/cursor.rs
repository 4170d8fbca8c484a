//! A bounds-checked forward reader over a byte slice.

use std::fmt;

/// A read asked for more bytes than remain in the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Overrun {
    /// Offset from the start of the buffer at which the read was attempted.
    pub offset: usize,
    /// Number of bytes requested.
    pub wanted: usize,
    /// Number of bytes that were left.
    pub available: usize,
}

impl std::error::Error for Overrun {}

impl fmt::Display for Overrun {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "input stream overrun: wanted {} bytes at offset {}, but only {} remain",
            self.wanted, self.offset, self.available)
    }
}

#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Returns a cursor over the same buffer, positioned at `pos`. Fails if
    /// `pos` lies past the end.
    pub fn at(buf: &'a [u8], pos: usize) -> Result<Self, Overrun> {
        let mut cursor = Self::new(buf);
        cursor.read(pos)?;
        Ok(cursor)
    }

    /// Offset of the next byte to be read.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Returns the next `n` bytes and advances past them. On error, the
    /// position is unchanged.
    pub fn read(&mut self, n: usize) -> Result<&'a [u8], Overrun> {
        if n > self.remaining() {
            return Err(Overrun { offset: self.pos, wanted: n, available: self.remaining() });
        }
        let result = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(result)
    }

    pub fn read_u8(&mut self) -> Result<u8, Overrun> {
        Ok(self.read(1)?[0])
    }

    pub fn read_u16le(&mut self) -> Result<u16, Overrun> {
        let b = self.read(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Skips forward to the next multiple of `m` (measured from the start of
    /// the buffer), returning the number of bytes skipped. Fails if the skipped
    /// bytes are not all present.
    pub fn align(&mut self, m: usize) -> Result<usize, Overrun> {
        let pad = (m - self.pos % m) % m;
        self.read(pad)?;
        Ok(pad)
    }
}
