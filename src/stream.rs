//! Parsing of the "CM" container: a signature, a sequence of compressed
//! blocks ended by a terminator, and a paragraph-aligned decompressor image.
//!
//! ```text
//! Stream     := "CM" Block* Terminator Padding DecompressorImage
//! Block      := 01 compressed_len:u16 uncompressed_len:u16 payload[compressed_len]
//! Terminator := 00 00 00
//! Padding    := 0 to 15 bytes, up to a multiple of 16 from the stream start
//! Image      := "CM" entry:u16 len_paragraphs:u16 code...
//! ```
//!
//! Every block payload begins with its own 6-byte header:
//! `"DS" reserved:u16 control:u16`.

use std::fmt;

use crate::cursor::{Cursor, Overrun};

/// The signature at the beginning of a stream and of its decompressor image,
/// interpreted as a little-endian integer.
pub const SIGNATURE: u16 = 0x4d43; // "CM"

/// The signature at the beginning of each block payload.
pub const BLOCK_SIGNATURE: u16 = 0x5344; // "DS"

/// The length of the header at the beginning of each block payload.
pub const SUB_HEADER_LEN: usize = 6;

/// The decompressor image is aligned to a paragraph.
pub const PARAGRAPH: usize = 16;

/// A container format error.
#[derive(Debug, Clone, PartialEq)]
pub enum FormatError {
    /// A read went past the end of the input.
    Overrun(Overrun),
    /// The stream does not start with `b"CM"`.
    BadSignature { signature: u16 },
    /// A block's validity byte was neither 0 nor 1.
    BadValidity { offset: usize, value: u8 },
    /// A terminator with a nonzero length, or a block with a zero length.
    InconsistentLength { offset: usize, valid: bool, compressed_len: u16 },
    /// The decompressor image does not start with `b"CM"`.
    BadImageSignature { offset: usize, signature: u16 },
    /// The decompressor image claims more paragraphs than the input holds.
    ImageTooLong { offset: usize, len: usize, available: usize },
    /// A block payload does not start with `b"DS"`.
    BadBlockSignature { signature: u16 },
}

impl std::error::Error for FormatError {}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FormatError::Overrun(err) =>
                err.fmt(f),
            FormatError::BadSignature { signature } =>
                write!(f, "bad stream signature {:#06x}; expected {:#06x}", signature, SIGNATURE),
            FormatError::BadValidity { offset, value } =>
                write!(f, "block at offset {} has validity byte {:#04x}; expected 0 or 1", offset, value),
            FormatError::InconsistentLength { offset, valid, compressed_len } =>
                write!(f, "block at offset {} has validity {} with compressed length {}", offset, *valid as u8, compressed_len),
            FormatError::BadImageSignature { offset, signature } =>
                write!(f, "bad decompressor signature {:#06x} at offset {}; expected {:#06x}", signature, offset, SIGNATURE),
            FormatError::ImageTooLong { offset, len, available } =>
                write!(f, "decompressor at offset {} is {} bytes long, but only {} bytes remain", offset, len, available),
            FormatError::BadBlockSignature { signature } =>
                write!(f, "bad block signature {:#06x}; expected {:#06x}", signature, BLOCK_SIGNATURE),
        }
    }
}

impl From<Overrun> for FormatError {
    fn from(err: Overrun) -> Self {
        FormatError::Overrun(err)
    }
}

/// Returns true if `buf` starts with the stream signature. Does not check
/// anything else.
pub fn is_container_format(buf: &[u8]) -> bool {
    buf.len() > 2 && u16::from_le_bytes([buf[0], buf[1]]) == SIGNATURE
}

/// One compressed block. The terminator is not represented as a `Block`.
#[derive(Debug, Clone, PartialEq)]
pub struct Block<'a> {
    /// Offset of the block's validity byte from the start of the stream.
    pub offset: usize,
    pub uncompressed_len: u16,
    /// The whole payload, including the sub-header.
    pub payload: &'a [u8],
}

impl<'a> Block<'a> {
    /// The compressed length as declared in the block descriptor. Always
    /// nonzero.
    pub fn compressed_len(&self) -> u16 {
        self.payload.len() as u16
    }

    /// Parses the header at the beginning of the payload.
    pub fn sub_header(&self) -> Result<SubHeader, FormatError> {
        let mut cursor = Cursor::new(self.payload);
        let signature = cursor.read_u16le()?;
        if signature != BLOCK_SIGNATURE {
            return Err(FormatError::BadBlockSignature { signature });
        }
        // The second word seems to be unused.
        let reserved = cursor.read_u16le()?;
        let control = cursor.read_u16le()?;
        Ok(SubHeader { reserved, control })
    }
}

/// The header at the beginning of every block payload, minus the signature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubHeader {
    pub reserved: u16,
    /// Passed to the decompressor in `ax`.
    pub control: u16,
}

/// Iterator over the blocks of a stream, starting just after the signature.
/// Stops after the terminator or after the first error.
#[derive(Debug, Clone)]
pub struct Blocks<'a> {
    cursor: Cursor<'a>,
    done: bool,
}

impl<'a> Blocks<'a> {
    fn new(cursor: Cursor<'a>) -> Self {
        Self { cursor, done: false }
    }

    /// Reads one block descriptor and its payload. Returns `None` for the
    /// terminator.
    fn read_block(&mut self) -> Result<Option<Block<'a>>, FormatError> {
        let offset = self.cursor.position();
        let valid = match self.cursor.read_u8()? {
            0 => false,
            1 => true,
            value => return Err(FormatError::BadValidity { offset, value }),
        };
        let compressed_len = self.cursor.read_u16le()?;
        if valid != (compressed_len != 0) {
            return Err(FormatError::InconsistentLength { offset, valid, compressed_len });
        }
        if !valid {
            return Ok(None);
        }
        let uncompressed_len = self.cursor.read_u16le()?;
        let payload = self.cursor.read(usize::from(compressed_len))?;
        Ok(Some(Block { offset, uncompressed_len, payload }))
    }

    /// Runs the iterator to the end, discarding blocks, and returns a cursor
    /// positioned just after the terminator.
    pub fn skip_to_end(mut self) -> Result<Cursor<'a>, FormatError> {
        while let Some(block) = self.next() {
            block?;
        }
        Ok(self.cursor)
    }
}

impl<'a> Iterator for Blocks<'a> {
    type Item = Result<Block<'a>, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_block() {
            Ok(Some(block)) => Some(Ok(block)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// The embedded decompressor.
#[derive(Debug, Clone, PartialEq)]
pub struct DecompressorImage<'a> {
    /// Offset of the image from the start of the stream. Always a multiple of
    /// `PARAGRAPH`.
    pub offset: usize,
    /// Entry point, relative to the start of the image.
    pub entry: u16,
    pub len_paragraphs: u16,
    /// The whole image, `16 * len_paragraphs` bytes, starting with its own
    /// header.
    pub code: &'a [u8],
}

impl<'a> DecompressorImage<'a> {
    /// Reads the image header at `cursor`, which must be the position just
    /// after the terminator, and locates the code.
    fn locate(buf: &'a [u8], mut cursor: Cursor<'a>) -> Result<Self, FormatError> {
        let pad = cursor.align(PARAGRAPH)?;
        let offset = cursor.position();
        debug!("decompressor image at offset {} after {} bytes of padding", offset, pad);
        let available = cursor.remaining();

        let signature = cursor.read_u16le()?;
        if signature != SIGNATURE {
            return Err(FormatError::BadImageSignature { offset, signature });
        }
        let entry = cursor.read_u16le()?;
        let len_paragraphs = cursor.read_u16le()?;
        let len = usize::from(len_paragraphs) * PARAGRAPH;
        if len > available {
            return Err(FormatError::ImageTooLong { offset, len, available });
        }

        Ok(Self {
            offset,
            entry,
            len_paragraphs,
            code: &buf[offset..offset + len],
        })
    }
}

/// A parsed stream: the signature has been checked, the block sequence has
/// been walked once, and the decompressor image has been located.
#[derive(Debug, Clone)]
pub struct Container<'a> {
    /// Positioned just after the signature.
    start: Cursor<'a>,
    image: DecompressorImage<'a>,
}

impl<'a> Container<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, FormatError> {
        let mut cursor = Cursor::new(buf);
        let signature = cursor.read_u16le()?;
        if signature != SIGNATURE {
            return Err(FormatError::BadSignature { signature });
        }

        // Walk all the blocks once, just to find where the decompressor is.
        let start = cursor.clone();
        let cursor = Blocks::new(cursor).skip_to_end()?;
        let image = DecompressorImage::locate(buf, cursor)?;

        Ok(Self { start, image })
    }

    /// Returns a fresh iterator over the blocks.
    pub fn blocks(&self) -> Blocks<'a> {
        Blocks::new(self.start.clone())
    }

    pub fn image(&self) -> &DecompressorImage<'a> {
        &self.image
    }
}
