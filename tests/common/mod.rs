use std::env;
use std::fs;
use std::path;

/// Copies `ax` bytes from ds:si to es:di.
///
/// ```text
/// mov cx, ax
/// cld
/// rep movsb
/// clc
/// retf
/// ```
pub const COPY: &[u8] = &[0x89, 0xc1, 0xfc, 0xf3, 0xa4, 0xf8, 0xcb];

/// Like `COPY`, but reads one byte past the end of its input.
pub const COPY_READ_AHEAD: &[u8] = &[0x89, 0xc1, 0xfc, 0xf3, 0xa4, 0x46, 0xf8, 0xcb];

/// Like `COPY`, but reports one byte fewer than it wrote.
pub const COPY_SHORT: &[u8] = &[0x89, 0xc1, 0xfc, 0xf3, 0xa4, 0x4f, 0xf8, 0xcb];

/// Expands `ax` (count, byte) pairs.
///
/// ```text
///     mov cx, ax
///     cld
/// next:
///     jcxz done
///     push cx
///     lodsw
///     mov cl, al
///     xor ch, ch
///     mov al, ah
///     rep stosb
///     pop cx
///     loop next
/// done:
///     clc
///     retf
/// ```
pub const RUN_LENGTH: &[u8] = &[
    0x89, 0xc1, 0xfc, 0xe3, 0x0d, 0x51, 0xad, 0x88, 0xc1, 0x30, 0xed,
    0x88, 0xe0, 0xf3, 0xaa, 0x59, 0xe2, 0xf1, 0xf8, 0xcb,
];

/// Halts without returning.
pub const HALT: &[u8] = &[0xf4];

/// Returns with carry set.
///
/// ```text
/// stc
/// retf
/// ```
pub const FAIL: &[u8] = &[0xf9, 0xcb];

/// Never returns.
///
/// ```text
/// jmp $
/// ```
pub const SPIN: &[u8] = &[0xeb, 0xfe];

/// Jumps to a segment where nothing is mapped.
///
/// ```text
/// jmp 5000h:0000h
/// ```
pub const WILD_JUMP: &[u8] = &[0xea, 0x00, 0x00, 0x00, 0x50];

/// Stores a byte into a segment where nothing is mapped.
///
/// ```text
/// mov bx, 5000h
/// mov es, bx
/// stosb
/// ```
pub const WILD_STORE: &[u8] = &[0xbb, 0x00, 0x50, 0x8e, 0xc3, 0xaa];

/// Calls DOS.
///
/// ```text
/// int 21h
/// ```
pub const SYSCALL: &[u8] = &[0xcd, 0x21];

/// Appends zero bytes to `buf` up to a multiple of 16.
pub fn pad_to_paragraph(buf: &mut Vec<u8>) {
    while buf.len() % 16 != 0 {
        buf.push(0);
    }
}

/// A decompressor image with `routine` at `entry`, padded to a whole number
/// of paragraphs. The space between the header and `entry` is filled with
/// `hlt`.
pub fn image_at(entry: u16, routine: &[u8]) -> Vec<u8> {
    let mut image = vec![0x43, 0x4d];
    image.extend_from_slice(&entry.to_le_bytes());
    image.extend_from_slice(&[0, 0]);
    image.resize(usize::from(entry), 0xf4);
    image.extend_from_slice(routine);
    pad_to_paragraph(&mut image);
    let paragraphs = (image.len() / 16) as u16;
    image[4..6].copy_from_slice(&paragraphs.to_le_bytes());
    image
}

/// A decompressor image with `routine` just after the header.
pub fn image(routine: &[u8]) -> Vec<u8> {
    image_at(6, routine)
}

/// Builds a stream one block at a time.
pub struct StreamBuilder {
    buf: Vec<u8>,
}

impl StreamBuilder {
    pub fn new() -> Self {
        Self { buf: b"CM".to_vec() }
    }

    /// Appends a block descriptor and `payload` exactly as given.
    pub fn raw_block(mut self, uncompressed_len: u16, payload: &[u8]) -> Self {
        self.buf.push(1);
        self.buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(&uncompressed_len.to_le_bytes());
        self.buf.extend_from_slice(payload);
        self
    }

    /// Appends a block whose payload is a sub-header with `control`,
    /// followed by `data`.
    pub fn block(self, control: u16, uncompressed_len: u16, data: &[u8]) -> Self {
        let mut payload = vec![0x44, 0x53, 0x00, 0x00];
        payload.extend_from_slice(&control.to_le_bytes());
        payload.extend_from_slice(data);
        self.raw_block(uncompressed_len, &payload)
    }

    /// Appends a block for the `COPY` family of decompressors.
    pub fn copy_block(self, data: &[u8]) -> Self {
        self.block(data.len() as u16, data.len() as u16, data)
    }

    /// Appends the terminator and returns the stream so far, unpadded.
    pub fn terminate(mut self) -> Vec<u8> {
        self.buf.extend_from_slice(&[0, 0, 0]);
        self.buf
    }

    /// Appends the terminator, padding, and `image`.
    pub fn finish_with_image(self, image: &[u8]) -> Vec<u8> {
        let mut buf = self.terminate();
        pad_to_paragraph(&mut buf);
        buf.extend_from_slice(image);
        buf
    }

    /// Appends the terminator, padding, and an image made from `routine`.
    pub fn finish(self, routine: &[u8]) -> Vec<u8> {
        self.finish_with_image(&image(routine))
    }
}

/// Writes `buf` to `path` if the environment variable `CMUNPACK_TEST_SAVE` is
/// set.
pub fn maybe_save<P: AsRef<path::Path>>(path: P, buf: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
    if env::var_os("CMUNPACK_TEST_SAVE").is_some() {
        fs::write(path, buf)?;
    }
    Ok(())
}
