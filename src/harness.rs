//! Runs the embedded decompressor on one block at a time.
//!
//! The decompressor lives in a small fixed machine:
//!
//! ```text
//! linear 0x00000  code region   0000:0000  hlt (the return address)
//!                               0000:00fc  far return address 0000:0000
//!                               0010:0000  the decompressor image, header and all
//! linear 0x10000  input region  1000:0000  the block payload, header and all
//! linear 0x20000  output region 2000:0000  decompressed bytes
//! ```
//!
//! The decompressor is called far, with
//!
//! ```text
//! cs:ip = 0010:entry
//! ds:si = 1000:0006     (just past the payload's sub-header)
//! es:di = 2000:0000
//! ax    = control word from the sub-header
//! bx    = 1
//! cx    = uncompressed length in 512-byte units, rounded up
//! dx    = 0
//! ss:sp = 0000:00fc
//! ```
//!
//! and is expected to return far to 0000:0000, where it hits the `hlt`, with
//! carry clear, `si` just past the input it consumed, and `di` just past the
//! output it produced.

use std::fmt;

use crate::cpu::{Machine, Registers, Stop, Flags};
use crate::memory::{AddressSpace, MapError, Perm, RegionId};
use crate::pointer::Pointer;
use crate::stream::{Block, DecompressorImage, FormatError, SUB_HEADER_LEN};
use crate::Options;

/// Each of the three regions is one real-mode segment long.
pub const REGION_SIZE: usize = 0x10000;
/// Bytes at the foot of the code region reserved for the stack.
pub const STACK_RESERVE: usize = 256;

pub const CODE_BASE: u32 = 0x00000;
pub const INPUT_BASE: u32 = 0x10000;
pub const OUTPUT_BASE: u32 = 0x20000;

const HLT: u8 = 0xf4;

/// Where the far return address is stored, relative to `ss`.
const RETURN_SLOT: u16 = 0x00fc;

/// A decompressor that returns normally executes the `hlt` at linear 0 and
/// stops with this `cs:ip`.
pub const EXPECTED_HALT: Pointer = Pointer { segment: 0x0000, offset: 0x0001 };

/// `cx` counts output in units of this many bytes.
const OUTPUT_UNIT: u32 = 512;

/// The machine could not be set up.
#[derive(Debug, Clone, PartialEq)]
pub enum SetupError {
    /// The decompressor image plus the stack reserve exceeds the code region.
    Capacity { len: usize, available: usize },
    /// The fixed memory layout is inconsistent.
    Layout(MapError),
}

impl std::error::Error for SetupError {}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SetupError::Capacity { len, available } =>
                write!(f, "decompressor is {} bytes long, but only {} bytes of code space are available", len, available),
            SetupError::Layout(err) =>
                write!(f, "memory layout: {}", err),
        }
    }
}

impl From<MapError> for SetupError {
    fn from(err: MapError) -> Self {
        SetupError::Layout(err)
    }
}

/// Which register a `LengthMismatch` is about.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Measure {
    /// Input consumed, from `si`.
    Consumed,
    /// Output produced, from `di`.
    Produced,
}

impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Measure::Consumed => write!(f, "consumed"),
            Measure::Produced => write!(f, "produced"),
        }
    }
}

/// The decompressor ran, but its final state is not a successful return.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionError {
    /// The machine stopped anywhere other than on the `hlt` at
    /// `EXPECTED_HALT`. `stop` is set if it stopped without halting at all.
    UnexpectedHalt { halt: Pointer, stop: Option<Stop> },
    /// The decompressor returned with carry set.
    DecompressionFailed,
    /// `si` or `di` does not agree with the block's declared lengths.
    LengthMismatch { measure: Measure, expected: u16, actual: u16 },
}

impl std::error::Error for ExecutionError {}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecutionError::UnexpectedHalt { halt: _, stop: Some(stop) } =>
                write!(f, "decompressor did not return: {}", stop),
            ExecutionError::UnexpectedHalt { halt, stop: None } =>
                write!(f, "decompressor halted at {}; expected {}", halt, EXPECTED_HALT),
            ExecutionError::DecompressionFailed =>
                write!(f, "decompressor reported failure"),
            ExecutionError::LengthMismatch { measure: Measure::Consumed, expected, actual } =>
                write!(f, "decompressor consumed {} bytes; expected {} or {}", actual, expected, u32::from(*expected) + 1),
            ExecutionError::LengthMismatch { measure, expected, actual } =>
                write!(f, "decompressor {} {} bytes; expected {}", measure, actual, expected),
        }
    }
}

/// The machine state that matters after running the decompressor on a block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockExecutionResult {
    /// Why the machine stopped, if not by `hlt`.
    pub stop: Option<Stop>,
    /// `cs:ip` when the machine stopped.
    pub halt: Pointer,
    pub carry: bool,
    /// `si`
    pub consumed: u16,
    /// `di`
    pub produced: u16,
}

impl BlockExecutionResult {
    /// Checks that the decompressor returned normally, succeeded, and
    /// consumed and produced as many bytes as `block` declares. `si` may
    /// overshoot the input by one byte.
    pub fn check(&self, block: &Block) -> Result<(), ExecutionError> {
        if self.stop.is_some() || self.halt != EXPECTED_HALT {
            return Err(ExecutionError::UnexpectedHalt { halt: self.halt, stop: self.stop.clone() });
        }
        if self.carry {
            return Err(ExecutionError::DecompressionFailed);
        }
        let compressed_len = block.compressed_len();
        let consumed = u32::from(self.consumed);
        if consumed != u32::from(compressed_len) && consumed != u32::from(compressed_len) + 1 {
            return Err(ExecutionError::LengthMismatch {
                measure: Measure::Consumed,
                expected: compressed_len,
                actual: self.consumed,
            });
        }
        if self.produced != block.uncompressed_len {
            return Err(ExecutionError::LengthMismatch {
                measure: Measure::Produced,
                expected: block.uncompressed_len,
                actual: self.produced,
            });
        }
        Ok(())
    }
}

/// A machine with a decompressor loaded, ready to run on blocks.
#[derive(Debug)]
pub struct Harness {
    machine: Machine,
    input: RegionId,
    output: RegionId,
    entry: u16,
    max_steps: Option<u64>,
}

impl Harness {
    /// Lays out memory and loads `image` into it.
    pub fn new(image: &DecompressorImage, options: &Options) -> Result<Self, SetupError> {
        let len = image.code.len();
        let available = REGION_SIZE - STACK_RESERVE;
        if len > available {
            return Err(SetupError::Capacity { len, available });
        }

        let mut mem = AddressSpace::new();
        let code = mem.alloc(REGION_SIZE);
        let input = mem.alloc(REGION_SIZE);
        let output = mem.alloc(REGION_SIZE);
        {
            let code = mem.region_mut(code);
            code[0] = HLT;
            code[STACK_RESERVE..STACK_RESERVE + len].copy_from_slice(image.code);
        }
        let perm = Perm::all();
        mem.map(CODE_BASE, code, perm)?;
        mem.map(INPUT_BASE, input, perm)?;
        mem.map(OUTPUT_BASE, output, perm)?;

        Ok(Self {
            machine: Machine::new(mem),
            input,
            output,
            entry: image.entry,
            max_steps: options.max_steps,
        })
    }

    /// Sets up registers and the stack for a call on `block`.
    fn enter(&mut self, block: &Block, control: u16) -> Result<(), Stop> {
        let uncompressed_len = u32::from(block.uncompressed_len);
        self.machine.regs = Registers {
            cs: ((CODE_BASE as usize + STACK_RESERVE) >> 4) as u16,
            ip: self.entry,
            ds: (INPUT_BASE >> 4) as u16,
            si: SUB_HEADER_LEN as u16,
            es: (OUTPUT_BASE >> 4) as u16,
            di: 0,
            ax: control,
            bx: 1,
            cx: ((uncompressed_len + OUTPUT_UNIT - 1) / OUTPUT_UNIT) as u16,
            dx: 0,
            ss: (CODE_BASE >> 4) as u16,
            sp: RETURN_SLOT,
            ..Registers::default()
        };

        let at = self.machine.regs.cs_ip();
        let slot = Pointer::new(self.machine.regs.ss, RETURN_SLOT);
        self.machine.write_u16(slot, 0x0000)
            .and_then(|_| self.machine.write_u16(slot.add(2), 0x0000))
            .map_err(|fault| Stop::Fault { at, fault })
    }

    /// Runs the decompressor on `block` and reports the final state. Does not
    /// judge whether the run succeeded; see `BlockExecutionResult::check`.
    pub fn run_block(&mut self, block: &Block) -> Result<BlockExecutionResult, FormatError> {
        let sub_header = block.sub_header()?;
        debug!("block at offset {}: compressed {} uncompressed {} control {:#06x}",
            block.offset, block.compressed_len(), block.uncompressed_len, sub_header.control);
        self.machine.mem.region_mut(self.input)[..block.payload.len()].copy_from_slice(block.payload);

        let max_steps = self.max_steps;
        let stop = match self.enter(block, sub_header.control).and_then(|_| self.machine.run(max_steps)) {
            Ok(steps) => {
                debug!("halted after {} instructions", steps);
                None
            }
            Err(stop) => {
                debug!("stopped: {}", stop);
                Some(stop)
            }
        };
        let regs = &self.machine.regs;
        debug!("{}", regs);

        Ok(BlockExecutionResult {
            stop,
            halt: regs.cs_ip(),
            carry: regs.flag(Flags::CF),
            consumed: regs.si,
            produced: regs.di,
        })
    }

    /// The first `len` bytes of the output region.
    pub fn output(&self, len: u16) -> &[u8] {
        &self.machine.mem.region(self.output)[..usize::from(len)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Wraps `routine` in an image header, with the entry point just after
    /// the header.
    fn image_code(routine: &[u8]) -> Vec<u8> {
        let mut code = vec![0x43, 0x4d, 0x06, 0x00, 0x00, 0x00];
        code.extend_from_slice(routine);
        while code.len() % 16 != 0 {
            code.push(0);
        }
        let paragraphs = (code.len() / 16) as u16;
        code[4..6].copy_from_slice(&paragraphs.to_le_bytes());
        code
    }

    fn harness(code: &[u8], options: &Options) -> Harness {
        let image = DecompressorImage {
            offset: 0,
            entry: 6,
            len_paragraphs: (code.len() / 16) as u16,
            code,
        };
        Harness::new(&image, options).unwrap()
    }

    fn payload(control: u16, data: &[u8]) -> Vec<u8> {
        let mut payload = vec![0x44, 0x53, 0x00, 0x00];
        payload.extend_from_slice(&control.to_le_bytes());
        payload.extend_from_slice(data);
        payload
    }

    // mov cx, ax; cld; rep movsb; clc; retf
    const COPY: &[u8] = &[0x89, 0xc1, 0xfc, 0xf3, 0xa4, 0xf8, 0xcb];

    #[test]
    fn test_copy() {
        let code = image_code(COPY);
        let mut h = harness(&code, &Options::default());
        let data = b"hello, world";
        let payload = payload(data.len() as u16, data);
        let block = Block { offset: 2, uncompressed_len: data.len() as u16, payload: &payload };
        let result = h.run_block(&block).unwrap();
        assert_eq!(result, BlockExecutionResult {
            stop: None,
            halt: EXPECTED_HALT,
            carry: false,
            consumed: payload.len() as u16,
            produced: data.len() as u16,
        });
        assert_eq!(result.check(&block), Ok(()));
        assert_eq!(h.output(block.uncompressed_len), &data[..]);
    }

    #[test]
    fn test_calling_convention() {
        // hlt
        let code = image_code(&[0xf4]);
        let mut h = harness(&code, &Options::default());
        let payload = payload(0xabcd, &[]);
        let block = Block { offset: 2, uncompressed_len: 513, payload: &payload };
        let result = h.run_block(&block).unwrap();
        assert_eq!(result.halt, Pointer::new(0x0010, 0x0007));
        let regs = &h.machine.regs;
        assert_eq!((regs.ax, regs.bx, regs.cx, regs.dx), (0xabcd, 1, 2, 0));
        assert_eq!((regs.ds, regs.si, regs.es, regs.di), (0x1000, 6, 0x2000, 0));
        assert_eq!((regs.ss, regs.sp), (0x0000, 0x00fc));
        assert_eq!(h.machine.read_u16(Pointer::new(0, 0xfc)), Ok(0));
        assert_eq!(h.machine.read_u16(Pointer::new(0, 0xfe)), Ok(0));
        assert_eq!(result.check(&block), Err(ExecutionError::UnexpectedHalt {
            halt: Pointer::new(0x0010, 0x0007),
            stop: None,
        }));
    }

    #[test]
    fn test_output_units() {
        let code = image_code(&[0xf4]);
        let mut h = harness(&code, &Options::default());
        let payload = payload(0, &[]);
        for &(len, units) in &[(0, 0), (1, 1), (512, 1), (513, 2), (0xffff, 128)] {
            let block = Block { offset: 2, uncompressed_len: len, payload: &payload };
            h.run_block(&block).unwrap();
            assert_eq!(h.machine.regs.cx, units, "{}", len);
        }
    }

    #[test]
    fn test_carry() {
        // stc; retf
        let code = image_code(&[0xf9, 0xcb]);
        let mut h = harness(&code, &Options::default());
        let payload = payload(0, &[]);
        let block = Block { offset: 2, uncompressed_len: 0, payload: &payload };
        let result = h.run_block(&block).unwrap();
        assert_eq!(result.halt, EXPECTED_HALT);
        assert_eq!(result.check(&block), Err(ExecutionError::DecompressionFailed));
    }

    #[test]
    fn test_length_mismatch() {
        let code = image_code(COPY);
        let mut h = harness(&code, &Options::default());

        // Copies one byte fewer than the payload holds.
        let payload_short = payload(3, b"abcd");
        let block = Block { offset: 2, uncompressed_len: 3, payload: &payload_short };
        let result = h.run_block(&block).unwrap();
        assert_eq!(result.check(&block), Err(ExecutionError::LengthMismatch {
            measure: Measure::Consumed,
            expected: 10,
            actual: 9,
        }));

        // Consumes the whole payload but produces a different length.
        let payload_full = payload(4, b"abcd");
        let block = Block { offset: 2, uncompressed_len: 5, payload: &payload_full };
        let result = h.run_block(&block).unwrap();
        assert_eq!(result.check(&block), Err(ExecutionError::LengthMismatch {
            measure: Measure::Produced,
            expected: 5,
            actual: 4,
        }));
    }

    #[test]
    fn test_consumed_tolerance() {
        // mov cx, ax; cld; rep movsb; inc si; clc; retf
        let code = image_code(&[0x89, 0xc1, 0xfc, 0xf3, 0xa4, 0x46, 0xf8, 0xcb]);
        let mut h = harness(&code, &Options::default());
        let payload = payload(4, b"abcd");
        let block = Block { offset: 2, uncompressed_len: 4, payload: &payload };
        let result = h.run_block(&block).unwrap();
        assert_eq!(result.consumed, 11);
        assert_eq!(result.check(&block), Ok(()));
    }

    #[test]
    fn test_step_limit() {
        // jmp $
        let code = image_code(&[0xeb, 0xfe]);
        let mut h = harness(&code, &Options { max_steps: Some(1000) });
        let payload = payload(0, &[]);
        let block = Block { offset: 2, uncompressed_len: 0, payload: &payload };
        let result = h.run_block(&block).unwrap();
        assert_eq!(result.stop, Some(Stop::StepLimit { steps: 1000 }));
        assert!(matches!(result.check(&block), Err(ExecutionError::UnexpectedHalt { stop: Some(_), .. })));
    }

    #[test]
    fn test_bad_sub_header() {
        let code = image_code(COPY);
        let mut h = harness(&code, &Options::default());
        let block = Block { offset: 2, uncompressed_len: 0, payload: b"XY\x00\x00\x00\x00" };
        assert_eq!(h.run_block(&block), Err(FormatError::BadBlockSignature { signature: 0x5958 }));
        let block = Block { offset: 2, uncompressed_len: 0, payload: b"DS\x00" };
        assert!(matches!(h.run_block(&block), Err(FormatError::Overrun(_))));
    }

    #[test]
    fn test_capacity() {
        let options = Options::default();
        let code = vec![0; REGION_SIZE - STACK_RESERVE];
        let image = DecompressorImage { offset: 0, entry: 6, len_paragraphs: 0x0ff0, code: &code };
        assert!(Harness::new(&image, &options).is_ok());
        let code = vec![0; REGION_SIZE - STACK_RESERVE + 16];
        let image = DecompressorImage { offset: 0, entry: 6, len_paragraphs: 0x0ff1, code: &code };
        assert_eq!(Harness::new(&image, &options).map(|_| ()), Err(SetupError::Capacity {
            len: REGION_SIZE - STACK_RESERVE + 16,
            available: REGION_SIZE - STACK_RESERVE,
        }));
    }
}
