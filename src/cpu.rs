//! A 16-bit real-mode x86 interpreter.
//!
//! Implements the 8086 instruction set and the common 80186 additions
//! (`pusha`, `popa`, `push imm`, `imul r, r/m, imm`, shifts by an immediate
//! count, `enter`, `leave`). All memory accesses go through an
//! `AddressSpace`, so a program can touch only what has been mapped for it.
//!
//! There is no interrupt controller, no I/O port space, and no FPU. The
//! machine stops when it executes `hlt`, and reports a `Stop` for anything
//! it cannot or will not do: `int`, `in`/`out`, FPU escapes, undefined
//! opcodes, divide errors, and memory faults.

use std::fmt;

use bitflags::bitflags;

use crate::memory::{Access, AddressSpace, Fault};
use crate::pointer::Pointer;

bitflags! {
    /// Bits of the flags register that `popf`, `sahf`, and `iret` can change.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u16 {
        const CF = 0x0001; // Carry
        const PF = 0x0004; // Parity
        const AF = 0x0010; // Auxiliary carry
        const ZF = 0x0040; // Zero
        const SF = 0x0080; // Sign
        const TF = 0x0100; // Trap
        const IF = 0x0200; // Interrupt enable
        const DF = 0x0400; // Direction
        const OF = 0x0800; // Overflow
    }
}

/// Bit 1 of the flags register always reads as 1.
const FLAGS_FIXED: u16 = 0x0002;

/// A run of more prefix bytes than this is treated as an undefined opcode.
const MAX_PREFIXES: usize = 15;

#[derive(Debug, Clone, PartialEq)]
pub struct Registers {
    pub ax: u16,
    pub bx: u16,
    pub cx: u16,
    pub dx: u16,
    pub si: u16,
    pub di: u16,
    pub bp: u16,
    pub sp: u16,
    pub ip: u16,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub ss: u16,
    pub flags: u16,
}

impl Default for Registers {
    fn default() -> Self {
        Self {
            ax: 0, bx: 0, cx: 0, dx: 0,
            si: 0, di: 0, bp: 0, sp: 0,
            ip: 0, cs: 0, ds: 0, es: 0, ss: 0,
            flags: FLAGS_FIXED,
        }
    }
}

impl Registers {
    /// The instruction pointer as a far pointer.
    pub fn cs_ip(&self) -> Pointer {
        Pointer::new(self.cs, self.ip)
    }

    pub fn flag(&self, flag: Flags) -> bool {
        self.flags & flag.bits() != 0
    }

    pub fn set_flag(&mut self, flag: Flags, value: bool) {
        if value {
            self.flags |= flag.bits();
        } else {
            self.flags &= !flag.bits();
        }
    }

    /// Loads the writable flag bits from `value`.
    fn load_flags(&mut self, value: u16) {
        self.flags = Flags::from_bits_truncate(value).bits() | FLAGS_FIXED;
    }

    /// 16-bit register by ModR/M index: ax cx dx bx sp bp si di.
    fn reg16(&self, index: u8) -> u16 {
        match index & 7 {
            0 => self.ax,
            1 => self.cx,
            2 => self.dx,
            3 => self.bx,
            4 => self.sp,
            5 => self.bp,
            6 => self.si,
            _ => self.di,
        }
    }

    fn set_reg16(&mut self, index: u8, value: u16) {
        match index & 7 {
            0 => self.ax = value,
            1 => self.cx = value,
            2 => self.dx = value,
            3 => self.bx = value,
            4 => self.sp = value,
            5 => self.bp = value,
            6 => self.si = value,
            _ => self.di = value,
        }
    }

    /// 8-bit register by ModR/M index: al cl dl bl ah ch dh bh.
    fn reg8(&self, index: u8) -> u8 {
        let word = self.reg16(index & 3);
        if index & 4 == 0 { word as u8 } else { (word >> 8) as u8 }
    }

    fn set_reg8(&mut self, index: u8, value: u8) {
        let word = self.reg16(index & 3);
        let word = if index & 4 == 0 {
            (word & 0xff00) | u16::from(value)
        } else {
            (word & 0x00ff) | (u16::from(value) << 8)
        };
        self.set_reg16(index & 3, word);
    }

    /// Segment register by index: es cs ss ds.
    fn sreg(&self, index: u8) -> u16 {
        match index & 3 {
            0 => self.es,
            1 => self.cs,
            2 => self.ss,
            _ => self.ds,
        }
    }

    fn set_sreg(&mut self, index: u8, value: u16) {
        match index & 3 {
            0 => self.es = value,
            1 => self.cs = value,
            2 => self.ss = value,
            _ => self.ds = value,
        }
    }
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ax={:04x} bx={:04x} cx={:04x} dx={:04x} si={:04x} di={:04x} bp={:04x} sp={:04x} \
            cs={:04x} ip={:04x} ds={:04x} es={:04x} ss={:04x} flags={:04x}",
            self.ax, self.bx, self.cx, self.dx, self.si, self.di, self.bp, self.sp,
            self.cs, self.ip, self.ds, self.es, self.ss, self.flags)
    }
}

/// Why the machine stopped, other than by executing `hlt`. `at` is the address
/// of the instruction that caused the stop.
#[derive(Debug, Clone, PartialEq)]
pub enum Stop {
    /// A memory access hit an unmapped page or lacked permission.
    Fault { at: Pointer, fault: Fault },
    /// The opcode is not defined.
    InvalidOpcode { at: Pointer, opcode: u8 },
    /// The opcode is defined but needs hardware we don't emulate (I/O ports,
    /// FPU, protected mode, 32-bit operands).
    Unsupported { at: Pointer, opcode: u8 },
    /// A software interrupt (`int`, `int3`, or `into` with overflow set).
    Interrupt { at: Pointer, vector: u8 },
    /// Division by zero, or a quotient too large for its destination.
    DivideError { at: Pointer },
    /// `run` executed its maximum number of instructions.
    StepLimit { steps: u64 },
}

impl std::error::Error for Stop {}

impl fmt::Display for Stop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Stop::Fault { at, fault } =>
                write!(f, "{} at {}", fault, at),
            Stop::InvalidOpcode { at, opcode } =>
                write!(f, "undefined opcode {:#04x} at {}", opcode, at),
            Stop::Unsupported { at, opcode } =>
                write!(f, "unsupported opcode {:#04x} at {}", opcode, at),
            Stop::Interrupt { at, vector } =>
                write!(f, "software interrupt {:#04x} at {}", vector, at),
            Stop::DivideError { at } =>
                write!(f, "divide error at {}", at),
            Stop::StepLimit { steps } =>
                write!(f, "stopped after {} instructions without halting", steps),
        }
    }
}

/// The outcome of one instruction, short of a `Stop`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Halt,
}

/// A `Stop` that doesn't know its address yet.
#[derive(Debug)]
enum Exception {
    Fault(Fault),
    Invalid(u8),
    Unsupported(u8),
    Interrupt(u8),
    Divide,
}

impl Exception {
    fn at(self, at: Pointer) -> Stop {
        match self {
            Exception::Fault(fault) => Stop::Fault { at, fault },
            Exception::Invalid(opcode) => Stop::InvalidOpcode { at, opcode },
            Exception::Unsupported(opcode) => Stop::Unsupported { at, opcode },
            Exception::Interrupt(vector) => Stop::Interrupt { at, vector },
            Exception::Divide => Stop::DivideError { at },
        }
    }
}

impl From<Fault> for Exception {
    fn from(fault: Fault) -> Self {
        Exception::Fault(fault)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Width {
    Byte,
    Word,
}

impl Width {
    /// Byte for even opcodes, word for odd, as in most of the opcode map.
    fn from_opcode(opcode: u8) -> Self {
        if opcode & 1 == 0 { Width::Byte } else { Width::Word }
    }

    fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xff,
            Width::Word => 0xffff,
        }
    }

    fn sign(self) -> u32 {
        match self {
            Width::Byte => 0x80,
            Width::Word => 0x8000,
        }
    }

    fn bytes(self) -> u16 {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Rep {
    /// `rep`/`repe`/`repz` (0xf3).
    Equal,
    /// `repne`/`repnz` (0xf2).
    NotEqual,
}

/// The r/m half of a ModR/M byte: a register index or a memory address.
#[derive(Debug, Copy, Clone)]
enum Operand {
    Reg(u8),
    Mem(Pointer),
}

#[derive(Debug, Copy, Clone)]
struct ModRm {
    reg: u8,
    rm: Operand,
}

impl ModRm {
    /// For instructions that only make sense with a memory operand.
    fn mem(&self, opcode: u8) -> Result<Pointer, Exception> {
        match self.rm {
            Operand::Mem(p) => Ok(p),
            Operand::Reg(_) => Err(Exception::Invalid(opcode)),
        }
    }
}

/// A CPU attached to an address space.
#[derive(Debug)]
pub struct Machine {
    pub regs: Registers,
    pub mem: AddressSpace,
    /// Segment override prefix of the current instruction.
    segment: Option<u16>,
    /// Repeat prefix of the current instruction.
    rep: Option<Rep>,
}

impl Machine {
    pub fn new(mem: AddressSpace) -> Self {
        Self {
            regs: Registers::default(),
            mem,
            segment: None,
            rep: None,
        }
    }

    /// Executes instructions until `hlt`, returning the number executed
    /// (including the `hlt`). If `max_steps` is given, gives up with
    /// `Stop::StepLimit` after that many instructions.
    pub fn run(&mut self, max_steps: Option<u64>) -> Result<u64, Stop> {
        let mut steps = 0;
        loop {
            if let Some(max_steps) = max_steps {
                if steps >= max_steps {
                    return Err(Stop::StepLimit { steps });
                }
            }
            steps += 1;
            if self.step()? == Flow::Halt {
                return Ok(steps);
            }
        }
    }

    /// Executes one instruction, including its prefixes.
    pub fn step(&mut self) -> Result<Flow, Stop> {
        let at = self.regs.cs_ip();
        self.segment = None;
        self.rep = None;
        trace!("{} {}", at, self.regs);
        self.execute().map_err(|exc| exc.at(at))
    }

    pub fn read_u8(&self, p: Pointer) -> Result<u8, Fault> {
        self.mem.read_u8(p.linear(), Access::Read)
    }

    pub fn read_u16(&self, p: Pointer) -> Result<u16, Fault> {
        Ok(u16::from_le_bytes([self.read_u8(p)?, self.read_u8(p.add(1))?]))
    }

    pub fn write_u8(&mut self, p: Pointer, v: u8) -> Result<(), Fault> {
        self.mem.write_u8(p.linear(), v)
    }

    pub fn write_u16(&mut self, p: Pointer, v: u16) -> Result<(), Fault> {
        let [lo, hi] = v.to_le_bytes();
        self.write_u8(p, lo)?;
        self.write_u8(p.add(1), hi)
    }

    fn read(&self, p: Pointer, w: Width) -> Result<u32, Fault> {
        match w {
            Width::Byte => self.read_u8(p).map(u32::from),
            Width::Word => self.read_u16(p).map(u32::from),
        }
    }

    fn write(&mut self, p: Pointer, w: Width, v: u32) -> Result<(), Fault> {
        match w {
            Width::Byte => self.write_u8(p, v as u8),
            Width::Word => self.write_u16(p, v as u16),
        }
    }

    fn fetch_u8(&mut self) -> Result<u8, Fault> {
        let v = self.mem.read_u8(self.regs.cs_ip().linear(), Access::Execute)?;
        self.regs.ip = self.regs.ip.wrapping_add(1);
        Ok(v)
    }

    fn fetch_u16(&mut self) -> Result<u16, Fault> {
        let lo = self.fetch_u8()?;
        let hi = self.fetch_u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    /// Fetches a sign-extended 8-bit immediate.
    fn fetch_i8(&mut self) -> Result<u16, Fault> {
        Ok(self.fetch_u8()? as i8 as u16)
    }

    fn fetch(&mut self, w: Width) -> Result<u32, Fault> {
        match w {
            Width::Byte => self.fetch_u8().map(u32::from),
            Width::Word => self.fetch_u16().map(u32::from),
        }
    }

    fn reg(&self, w: Width, index: u8) -> u32 {
        match w {
            Width::Byte => u32::from(self.regs.reg8(index)),
            Width::Word => u32::from(self.regs.reg16(index)),
        }
    }

    fn set_reg(&mut self, w: Width, index: u8, v: u32) {
        match w {
            Width::Byte => self.regs.set_reg8(index, v as u8),
            Width::Word => self.regs.set_reg16(index, v as u16),
        }
    }

    fn push(&mut self, v: u16) -> Result<(), Fault> {
        self.regs.sp = self.regs.sp.wrapping_sub(2);
        self.write_u16(Pointer::new(self.regs.ss, self.regs.sp), v)
    }

    fn pop(&mut self) -> Result<u16, Fault> {
        let v = self.read_u16(Pointer::new(self.regs.ss, self.regs.sp))?;
        self.regs.sp = self.regs.sp.wrapping_add(2);
        Ok(v)
    }

    /// The segment for a data access: the override prefix if any, else
    /// `default`.
    fn data_segment(&self, default: u16) -> u16 {
        self.segment.unwrap_or(default)
    }

    fn decode_modrm(&mut self) -> Result<ModRm, Fault> {
        let modrm = self.fetch_u8()?;
        let mode = modrm >> 6;
        let reg = (modrm >> 3) & 7;
        let rm = modrm & 7;
        if mode == 3 {
            return Ok(ModRm { reg, rm: Operand::Reg(rm) });
        }

        let r = &self.regs;
        let (base, bp_based) = match rm {
            0 => (r.bx.wrapping_add(r.si), false),
            1 => (r.bx.wrapping_add(r.di), false),
            2 => (r.bp.wrapping_add(r.si), true),
            3 => (r.bp.wrapping_add(r.di), true),
            4 => (r.si, false),
            5 => (r.di, false),
            6 if mode == 0 => (0, false),
            6 => (r.bp, true),
            _ => (r.bx, false),
        };
        let displacement = match (mode, rm) {
            (0, 6) | (2, _) => self.fetch_u16()?,
            (1, _) => self.fetch_i8()?,
            _ => 0,
        };
        let default = if bp_based { self.regs.ss } else { self.regs.ds };
        let segment = self.data_segment(default);
        Ok(ModRm { reg, rm: Operand::Mem(Pointer::new(segment, base.wrapping_add(displacement))) })
    }

    fn read_rm(&self, modrm: &ModRm, w: Width) -> Result<u32, Fault> {
        match modrm.rm {
            Operand::Reg(index) => Ok(self.reg(w, index)),
            Operand::Mem(p) => self.read(p, w),
        }
    }

    fn write_rm(&mut self, modrm: &ModRm, w: Width, v: u32) -> Result<(), Fault> {
        match modrm.rm {
            Operand::Reg(index) => {
                self.set_reg(w, index, v);
                Ok(())
            }
            Operand::Mem(p) => self.write(p, w, v),
        }
    }

    fn set_szp(&mut self, w: Width, r: u32) {
        self.regs.set_flag(Flags::ZF, r & w.mask() == 0);
        self.regs.set_flag(Flags::SF, r & w.sign() != 0);
        self.regs.set_flag(Flags::PF, (r as u8).count_ones() % 2 == 0);
    }

    fn add(&mut self, w: Width, a: u32, b: u32, carry: u32) -> u32 {
        let full = a + b + carry;
        let r = full & w.mask();
        self.regs.set_flag(Flags::CF, full > w.mask());
        self.regs.set_flag(Flags::OF, (a ^ r) & (b ^ r) & w.sign() != 0);
        self.regs.set_flag(Flags::AF, (a ^ b ^ r) & 0x10 != 0);
        self.set_szp(w, r);
        r
    }

    fn sub(&mut self, w: Width, a: u32, b: u32, borrow: u32) -> u32 {
        let r = a.wrapping_sub(b).wrapping_sub(borrow) & w.mask();
        self.regs.set_flag(Flags::CF, a < b + borrow);
        self.regs.set_flag(Flags::OF, (a ^ b) & (a ^ r) & w.sign() != 0);
        self.regs.set_flag(Flags::AF, (a ^ b ^ r) & 0x10 != 0);
        self.set_szp(w, r);
        r
    }

    fn logic(&mut self, w: Width, r: u32) -> u32 {
        self.regs.set_flag(Flags::CF, false);
        self.regs.set_flag(Flags::OF, false);
        self.regs.set_flag(Flags::AF, false);
        self.set_szp(w, r);
        r
    }

    /// The eight arithmetic operations selected by bits 3–5 of opcodes 0x00–0x3f
    /// and by the reg field of group 1: add or adc sbb and sub xor cmp.
    fn alu(&mut self, op: u8, w: Width, a: u32, b: u32) -> u32 {
        let carry = u32::from(self.regs.flag(Flags::CF));
        match op & 7 {
            0 => self.add(w, a, b, 0),
            1 => self.logic(w, a | b),
            2 => self.add(w, a, b, carry),
            3 => self.sub(w, a, b, carry),
            4 => self.logic(w, a & b),
            5 => self.sub(w, a, b, 0),
            6 => self.logic(w, a ^ b),
            _ => self.sub(w, a, b, 0),
        }
    }

    fn inc(&mut self, w: Width, a: u32) -> u32 {
        let cf = self.regs.flag(Flags::CF);
        let r = self.add(w, a, 1, 0);
        self.regs.set_flag(Flags::CF, cf);
        r
    }

    fn dec(&mut self, w: Width, a: u32) -> u32 {
        let cf = self.regs.flag(Flags::CF);
        let r = self.sub(w, a, 1, 0);
        self.regs.set_flag(Flags::CF, cf);
        r
    }

    /// Group 2: rol ror rcl rcr shl shr sal sar. The count is masked to 5
    /// bits, as on the 80186 and later.
    fn shift(&mut self, op: u8, w: Width, v: u32, count: u8) -> u32 {
        let count = count & 0x1f;
        if count == 0 {
            return v;
        }
        let msb = |x: u32| x & w.sign() != 0;
        let mut r = v;
        let mut cf = self.regs.flag(Flags::CF);
        let mut of = false;
        for _ in 0..count {
            match op & 7 {
                0 => {
                    cf = msb(r);
                    r = ((r << 1) | cf as u32) & w.mask();
                    of = msb(r) != cf;
                }
                1 => {
                    cf = r & 1 != 0;
                    r = (r >> 1) | if cf { w.sign() } else { 0 };
                    of = msb(r) != msb(r << 1);
                }
                2 => {
                    let out = msb(r);
                    r = ((r << 1) | cf as u32) & w.mask();
                    cf = out;
                    of = msb(r) != cf;
                }
                3 => {
                    let out = r & 1 != 0;
                    r = (r >> 1) | if cf { w.sign() } else { 0 };
                    cf = out;
                    of = msb(r) != msb(r << 1);
                }
                4 | 6 => {
                    cf = msb(r);
                    r = (r << 1) & w.mask();
                    of = msb(r) != cf;
                }
                5 => {
                    cf = r & 1 != 0;
                    of = msb(r);
                    r >>= 1;
                }
                _ => {
                    cf = r & 1 != 0;
                    of = false;
                    r = (r >> 1) | (r & w.sign());
                }
            }
        }
        self.regs.set_flag(Flags::CF, cf);
        self.regs.set_flag(Flags::OF, of);
        if op & 7 >= 4 {
            self.set_szp(w, r);
        }
        r
    }

    fn condition(&self, cc: u8) -> bool {
        let r = &self.regs;
        let sf_ne_of = r.flag(Flags::SF) != r.flag(Flags::OF);
        let holds = match (cc >> 1) & 7 {
            0 => r.flag(Flags::OF),
            1 => r.flag(Flags::CF),
            2 => r.flag(Flags::ZF),
            3 => r.flag(Flags::CF) || r.flag(Flags::ZF),
            4 => r.flag(Flags::SF),
            5 => r.flag(Flags::PF),
            6 => sf_ne_of,
            _ => r.flag(Flags::ZF) || sf_ne_of,
        };
        holds != (cc & 1 != 0)
    }

    fn jump_relative(&mut self, displacement: u16) {
        self.regs.ip = self.regs.ip.wrapping_add(displacement);
    }

    fn far_call(&mut self, target: Pointer) -> Result<(), Fault> {
        self.push(self.regs.cs)?;
        self.push(self.regs.ip)?;
        self.regs.cs = target.segment;
        self.regs.ip = target.offset;
        Ok(())
    }

    fn read_far_pointer(&self, p: Pointer) -> Result<Pointer, Fault> {
        let offset = self.read_u16(p)?;
        let segment = self.read_u16(p.add(2))?;
        Ok(Pointer::new(segment, offset))
    }

    fn execute(&mut self) -> Result<Flow, Exception> {
        let mut prefixes = 0;
        let opcode = loop {
            let byte = self.fetch_u8()?;
            match byte {
                0x26 | 0x2e | 0x36 | 0x3e => self.segment = Some(self.regs.sreg((byte >> 3) & 3)),
                0xf0 => (), // lock
                0xf2 => self.rep = Some(Rep::NotEqual),
                0xf3 => self.rep = Some(Rep::Equal),
                _ => break byte,
            }
            prefixes += 1;
            if prefixes > MAX_PREFIXES {
                return Err(Exception::Invalid(byte));
            }
        };

        match opcode {
            // add or adc sbb and sub xor cmp, in their six addressing forms.
            0x00..=0x3f if opcode & 7 < 6 => {
                let op = opcode >> 3;
                let w = Width::from_opcode(opcode);
                match opcode & 7 {
                    0 | 1 => {
                        let modrm = self.decode_modrm()?;
                        let a = self.read_rm(&modrm, w)?;
                        let b = self.reg(w, modrm.reg);
                        let r = self.alu(op, w, a, b);
                        if op != 7 {
                            self.write_rm(&modrm, w, r)?;
                        }
                    }
                    2 | 3 => {
                        let modrm = self.decode_modrm()?;
                        let a = self.reg(w, modrm.reg);
                        let b = self.read_rm(&modrm, w)?;
                        let r = self.alu(op, w, a, b);
                        if op != 7 {
                            self.set_reg(w, modrm.reg, r);
                        }
                    }
                    _ => {
                        let a = self.reg(w, 0);
                        let b = self.fetch(w)?;
                        let r = self.alu(op, w, a, b);
                        if op != 7 {
                            self.set_reg(w, 0, r);
                        }
                    }
                }
            }
            // push es/cs/ss/ds
            0x06 | 0x0e | 0x16 | 0x1e => self.push(self.regs.sreg(opcode >> 3))?,
            // pop es/ss/ds
            0x07 | 0x17 | 0x1f => {
                let v = self.pop()?;
                self.regs.set_sreg(opcode >> 3, v);
            }
            0x27 => self.daa(),
            0x2f => self.das(),
            0x37 => self.aaa(),
            0x3f => self.aas(),
            // inc r16
            0x40..=0x47 => {
                let v = self.reg(Width::Word, opcode);
                let r = self.inc(Width::Word, v);
                self.set_reg(Width::Word, opcode, r);
            }
            // dec r16
            0x48..=0x4f => {
                let v = self.reg(Width::Word, opcode);
                let r = self.dec(Width::Word, v);
                self.set_reg(Width::Word, opcode, r);
            }
            // push r16; push sp pushes the value from before the push.
            0x50..=0x57 => self.push(self.regs.reg16(opcode))?,
            // pop r16
            0x58..=0x5f => {
                let v = self.pop()?;
                self.regs.set_reg16(opcode, v);
            }
            // pusha
            0x60 => {
                let sp = self.regs.sp;
                for index in 0..8 {
                    let v = if index == 4 { sp } else { self.regs.reg16(index) };
                    self.push(v)?;
                }
            }
            // popa
            0x61 => {
                for index in (0..8).rev() {
                    let v = self.pop()?;
                    if index != 4 {
                        self.regs.set_reg16(index, v);
                    }
                }
            }
            // push imm16
            0x68 => {
                let v = self.fetch_u16()?;
                self.push(v)?;
            }
            // push imm8
            0x6a => {
                let v = self.fetch_i8()?;
                self.push(v)?;
            }
            // imul r16, r/m16, imm
            0x69 | 0x6b => {
                let modrm = self.decode_modrm()?;
                let a = self.read_rm(&modrm, Width::Word)? as u16;
                let b = if opcode == 0x69 { self.fetch_u16()? } else { self.fetch_i8()? };
                let r = i32::from(a as i16) * i32::from(b as i16);
                self.regs.set_reg16(modrm.reg, r as u16);
                let overflow = r != i32::from(r as i16);
                self.regs.set_flag(Flags::CF, overflow);
                self.regs.set_flag(Flags::OF, overflow);
            }
            // bound, and the port string instructions
            0x62 | 0x6c..=0x6f => return Err(Exception::Unsupported(opcode)),
            // 386 segment and size prefixes
            0x64..=0x67 => return Err(Exception::Unsupported(opcode)),
            // jcc rel8
            0x70..=0x7f => {
                let displacement = self.fetch_i8()?;
                if self.condition(opcode & 0x0f) {
                    self.jump_relative(displacement);
                }
            }
            // group 1: alu r/m, imm
            0x80..=0x83 => {
                let w = Width::from_opcode(opcode);
                let modrm = self.decode_modrm()?;
                let a = self.read_rm(&modrm, w)?;
                let b = match opcode {
                    0x81 => u32::from(self.fetch_u16()?),
                    0x83 => u32::from(self.fetch_i8()?),
                    _ => u32::from(self.fetch_u8()?),
                };
                let r = self.alu(modrm.reg, w, a, b);
                if modrm.reg != 7 {
                    self.write_rm(&modrm, w, r)?;
                }
            }
            // test r/m, reg
            0x84 | 0x85 => {
                let w = Width::from_opcode(opcode);
                let modrm = self.decode_modrm()?;
                let a = self.read_rm(&modrm, w)?;
                let b = self.reg(w, modrm.reg);
                self.logic(w, a & b);
            }
            // xchg r/m, reg
            0x86 | 0x87 => {
                let w = Width::from_opcode(opcode);
                let modrm = self.decode_modrm()?;
                let a = self.read_rm(&modrm, w)?;
                let b = self.reg(w, modrm.reg);
                self.write_rm(&modrm, w, b)?;
                self.set_reg(w, modrm.reg, a);
            }
            // mov r/m, reg
            0x88 | 0x89 => {
                let w = Width::from_opcode(opcode);
                let modrm = self.decode_modrm()?;
                let v = self.reg(w, modrm.reg);
                self.write_rm(&modrm, w, v)?;
            }
            // mov reg, r/m
            0x8a | 0x8b => {
                let w = Width::from_opcode(opcode);
                let modrm = self.decode_modrm()?;
                let v = self.read_rm(&modrm, w)?;
                self.set_reg(w, modrm.reg, v);
            }
            // mov r/m16, sreg
            0x8c => {
                let modrm = self.decode_modrm()?;
                let v = self.regs.sreg(modrm.reg);
                self.write_rm(&modrm, Width::Word, u32::from(v))?;
            }
            // lea
            0x8d => {
                let modrm = self.decode_modrm()?;
                let p = modrm.mem(opcode)?;
                self.regs.set_reg16(modrm.reg, p.offset);
            }
            // mov sreg, r/m16
            0x8e => {
                let modrm = self.decode_modrm()?;
                let v = self.read_rm(&modrm, Width::Word)?;
                self.regs.set_sreg(modrm.reg, v as u16);
            }
            // pop r/m16
            0x8f => {
                let modrm = self.decode_modrm()?;
                let v = self.pop()?;
                self.write_rm(&modrm, Width::Word, u32::from(v))?;
            }
            // nop
            0x90 => (),
            // xchg ax, r16
            0x91..=0x97 => {
                let v = self.regs.reg16(opcode);
                self.regs.set_reg16(opcode, self.regs.ax);
                self.regs.ax = v;
            }
            // cbw
            0x98 => self.regs.ax = self.regs.ax as u8 as i8 as u16,
            // cwd
            0x99 => self.regs.dx = if self.regs.ax & 0x8000 != 0 { 0xffff } else { 0 },
            // call far ptr16:16
            0x9a => {
                let offset = self.fetch_u16()?;
                let segment = self.fetch_u16()?;
                self.far_call(Pointer::new(segment, offset))?;
            }
            // wait
            0x9b => (),
            // pushf
            0x9c => self.push(self.regs.flags)?,
            // popf
            0x9d => {
                let v = self.pop()?;
                self.regs.load_flags(v);
            }
            // sahf
            0x9e => {
                let ah = self.regs.ax >> 8;
                self.regs.load_flags((self.regs.flags & 0xff00) | ah);
            }
            // lahf
            0x9f => self.regs.set_reg8(4, self.regs.flags as u8),
            // mov al/ax, moffs
            0xa0 | 0xa1 => {
                let w = Width::from_opcode(opcode);
                let offset = self.fetch_u16()?;
                let p = Pointer::new(self.data_segment(self.regs.ds), offset);
                let v = self.read(p, w)?;
                self.set_reg(w, 0, v);
            }
            // mov moffs, al/ax
            0xa2 | 0xa3 => {
                let w = Width::from_opcode(opcode);
                let offset = self.fetch_u16()?;
                let p = Pointer::new(self.data_segment(self.regs.ds), offset);
                let v = self.reg(w, 0);
                self.write(p, w, v)?;
            }
            // movs cmps stos lods scas
            0xa4..=0xa7 | 0xaa..=0xaf => self.string(opcode)?,
            // test al/ax, imm
            0xa8 | 0xa9 => {
                let w = Width::from_opcode(opcode);
                let a = self.reg(w, 0);
                let b = self.fetch(w)?;
                self.logic(w, a & b);
            }
            // mov r8, imm8
            0xb0..=0xb7 => {
                let v = self.fetch_u8()?;
                self.regs.set_reg8(opcode, v);
            }
            // mov r16, imm16
            0xb8..=0xbf => {
                let v = self.fetch_u16()?;
                self.regs.set_reg16(opcode, v);
            }
            // group 2 with an imm8 count
            0xc0 | 0xc1 => {
                let w = Width::from_opcode(opcode);
                let modrm = self.decode_modrm()?;
                let count = self.fetch_u8()?;
                self.group2(&modrm, w, count)?;
            }
            // ret imm16 / ret
            0xc2 | 0xc3 => {
                let release = if opcode == 0xc2 { self.fetch_u16()? } else { 0 };
                self.regs.ip = self.pop()?;
                self.regs.sp = self.regs.sp.wrapping_add(release);
            }
            // les / lds
            0xc4 | 0xc5 => {
                let modrm = self.decode_modrm()?;
                let p = self.read_far_pointer(modrm.mem(opcode)?)?;
                self.regs.set_reg16(modrm.reg, p.offset);
                if opcode == 0xc4 {
                    self.regs.es = p.segment;
                } else {
                    self.regs.ds = p.segment;
                }
            }
            // mov r/m, imm
            0xc6 | 0xc7 => {
                let w = Width::from_opcode(opcode);
                let modrm = self.decode_modrm()?;
                let v = self.fetch(w)?;
                self.write_rm(&modrm, w, v)?;
            }
            // enter imm16, imm8
            0xc8 => {
                let size = self.fetch_u16()?;
                let level = self.fetch_u8()? & 0x1f;
                self.push(self.regs.bp)?;
                let frame = self.regs.sp;
                if level > 0 {
                    for _ in 1..level {
                        self.regs.bp = self.regs.bp.wrapping_sub(2);
                        let v = self.read_u16(Pointer::new(self.regs.ss, self.regs.bp))?;
                        self.push(v)?;
                    }
                    self.push(frame)?;
                }
                self.regs.bp = frame;
                self.regs.sp = self.regs.sp.wrapping_sub(size);
            }
            // leave
            0xc9 => {
                self.regs.sp = self.regs.bp;
                self.regs.bp = self.pop()?;
            }
            // retf imm16 / retf
            0xca | 0xcb => {
                let release = if opcode == 0xca { self.fetch_u16()? } else { 0 };
                self.regs.ip = self.pop()?;
                self.regs.cs = self.pop()?;
                self.regs.sp = self.regs.sp.wrapping_add(release);
            }
            // int3
            0xcc => return Err(Exception::Interrupt(3)),
            // int imm8
            0xcd => {
                let vector = self.fetch_u8()?;
                return Err(Exception::Interrupt(vector));
            }
            // into
            0xce => {
                if self.regs.flag(Flags::OF) {
                    return Err(Exception::Interrupt(4));
                }
            }
            // iret
            0xcf => {
                self.regs.ip = self.pop()?;
                self.regs.cs = self.pop()?;
                let v = self.pop()?;
                self.regs.load_flags(v);
            }
            // group 2 by 1 / by cl
            0xd0..=0xd3 => {
                let w = Width::from_opcode(opcode);
                let modrm = self.decode_modrm()?;
                let count = if opcode < 0xd2 { 1 } else { self.regs.cx as u8 };
                self.group2(&modrm, w, count)?;
            }
            0xd4 => {
                let base = self.fetch_u8()?;
                self.aam(base)?;
            }
            0xd5 => {
                let base = self.fetch_u8()?;
                self.aad(base);
            }
            // salc
            0xd6 => {
                let v = if self.regs.flag(Flags::CF) { 0xff } else { 0x00 };
                self.regs.set_reg8(0, v);
            }
            // xlat
            0xd7 => {
                let offset = self.regs.bx.wrapping_add(self.regs.ax & 0xff);
                let p = Pointer::new(self.data_segment(self.regs.ds), offset);
                let v = self.read_u8(p)?;
                self.regs.set_reg8(0, v);
            }
            // FPU escapes
            0xd8..=0xdf => return Err(Exception::Unsupported(opcode)),
            // loopnz / loopz / loop
            0xe0..=0xe2 => {
                let displacement = self.fetch_i8()?;
                self.regs.cx = self.regs.cx.wrapping_sub(1);
                let taken = self.regs.cx != 0 && match opcode {
                    0xe0 => !self.regs.flag(Flags::ZF),
                    0xe1 => self.regs.flag(Flags::ZF),
                    _ => true,
                };
                if taken {
                    self.jump_relative(displacement);
                }
            }
            // jcxz
            0xe3 => {
                let displacement = self.fetch_i8()?;
                if self.regs.cx == 0 {
                    self.jump_relative(displacement);
                }
            }
            // in / out
            0xe4..=0xe7 | 0xec..=0xef => return Err(Exception::Unsupported(opcode)),
            // call rel16
            0xe8 => {
                let displacement = self.fetch_u16()?;
                self.push(self.regs.ip)?;
                self.jump_relative(displacement);
            }
            // jmp rel16
            0xe9 => {
                let displacement = self.fetch_u16()?;
                self.jump_relative(displacement);
            }
            // jmp far ptr16:16
            0xea => {
                let offset = self.fetch_u16()?;
                let segment = self.fetch_u16()?;
                self.regs.cs = segment;
                self.regs.ip = offset;
            }
            // jmp rel8
            0xeb => {
                let displacement = self.fetch_i8()?;
                self.jump_relative(displacement);
            }
            0xf4 => return Ok(Flow::Halt),
            0xf5 => {
                let cf = self.regs.flag(Flags::CF);
                self.regs.set_flag(Flags::CF, !cf);
            }
            0xf6 | 0xf7 => self.group3(Width::from_opcode(opcode))?,
            0xf8 => self.regs.set_flag(Flags::CF, false),
            0xf9 => self.regs.set_flag(Flags::CF, true),
            0xfa => self.regs.set_flag(Flags::IF, false),
            0xfb => self.regs.set_flag(Flags::IF, true),
            0xfc => self.regs.set_flag(Flags::DF, false),
            0xfd => self.regs.set_flag(Flags::DF, true),
            // group 4: inc/dec r/m8
            0xfe => {
                let modrm = self.decode_modrm()?;
                let v = self.read_rm(&modrm, Width::Byte)?;
                let r = match modrm.reg {
                    0 => self.inc(Width::Byte, v),
                    1 => self.dec(Width::Byte, v),
                    _ => return Err(Exception::Invalid(opcode)),
                };
                self.write_rm(&modrm, Width::Byte, r)?;
            }
            0xff => self.group5(opcode)?,
            // 0x0f (pop cs on the 8086, a two-byte escape later), 0x63, 0xf1
            _ => return Err(Exception::Invalid(opcode)),
        }
        Ok(Flow::Continue)
    }

    /// One iteration of a string instruction.
    fn string_once(&mut self, opcode: u8, w: Width, source: u16) -> Result<(), Fault> {
        let delta = if self.regs.flag(Flags::DF) { w.bytes().wrapping_neg() } else { w.bytes() };
        let src = Pointer::new(source, self.regs.si);
        let dst = Pointer::new(self.regs.es, self.regs.di);
        match opcode & 0xfe {
            0xa4 => {
                let v = self.read(src, w)?;
                self.write(dst, w, v)?;
            }
            0xa6 => {
                let a = self.read(src, w)?;
                let b = self.read(dst, w)?;
                self.sub(w, a, b, 0);
            }
            0xaa => {
                let v = self.reg(w, 0);
                self.write(dst, w, v)?;
            }
            0xac => {
                let v = self.read(src, w)?;
                self.set_reg(w, 0, v);
            }
            _ => {
                let a = self.reg(w, 0);
                let b = self.read(dst, w)?;
                self.sub(w, a, b, 0);
            }
        }
        if matches!(opcode & 0xfe, 0xa4 | 0xa6 | 0xac) {
            self.regs.si = self.regs.si.wrapping_add(delta);
        }
        if matches!(opcode & 0xfe, 0xa4 | 0xa6 | 0xaa | 0xae) {
            self.regs.di = self.regs.di.wrapping_add(delta);
        }
        Ok(())
    }

    fn string(&mut self, opcode: u8) -> Result<(), Fault> {
        let w = Width::from_opcode(opcode);
        let source = self.data_segment(self.regs.ds);
        let compares = matches!(opcode & 0xfe, 0xa6 | 0xae);
        let rep = match self.rep {
            Some(rep) => rep,
            None => return self.string_once(opcode, w, source),
        };
        while self.regs.cx != 0 {
            self.string_once(opcode, w, source)?;
            self.regs.cx = self.regs.cx.wrapping_sub(1);
            if compares && self.regs.flag(Flags::ZF) != (rep == Rep::Equal) {
                break;
            }
        }
        Ok(())
    }

    fn group2(&mut self, modrm: &ModRm, w: Width, count: u8) -> Result<(), Fault> {
        let v = self.read_rm(modrm, w)?;
        let r = self.shift(modrm.reg, w, v, count);
        self.write_rm(modrm, w, r)
    }

    /// Group 3: test not neg mul imul div idiv.
    fn group3(&mut self, w: Width) -> Result<(), Exception> {
        let modrm = self.decode_modrm()?;
        let v = self.read_rm(&modrm, w)?;
        match modrm.reg {
            0 | 1 => {
                let imm = self.fetch(w)?;
                self.logic(w, v & imm);
            }
            2 => self.write_rm(&modrm, w, !v & w.mask())?,
            3 => {
                let r = self.sub(w, 0, v, 0);
                self.write_rm(&modrm, w, r)?;
            }
            4 => {
                let high = match w {
                    Width::Byte => {
                        let r = (self.regs.ax & 0xff) * v as u16;
                        self.regs.ax = r;
                        r >> 8
                    }
                    Width::Word => {
                        let r = u32::from(self.regs.ax) * v;
                        self.regs.ax = r as u16;
                        self.regs.dx = (r >> 16) as u16;
                        self.regs.dx
                    }
                };
                self.regs.set_flag(Flags::CF, high != 0);
                self.regs.set_flag(Flags::OF, high != 0);
            }
            5 => {
                let overflow = match w {
                    Width::Byte => {
                        let r = i32::from(self.regs.ax as u8 as i8) * i32::from(v as u8 as i8);
                        self.regs.ax = r as u16;
                        r != i32::from(r as i8)
                    }
                    Width::Word => {
                        let r = i32::from(self.regs.ax as i16) * i32::from(v as u16 as i16);
                        self.regs.ax = r as u16;
                        self.regs.dx = (r >> 16) as u16;
                        r != i32::from(r as i16)
                    }
                };
                self.regs.set_flag(Flags::CF, overflow);
                self.regs.set_flag(Flags::OF, overflow);
            }
            6 => {
                if v == 0 {
                    return Err(Exception::Divide);
                }
                match w {
                    Width::Byte => {
                        let n = u32::from(self.regs.ax);
                        let q = n / v;
                        if q > 0xff {
                            return Err(Exception::Divide);
                        }
                        self.regs.ax = (((n % v) << 8) | q) as u16;
                    }
                    Width::Word => {
                        let n = (u32::from(self.regs.dx) << 16) | u32::from(self.regs.ax);
                        let q = n / v;
                        if q > 0xffff {
                            return Err(Exception::Divide);
                        }
                        self.regs.ax = q as u16;
                        self.regs.dx = (n % v) as u16;
                    }
                }
            }
            _ => {
                if v == 0 {
                    return Err(Exception::Divide);
                }
                match w {
                    Width::Byte => {
                        let n = i64::from(self.regs.ax as i16);
                        let d = i64::from(v as u8 as i8);
                        let q = n / d;
                        if q < i64::from(i8::MIN) || q > i64::from(i8::MAX) {
                            return Err(Exception::Divide);
                        }
                        self.regs.set_reg8(0, q as u8);
                        self.regs.set_reg8(4, (n % d) as u8);
                    }
                    Width::Word => {
                        let n = i64::from(((u32::from(self.regs.dx) << 16) | u32::from(self.regs.ax)) as i32);
                        let d = i64::from(v as u16 as i16);
                        let q = n / d;
                        if q < i64::from(i16::MIN) || q > i64::from(i16::MAX) {
                            return Err(Exception::Divide);
                        }
                        self.regs.ax = q as u16;
                        self.regs.dx = (n % d) as u16;
                    }
                }
            }
        }
        Ok(())
    }

    /// Group 5: inc dec call callf jmp jmpf push.
    fn group5(&mut self, opcode: u8) -> Result<(), Exception> {
        let modrm = self.decode_modrm()?;
        match modrm.reg {
            0 | 1 => {
                let v = self.read_rm(&modrm, Width::Word)?;
                let r = if modrm.reg == 0 { self.inc(Width::Word, v) } else { self.dec(Width::Word, v) };
                self.write_rm(&modrm, Width::Word, r)?;
            }
            2 => {
                let target = self.read_rm(&modrm, Width::Word)? as u16;
                self.push(self.regs.ip)?;
                self.regs.ip = target;
            }
            3 => {
                let target = self.read_far_pointer(modrm.mem(opcode)?)?;
                self.far_call(target)?;
            }
            4 => self.regs.ip = self.read_rm(&modrm, Width::Word)? as u16,
            5 => {
                let target = self.read_far_pointer(modrm.mem(opcode)?)?;
                self.regs.cs = target.segment;
                self.regs.ip = target.offset;
            }
            6 => {
                let v = self.read_rm(&modrm, Width::Word)? as u16;
                self.push(v)?;
            }
            _ => return Err(Exception::Invalid(opcode)),
        }
        Ok(())
    }

    fn daa(&mut self) {
        let al = self.regs.reg8(0);
        let cf = self.regs.flag(Flags::CF);
        let mut r = al;
        let mut carry = false;
        if al & 0x0f > 9 || self.regs.flag(Flags::AF) {
            let (sum, c) = r.overflowing_add(6);
            r = sum;
            carry = cf || c;
            self.regs.set_flag(Flags::AF, true);
        } else {
            self.regs.set_flag(Flags::AF, false);
        }
        if al > 0x99 || cf {
            r = r.wrapping_add(0x60);
            carry = true;
        }
        self.regs.set_flag(Flags::CF, carry);
        self.regs.set_reg8(0, r);
        self.set_szp(Width::Byte, u32::from(r));
    }

    fn das(&mut self) {
        let al = self.regs.reg8(0);
        let cf = self.regs.flag(Flags::CF);
        let mut r = al;
        let mut borrow = false;
        if al & 0x0f > 9 || self.regs.flag(Flags::AF) {
            let (diff, b) = r.overflowing_sub(6);
            r = diff;
            borrow = cf || b;
            self.regs.set_flag(Flags::AF, true);
        } else {
            self.regs.set_flag(Flags::AF, false);
        }
        if al > 0x99 || cf {
            r = r.wrapping_sub(0x60);
            borrow = true;
        }
        self.regs.set_flag(Flags::CF, borrow);
        self.regs.set_reg8(0, r);
        self.set_szp(Width::Byte, u32::from(r));
    }

    fn aaa(&mut self) {
        let adjust = self.regs.ax & 0x0f > 9 || self.regs.flag(Flags::AF);
        if adjust {
            self.regs.ax = self.regs.ax.wrapping_add(0x106);
        }
        self.regs.set_flag(Flags::AF, adjust);
        self.regs.set_flag(Flags::CF, adjust);
        self.regs.ax &= 0xff0f;
    }

    fn aas(&mut self) {
        let adjust = self.regs.ax & 0x0f > 9 || self.regs.flag(Flags::AF);
        if adjust {
            let al = self.regs.reg8(0).wrapping_sub(6);
            let ah = self.regs.reg8(4).wrapping_sub(1);
            self.regs.ax = (u16::from(ah) << 8) | u16::from(al);
        }
        self.regs.set_flag(Flags::AF, adjust);
        self.regs.set_flag(Flags::CF, adjust);
        self.regs.ax &= 0xff0f;
    }

    fn aam(&mut self, base: u8) -> Result<(), Exception> {
        if base == 0 {
            return Err(Exception::Divide);
        }
        let al = self.regs.reg8(0);
        self.regs.set_reg8(4, al / base);
        self.regs.set_reg8(0, al % base);
        self.set_szp(Width::Byte, u32::from(al % base));
        Ok(())
    }

    fn aad(&mut self, base: u8) {
        let al = self.regs.reg8(0).wrapping_add(self.regs.reg8(4).wrapping_mul(base));
        self.regs.ax = u16::from(al);
        self.set_szp(Width::Byte, u32::from(al));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Perm;

    /// A machine with 64 KB of memory at linear 0, `code` loaded at 0010:0000,
    /// and the stack at 0000:0100.
    fn machine(code: &[u8]) -> Machine {
        let mut mem = AddressSpace::new();
        let region = mem.alloc(0x10000);
        mem.region_mut(region)[0x100..0x100 + code.len()].copy_from_slice(code);
        mem.map(0, region, Perm::all()).unwrap();
        let mut m = Machine::new(mem);
        m.regs.cs = 0x0010;
        m.regs.sp = 0x0100;
        m
    }

    fn poke(m: &mut Machine, linear: u32, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            m.mem.write_u8(linear + i as u32, b).unwrap();
        }
    }

    fn run(m: &mut Machine) {
        m.run(Some(10_000)).unwrap();
    }

    fn run_code(code: &[u8]) -> Machine {
        let mut m = machine(code);
        run(&mut m);
        m
    }

    #[test]
    fn test_halt() {
        let mut m = machine(&[0x90, 0x90, 0xf4]);
        assert_eq!(m.run(None), Ok(3));
        assert_eq!(m.regs.cs_ip(), Pointer::new(0x0010, 0x0003));
    }

    #[test]
    fn test_add() {
        // mov ax, 0x1234; mov bx, 0x0f0f; add ax, bx
        let m = run_code(&[0xb8, 0x34, 0x12, 0xbb, 0x0f, 0x0f, 0x01, 0xd8, 0xf4]);
        assert_eq!(m.regs.ax, 0x2143);
        assert!(!m.regs.flag(Flags::CF));
        assert!(!m.regs.flag(Flags::ZF));

        // mov al, 0xff; add al, 1
        let m = run_code(&[0xb0, 0xff, 0x04, 0x01, 0xf4]);
        assert_eq!(m.regs.ax & 0xff, 0x00);
        assert!(m.regs.flag(Flags::CF));
        assert!(m.regs.flag(Flags::ZF));
        assert!(m.regs.flag(Flags::AF));
        assert!(!m.regs.flag(Flags::OF));

        // mov al, 0x7f; add al, 1
        let m = run_code(&[0xb0, 0x7f, 0x04, 0x01, 0xf4]);
        assert!(m.regs.flag(Flags::OF));
        assert!(m.regs.flag(Flags::SF));
        assert!(!m.regs.flag(Flags::CF));
    }

    #[test]
    fn test_sub_and_inc() {
        // mov ax, 0; sub ax, 1
        let m = run_code(&[0xb8, 0x00, 0x00, 0x2d, 0x01, 0x00, 0xf4]);
        assert_eq!(m.regs.ax, 0xffff);
        assert!(m.regs.flag(Flags::CF));
        assert!(m.regs.flag(Flags::SF));

        // stc; mov ax, 0xffff; inc ax: inc doesn't touch CF
        let m = run_code(&[0xf9, 0xb8, 0xff, 0xff, 0x40, 0xf4]);
        assert_eq!(m.regs.ax, 0);
        assert!(m.regs.flag(Flags::ZF));
        assert!(m.regs.flag(Flags::CF));
    }

    #[test]
    fn test_loop() {
        // mov cx, 5; xor ax, ax; l: add ax, 3; loop l
        let m = run_code(&[0xb9, 0x05, 0x00, 0x31, 0xc0, 0x05, 0x03, 0x00, 0xe2, 0xfb, 0xf4]);
        assert_eq!(m.regs.ax, 15);
        assert_eq!(m.regs.cx, 0);
    }

    #[test]
    fn test_rep_movsb() {
        // mov si, 0x200; mov di, 0x300; mov cx, 4; cld; rep movsb
        let mut m = machine(&[0xbe, 0x00, 0x02, 0xbf, 0x00, 0x03, 0xb9, 0x04, 0x00, 0xfc, 0xf3, 0xa4, 0xf4]);
        poke(&mut m, 0x200, &[1, 2, 3, 4, 5]);
        run(&mut m);
        let copied: Vec<u8> = (0..5).map(|i| m.read_u8(Pointer::new(0, 0x300 + i)).unwrap()).collect();
        assert_eq!(copied, vec![1, 2, 3, 4, 0]);
        assert_eq!((m.regs.si, m.regs.di, m.regs.cx), (0x204, 0x304, 0));
    }

    #[test]
    fn test_std_rep_stosw() {
        // mov ax, 0xbeef; mov di, 0x302; mov cx, 2; std; rep stosw
        let m = run_code(&[0xb8, 0xef, 0xbe, 0xbf, 0x02, 0x03, 0xb9, 0x02, 0x00, 0xfd, 0xf3, 0xab, 0xf4]);
        assert_eq!(m.read_u16(Pointer::new(0, 0x300)), Ok(0xbeef));
        assert_eq!(m.read_u16(Pointer::new(0, 0x302)), Ok(0xbeef));
        assert_eq!(m.regs.di, 0x2fe);
    }

    #[test]
    fn test_repne_scasb() {
        // mov di, 0x200; mov cx, 8; mov al, 0x33; cld; repne scasb
        let mut m = machine(&[0xbf, 0x00, 0x02, 0xb9, 0x08, 0x00, 0xb0, 0x33, 0xfc, 0xf2, 0xae, 0xf4]);
        poke(&mut m, 0x200, &[0x11, 0x22, 0x33, 0x44]);
        run(&mut m);
        assert_eq!(m.regs.di, 0x203);
        assert_eq!(m.regs.cx, 5);
        assert!(m.regs.flag(Flags::ZF));
    }

    #[test]
    fn test_call_ret() {
        // call f; hlt; f: mov ax, 7; ret
        let m = run_code(&[0xe8, 0x01, 0x00, 0xf4, 0xb8, 0x07, 0x00, 0xc3]);
        assert_eq!(m.regs.ax, 7);
        assert_eq!(m.regs.sp, 0x100);
        assert_eq!(m.regs.ip, 4);
    }

    #[test]
    fn test_retf() {
        // retf to 0000:0000, where there is a hlt.
        let mut m = machine(&[0xcb]);
        poke(&mut m, 0, &[0xf4]);
        m.regs.sp = 0xfc;
        run(&mut m);
        assert_eq!(m.regs.cs_ip(), Pointer::new(0, 1));
        assert_eq!(m.regs.sp, 0x100);
    }

    #[test]
    fn test_mul_div() {
        // mov ax, 0x1234; mov bx, 0x100; mul bx
        let m = run_code(&[0xb8, 0x34, 0x12, 0xbb, 0x00, 0x01, 0xf7, 0xe3, 0xf4]);
        assert_eq!((m.regs.dx, m.regs.ax), (0x0012, 0x3400));
        assert!(m.regs.flag(Flags::CF) && m.regs.flag(Flags::OF));

        // mov dx, 0; mov ax, 100; mov cx, 7; div cx
        let m = run_code(&[0xba, 0x00, 0x00, 0xb8, 0x64, 0x00, 0xb9, 0x07, 0x00, 0xf7, 0xf1, 0xf4]);
        assert_eq!((m.regs.ax, m.regs.dx), (14, 2));

        // mov ax, -7; cwd; mov cx, 2; idiv cx
        let m = run_code(&[0xb8, 0xf9, 0xff, 0x99, 0xb9, 0x02, 0x00, 0xf7, 0xf9, 0xf4]);
        assert_eq!((m.regs.ax, m.regs.dx), (0xfffd, 0xffff));
    }

    #[test]
    fn test_divide_error() {
        // xor cx, cx; div cx
        let mut m = machine(&[0x31, 0xc9, 0xf7, 0xf1, 0xf4]);
        assert_eq!(m.run(None), Err(Stop::DivideError { at: Pointer::new(0x0010, 0x0002) }));
    }

    #[test]
    fn test_shifts() {
        // mov al, 0x81; shl al, 1
        let m = run_code(&[0xb0, 0x81, 0xd0, 0xe0, 0xf4]);
        assert_eq!(m.regs.ax & 0xff, 0x02);
        assert!(m.regs.flag(Flags::CF));
        assert!(m.regs.flag(Flags::OF));

        // mov ax, 0x8000; mov cl, 3; sar ax, cl
        let m = run_code(&[0xb8, 0x00, 0x80, 0xb1, 0x03, 0xd3, 0xf8, 0xf4]);
        assert_eq!(m.regs.ax, 0xf000);
        assert!(!m.regs.flag(Flags::CF));

        // stc; mov al, 0x80; rcl al, 1
        let m = run_code(&[0xf9, 0xb0, 0x80, 0xd0, 0xd0, 0xf4]);
        assert_eq!(m.regs.ax & 0xff, 0x01);
        assert!(m.regs.flag(Flags::CF));

        // mov ax, 1; shl ax, 4 (80186 form)
        let m = run_code(&[0xb8, 0x01, 0x00, 0xc1, 0xe0, 0x04, 0xf4]);
        assert_eq!(m.regs.ax, 0x10);
    }

    #[test]
    fn test_addressing() {
        // mov bp, 0x10; mov byte [bp+2], 0x5a: bp-based addressing uses ss
        let mut m = machine(&[0xbd, 0x10, 0x00, 0xc6, 0x46, 0x02, 0x5a, 0xf4]);
        m.regs.ss = 0x0030;
        m.regs.sp = 0x0100;
        run(&mut m);
        assert_eq!(m.mem.read_u8(0x312, Access::Read), Ok(0x5a));

        // mov al, es:[0x0004]
        let mut m = machine(&[0x26, 0xa0, 0x04, 0x00, 0xf4]);
        m.regs.es = 0x0020;
        poke(&mut m, 0x204, &[0x77]);
        run(&mut m);
        assert_eq!(m.regs.ax & 0xff, 0x77);

        // lds si, [0x200]
        let mut m = machine(&[0xc5, 0x36, 0x00, 0x02, 0xf4]);
        poke(&mut m, 0x200, &[0x34, 0x12, 0x78, 0x56]);
        run(&mut m);
        assert_eq!((m.regs.si, m.regs.ds), (0x1234, 0x5678));
    }

    #[test]
    fn test_stack_ops() {
        // push -1 (imm8); pop ax
        let m = run_code(&[0x6a, 0xff, 0x58, 0xf4]);
        assert_eq!(m.regs.ax, 0xffff);
        assert_eq!(m.regs.sp, 0x100);

        // mov si, 0x1234; pusha; xor si, si; popa
        let m = run_code(&[0xbe, 0x34, 0x12, 0x60, 0x31, 0xf6, 0x61, 0xf4]);
        assert_eq!(m.regs.si, 0x1234);
        assert_eq!(m.regs.sp, 0x100);
    }

    #[test]
    fn test_popf() {
        // Only the defined flag bits are loaded; bit 1 stays set.
        let m = run_code(&[0xb8, 0xff, 0xff, 0x50, 0x9d, 0xf4]);
        assert_eq!(m.regs.flags, 0x0fd7);
        assert!(m.regs.flag(Flags::TF) && m.regs.flag(Flags::OF) && m.regs.flag(Flags::DF));

        let m = run_code(&[0x31, 0xc0, 0x50, 0x9d, 0xf4]);
        assert_eq!(m.regs.flags, 0x0002);
        assert!(!m.regs.flag(Flags::all()));
    }

    #[test]
    fn test_daa() {
        // mov al, 0x19; add al, 0x28; daa
        let m = run_code(&[0xb0, 0x19, 0x04, 0x28, 0x27, 0xf4]);
        assert_eq!(m.regs.ax & 0xff, 0x47);
        assert!(!m.regs.flag(Flags::CF));
    }

    #[test]
    fn test_fault() {
        // jmp 5000:0000, which is not mapped
        let mut m = machine(&[0xea, 0x00, 0x00, 0x00, 0x50]);
        assert_eq!(m.run(None), Err(Stop::Fault {
            at: Pointer::new(0x5000, 0x0000),
            fault: Fault { address: 0x50000, access: Access::Execute },
        }));
    }

    #[test]
    fn test_invalid_and_unsupported() {
        let mut m = machine(&[0x90, 0x0f, 0x01]);
        assert_eq!(m.run(None), Err(Stop::InvalidOpcode { at: Pointer::new(0x0010, 0x0001), opcode: 0x0f }));
        let mut m = machine(&[0xcd, 0x21]);
        assert_eq!(m.run(None), Err(Stop::Interrupt { at: Pointer::new(0x0010, 0x0000), vector: 0x21 }));
        let mut m = machine(&[0xe4, 0x60]);
        assert_eq!(m.run(None), Err(Stop::Unsupported { at: Pointer::new(0x0010, 0x0000), opcode: 0xe4 }));
    }

    #[test]
    fn test_step_limit() {
        // jmp $
        let mut m = machine(&[0xeb, 0xfe]);
        assert_eq!(m.run(Some(100)), Err(Stop::StepLimit { steps: 100 }));
        assert_eq!(m.regs.ip, 0);
    }
}
