//! The emulated real-mode address space.
//!
//! Memory is an arena of byte regions. A page table maps each 4 KB page of the
//! linear address space either to nothing or to a page-sized window into one
//! of the regions, along with access permissions. The CPU only ever sees
//! linear addresses; segment:offset translation happens in `Pointer::linear`.

use std::fmt;

use bitflags::bitflags;

/// Granularity of the page table.
pub const PAGE_SIZE: usize = 0x1000;

/// The largest linear address reachable from segment:offset, plus one
/// (`ffff:ffff` is 0x10ffef).
pub const ADDRESS_LIMIT: usize = 0x110000;

bitflags! {
    /// Access permissions of a page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Perm: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const EXECUTE = 0x04;
        /// A page without `VALID` faults on every access, whatever its other bits.
        const VALID = 0x08;
    }
}

/// Kinds of memory access.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    fn required(&self) -> Perm {
        match self {
            Access::Read => Perm::READ | Perm::VALID,
            Access::Write => Perm::WRITE | Perm::VALID,
            Access::Execute => Perm::EXECUTE | Perm::VALID,
        }
    }
}

/// An access to an unmapped address or without permission.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub address: u32,
    pub access: Access,
}

impl std::error::Error for Fault {}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let what = match self.access {
            Access::Read => "read from",
            Access::Write => "write to",
            Access::Execute => "execute at",
        };
        write!(f, "memory fault: {} linear address {:#07x}", what, self.address)
    }
}

/// A mapping request that cannot be satisfied. These come from the fixed
/// memory layout, never from input data.
#[derive(Debug, Clone, PartialEq)]
pub enum MapError {
    /// The base address is not a multiple of `PAGE_SIZE`.
    UnalignedBase { base: u32 },
    /// The region length is not a multiple of `PAGE_SIZE`.
    UnalignedLength { len: usize },
    /// The mapping would extend past `ADDRESS_LIMIT`.
    OutOfRange { base: u32, len: usize },
    /// A page in the range is already mapped.
    Overlap { address: u32 },
}

impl std::error::Error for MapError {}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MapError::UnalignedBase { base } =>
                write!(f, "base address {:#07x} is not page-aligned", base),
            MapError::UnalignedLength { len } =>
                write!(f, "region length {:#x} is not page-aligned", len),
            MapError::OutOfRange { base, len } =>
                write!(f, "region of {:#x} bytes at {:#07x} lies outside the address space", len, base),
            MapError::Overlap { address } =>
                write!(f, "page at {:#07x} is already mapped", address),
        }
    }
}

/// Index of a region in an `AddressSpace`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegionId(usize);

#[derive(Debug, Copy, Clone)]
struct PageEntry {
    region: RegionId,
    offset: usize,
    perm: Perm,
}

#[derive(Debug)]
pub struct AddressSpace {
    regions: Vec<Vec<u8>>,
    pages: Vec<Option<PageEntry>>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            pages: vec![None; ADDRESS_LIMIT / PAGE_SIZE],
        }
    }

    /// Allocates a zero-filled region of `len` bytes. The region is not
    /// visible to the CPU until it is mapped.
    pub fn alloc(&mut self, len: usize) -> RegionId {
        self.regions.push(vec![0; len]);
        RegionId(self.regions.len() - 1)
    }

    pub fn region(&self, id: RegionId) -> &[u8] {
        &self.regions[id.0]
    }

    pub fn region_mut(&mut self, id: RegionId) -> &mut [u8] {
        &mut self.regions[id.0]
    }

    /// Maps the whole of region `id` at linear address `base` with permissions
    /// `perm`.
    pub fn map(&mut self, base: u32, id: RegionId, perm: Perm) -> Result<(), MapError> {
        let len = self.regions[id.0].len();
        if base as usize % PAGE_SIZE != 0 {
            return Err(MapError::UnalignedBase { base });
        }
        if len % PAGE_SIZE != 0 {
            return Err(MapError::UnalignedLength { len });
        }
        let first = base as usize / PAGE_SIZE;
        let count = len / PAGE_SIZE;
        if first + count > self.pages.len() {
            return Err(MapError::OutOfRange { base, len });
        }
        if let Some(i) = (first..first + count).find(|&i| self.pages[i].is_some()) {
            return Err(MapError::Overlap { address: (i * PAGE_SIZE) as u32 });
        }
        for i in 0..count {
            self.pages[first + i] = Some(PageEntry {
                region: id,
                offset: i * PAGE_SIZE,
                perm,
            });
        }
        Ok(())
    }

    /// Finds the region and offset backing `address`, checking permissions.
    fn translate(&self, address: u32, access: Access) -> Result<(RegionId, usize), Fault> {
        let fault = Fault { address, access };
        let index = address as usize / PAGE_SIZE;
        match self.pages.get(index) {
            Some(Some(entry)) if entry.perm.contains(access.required()) =>
                Ok((entry.region, entry.offset + address as usize % PAGE_SIZE)),
            _ => Err(fault),
        }
    }

    pub fn read_u8(&self, address: u32, access: Access) -> Result<u8, Fault> {
        let (id, offset) = self.translate(address, access)?;
        Ok(self.regions[id.0][offset])
    }

    pub fn write_u8(&mut self, address: u32, value: u8) -> Result<(), Fault> {
        let (id, offset) = self.translate(address, Access::Write)?;
        self.regions[id.0][offset] = value;
        Ok(())
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}
