use core::fmt;

use axerrno::{ax_err, ax_err_type, AxError, AxResult};
use memory_addr::{def_usize_addr, def_usize_addr_formatter, AddrRange};

def_usize_addr! {
    /// Guest physical address, as seen by the guest before stage-2 translation.
    pub type GuestPhysAddr;
}

def_usize_addr_formatter! {
    GuestPhysAddr = "GPA:{}";
}

/// A range of guest physical addresses.
pub type GuestPhysAddrRange = AddrRange<GuestPhysAddr>;

/// A range of offsets local to a device's MMIO window.
pub type OffsetRange = AddrRange<usize>;

/// The width of a single MMIO access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessWidth {
    /// 8-bit access.
    Byte,
    /// 16-bit access.
    Word,
    /// 32-bit access.
    Dword,
    /// 64-bit access.
    Qword,
}

impl AccessWidth {
    /// Decodes the `SAS` field of a data abort syndrome (log2 of the access size).
    pub const fn from_sas(sas: u64) -> Self {
        match sas & 0b11 {
            0 => Self::Byte,
            1 => Self::Word,
            2 => Self::Dword,
            _ => Self::Qword,
        }
    }

    /// Size of the access in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
            Self::Qword => 8,
        }
    }

    /// Size of the access in bits.
    pub const fn bits(self) -> u32 {
        self.size() as u32 * 8
    }

    /// A mask covering exactly the bits of this width.
    pub const fn mask(self) -> u64 {
        match self {
            Self::Qword => u64::MAX,
            _ => (1u64 << self.bits()) - 1,
        }
    }

    /// Sign-extends `value`, interpreted as a number of this width, to 64 bits.
    pub const fn sign_extend(self, value: u64) -> u64 {
        let shift = 64 - self.bits();
        (((value << shift) as i64) >> shift) as u64
    }
}

impl TryFrom<usize> for AccessWidth {
    type Error = AxError;

    fn try_from(size: usize) -> AxResult<Self> {
        match size {
            1 => Ok(Self::Byte),
            2 => Ok(Self::Word),
            4 => Ok(Self::Dword),
            8 => Ok(Self::Qword),
            _ => Err(ax_err_type!(
                InvalidInput,
                format!("{size} is not a valid access size")
            )),
        }
    }
}

impl From<AccessWidth> for usize {
    fn from(width: AccessWidth) -> usize {
        width.size()
    }
}

/// A slice of guest physical address space, either RAM or an MMIO window.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// First guest physical address of the region.
    pub base: GuestPhysAddr,
    /// Size of the region in bytes.
    pub size: usize,
}

impl MemoryRegion {
    /// Creates a region of `size` bytes starting at `base`.
    pub const fn new(base: GuestPhysAddr, size: usize) -> Self {
        Self { base, size }
    }

    /// The guest physical range `[base, base + size)` covered by the region.
    ///
    /// Returns `None` if the region wraps around the address space.
    pub fn range(&self) -> Option<GuestPhysAddrRange> {
        let end = self.base.as_usize().checked_add(self.size)?;
        Some(GuestPhysAddrRange {
            start: self.base,
            end: GuestPhysAddr::from(end),
        })
    }

    /// Whether the two regions share at least one byte.
    pub fn overlaps(&self, other: &MemoryRegion) -> bool {
        match (self.range(), other.range()) {
            (Some(a), Some(b)) => a.overlaps(b),
            _ => true,
        }
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:#x}, {:#x})",
            self.base.as_usize(),
            self.base.as_usize().wrapping_add(self.size)
        )
    }
}

/// A monitor-side view of guest RAM backed by memory the session owns.
pub struct GuestMemory<'a> {
    region: MemoryRegion,
    backing: &'a mut [u8],
}

impl<'a> GuestMemory<'a> {
    /// Wraps `backing` as the RAM placed at `base` in guest physical space.
    pub fn new(base: GuestPhysAddr, backing: &'a mut [u8]) -> Self {
        Self {
            region: MemoryRegion::new(base, backing.len()),
            backing,
        }
    }

    /// The region of guest physical space this RAM occupies.
    pub fn region(&self) -> MemoryRegion {
        self.region
    }

    /// The guest physical address of byte `offset` of the RAM.
    pub fn gpa_of(&self, offset: usize) -> GuestPhysAddr {
        self.region.base + offset
    }

    /// Copies `image` verbatim to `offset` bytes into RAM.
    pub fn load(&mut self, offset: usize, image: &[u8]) -> AxResult {
        let end = match offset.checked_add(image.len()) {
            Some(end) if end <= self.backing.len() => end,
            _ => {
                return ax_err!(
                    InvalidInput,
                    format!(
                        "image of {:#x} bytes at offset {:#x} exceeds guest RAM {:?}",
                        image.len(),
                        offset,
                        self.region
                    )
                )
            }
        };
        self.backing[offset..end].copy_from_slice(image);
        Ok(())
    }

    /// Reads `len` bytes starting at guest physical address `gpa`.
    pub fn read(&self, gpa: GuestPhysAddr, len: usize) -> AxResult<&[u8]> {
        let start = gpa
            .as_usize()
            .checked_sub(self.region.base.as_usize())
            .ok_or(AxError::BadAddress)?;
        let end = start.checked_add(len).ok_or(AxError::BadAddress)?;
        self.backing.get(start..end).ok_or(AxError::BadAddress)
    }
}
