use core::mem::offset_of;

use crate::mem::GuestPhysAddr;

/// Number of general-purpose registers (`x0` to `x30`).
pub const GPR_COUNT: usize = 31;

/// Register index that encodes the zero register in instruction syndromes.
pub const ZERO_REGISTER: usize = 31;

/// The register state of a virtual CPU, as exchanged with the kernel.
///
/// This record lives in memory shared between the kernel and the monitor. The kernel writes it on
/// every guest exit and reloads it on every resume, so its layout is a binary contract: fields must
/// keep their offsets (checked at compile time below).
///
/// The contents are only meaningful between a reported exit and the next resume; [`crate::VCpu`]
/// refuses access at any other time.
#[repr(C)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VCpuRegisters {
    /// General-purpose registers `x0` to `x30`.
    pub gpr: [u64; GPR_COUNT],
    /// Stack pointer of the guest's current exception level.
    pub sp: u64,
    /// Instruction pointer (`ELR_EL2` on exit).
    pub ip: u64,
    /// Saved program status (`SPSR_EL2` on exit).
    pub pstate: u64,
    /// Exception syndrome (`ESR_EL2`) of the last exit.
    pub esr_el2: u64,
    /// Faulting virtual address (`FAR_EL2`) of the last exit.
    pub far_el2: u64,
    /// Faulting IPA page (`HPFAR_EL2`) of the last exit.
    pub hpfar_el2: u64,
}

const _: () = {
    assert!(offset_of!(VCpuRegisters, gpr) == 0x000);
    assert!(offset_of!(VCpuRegisters, sp) == 0x0f8);
    assert!(offset_of!(VCpuRegisters, ip) == 0x100);
    assert!(offset_of!(VCpuRegisters, pstate) == 0x108);
    assert!(offset_of!(VCpuRegisters, esr_el2) == 0x110);
    assert!(offset_of!(VCpuRegisters, far_el2) == 0x118);
    assert!(offset_of!(VCpuRegisters, hpfar_el2) == 0x120);
    assert!(core::mem::size_of::<VCpuRegisters>() == 0x128);
};

impl VCpuRegisters {
    /// Reads general-purpose register `reg`; index 31 reads as zero.
    pub fn gpr(&self, reg: usize) -> u64 {
        self.gpr.get(reg).copied().unwrap_or(0)
    }

    /// Writes general-purpose register `reg`; writes to index 31 are discarded.
    pub fn set_gpr(&mut self, reg: usize, val: u64) {
        if let Some(slot) = self.gpr.get_mut(reg) {
            *slot = val;
        }
    }

    /// The guest physical address of the last stage-2 fault.
    ///
    /// `HPFAR_EL2` holds bits `[47:12]` of the IPA in its bits `[39:4]`; the page offset comes from
    /// `FAR_EL2`.
    pub fn fault_ipa(&self) -> GuestPhysAddr {
        let page = (self.hpfar_el2 & 0x0000_00ff_ffff_fff0) << 8;
        GuestPhysAddr::from((page | (self.far_el2 & 0xfff)) as usize)
    }
}
