use crate::mem::AccessWidth;

/// `ESR_EL2.EC` values the monitor understands.
mod ec {
    pub const HVC64: u64 = 0x16;
    pub const SMC64: u64 = 0x17;
    pub const DATA_ABORT_LOWER: u64 = 0x24;
}

const ESR_EC_SHIFT: u64 = 26;
const ESR_EC_MASK: u64 = 0x3f;
const ESR_ISS_MASK: u64 = 0x01ff_ffff;

const ISS_ISV: u64 = 1 << 24;
const ISS_SAS_SHIFT: u64 = 22;
const ISS_SSE: u64 = 1 << 21;
const ISS_SRT_SHIFT: u64 = 16;
const ISS_SRT_MASK: u64 = 0x1f;
const ISS_SF: u64 = 1 << 15;
const ISS_WNR: u64 = 1 << 6;

/// The instruction a hypercall was issued with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HypercallConduit {
    /// `HVC`: the saved instruction pointer already points past the instruction.
    Hvc,
    /// `SMC` trapped to EL2: the saved instruction pointer points at the instruction.
    Smc,
}

impl HypercallConduit {
    /// How far the instruction pointer must advance to resume after the call.
    pub const fn resume_offset(self) -> u64 {
        match self {
            Self::Hvc => 0,
            Self::Smc => 4,
        }
    }
}

/// The decoded syndrome of a trapped MMIO access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmioAccess {
    /// The width of the access.
    pub width: AccessWidth,
    /// The index of the general-purpose register transferring the data (31 is the zero register).
    pub reg: usize,
    /// Whether a loaded value must be sign-extended into the register.
    pub sign_extend: bool,
    /// Whether the destination register is 64 bits wide (`X`) rather than 32 (`W`).
    pub reg_is_64bit: bool,
}

/// Why the virtual CPU last exited to the monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultReason {
    /// The guest loaded from an address stage-2 translation does not map.
    DataAbortRead(MmioAccess),
    /// The guest stored to an address stage-2 translation does not map.
    DataAbortWrite(MmioAccess),
    /// The guest issued a hypercall.
    Hypercall {
        /// The instruction used for the call.
        conduit: HypercallConduit,
        /// The immediate encoded in the instruction.
        imm: u16,
    },
    /// Anything the monitor cannot emulate, including data aborts without a valid syndrome.
    Unknown {
        /// The raw exception syndrome.
        syndrome: u64,
    },
}

impl FaultReason {
    /// Classifies an exit from its `ESR_EL2` value.
    pub fn from_syndrome(esr: u64) -> Self {
        let iss = esr & ESR_ISS_MASK;
        match (esr >> ESR_EC_SHIFT) & ESR_EC_MASK {
            ec::DATA_ABORT_LOWER if iss & ISS_ISV != 0 => {
                let access = MmioAccess {
                    width: AccessWidth::from_sas(iss >> ISS_SAS_SHIFT),
                    reg: ((iss >> ISS_SRT_SHIFT) & ISS_SRT_MASK) as usize,
                    sign_extend: iss & ISS_SSE != 0,
                    reg_is_64bit: iss & ISS_SF != 0,
                };
                if iss & ISS_WNR != 0 {
                    Self::DataAbortWrite(access)
                } else {
                    Self::DataAbortRead(access)
                }
            }
            ec::HVC64 => Self::Hypercall {
                conduit: HypercallConduit::Hvc,
                imm: iss as u16,
            },
            ec::SMC64 => Self::Hypercall {
                conduit: HypercallConduit::Smc,
                imm: iss as u16,
            },
            _ => Self::Unknown { syndrome: esr },
        }
    }

    /// Whether this exit is a data abort the monitor can emulate.
    pub const fn is_data_abort(&self) -> bool {
        matches!(self, Self::DataAbortRead(_) | Self::DataAbortWrite(_))
    }
}

/// Builds `ESR_EL2` values for synthetic exits.
#[cfg(test)]
pub(crate) mod syndrome {
    use super::*;

    pub fn data_abort(write: bool, width: AccessWidth, reg: usize) -> u64 {
        let sas = width.size().trailing_zeros() as u64;
        (ec::DATA_ABORT_LOWER << ESR_EC_SHIFT)
            | ISS_ISV
            | (sas << ISS_SAS_SHIFT)
            | ((reg as u64 & ISS_SRT_MASK) << ISS_SRT_SHIFT)
            | ISS_SF
            | if write { ISS_WNR } else { 0 }
    }

    pub fn hvc(imm: u16) -> u64 {
        (ec::HVC64 << ESR_EC_SHIFT) | imm as u64
    }

    pub fn smc(imm: u16) -> u64 {
        (ec::SMC64 << ESR_EC_SHIFT) | imm as u64
    }
}
