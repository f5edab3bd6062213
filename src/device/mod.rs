//! The emulated device model.
//!
//! Every device is an [`MmioDevice`]: an address window holding a bank of [`Register`]s over some
//! device state. The set of device kinds is closed and dispatched through [`Device`].

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};
use spin::Mutex;

use crate::mem::{AccessWidth, GuestPhysAddrRange};

mod directory;
mod register;
pub mod uart;
pub mod virtio;

pub use directory::{DeviceDirectory, DeviceId};
pub use register::{ReadHook, Register, RegisterAccess, WriteHook};
pub use uart::Pl011;
pub use virtio::VirtioTransport;

/// Interrupt line levels changed by devices but not yet forwarded to the guest.
#[derive(Default)]
pub struct PendingIrqs {
    levels: Mutex<BTreeMap<u32, bool>>,
}

impl PendingIrqs {
    /// Takes every line whose level changed since the last drain, with its latest level.
    pub fn drain(&self) -> Vec<(u32, bool)> {
        core::mem::take(&mut *self.levels.lock()).into_iter().collect()
    }

    /// Whether any level change is waiting to be forwarded.
    pub fn is_empty(&self) -> bool {
        self.levels.lock().is_empty()
    }
}

/// A device's connection to one guest interrupt line.
#[derive(Clone)]
pub struct IrqLine {
    irq: u32,
    asserted: bool,
    pending: Arc<PendingIrqs>,
}

impl IrqLine {
    /// Connects to line `irq`, reporting level changes into `pending`.
    pub fn new(irq: u32, pending: Arc<PendingIrqs>) -> Self {
        Self {
            irq,
            asserted: false,
            pending,
        }
    }

    /// The line number.
    pub const fn irq(&self) -> u32 {
        self.irq
    }

    /// Whether the device currently drives the line high.
    pub const fn is_asserted(&self) -> bool {
        self.asserted
    }

    /// Drives the line to `asserted`. Setting the current level again is not reported.
    pub fn set_level(&mut self, asserted: bool) {
        if self.asserted != asserted {
            self.asserted = asserted;
            trace!("irq {} -> {}", self.irq, asserted);
            self.pending.levels.lock().insert(self.irq, asserted);
        }
    }
}

/// An address-range-bound bank of registers over device state `S`.
pub struct MmioDevice<S> {
    name: &'static str,
    range: GuestPhysAddrRange,
    registers: Vec<Register<S>>,
    state: S,
}

impl<S> MmioDevice<S> {
    /// Creates a device covering `range`.
    ///
    /// Fails if a register lies outside the window or two registers overlap.
    pub fn new(
        name: &'static str,
        range: GuestPhysAddrRange,
        state: S,
        mut registers: Vec<Register<S>>,
    ) -> AxResult<Self> {
        registers.sort_by_key(|reg| reg.offset());
        for (i, reg) in registers.iter().enumerate() {
            if reg.range().end > range.size() {
                return ax_err!(
                    InvalidInput,
                    format!("{}: register {:?} outside the device window", name, reg)
                );
            }
            if let Some(next) = registers.get(i + 1) {
                if reg.range().overlaps(next.range()) {
                    return ax_err!(
                        AlreadyExists,
                        format!("{}: registers {} and {} overlap", name, reg.name(), next.name())
                    );
                }
            }
        }
        Ok(Self {
            name,
            range,
            registers,
            state,
        })
    }

    /// The device's name on the board.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// The guest physical window of the device.
    pub const fn range(&self) -> GuestPhysAddrRange {
        self.range
    }

    /// The state the register hooks operate on.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Mutable access to the device state, for backends acting between exits.
    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    fn register_index(&self, offset: usize) -> Option<usize> {
        let idx = self
            .registers
            .partition_point(|reg| reg.offset() <= offset)
            .checked_sub(1)?;
        self.registers[idx].range().contains(offset).then_some(idx)
    }

    /// The register containing device-local `offset`.
    pub fn register_at(&self, offset: usize) -> Option<&Register<S>> {
        self.register_index(offset).map(|idx| &self.registers[idx])
    }

    /// Emulates one guest access at device-local `offset`.
    ///
    /// Returns the value read, or `None` for a write. An access narrower than its register, or
    /// not aligned to it, touches only the addressed bytes; bytes past the end of the register are
    /// dropped on write and read as zero.
    pub fn handle_access(
        &mut self,
        offset: usize,
        width: AccessWidth,
        is_write: bool,
        value: u64,
    ) -> AxResult<Option<u64>> {
        let Some(idx) = self.register_index(offset) else {
            return ax_err!(
                NotFound,
                format!("{}: no register at offset {:#x}", self.name, offset)
            );
        };
        let reg = &mut self.registers[idx];
        let lane = offset - reg.offset();
        if lane != 0 || width != reg.width() {
            debug!(
                "{}: {:?} access to {} ({:?}) at lane {}",
                self.name,
                width,
                reg.name(),
                reg.width(),
                lane
            );
        }
        if is_write {
            trace!("{}: {} <- {:#x}", self.name, reg.name(), value);
            reg.write_lane(&mut self.state, lane, width, value);
            Ok(None)
        } else {
            let value = reg.read_lane(&self.state, lane, width);
            trace!("{}: {} -> {:#x}", self.name, reg.name(), value);
            Ok(Some(value))
        }
    }
}

/// Every kind of device the monitor can place in guest physical space.
pub enum Device {
    /// A PL011-style UART console.
    Uart(Pl011),
    /// A virtio-mmio transport.
    Virtio(VirtioTransport),
}

impl Device {
    /// The device's name on the board.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uart(dev) => dev.mmio().name(),
            Self::Virtio(dev) => dev.mmio().name(),
        }
    }

    /// The guest physical window of the device.
    pub fn range(&self) -> GuestPhysAddrRange {
        match self {
            Self::Uart(dev) => dev.mmio().range(),
            Self::Virtio(dev) => dev.mmio().range(),
        }
    }

    /// Emulates one guest access at device-local `offset`, see [`MmioDevice::handle_access`].
    pub fn handle_access(
        &mut self,
        offset: usize,
        width: AccessWidth,
        is_write: bool,
        value: u64,
    ) -> AxResult<Option<u64>> {
        match self {
            Self::Uart(dev) => dev.handle_access(offset, width, is_write, value),
            Self::Virtio(dev) => dev.handle_access(offset, width, is_write, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::GuestPhysAddr;
    use alloc::vec;

    #[derive(Default)]
    struct Counter {
        writes: u64,
        last: u64,
    }

    fn counter_device() -> MmioDevice<Counter> {
        let range = GuestPhysAddrRange::from_start_size(GuestPhysAddr::from(0x1000), 0x1000);
        MmioDevice::new(
            "counter",
            range,
            Counter::default(),
            vec![
                Register::new("Scratch", 0x70, AccessWidth::Dword),
                Register::constant("Id", 0x00, AccessWidth::Dword, 0x1234_5678),
                Register::new("Count", 0x08, AccessWidth::Qword)
                    .on_read(|s: &Counter| s.writes)
                    .on_write(|s: &mut Counter, v| {
                        s.writes += 1;
                        s.last = v;
                    }),
            ],
        )
        .unwrap()
    }

    #[test]
    fn offset_resolves_to_containing_register() {
        let dev = counter_device();
        let fault = GuestPhysAddr::from(0x1070);
        let offset = fault.as_usize() - dev.range().start.as_usize();
        assert_eq!(dev.register_at(offset).unwrap().name(), "Scratch");
        assert_eq!(dev.register_at(0x0a).unwrap().name(), "Count");
        assert!(dev.register_at(0x04).is_none());
        assert!(dev.register_at(0x74).is_none());
    }

    #[test]
    fn stored_and_hooked_registers() {
        let mut dev = counter_device();
        dev.handle_access(0x70, AccessWidth::Dword, true, 0xcafe).unwrap();
        assert_eq!(
            dev.handle_access(0x70, AccessWidth::Dword, false, 0).unwrap(),
            Some(0xcafe)
        );
        dev.handle_access(0x08, AccessWidth::Qword, true, 7).unwrap();
        dev.handle_access(0x08, AccessWidth::Qword, true, 9).unwrap();
        assert_eq!(dev.state().last, 9);
        assert_eq!(
            dev.handle_access(0x08, AccessWidth::Qword, false, 0).unwrap(),
            Some(2)
        );
    }

    #[test]
    fn read_only_register_ignores_writes() {
        let mut dev = counter_device();
        dev.handle_access(0x00, AccessWidth::Dword, true, 0).unwrap();
        assert_eq!(
            dev.handle_access(0x00, AccessWidth::Dword, false, 0).unwrap(),
            Some(0x1234_5678)
        );
    }

    #[test]
    fn narrow_accesses_use_byte_lanes() {
        let mut dev = counter_device();
        dev.handle_access(0x70, AccessWidth::Dword, true, 0x4433_2211).unwrap();
        assert_eq!(
            dev.handle_access(0x72, AccessWidth::Byte, false, 0).unwrap(),
            Some(0x33)
        );
        dev.handle_access(0x71, AccessWidth::Byte, true, 0xaa).unwrap();
        assert_eq!(
            dev.handle_access(0x70, AccessWidth::Dword, false, 0).unwrap(),
            Some(0x4433_aa11)
        );
        // Wider than the register: truncated to it.
        dev.handle_access(0x70, AccessWidth::Qword, true, 0x1_0000_0001).unwrap();
        assert_eq!(
            dev.handle_access(0x70, AccessWidth::Qword, false, 0).unwrap(),
            Some(1)
        );
    }

    #[test]
    fn unmapped_offset_is_an_error() {
        let mut dev = counter_device();
        assert!(dev.handle_access(0x40, AccessWidth::Dword, false, 0).is_err());
    }

    #[test]
    fn overlapping_registers_are_rejected() {
        let range = GuestPhysAddrRange::from_start_size(GuestPhysAddr::from(0), 0x100);
        let result = MmioDevice::new(
            "bad",
            range,
            (),
            vec![
                Register::new("A", 0x00, AccessWidth::Qword),
                Register::new("B", 0x04, AccessWidth::Dword),
            ],
        );
        assert!(result.is_err());
        let result = MmioDevice::new(
            "bad",
            range,
            (),
            vec![Register::new("C", 0xfc, AccessWidth::Qword)],
        );
        assert!(result.is_err());
    }

    #[test]
    fn irq_levels_are_coalesced() {
        let pending = Arc::new(PendingIrqs::default());
        let mut line = IrqLine::new(48, pending.clone());
        line.set_level(true);
        line.set_level(true);
        assert_eq!(pending.drain(), vec![(48, true)]);
        assert!(pending.is_empty());
        line.set_level(true);
        assert!(pending.is_empty());
        line.set_level(false);
        assert_eq!(pending.drain(), vec![(48, false)]);
    }
}
