//! The virtio-mmio transport (version 2 register layout).
//!
//! The transport negotiates features and records queue placement for the guest driver. It does
//! not process queues itself: notifications are collected for a device backend, which signals
//! completion through [`VirtioTransport::raise_interrupt`].

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};
use bitflags::bitflags;

use super::{IrqLine, MmioDevice, PendingIrqs, Register, RegisterAccess};
use crate::mem::{AccessWidth, GuestPhysAddrRange};

/// "virt" in little endian.
pub const VIRTIO_MMIO_MAGIC: u64 = 0x7472_6976;
/// The non-legacy register layout.
pub const VIRTIO_MMIO_VERSION: u64 = 2;
/// "QEMU" in little endian.
pub const VIRTIO_VENDOR_ID: u32 = 0x554d_4551;
/// The feature bit every non-legacy device offers.
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

/// Register offsets of the virtio-mmio window.
pub mod offset {
    pub const MAGIC_VALUE: usize = 0x000;
    pub const VERSION: usize = 0x004;
    pub const DEVICE_ID: usize = 0x008;
    pub const VENDOR_ID: usize = 0x00c;
    pub const DEVICE_FEATURES: usize = 0x010;
    pub const DEVICE_FEATURES_SEL: usize = 0x014;
    pub const DRIVER_FEATURES: usize = 0x020;
    pub const DRIVER_FEATURES_SEL: usize = 0x024;
    pub const QUEUE_SEL: usize = 0x030;
    /// Read-only maximum queue size; the writable queue size lives at [`QUEUE_NUM`] as in
    /// virtio-mmio version 2, not at this offset.
    pub const QUEUE_NUM_MAX: usize = 0x034;
    pub const QUEUE_NUM: usize = 0x038;
    pub const QUEUE_READY: usize = 0x044;
    pub const QUEUE_NOTIFY: usize = 0x050;
    pub const INTERRUPT_STATUS: usize = 0x060;
    pub const INTERRUPT_ACK: usize = 0x064;
    pub const STATUS: usize = 0x070;
    pub const QUEUE_DESC_LOW: usize = 0x080;
    pub const QUEUE_DESC_HIGH: usize = 0x084;
    pub const QUEUE_DRIVER_LOW: usize = 0x090;
    pub const QUEUE_DRIVER_HIGH: usize = 0x094;
    pub const QUEUE_DEVICE_LOW: usize = 0x0a0;
    pub const QUEUE_DEVICE_HIGH: usize = 0x0a4;
    pub const CONFIG_GENERATION: usize = 0x0fc;
    pub const CONFIG: usize = 0x100;
}

bitflags! {
    /// Bits of the device status byte.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
        const DEVICE_NEEDS_RESET = 0x40;
        const FAILED = 0x80;
    }

    /// Bits of the interrupt status register.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InterruptStatus: u32 {
        const USED_BUFFER = 1;
        const CONFIG_CHANGE = 2;
    }
}

/// How far the driver has come in initializing the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum StatusPhase {
    Reset,
    Acknowledge,
    Driver,
    FeaturesOk,
    DriverOk,
    Failed,
}

impl From<DeviceStatus> for StatusPhase {
    fn from(status: DeviceStatus) -> Self {
        if status.contains(DeviceStatus::FAILED) {
            Self::Failed
        } else if status.contains(DeviceStatus::DRIVER_OK) {
            Self::DriverOk
        } else if status.contains(DeviceStatus::FEATURES_OK) {
            Self::FeaturesOk
        } else if status.contains(DeviceStatus::DRIVER) {
            Self::Driver
        } else if status.contains(DeviceStatus::ACKNOWLEDGE) {
            Self::Acknowledge
        } else {
            Self::Reset
        }
    }
}

impl StatusPhase {
    /// Whether going from `self` to `next` follows the initialization sequence: one step forward,
    /// staying put, a reset, or failing from any started phase.
    pub fn is_expected_transition(self, next: StatusPhase) -> bool {
        match next {
            Self::Reset => true,
            Self::Failed => self != Self::Reset,
            _ if next == self => true,
            _ => (next as u8) == (self as u8) + 1,
        }
    }
}

/// Static parameters of a virtio-mmio device.
#[derive(Clone, Debug)]
pub struct VirtioDeviceConfig {
    /// The virtio device type (1 net, 2 block, 3 console...).
    pub device_id: u32,
    pub vendor_id: u32,
    /// The feature bitmap offered to the driver.
    pub features: u64,
    /// Number of virtqueues.
    pub queue_count: usize,
    /// Largest size the driver may configure for a queue.
    pub queue_num_max: u32,
    /// Device-specific configuration space, exposed from offset `0x100`.
    pub config_space: Vec<u8>,
}

impl Default for VirtioDeviceConfig {
    fn default() -> Self {
        Self {
            device_id: 3,
            vendor_id: VIRTIO_VENDOR_ID,
            features: VIRTIO_F_VERSION_1,
            queue_count: 2,
            queue_num_max: 256,
            config_space: Vec::new(),
        }
    }
}

/// Placement and readiness of one virtqueue, as configured by the driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VirtQueue {
    pub size: u32,
    pub ready: bool,
    /// Guest physical address of the descriptor table.
    pub desc: u64,
    /// Guest physical address of the available ring.
    pub driver: u64,
    /// Guest physical address of the used ring.
    pub device: u64,
}

/// The state behind the virtio-mmio registers.
pub struct VirtioState {
    device_id: u32,
    vendor_id: u32,
    device_features: u64,
    device_features_sel: u32,
    driver_features: u64,
    driver_features_sel: u32,
    queue_sel: u32,
    queue_num_max: u32,
    queues: Vec<VirtQueue>,
    interrupt_status: InterruptStatus,
    status: u8,
    config_generation: u32,
    notifications: VecDeque<u32>,
    irq: IrqLine,
}

fn set_low(field: &mut u64, v: u64) {
    *field = (*field & !0xffff_ffff) | (v & 0xffff_ffff);
}

fn set_high(field: &mut u64, v: u64) {
    *field = (*field & 0xffff_ffff) | (v << 32);
}

fn high(field: u64) -> u64 {
    field >> 32
}

impl VirtioState {
    fn queue(&self) -> Option<&VirtQueue> {
        self.queues.get(self.queue_sel as usize)
    }

    fn queue_mut(&mut self) -> Option<&mut VirtQueue> {
        self.queues.get_mut(self.queue_sel as usize)
    }

    fn queue_field(&self, f: fn(&VirtQueue) -> u64) -> u64 {
        self.queue().map_or(0, f)
    }

    fn set_queue_field(&mut self, f: impl FnOnce(&mut VirtQueue)) {
        match self.queue_mut() {
            Some(queue) => f(queue),
            None => warn!("virtio: queue {} does not exist", self.queue_sel),
        }
    }

    fn device_features_word(&self) -> u64 {
        match self.device_features_sel {
            0 => self.device_features & 0xffff_ffff,
            1 => high(self.device_features),
            _ => 0,
        }
    }

    fn write_driver_features(&mut self, v: u64) {
        match self.driver_features_sel {
            0 => set_low(&mut self.driver_features, v),
            1 => set_high(&mut self.driver_features, v),
            sel => warn!("virtio: driver features word {} does not exist", sel),
        }
    }

    fn write_status(&mut self, v: u64) {
        let next = v as u8;
        let from = StatusPhase::from(DeviceStatus::from_bits_retain(self.status));
        let to = StatusPhase::from(DeviceStatus::from_bits_retain(next));
        if !from.is_expected_transition(to) {
            warn!(
                "virtio: unexpected status transition {:#x} ({:?}) -> {:#x} ({:?})",
                self.status, from, next, to
            );
        }
        if to == StatusPhase::FeaturesOk && self.driver_features & !self.device_features != 0 {
            warn!(
                "virtio: driver accepted features {:#x} not offered ({:#x})",
                self.driver_features, self.device_features
            );
        }
        if next == 0 {
            self.reset();
        }
        self.status = next;
        debug!("virtio: status {:#x} ({:?})", next, to);
    }

    fn reset(&mut self) {
        self.device_features_sel = 0;
        self.driver_features = 0;
        self.driver_features_sel = 0;
        self.queue_sel = 0;
        self.queues.iter_mut().for_each(|q| *q = VirtQueue::default());
        self.interrupt_status = InterruptStatus::empty();
        self.notifications.clear();
        self.irq.set_level(false);
    }

    fn notify(&mut self, queue: u64) {
        let queue = queue as u32;
        match self.queues.get(queue as usize) {
            Some(q) if q.ready => {
                trace!("virtio: queue {} notified", queue);
                self.notifications.push_back(queue);
            }
            _ => warn!("virtio: notification for queue {} which is not ready", queue),
        }
    }

    fn acknowledge(&mut self, v: u64) {
        self.interrupt_status &= !InterruptStatus::from_bits_truncate(v as u32);
        self.irq.set_level(!self.interrupt_status.is_empty());
    }
}

/// A virtio-mmio transport.
pub struct VirtioTransport {
    mmio: MmioDevice<VirtioState>,
}

impl VirtioTransport {
    /// Creates a transport covering `range` and raising guest interrupt `irq`.
    ///
    /// The window must include the configuration space: `0x100` bytes plus its size.
    pub fn new(
        name: &'static str,
        range: GuestPhysAddrRange,
        irq: u32,
        pending: Arc<PendingIrqs>,
        config: &VirtioDeviceConfig,
    ) -> AxResult<Self> {
        use offset::*;

        if config.queue_count == 0 {
            return ax_err!(InvalidInput, format!("{}: a virtio device needs a queue", name));
        }
        let state = VirtioState {
            device_id: config.device_id,
            vendor_id: config.vendor_id,
            device_features: config.features,
            device_features_sel: 0,
            driver_features: 0,
            driver_features_sel: 0,
            queue_sel: 0,
            queue_num_max: config.queue_num_max,
            queues: vec![VirtQueue::default(); config.queue_count],
            interrupt_status: InterruptStatus::empty(),
            status: 0,
            config_generation: 0,
            notifications: VecDeque::new(),
            irq: IrqLine::new(irq, pending),
        };

        let mut registers = vec![
            Register::constant("MagicValue", MAGIC_VALUE, AccessWidth::Dword, VIRTIO_MMIO_MAGIC),
            Register::constant("Version", VERSION, AccessWidth::Dword, VIRTIO_MMIO_VERSION),
            Register::new("DeviceID", DEVICE_ID, AccessWidth::Dword)
                .with_access(RegisterAccess::ReadOnly)
                .on_read(|s: &VirtioState| s.device_id as u64),
            Register::new("VendorID", VENDOR_ID, AccessWidth::Dword)
                .with_access(RegisterAccess::ReadOnly)
                .on_read(|s: &VirtioState| s.vendor_id as u64),
            Register::new("DeviceFeatures", DEVICE_FEATURES, AccessWidth::Dword)
                .with_access(RegisterAccess::ReadOnly)
                .on_read(VirtioState::device_features_word),
            Register::new("DeviceFeaturesSel", DEVICE_FEATURES_SEL, AccessWidth::Dword)
                .on_read(|s: &VirtioState| s.device_features_sel as u64)
                .on_write(|s: &mut VirtioState, v| s.device_features_sel = v as u32),
            Register::new("DriverFeatures", DRIVER_FEATURES, AccessWidth::Dword)
                .with_access(RegisterAccess::WriteOnly)
                .on_write(VirtioState::write_driver_features),
            Register::new("DriverFeaturesSel", DRIVER_FEATURES_SEL, AccessWidth::Dword)
                .on_read(|s: &VirtioState| s.driver_features_sel as u64)
                .on_write(|s: &mut VirtioState, v| s.driver_features_sel = v as u32),
            Register::new("QueueSel", QUEUE_SEL, AccessWidth::Dword)
                .on_read(|s: &VirtioState| s.queue_sel as u64)
                .on_write(|s: &mut VirtioState, v| s.queue_sel = v as u32),
            Register::new("QueueNumMax", QUEUE_NUM_MAX, AccessWidth::Dword)
                .with_access(RegisterAccess::ReadOnly)
                .on_read(|s: &VirtioState| match s.queue() {
                    Some(_) => s.queue_num_max as u64,
                    None => 0,
                }),
            Register::new("QueueNum", QUEUE_NUM, AccessWidth::Dword)
                .on_read(|s: &VirtioState| s.queue_field(|q| q.size as u64))
                .on_write(|s: &mut VirtioState, v| {
                    if v > s.queue_num_max as u64 {
                        warn!("virtio: queue size {} exceeds {}", v, s.queue_num_max);
                        return;
                    }
                    s.set_queue_field(|q| q.size = v as u32)
                }),
            Register::new("QueueReady", QUEUE_READY, AccessWidth::Dword)
                .on_read(|s: &VirtioState| s.queue_field(|q| q.ready as u64))
                .on_write(|s: &mut VirtioState, v| s.set_queue_field(|q| q.ready = v & 1 != 0)),
            Register::new("QueueNotify", QUEUE_NOTIFY, AccessWidth::Dword)
                .with_access(RegisterAccess::WriteOnly)
                .on_write(VirtioState::notify),
            Register::new("InterruptStatus", INTERRUPT_STATUS, AccessWidth::Dword)
                .with_access(RegisterAccess::ReadOnly)
                .on_read(|s: &VirtioState| s.interrupt_status.bits() as u64),
            Register::new("InterruptACK", INTERRUPT_ACK, AccessWidth::Dword)
                .with_access(RegisterAccess::WriteOnly)
                .on_write(VirtioState::acknowledge),
            Register::new("Status", STATUS, AccessWidth::Dword)
                .on_read(|s: &VirtioState| s.status as u64)
                .on_write(VirtioState::write_status),
            Register::new("QueueDescLow", QUEUE_DESC_LOW, AccessWidth::Dword)
                .on_read(|s: &VirtioState| s.queue_field(|q| q.desc & 0xffff_ffff))
                .on_write(|s: &mut VirtioState, v| s.set_queue_field(|q| set_low(&mut q.desc, v))),
            Register::new("QueueDescHigh", QUEUE_DESC_HIGH, AccessWidth::Dword)
                .on_read(|s: &VirtioState| s.queue_field(|q| high(q.desc)))
                .on_write(|s: &mut VirtioState, v| s.set_queue_field(|q| set_high(&mut q.desc, v))),
            Register::new("QueueDriverLow", QUEUE_DRIVER_LOW, AccessWidth::Dword)
                .on_read(|s: &VirtioState| s.queue_field(|q| q.driver & 0xffff_ffff))
                .on_write(|s: &mut VirtioState, v| {
                    s.set_queue_field(|q| set_low(&mut q.driver, v))
                }),
            Register::new("QueueDriverHigh", QUEUE_DRIVER_HIGH, AccessWidth::Dword)
                .on_read(|s: &VirtioState| s.queue_field(|q| high(q.driver)))
                .on_write(|s: &mut VirtioState, v| {
                    s.set_queue_field(|q| set_high(&mut q.driver, v))
                }),
            Register::new("QueueDeviceLow", QUEUE_DEVICE_LOW, AccessWidth::Dword)
                .on_read(|s: &VirtioState| s.queue_field(|q| q.device & 0xffff_ffff))
                .on_write(|s: &mut VirtioState, v| {
                    s.set_queue_field(|q| set_low(&mut q.device, v))
                }),
            Register::new("QueueDeviceHigh", QUEUE_DEVICE_HIGH, AccessWidth::Dword)
                .on_read(|s: &VirtioState| s.queue_field(|q| high(q.device)))
                .on_write(|s: &mut VirtioState, v| {
                    s.set_queue_field(|q| set_high(&mut q.device, v))
                }),
            Register::new("ConfigGeneration", CONFIG_GENERATION, AccessWidth::Dword)
                .with_access(RegisterAccess::ReadOnly)
                .on_read(|s: &VirtioState| s.config_generation as u64),
        ];
        for (i, chunk) in config.config_space.chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            registers.push(
                Register::new("Config", CONFIG + i * 4, AccessWidth::Dword)
                    .with_value(u32::from_le_bytes(word) as u64),
            );
        }

        Ok(Self {
            mmio: MmioDevice::new(name, range, state, registers)?,
        })
    }

    /// The register bank behind the transport.
    pub fn mmio(&self) -> &MmioDevice<VirtioState> {
        &self.mmio
    }

    /// Emulates one guest access, see [`MmioDevice::handle_access`].
    pub fn handle_access(
        &mut self,
        offset: usize,
        width: AccessWidth,
        is_write: bool,
        value: u64,
    ) -> AxResult<Option<u64>> {
        self.mmio.handle_access(offset, width, is_write, value)
    }

    /// The status byte last written by the driver.
    pub fn status(&self) -> u8 {
        self.mmio.state().status
    }

    /// The initialization phase the status byte describes.
    pub fn phase(&self) -> StatusPhase {
        DeviceStatus::from_bits_retain(self.status()).into()
    }

    /// The feature bits the driver wrote.
    pub fn driver_features(&self) -> u64 {
        self.mmio.state().driver_features
    }

    /// The feature bits both sides agreed on.
    pub fn negotiated_features(&self) -> u64 {
        let state = self.mmio.state();
        state.driver_features & state.device_features
    }

    /// Queue `idx` as configured by the driver.
    pub fn queue(&self, idx: usize) -> Option<&VirtQueue> {
        self.mmio.state().queues.get(idx)
    }

    /// Takes the queue indices the driver notified, oldest first.
    pub fn take_notifications(&mut self) -> Vec<u32> {
        self.mmio.state_mut().notifications.drain(..).collect()
    }

    /// Sets interrupt status bits and asserts the interrupt line.
    pub fn raise_interrupt(&mut self, cause: InterruptStatus) {
        let state = self.mmio.state_mut();
        if cause.contains(InterruptStatus::CONFIG_CHANGE) {
            state.config_generation = state.config_generation.wrapping_add(1);
        }
        state.interrupt_status |= cause;
        state.irq.set_level(!state.interrupt_status.is_empty());
    }

    /// Whether the transport currently drives its interrupt line.
    pub fn irq_asserted(&self) -> bool {
        self.mmio.state().irq.is_asserted()
    }
}

#[cfg(test)]
mod tests {
    use super::offset::*;
    use super::*;
    use crate::mem::GuestPhysAddr;
    use test_case::test_case;

    const FEATURES: u64 = VIRTIO_F_VERSION_1 | 0b101;

    fn transport() -> (VirtioTransport, Arc<PendingIrqs>) {
        let pending = Arc::new(PendingIrqs::default());
        let range = GuestPhysAddrRange::from_start_size(GuestPhysAddr::from(0x0a00_0000), 0x200);
        let config = VirtioDeviceConfig {
            features: FEATURES,
            config_space: vec![0x50, 0x00, 0x19, 0x00, 0x01],
            ..Default::default()
        };
        (
            VirtioTransport::new("virtio", range, 48, pending.clone(), &config).unwrap(),
            pending,
        )
    }

    fn read(dev: &mut VirtioTransport, offset: usize) -> u64 {
        dev.handle_access(offset, AccessWidth::Dword, false, 0)
            .unwrap()
            .unwrap()
    }

    fn write(dev: &mut VirtioTransport, offset: usize, value: u64) {
        assert_eq!(
            dev.handle_access(offset, AccessWidth::Dword, true, value).unwrap(),
            None
        );
    }

    #[test]
    fn identification_registers() {
        let (mut dev, _) = transport();
        assert_eq!(read(&mut dev, MAGIC_VALUE), VIRTIO_MMIO_MAGIC);
        assert_eq!(read(&mut dev, VERSION), 2);
        assert_eq!(read(&mut dev, DEVICE_ID), 3);
        assert_eq!(read(&mut dev, VENDOR_ID), VIRTIO_VENDOR_ID as u64);
        write(&mut dev, MAGIC_VALUE, 0);
        assert_eq!(read(&mut dev, MAGIC_VALUE), VIRTIO_MMIO_MAGIC);
    }

    #[test]
    fn status_round_trip() {
        let (mut dev, _) = transport();
        for status in [0x00, 0x01, 0x03, 0x08, 0x04] {
            write(&mut dev, STATUS, status);
            assert_eq!(read(&mut dev, STATUS), status);
        }
    }

    #[test]
    fn status_keeps_unexpected_transitions() {
        let (mut dev, _) = transport();
        write(&mut dev, STATUS, 0x04);
        assert_eq!(read(&mut dev, STATUS), 0x04);
        assert_eq!(dev.phase(), StatusPhase::DriverOk);
        write(&mut dev, STATUS, 0x81);
        assert_eq!(dev.status(), 0x81);
        assert_eq!(dev.phase(), StatusPhase::Failed);
    }

    #[test_case(StatusPhase::Reset, StatusPhase::Acknowledge, true)]
    #[test_case(StatusPhase::Acknowledge, StatusPhase::Driver, true)]
    #[test_case(StatusPhase::Driver, StatusPhase::FeaturesOk, true)]
    #[test_case(StatusPhase::FeaturesOk, StatusPhase::DriverOk, true)]
    #[test_case(StatusPhase::DriverOk, StatusPhase::Reset, true)]
    #[test_case(StatusPhase::Driver, StatusPhase::Failed, true)]
    #[test_case(StatusPhase::Reset, StatusPhase::Failed, false)]
    #[test_case(StatusPhase::Reset, StatusPhase::DriverOk, false)]
    #[test_case(StatusPhase::FeaturesOk, StatusPhase::Driver, false)]
    fn status_transitions(from: StatusPhase, to: StatusPhase, expected: bool) {
        assert_eq!(from.is_expected_transition(to), expected);
    }

    #[test]
    fn device_features_ignore_driver_writes() {
        let (mut dev, _) = transport();
        write(&mut dev, STATUS, 0x01);
        write(&mut dev, STATUS, 0x03);
        write(&mut dev, DRIVER_FEATURES_SEL, 0);
        write(&mut dev, DRIVER_FEATURES, 0xffff_ffff);
        write(&mut dev, DRIVER_FEATURES_SEL, 1);
        write(&mut dev, DRIVER_FEATURES, 0x1);

        write(&mut dev, DEVICE_FEATURES_SEL, 0);
        assert_eq!(read(&mut dev, DEVICE_FEATURES), FEATURES & 0xffff_ffff);
        write(&mut dev, DEVICE_FEATURES_SEL, 1);
        assert_eq!(read(&mut dev, DEVICE_FEATURES), FEATURES >> 32);
        write(&mut dev, DEVICE_FEATURES_SEL, 2);
        assert_eq!(read(&mut dev, DEVICE_FEATURES), 0);

        assert_eq!(dev.driver_features(), 0x1_ffff_ffff);
        assert_eq!(dev.negotiated_features(), FEATURES);
        write(&mut dev, STATUS, 0x0b);
        assert_eq!(dev.phase(), StatusPhase::FeaturesOk);
    }

    #[test]
    fn queue_addresses_are_assembled_from_halves() {
        let (mut dev, _) = transport();
        write(&mut dev, QUEUE_SEL, 1);
        assert_eq!(read(&mut dev, QUEUE_NUM_MAX), 256);
        write(&mut dev, QUEUE_NUM, 128);
        write(&mut dev, QUEUE_DESC_LOW, 0x4000_1000);
        write(&mut dev, QUEUE_DESC_HIGH, 0x1);
        write(&mut dev, QUEUE_DRIVER_LOW, 0x4000_2000);
        write(&mut dev, QUEUE_DEVICE_LOW, 0x4000_3000);
        write(&mut dev, QUEUE_DEVICE_HIGH, 0x2);
        write(&mut dev, QUEUE_READY, 1);

        let queue = *dev.queue(1).unwrap();
        assert_eq!(
            queue,
            VirtQueue {
                size: 128,
                ready: true,
                desc: 0x1_4000_1000,
                driver: 0x4000_2000,
                device: 0x2_4000_3000,
            }
        );
        assert_eq!(read(&mut dev, QUEUE_DESC_HIGH), 1);
        assert_eq!(*dev.queue(0).unwrap(), VirtQueue::default());

        // Oversized queues are refused.
        write(&mut dev, QUEUE_NUM, 1024);
        assert_eq!(dev.queue(1).unwrap().size, 128);
    }

    #[test]
    fn missing_queue_reads_as_unavailable() {
        let (mut dev, _) = transport();
        write(&mut dev, QUEUE_SEL, 7);
        assert_eq!(read(&mut dev, QUEUE_NUM_MAX), 0);
        write(&mut dev, QUEUE_READY, 1);
        assert_eq!(read(&mut dev, QUEUE_READY), 0);
    }

    #[test]
    fn notify_and_interrupt_handshake() {
        let (mut dev, pending) = transport();
        write(&mut dev, QUEUE_NOTIFY, 0);
        assert!(dev.take_notifications().is_empty());

        write(&mut dev, QUEUE_READY, 1);
        write(&mut dev, QUEUE_NOTIFY, 0);
        assert_eq!(dev.take_notifications(), vec![0]);

        dev.raise_interrupt(InterruptStatus::USED_BUFFER);
        assert!(dev.irq_asserted());
        assert_eq!(pending.drain(), vec![(48, true)]);
        assert_eq!(read(&mut dev, INTERRUPT_STATUS), 1);

        write(&mut dev, INTERRUPT_ACK, 1);
        assert_eq!(read(&mut dev, INTERRUPT_STATUS), 0);
        assert!(!dev.irq_asserted());
        assert_eq!(pending.drain(), vec![(48, false)]);
    }

    #[test]
    fn config_space_and_generation() {
        let (mut dev, _) = transport();
        assert_eq!(read(&mut dev, CONFIG), 0x0019_0050);
        assert_eq!(
            dev.handle_access(CONFIG + 4, AccessWidth::Byte, false, 0).unwrap(),
            Some(1)
        );
        assert_eq!(
            dev.handle_access(CONFIG + 2, AccessWidth::Word, false, 0).unwrap(),
            Some(0x19)
        );
        assert_eq!(read(&mut dev, CONFIG_GENERATION), 0);
        dev.raise_interrupt(InterruptStatus::CONFIG_CHANGE);
        assert_eq!(read(&mut dev, CONFIG_GENERATION), 1);
    }

    #[test]
    fn writing_zero_status_resets_the_transport() {
        let (mut dev, _) = transport();
        write(&mut dev, STATUS, 0x0f);
        write(&mut dev, DRIVER_FEATURES, 0x5);
        write(&mut dev, QUEUE_NUM, 64);
        write(&mut dev, QUEUE_READY, 1);
        dev.raise_interrupt(InterruptStatus::USED_BUFFER);

        write(&mut dev, STATUS, 0);
        assert_eq!(dev.status(), 0);
        assert_eq!(dev.driver_features(), 0);
        assert_eq!(*dev.queue(0).unwrap(), VirtQueue::default());
        assert_eq!(read(&mut dev, INTERRUPT_STATUS), 0);
        assert!(!dev.irq_asserted());
    }
}
