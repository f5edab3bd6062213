use alloc::vec;
use alloc::vec::Vec;

use crate::device::virtio::VirtioDeviceConfig;
use crate::mem::{GuestPhysAddr, MemoryRegion};

/// The kind of device a board entry describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    /// A PL011-style UART console.
    Pl011,
    /// A virtio-mmio transport, configured by [`MonitorConfig::virtio`].
    VirtioMmio,
}

/// One entry of the static board device list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoardDevice {
    pub name: &'static str,
    pub base: GuestPhysAddr,
    pub size: usize,
    /// The guest interrupt line the device raises.
    pub irq: u32,
    pub kind: DeviceKind,
}

impl BoardDevice {
    /// The guest physical window of the device.
    pub const fn region(&self) -> MemoryRegion {
        MemoryRegion::new(self.base, self.size)
    }
}

/// Everything the monitor needs to know about the guest it builds.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Guest physical address RAM starts at.
    pub ram_base: GuestPhysAddr,
    /// Size of guest RAM in bytes.
    pub ram_size: usize,
    /// Offset of the kernel image inside RAM; the kernel is entered here.
    pub kernel_offset: usize,
    /// Offset of the device-tree blob inside RAM.
    pub dtb_offset: usize,
    /// Parameters of every virtio-mmio transport on the board.
    pub virtio: VirtioDeviceConfig,
    /// The devices placed in guest physical space.
    pub board: Vec<BoardDevice>,
}

impl MonitorConfig {
    /// The RAM region.
    pub const fn ram(&self) -> MemoryRegion {
        MemoryRegion::new(self.ram_base, self.ram_size)
    }

    /// Where the kernel is entered.
    pub fn kernel_entry(&self) -> GuestPhysAddr {
        self.ram_base + self.kernel_offset
    }

    /// Where the device tree is placed.
    pub fn dtb_addr(&self) -> GuestPhysAddr {
        self.ram_base + self.dtb_offset
    }
}

impl Default for MonitorConfig {
    /// A QEMU `virt`-like board with 128 MiB of RAM, one console and one virtio-mmio slot.
    fn default() -> Self {
        Self {
            ram_base: GuestPhysAddr::from(0x4000_0000),
            ram_size: 128 * 1024 * 1024,
            kernel_offset: 0x8_0000,
            dtb_offset: 0x200_0000,
            virtio: VirtioDeviceConfig::default(),
            board: vec![
                BoardDevice {
                    name: "pl011",
                    base: GuestPhysAddr::from(0x0900_0000),
                    size: 0x1000,
                    irq: 33,
                    kind: DeviceKind::Pl011,
                },
                BoardDevice {
                    name: "virtio_mmio",
                    base: GuestPhysAddr::from(0x0a00_0000),
                    size: 0x200,
                    irq: 48,
                    kind: DeviceKind::VirtioMmio,
                },
            ],
        }
    }
}
