use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};

use super::Device;
use crate::mem::{GuestPhysAddr, GuestPhysAddrRange};

/// Index of a device inside a [`DeviceDirectory`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceId(usize);

impl DeviceId {
    /// Position of the device in insertion order.
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

/// The devices of a guest, indexed by their disjoint guest physical windows.
///
/// Devices live in an arena in insertion order; a separate array of `(window, index)` pairs is
/// kept sorted by window start, so lookups are a binary search. Windows never change after
/// insertion.
#[derive(Default)]
pub struct DeviceDirectory {
    devices: Vec<Device>,
    index: Vec<(GuestPhysAddrRange, DeviceId)>,
}

impl DeviceDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `device` at its declared window.
    ///
    /// Fails if the window is empty or overlaps a device already present; the device map would
    /// be ambiguous otherwise.
    pub fn insert(&mut self, device: Device) -> AxResult<DeviceId> {
        let range = device.range();
        if range.is_empty() {
            return ax_err!(
                InvalidInput,
                format!("device {} has an empty window", device.name())
            );
        }
        let pos = self
            .index
            .partition_point(|(other, _)| other.start < range.start);
        let neighbours = pos.checked_sub(1).into_iter().chain([pos]);
        for i in neighbours {
            if let Some((other, id)) = self.index.get(i) {
                if other.overlaps(range) {
                    return ax_err!(
                        AlreadyExists,
                        format!(
                            "device {} at {:?} overlaps {} at {:?}",
                            device.name(),
                            range,
                            self.devices[id.0].name(),
                            other
                        )
                    );
                }
            }
        }
        let id = DeviceId(self.devices.len());
        info!("device {} at {:?}", device.name(), range);
        self.devices.push(device);
        self.index.insert(pos, (range, id));
        Ok(id)
    }

    /// The device whose window contains `addr`.
    pub fn find(&self, addr: GuestPhysAddr) -> Option<DeviceId> {
        let pos = self
            .index
            .partition_point(|(range, _)| range.start <= addr)
            .checked_sub(1)?;
        let (range, id) = self.index[pos];
        range.contains(addr).then_some(id)
    }

    /// The device with the given id.
    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(id.0)
    }

    /// Mutable access to the device with the given id.
    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(id.0)
    }

    /// The device whose window contains `addr`, with `addr` translated to a device-local offset.
    pub fn resolve_mut(&mut self, addr: GuestPhysAddr) -> Option<(&mut Device, usize)> {
        let id = self.find(addr)?;
        let device = &mut self.devices[id.0];
        let offset = addr.as_usize() - device.range().start.as_usize();
        Some((device, offset))
    }

    /// The first device registered under `name`.
    pub fn lookup_name(&self, name: &str) -> Option<DeviceId> {
        self.devices
            .iter()
            .position(|dev| dev.name() == name)
            .map(DeviceId)
    }

    /// Devices in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device has been inserted.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::device::{Pl011, PendingIrqs};
    use axerrno::AxError;
    use test_case::test_case;

    fn uart(name: &'static str, base: usize, size: usize) -> Device {
        let range = GuestPhysAddrRange::from_start_size(GuestPhysAddr::from(base), size);
        Device::Uart(Pl011::new(name, range, 1, Arc::new(PendingIrqs::default())).unwrap())
    }

    fn directory() -> DeviceDirectory {
        let mut dir = DeviceDirectory::new();
        // Inserted out of address order on purpose.
        dir.insert(uart("c", 0x3000, 0x1000)).unwrap();
        dir.insert(uart("a", 0x1000, 0x1000)).unwrap();
        dir.insert(uart("b", 0x2000, 0x1000)).unwrap();
        dir
    }

    #[test_case(0x1000, Some("a") ; "first byte")]
    #[test_case(0x1fff, Some("a") ; "last byte")]
    #[test_case(0x2000, Some("b") ; "adjacent window")]
    #[test_case(0x3070, Some("c") ; "inside last")]
    #[test_case(0x0fff, None ; "below all")]
    #[test_case(0x4000, None ; "above all")]
    #[test_case(0x0, None ; "zero")]
    fn find_returns_owning_device(addr: usize, expected: Option<&str>) {
        let dir = directory();
        let found = dir
            .find(GuestPhysAddr::from(addr))
            .map(|id| dir.get(id).unwrap().name());
        assert_eq!(found, expected);
    }

    #[test]
    fn find_with_gaps() {
        let mut dir = DeviceDirectory::new();
        dir.insert(uart("low", 0x1000, 0x1000)).unwrap();
        dir.insert(uart("high", 0x9000, 0x1000)).unwrap();
        assert!(dir.find(GuestPhysAddr::from(0x2000)).is_none());
        assert!(dir.find(GuestPhysAddr::from(0x8fff)).is_none());
        assert!(dir.find(GuestPhysAddr::from(0x9fff)).is_some());
        assert_eq!(dir.lookup_name("high"), dir.find(GuestPhysAddr::from(0x9000)));
    }

    #[test_case(0x1800, 0x1000 ; "straddles start")]
    #[test_case(0x0800, 0x1000 ; "ends inside")]
    #[test_case(0x1000, 0x1000 ; "identical")]
    #[test_case(0x0000, 0x5000 ; "covers all")]
    fn overlapping_insert_is_rejected(base: usize, size: usize) {
        let mut dir = directory();
        assert_eq!(
            dir.insert(uart("x", base, size)).unwrap_err(),
            AxError::AlreadyExists
        );
        assert_eq!(dir.len(), 3);
    }

    #[test]
    fn resolve_translates_to_local_offset() {
        let mut dir = directory();
        let (device, offset) = dir.resolve_mut(GuestPhysAddr::from(0x2018)).unwrap();
        assert_eq!(device.name(), "b");
        assert_eq!(offset, 0x18);
    }
}
