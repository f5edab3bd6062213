use crate::mem::{AccessWidth, OffsetRange};

/// Computes the live value of a register from its device's state.
pub type ReadHook<S> = fn(&S) -> u64;

/// Applies a guest write to its device's state.
pub type WriteHook<S> = fn(&mut S, u64);

/// Which directions of guest access a register accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterAccess {
    /// Reads are served, writes are ignored.
    ReadOnly,
    /// Writes are accepted, reads return zero.
    WriteOnly,
    /// Both directions are served.
    ReadWrite,
}

/// A named, width-typed storage cell inside a device's MMIO window.
///
/// Without hooks the register is plain storage. A read hook replaces the stored value with one
/// computed from the device state; a write hook replaces storing with a state update.
pub struct Register<S> {
    name: &'static str,
    offset: usize,
    width: AccessWidth,
    access: RegisterAccess,
    value: u64,
    read_hook: Option<ReadHook<S>>,
    write_hook: Option<WriteHook<S>>,
}

impl<S> Register<S> {
    /// A read-write storage register at `offset` within the device.
    pub const fn new(name: &'static str, offset: usize, width: AccessWidth) -> Self {
        Self {
            name,
            offset,
            width,
            access: RegisterAccess::ReadWrite,
            value: 0,
            read_hook: None,
            write_hook: None,
        }
    }

    /// A read-only register that always reads `value`.
    pub const fn constant(name: &'static str, offset: usize, width: AccessWidth, value: u64) -> Self {
        Self::new(name, offset, width)
            .with_access(RegisterAccess::ReadOnly)
            .with_value(value)
    }

    /// Sets the access direction.
    pub const fn with_access(mut self, access: RegisterAccess) -> Self {
        self.access = access;
        self
    }

    /// Sets the initial stored value.
    pub const fn with_value(mut self, value: u64) -> Self {
        self.value = value;
        self
    }

    /// Installs a read hook.
    pub const fn on_read(mut self, hook: ReadHook<S>) -> Self {
        self.read_hook = Some(hook);
        self
    }

    /// Installs a write hook.
    pub const fn on_write(mut self, hook: WriteHook<S>) -> Self {
        self.write_hook = Some(hook);
        self
    }

    /// The register's name, as used in log records.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Offset of the first byte of the register within the device window.
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// The declared access width.
    pub const fn width(&self) -> AccessWidth {
        self.width
    }

    /// Which directions of access the register serves.
    pub const fn access(&self) -> RegisterAccess {
        self.access
    }

    /// The device-local offsets the register occupies.
    pub fn range(&self) -> OffsetRange {
        OffsetRange {
            start: self.offset,
            end: self.offset + self.width.size(),
        }
    }

    /// The current value of the whole register.
    pub fn read(&self, state: &S) -> u64 {
        let value = match self.access {
            RegisterAccess::WriteOnly => {
                warn!("read from write-only register {}", self.name);
                0
            }
            _ => match self.read_hook {
                Some(hook) => hook(state),
                None => self.value,
            },
        };
        value & self.width.mask()
    }

    /// Commits a write of the whole register, truncated to its width.
    pub fn write(&mut self, state: &mut S, value: u64) {
        let value = value & self.width.mask();
        match self.access {
            RegisterAccess::ReadOnly => {
                warn!(
                    "ignoring write {:#x} to read-only register {}",
                    value, self.name
                );
            }
            _ => match self.write_hook {
                Some(hook) => hook(state, value),
                None => self.value = value,
            },
        }
    }

    /// Reads `width` bytes starting `lane` bytes into the register.
    pub(super) fn read_lane(&self, state: &S, lane: usize, width: AccessWidth) -> u64 {
        if lane == 0 && width >= self.width {
            return self.read(state);
        }
        (self.read(state) >> (lane * 8)) & width.mask()
    }

    /// Writes `width` bytes starting `lane` bytes into the register, preserving the other bytes.
    pub(super) fn write_lane(&mut self, state: &mut S, lane: usize, width: AccessWidth, value: u64) {
        if lane == 0 && width >= self.width {
            return self.write(state, value);
        }
        let shift = lane * 8;
        let mask = width.mask() << shift;
        let current = match self.access {
            RegisterAccess::WriteOnly => self.value,
            _ => self.read(state),
        };
        self.write(state, (current & !mask) | ((value << shift) & mask));
    }
}

impl<S> core::fmt::Debug for Register<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Register")
            .field("name", &self.name)
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("width", &self.width)
            .field("access", &self.access)
            .finish()
    }
}
