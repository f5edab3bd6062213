use alloc::sync::Arc;
use core::fmt;

use axerrno::{ax_err, AxError, AxResult};

use crate::config::{DeviceKind, MonitorConfig};
use crate::device::{Device, DeviceDirectory, PendingIrqs, Pl011, VirtioTransport};
use crate::exit::{FaultReason, HypercallConduit, MmioAccess};
use crate::mem::{GuestMemory, GuestPhysAddr};
use crate::regs::VCpuRegisters;
use crate::session::VmSession;
use crate::vcpu::VCpu;

/// Width of every AArch64 instruction.
const INSTRUCTION_SIZE: u64 = 4;

/// `SPSR` the guest kernel is entered with: EL1h, all exceptions masked.
const BOOT_PSTATE: u64 = 0x3c5;

mod psci {
    pub const VERSION: u64 = 0x8400_0000;
    pub const MIGRATE_INFO_TYPE: u64 = 0x8400_0006;
    pub const SYSTEM_OFF: u64 = 0x8400_0008;
    pub const SYSTEM_RESET: u64 = 0x8400_0009;
    pub const FEATURES: u64 = 0x8400_000a;

    /// PSCI 1.0.
    pub const VERSION_1_0: u64 = 0x0001_0000;
    /// Trusted OS is not present or does not require migration.
    pub const MIGRATE_NOT_REQUIRED: u64 = 2;
    pub const SUCCESS: u64 = 0;
    pub const NOT_SUPPORTED: u64 = -1i64 as u64;

    pub const fn is_implemented(function: u64) -> bool {
        matches!(
            function,
            VERSION | MIGRATE_INFO_TYPE | SYSTEM_OFF | SYSTEM_RESET | FEATURES
        )
    }
}

/// Why the monitor stopped resuming the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestHalt {
    /// The guest accessed an address no device owns.
    UnmappedAccess {
        addr: GuestPhysAddr,
        write: bool,
    },
    /// The guest issued a hypercall the monitor has no handler for.
    UndefinedHypercall {
        conduit: HypercallConduit,
        imm: u16,
        /// The function id the guest passed in `x0`.
        function: u64,
    },
    /// The guest exited for a reason the monitor cannot emulate.
    UnknownExit { syndrome: u64 },
    /// A device rejected the access, e.g. at an offset holding no register.
    DeviceFault { addr: GuestPhysAddr, err: AxError },
    /// The guest asked to be powered off.
    PoweredOff,
    /// The guest asked to be reset.
    Reset,
    /// The session or the vcpu failed.
    Session(AxError),
}

impl From<AxError> for GuestHalt {
    fn from(err: AxError) -> Self {
        Self::Session(err)
    }
}

impl GuestHalt {
    /// Whether the guest stopped on its own request rather than through a fault.
    pub const fn is_orderly(&self) -> bool {
        matches!(self, Self::PoweredOff | Self::Reset)
    }
}

impl fmt::Display for GuestHalt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnmappedAccess { addr, write } => write!(
                f,
                "{} of unmapped guest physical address {:#x}",
                if *write { "write" } else { "read" },
                addr.as_usize()
            ),
            Self::UndefinedHypercall {
                conduit,
                imm,
                function,
            } => write!(
                f,
                "undefined hypercall {:?} #{:#x} function {:#x}",
                conduit, imm, function
            ),
            Self::UnknownExit { syndrome } => write!(f, "unknown exit, syndrome {:#x}", syndrome),
            Self::DeviceFault { addr, err } => {
                write!(f, "device fault at {:#x}: {:?}", addr.as_usize(), err)
            }
            Self::PoweredOff => write!(f, "guest powered off"),
            Self::Reset => write!(f, "guest requested reset"),
            Self::Session(err) => write!(f, "session error: {:?}", err),
        }
    }
}

/// The orchestrator: owns the vcpu and the devices, and emulates every guest exit.
///
/// The guest runs and the monitor emulates, never both at once: the vcpu is resumed only after
/// the current exit is fully handled, so device state and register state need no locking.
pub struct Monitor<S: VmSession> {
    config: MonitorConfig,
    vcpu: VCpu<S>,
    devices: DeviceDirectory,
    pending_irqs: Arc<PendingIrqs>,
    exits: u64,
}

impl<S: VmSession> Monitor<S> {
    /// Creates the VM session, builds the guest and starts it.
    ///
    /// If the guest cannot be built or started, the session is destroyed before the error is
    /// returned.
    pub fn start(
        config: MonitorConfig,
        session_config: S::CreateConfig,
        kernel: &[u8],
        dtb: &[u8],
    ) -> AxResult<Self> {
        let vcpu = VCpu::create(0, config.ram_size, session_config)?;
        let mut monitor = Self::new(vcpu, config)?;
        if let Err(err) = monitor.boot(kernel, dtb) {
            release(&monitor.vcpu);
            return Err(err);
        }
        Ok(monitor)
    }

    /// Builds the device directory for the board described by `config` around `vcpu`.
    ///
    /// Fails if any two regions of the guest physical map overlap; `vcpu` is destroyed then.
    pub fn new(vcpu: VCpu<S>, config: MonitorConfig) -> AxResult<Self> {
        let pending_irqs = Arc::new(PendingIrqs::default());
        let devices = match build_board(&config, &pending_irqs) {
            Ok(devices) => devices,
            Err(err) => {
                release(&vcpu);
                return Err(err);
            }
        };
        Ok(Self {
            config,
            vcpu,
            devices,
            pending_irqs,
            exits: 0,
        })
    }

    /// Loads the kernel and the device tree, sets up the boot registers and issues the first run.
    pub fn boot(&mut self, kernel: &[u8], dtb: &[u8]) -> AxResult {
        let config = &self.config;
        let kernel_end = config.kernel_offset.saturating_add(kernel.len());
        let dtb_end = config.dtb_offset.saturating_add(dtb.len());
        if config.kernel_offset < dtb_end && config.dtb_offset < kernel_end {
            return ax_err!(InvalidInput, "kernel image and device tree overlap");
        }
        {
            let mut backing = self.vcpu.ram_mut()?;
            let mut ram = GuestMemory::new(config.ram_base, &mut backing);
            ram.load(config.kernel_offset, kernel)?;
            ram.load(config.dtb_offset, dtb)?;
        }
        info!(
            "kernel ({:#x} bytes) at {:?}, dtb ({:#x} bytes) at {:?}",
            kernel.len(),
            config.kernel_entry(),
            dtb.len(),
            config.dtb_addr()
        );
        {
            let mut regs = self.vcpu.register_state_mut()?;
            *regs = VCpuRegisters {
                ip: config.kernel_entry().as_usize() as u64,
                pstate: BOOT_PSTATE,
                ..Default::default()
            };
            regs.set_gpr(0, config.dtb_addr().as_usize() as u64);
        }
        self.vcpu.notify_on_exit()?;
        self.flush_irqs()?;
        self.vcpu.run()
    }

    /// The configuration the guest was built from.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// The guest's virtual CPU.
    pub fn vcpu(&self) -> &VCpu<S> {
        &self.vcpu
    }

    /// The devices placed on the board.
    pub fn devices(&self) -> &DeviceDirectory {
        &self.devices
    }

    /// The devices, for backends feeding input or completing requests between exits.
    pub fn devices_mut(&mut self) -> &mut DeviceDirectory {
        &mut self.devices
    }

    /// How many exits have been emulated.
    pub fn exits_handled(&self) -> u64 {
        self.exits
    }

    /// Waits for the next exit, emulates it and resumes the guest.
    pub fn process_exit(&mut self) -> Result<(), GuestHalt> {
        self.vcpu.wait_for_exit()?;
        self.handle_exit()?;
        self.flush_irqs()?;
        self.vcpu.run()?;
        Ok(())
    }

    /// Processes exits until the guest halts, and reports why.
    pub fn run(&mut self) -> GuestHalt {
        loop {
            if let Err(halt) = self.process_exit() {
                if halt.is_orderly() {
                    info!("vcpu {}: {} after {} exits", self.vcpu.id(), halt, self.exits);
                } else {
                    error!("vcpu {}: halted: {}", self.vcpu.id(), halt);
                }
                return halt;
            }
        }
    }

    /// Emulates the exit the stopped vcpu last reported, leaving it ready to be resumed.
    pub fn handle_exit(&mut self) -> Result<(), GuestHalt> {
        self.exits += 1;
        match self.vcpu.fault_reason()? {
            FaultReason::DataAbortRead(access) => self.emulate_mmio(access, false),
            FaultReason::DataAbortWrite(access) => self.emulate_mmio(access, true),
            FaultReason::Hypercall { conduit, imm } => self.handle_hypercall(conduit, imm),
            FaultReason::Unknown { syndrome } => Err(GuestHalt::UnknownExit { syndrome }),
        }
    }

    fn emulate_mmio(&mut self, access: MmioAccess, write: bool) -> Result<(), GuestHalt> {
        let addr = self.vcpu.fault_address()?;
        let value = if write {
            self.vcpu.register_state()?.gpr(access.reg) & access.width.mask()
        } else {
            0
        };
        let Some((device, offset)) = self.devices.resolve_mut(addr) else {
            return Err(GuestHalt::UnmappedAccess { addr, write });
        };
        let result = device
            .handle_access(offset, access.width, write, value)
            .map_err(|err| GuestHalt::DeviceFault { addr, err })?;
        if let Some(mut value) = result {
            if access.sign_extend {
                value = access.width.sign_extend(value);
            }
            if !access.reg_is_64bit {
                value &= 0xffff_ffff;
            }
            self.vcpu.set_gpr(access.reg, value)?;
        }
        self.vcpu.advance_instruction_pointer(INSTRUCTION_SIZE)?;
        Ok(())
    }

    fn handle_hypercall(&mut self, conduit: HypercallConduit, imm: u16) -> Result<(), GuestHalt> {
        let (function, arg) = {
            let regs = self.vcpu.register_state()?;
            (regs.gpr(0), regs.gpr(1))
        };
        let ret = match (imm, function) {
            (0, psci::VERSION) => psci::VERSION_1_0,
            (0, psci::MIGRATE_INFO_TYPE) => psci::MIGRATE_NOT_REQUIRED,
            (0, psci::FEATURES) if psci::is_implemented(arg) => psci::SUCCESS,
            (0, psci::FEATURES) => psci::NOT_SUPPORTED,
            (0, psci::SYSTEM_OFF) => return Err(GuestHalt::PoweredOff),
            (0, psci::SYSTEM_RESET) => return Err(GuestHalt::Reset),
            _ => {
                return Err(GuestHalt::UndefinedHypercall {
                    conduit,
                    imm,
                    function,
                })
            }
        };
        debug!("psci {:#x} -> {:#x}", function, ret);
        self.vcpu.set_gpr(0, ret)?;
        self.vcpu
            .advance_instruction_pointer(conduit.resume_offset())?;
        Ok(())
    }

    /// Forwards interrupt level changes of the devices to the guest.
    ///
    /// The monitor does this before every resume. A backend that raises an interrupt through
    /// [`Monitor::devices_mut`] while the guest runs calls it to deliver the change right away.
    pub fn flush_irqs(&mut self) -> AxResult {
        for (irq, level) in self.pending_irqs.drain() {
            self.vcpu.set_irq_level(irq, level)?;
        }
        Ok(())
    }

    /// Stops the guest and releases the session.
    pub fn shutdown(self) -> AxResult {
        info!("vcpu {}: shutting down", self.vcpu.id());
        self.vcpu.destroy()
    }
}

/// Places every device of the board in a fresh directory.
fn build_board(
    config: &MonitorConfig,
    pending_irqs: &Arc<PendingIrqs>,
) -> AxResult<DeviceDirectory> {
    let mut devices = DeviceDirectory::new();
    let ram = config.ram();
    for entry in &config.board {
        let region = entry.region();
        if region.overlaps(&ram) {
            return ax_err!(
                AlreadyExists,
                format!("device {} {:?} overlaps RAM {:?}", entry.name, region, ram)
            );
        }
        let Some(range) = region.range() else {
            return ax_err!(
                InvalidInput,
                format!("device {} {:?} wraps around", entry.name, region)
            );
        };
        let device = match entry.kind {
            DeviceKind::Pl011 => {
                Device::Uart(Pl011::new(entry.name, range, entry.irq, pending_irqs.clone())?)
            }
            DeviceKind::VirtioMmio => Device::Virtio(VirtioTransport::new(
                entry.name,
                range,
                entry.irq,
                pending_irqs.clone(),
                &config.virtio,
            )?),
        };
        devices.insert(device)?;
    }
    Ok(devices)
}

/// Destroys the session behind a guest that could not be built or started.
fn release<S: VmSession>(vcpu: &VCpu<S>) {
    if let Err(err) = vcpu.destroy() {
        error!("vcpu {}: failed to release the session: {:?}", vcpu.id(), err);
    }
}
