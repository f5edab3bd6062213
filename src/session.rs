use axerrno::AxResult;

use crate::notify::ExitNotifier;
use crate::regs::VCpuRegisters;

/// The kernel-facing capability surface of one virtual machine.
///
/// An implementor is the monitor's handle to a kernel-side VM object: it owns the guest RAM backing
/// and exactly one virtual CPU. [`crate::VCpu`] wraps it with lifecycle checks, so implementations
/// may assume their methods are only called in a legal order.
///
/// # Execution model
///
/// - [`VmSession::run`] starts the guest and returns without waiting for it. When the guest traps,
///   the kernel stores the register state (see [`VCpuRegisters`]) and signals the [`ExitNotifier`]
///   registered through [`VmSession::set_exit_notifier`]. The monitor waits for that signal by
///   calling [`VmSession::idle`] until it arrives.
/// - [`VmSession::pause`] stops a running guest synchronously: when it returns, the register state
///   is stable.
/// - Register state and guest RAM are only touched by the monitor while the guest is stopped.
pub trait VmSession: Sized {
    /// Implementation-specific parameters for VM creation (capability quota, kernel connection...).
    type CreateConfig;

    /// Creates a VM with `memory_size` bytes of guest RAM and one virtual CPU.
    ///
    /// Fails with [`axerrno::AxError::NoMemory`] when RAM or capability quota is insufficient; the
    /// caller may retry after freeing resources.
    fn create(memory_size: usize, config: Self::CreateConfig) -> AxResult<Self>;

    /// Resumes the guest from the current register state.
    fn run(&mut self) -> AxResult;

    /// Stops the guest, returning once it has genuinely stopped.
    fn pause(&mut self) -> AxResult;

    /// Releases the virtual CPU and the RAM backing.
    fn destroy(&mut self) -> AxResult;

    /// The register state shared with the kernel.
    fn registers(&self) -> &VCpuRegisters;

    /// Mutable access to the register state shared with the kernel.
    fn registers_mut(&mut self) -> &mut VCpuRegisters;

    /// The guest RAM backing.
    fn ram(&self) -> &[u8];

    /// Mutable access to the guest RAM backing.
    fn ram_mut(&mut self) -> &mut [u8];

    /// Registers the notifier the kernel signals on every guest exit.
    fn set_exit_notifier(&mut self, notifier: ExitNotifier) -> AxResult;

    /// Drives the level of virtual interrupt line `irq` as seen by the guest.
    fn set_irq_level(&mut self, irq: u32, asserted: bool) -> AxResult;

    /// Called over and over while the monitor waits for the next exit.
    ///
    /// The default only hints the CPU that it is spinning. A kernel-backed session should block
    /// on the kernel's exit event or yield the monitor's time slice here.
    fn idle(&self) {
        core::hint::spin_loop();
    }
}
