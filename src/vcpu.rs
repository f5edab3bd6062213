use core::cell::{Ref, RefCell, RefMut};

use axerrno::{ax_err, AxResult};

use crate::exit::FaultReason;
use crate::mem::GuestPhysAddr;
use crate::notify::{exit_channel, ExitReceiver};
use crate::regs::VCpuRegisters;
use crate::session::VmSession;

/// The state of a virtual CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VCpuState {
    /// An invalid state, entered after a failed transition.
    Invalid = 0,
    /// The vcpu is created but has never run.
    Created = 1,
    /// The vcpu exited or was paused; its register state is stable.
    Stopped = 2,
    /// The guest is executing.
    Running = 3,
    /// The session has been destroyed.
    Destroyed = 4,
}

impl VCpuState {
    /// Whether the register state may be inspected in this state.
    pub const fn is_stopped(self) -> bool {
        matches!(self, Self::Created | Self::Stopped)
    }
}

/// The mutable part of [`VCpu`].
struct VCpuInnerMut {
    /// The state of the vcpu.
    state: VCpuState,
    /// Where exits are reported, once [`VCpu::notify_on_exit`] has been called.
    exits: Option<ExitReceiver>,
}

/// The monitor-side context of the single virtual CPU of a [`VmSession`].
///
/// Tracks whether the guest is executing and only hands out the register state while it is not,
/// so that the run/emulate alternation the monitor relies on is checked rather than assumed.
///
/// Note that:
/// - This struct handles internal mutability itself, almost all the methods are `&self`.
/// - This struct is not thread-safe: one monitor thread drives one vcpu.
pub struct VCpu<S: VmSession> {
    /// The id of the vcpu.
    id: usize,
    /// The mutable part of the vcpu.
    inner_mut: RefCell<VCpuInnerMut>,
    /// The kernel session backing the vcpu.
    session: RefCell<S>,
}

impl<S: VmSession> VCpu<S> {
    /// Creates a VM session with `memory_size` bytes of RAM and wraps its vcpu.
    pub fn create(id: usize, memory_size: usize, config: S::CreateConfig) -> AxResult<Self> {
        Ok(Self::new(id, S::create(memory_size, config)?))
    }

    /// Wraps an already created session.
    pub fn new(id: usize, session: S) -> Self {
        Self {
            id,
            inner_mut: RefCell::new(VCpuInnerMut {
                state: VCpuState::Created,
                exits: None,
            }),
            session: RefCell::new(session),
        }
    }

    /// Get the id of the vcpu.
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Get the state of the vcpu.
    pub fn state(&self) -> VCpuState {
        self.inner_mut.borrow().state
    }

    /// Execute a block with the state of the vcpu transitioned from `from` to `to`. If the current
    /// state is not `from`, return an error.
    ///
    /// The state will be set to [`VCpuState::Invalid`] if the block fails, and to `to` if it
    /// succeeds. A state mismatch is reported without touching the state.
    pub fn with_state_transition<F, T>(&self, from: VCpuState, to: VCpuState, f: F) -> AxResult<T>
    where
        F: FnOnce() -> AxResult<T>,
    {
        let mut inner_mut = self.inner_mut.borrow_mut();
        if inner_mut.state != from {
            ax_err!(
                BadState,
                format!("VCpu state is not {:?}, but {:?}", from, inner_mut.state)
            )
        } else {
            let result = f();
            inner_mut.state = if result.is_err() {
                VCpuState::Invalid
            } else {
                to
            };
            result
        }
    }

    /// Execute an operation on the session with the state transitioned from `from` to `to`.
    pub fn manipulate_session<F, T>(&self, from: VCpuState, to: VCpuState, f: F) -> AxResult<T>
    where
        F: FnOnce(&mut S) -> AxResult<T>,
    {
        self.with_state_transition(from, to, || f(&mut self.session.borrow_mut()))
    }

    /// Transition the state of the vcpu. If the current state is not `from`, return an error.
    pub fn transition_state(&self, from: VCpuState, to: VCpuState) -> AxResult {
        self.with_state_transition(from, to, || Ok(()))
    }

    fn ensure_stopped(&self) -> AxResult {
        match self.state() {
            state if state.is_stopped() => Ok(()),
            state => ax_err!(
                BadState,
                format!("vcpu {} register state is not stable while {:?}", self.id, state)
            ),
        }
    }

    /// Routes the session's exit signal to this vcpu, so that [`VCpu::wait_for_exit`] can block
    /// on it.
    pub fn notify_on_exit(&self) -> AxResult {
        self.ensure_stopped()?;
        let (notifier, receiver) = exit_channel();
        self.session.borrow_mut().set_exit_notifier(notifier)?;
        self.inner_mut.borrow_mut().exits = Some(receiver);
        Ok(())
    }

    /// Resumes the guest. At most one run may be outstanding.
    pub fn run(&self) -> AxResult {
        let from = match self.state() {
            VCpuState::Created => VCpuState::Created,
            _ => VCpuState::Stopped,
        };
        self.manipulate_session(from, VCpuState::Running, |session| session.run())
    }

    /// Blocks until the running guest exits.
    pub fn wait_for_exit(&self) -> AxResult {
        if self.state() != VCpuState::Running {
            return ax_err!(BadState, "waiting for an exit of a vcpu that is not running");
        }
        let received = match self.inner_mut.borrow().exits.as_ref() {
            Some(exits) => {
                let session = self.session.borrow();
                exits.recv_with(|| session.idle())
            }
            None => return ax_err!(BadState, "no exit notification registered"),
        };
        match received {
            Some(_) => self.transition_state(VCpuState::Running, VCpuState::Stopped),
            None => ax_err!(BadState, "exit notifier dropped by the session"),
        }
    }

    /// Stops the guest and returns once its register state is stable. Pausing a stopped vcpu
    /// does nothing.
    pub fn pause(&self) -> AxResult {
        match self.state() {
            VCpuState::Running => {
                self.manipulate_session(VCpuState::Running, VCpuState::Stopped, |session| {
                    session.pause()
                })?;
                // An exit that raced with the pause is dropped; the guest re-executes the
                // trapping instruction when resumed.
                if let Some(exits) = self.inner_mut.borrow().exits.as_ref() {
                    exits.try_recv();
                }
                Ok(())
            }
            state if state.is_stopped() => Ok(()),
            state => ax_err!(BadState, format!("cannot pause vcpu in state {:?}", state)),
        }
    }

    /// Releases the vcpu and the guest RAM. Any later use of the vcpu fails.
    ///
    /// A vcpu left [`VCpuState::Invalid`] by a failed session call can still be destroyed.
    pub fn destroy(&self) -> AxResult {
        if self.state() == VCpuState::Running {
            if let Err(err) = self.pause() {
                warn!("vcpu {}: pause before destroy failed: {:?}", self.id, err);
            }
        }
        let from = match self.state() {
            state @ (VCpuState::Created | VCpuState::Stopped | VCpuState::Invalid) => state,
            state => {
                return ax_err!(BadState, format!("cannot destroy vcpu in state {:?}", state))
            }
        };
        self.manipulate_session(from, VCpuState::Destroyed, |session| session.destroy())
    }

    /// The register state of the stopped vcpu.
    pub fn register_state(&self) -> AxResult<Ref<'_, VCpuRegisters>> {
        self.ensure_stopped()?;
        Ok(Ref::map(self.session.borrow(), |session| session.registers()))
    }

    /// Mutable access to the register state of the stopped vcpu.
    pub fn register_state_mut(&self) -> AxResult<RefMut<'_, VCpuRegisters>> {
        self.ensure_stopped()?;
        Ok(RefMut::map(self.session.borrow_mut(), |session| {
            session.registers_mut()
        }))
    }

    /// Guest RAM of the stopped vcpu.
    pub fn ram_mut(&self) -> AxResult<RefMut<'_, [u8]>> {
        self.ensure_stopped()?;
        Ok(RefMut::map(self.session.borrow_mut(), |session| {
            session.ram_mut()
        }))
    }

    /// Classifies the last exit.
    pub fn fault_reason(&self) -> AxResult<FaultReason> {
        Ok(FaultReason::from_syndrome(self.register_state()?.esr_el2))
    }

    /// The guest physical address that caused the last exit, which must be a data abort.
    pub fn fault_address(&self) -> AxResult<GuestPhysAddr> {
        let regs = self.register_state()?;
        if !FaultReason::from_syndrome(regs.esr_el2).is_data_abort() {
            return ax_err!(BadState, "last exit was not a data abort");
        }
        Ok(regs.fault_ipa())
    }

    /// Moves the saved instruction pointer `n` bytes forward, past an emulated instruction.
    pub fn advance_instruction_pointer(&self, n: u64) -> AxResult {
        let mut regs = self.register_state_mut()?;
        regs.ip = regs.ip.wrapping_add(n);
        Ok(())
    }

    /// Sets the value of a general-purpose register according to the given index.
    pub fn set_gpr(&self, reg: usize, val: u64) -> AxResult {
        self.register_state_mut()?.set_gpr(reg, val);
        Ok(())
    }

    /// Drives the level of a guest interrupt line.
    pub fn set_irq_level(&self, irq: u32, asserted: bool) -> AxResult {
        if self.state() == VCpuState::Destroyed {
            return ax_err!(BadState, "vcpu is destroyed");
        }
        self.session.borrow_mut().set_irq_level(irq, asserted)
    }
}
