// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxVmm - a trap-and-emulate virtual machine monitor core.
//!
//! This crate runs a guest operating system on a hardware-assisted virtual CPU provided by the
//! kernel, and emulates in software the MMIO devices the guest sees: a PL011-style UART console
//! and a virtio-mmio transport. The guest executes natively; only stage-2 faults (MMIO accesses)
//! and hypercalls come back to the monitor.
//!
//! # Structure
//!
//! - [`VmSession`]: the kernel-facing capability to one VM with one virtual CPU and its RAM.
//! - [`VCpu`]: lifecycle and register-state access for that virtual CPU, with exits reported
//!   through a single-producer/single-consumer notification ([`notify`]).
//! - [`device`]: registers, devices and the [`DeviceDirectory`] mapping guest physical addresses
//!   to devices.
//! - [`Monitor`]: loads the guest images, builds the devices from the [`MonitorConfig`] board list
//!   and emulates every exit.
//!
//! # Execution model
//!
//! One virtual CPU, one monitor thread. The guest runs or the monitor emulates, never both: the
//! register state and the device state are only touched between an exit and the next resume.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

mod config;
pub mod device;
mod exit;
mod mem;
mod monitor;
pub mod notify;
mod regs;
mod session;
mod vcpu;

pub use config::{BoardDevice, DeviceKind, MonitorConfig};
pub use device::{Device, DeviceDirectory, DeviceId};
pub use exit::{FaultReason, HypercallConduit, MmioAccess};
pub use mem::{AccessWidth, GuestMemory, GuestPhysAddr, GuestPhysAddrRange, MemoryRegion, OffsetRange};
pub use monitor::{GuestHalt, Monitor};
pub use regs::{VCpuRegisters, GPR_COUNT, ZERO_REGISTER};
pub use session::VmSession;
pub use vcpu::{VCpu, VCpuState};
