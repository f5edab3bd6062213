//! A PL011-style UART serving as the guest console.
//!
//! Transmission completes instantly: bytes the guest writes are collected into lines and logged.
//! Input queued by the monitor is served from the data register.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use axerrno::AxResult;

use super::{IrqLine, MmioDevice, PendingIrqs, Register, RegisterAccess};
use crate::mem::{AccessWidth, GuestPhysAddrRange};

const UARTDR: usize = 0x000;
const UARTFR: usize = 0x018;
const UARTIBRD: usize = 0x024;
const UARTFBRD: usize = 0x028;
const UARTLCR_H: usize = 0x02c;
const UARTCR: usize = 0x030;
const UARTIMSC: usize = 0x038;
const UARTRIS: usize = 0x03c;
const UARTMIS: usize = 0x040;
const UARTICR: usize = 0x044;
const UARTPERIPHID0: usize = 0xfe0;

const FR_RXFE: u64 = 1 << 4;
const FR_TXFE: u64 = 1 << 7;

const INT_RX: u64 = 1 << 4;
const INT_TX: u64 = 1 << 5;
const INT_MASK: u64 = 0x7ff;

/// Longest line buffered before it is flushed without a newline.
const MAX_LINE: usize = 256;

/// PrimeCell peripheral and cell identification bytes of a PL011.
const PRIMECELL_ID: [u64; 8] = [0x11, 0x10, 0x14, 0x00, 0x0d, 0xf0, 0x05, 0xb1];
const PRIMECELL_ID_NAMES: [&str; 8] = [
    "UARTPeriphID0",
    "UARTPeriphID1",
    "UARTPeriphID2",
    "UARTPeriphID3",
    "UARTPCellID0",
    "UARTPCellID1",
    "UARTPCellID2",
    "UARTPCellID3",
];

/// The state behind the PL011 registers.
pub struct UartState {
    irq: IrqLine,
    rx: VecDeque<u8>,
    line: Vec<u8>,
    output: Vec<u8>,
    imsc: u64,
    ris: u64,
}

impl UartState {
    fn update_irq(&mut self) {
        let level = self.ris & self.imsc != 0;
        self.irq.set_level(level);
    }

    fn flush_line(&mut self) {
        if !self.line.is_empty() {
            info!("[guest] {}", String::from_utf8_lossy(&self.line).trim_end());
            self.line.clear();
        }
    }

    fn transmit(&mut self, byte: u8) {
        self.output.push(byte);
        match byte {
            b'\n' => self.flush_line(),
            b'\r' => {}
            _ => {
                self.line.push(byte);
                if self.line.len() >= MAX_LINE {
                    self.flush_line();
                }
            }
        }
        self.ris |= INT_TX;
        self.update_irq();
    }

    fn receive(&mut self) -> u64 {
        let byte = self.rx.pop_front().unwrap_or(0);
        if self.rx.is_empty() {
            self.ris &= !INT_RX;
            self.update_irq();
        }
        byte as u64
    }

    fn flags(&self) -> u64 {
        let mut flags = FR_TXFE;
        if self.rx.is_empty() {
            flags |= FR_RXFE;
        }
        flags
    }
}

/// A PL011-style UART.
pub struct Pl011 {
    mmio: MmioDevice<UartState>,
}

impl Pl011 {
    /// Creates a UART covering `range` and raising guest interrupt `irq`.
    pub fn new(
        name: &'static str,
        range: GuestPhysAddrRange,
        irq: u32,
        pending: Arc<PendingIrqs>,
    ) -> AxResult<Self> {
        let state = UartState {
            irq: IrqLine::new(irq, pending),
            rx: VecDeque::new(),
            line: Vec::new(),
            output: Vec::new(),
            imsc: 0,
            ris: INT_TX,
        };
        let mut registers = vec![
            Register::new("UARTDR", UARTDR, AccessWidth::Dword)
                .on_read(|s: &UartState| s.rx.front().copied().unwrap_or(0) as u64)
                .on_write(|s: &mut UartState, v| s.transmit(v as u8)),
            Register::new("UARTFR", UARTFR, AccessWidth::Dword)
                .with_access(RegisterAccess::ReadOnly)
                .on_read(UartState::flags),
            Register::new("UARTIBRD", UARTIBRD, AccessWidth::Dword),
            Register::new("UARTFBRD", UARTFBRD, AccessWidth::Dword),
            Register::new("UARTLCR_H", UARTLCR_H, AccessWidth::Dword),
            Register::new("UARTCR", UARTCR, AccessWidth::Dword).with_value(0x300),
            Register::new("UARTIMSC", UARTIMSC, AccessWidth::Dword)
                .on_read(|s: &UartState| s.imsc)
                .on_write(|s: &mut UartState, v| {
                    s.imsc = v & INT_MASK;
                    s.update_irq();
                }),
            Register::new("UARTRIS", UARTRIS, AccessWidth::Dword)
                .with_access(RegisterAccess::ReadOnly)
                .on_read(|s: &UartState| s.ris),
            Register::new("UARTMIS", UARTMIS, AccessWidth::Dword)
                .with_access(RegisterAccess::ReadOnly)
                .on_read(|s: &UartState| s.ris & s.imsc),
            Register::new("UARTICR", UARTICR, AccessWidth::Dword)
                .with_access(RegisterAccess::WriteOnly)
                .on_write(|s: &mut UartState, v| {
                    s.ris &= !v;
                    s.update_irq();
                }),
        ];
        for (i, (id, id_name)) in PRIMECELL_ID.iter().zip(PRIMECELL_ID_NAMES).enumerate() {
            registers.push(Register::constant(
                id_name,
                UARTPERIPHID0 + i * 4,
                AccessWidth::Dword,
                *id,
            ));
        }
        Ok(Self {
            mmio: MmioDevice::new(name, range, state, registers)?,
        })
    }

    /// The register bank behind the UART.
    pub fn mmio(&self) -> &MmioDevice<UartState> {
        &self.mmio
    }

    /// Emulates one guest access, see [`MmioDevice::handle_access`].
    ///
    /// Reading the data register consumes the received byte it returns.
    pub fn handle_access(
        &mut self,
        offset: usize,
        width: AccessWidth,
        is_write: bool,
        value: u64,
    ) -> AxResult<Option<u64>> {
        let result = self.mmio.handle_access(offset, width, is_write, value)?;
        if !is_write && offset == UARTDR {
            self.mmio.state_mut().receive();
        }
        Ok(result)
    }

    /// Queues bytes for the guest to receive.
    pub fn push_input(&mut self, bytes: &[u8]) {
        let state = self.mmio.state_mut();
        state.rx.extend(bytes.iter().copied());
        if !bytes.is_empty() {
            state.ris |= INT_RX;
            state.update_irq();
        }
    }

    /// Everything the guest has transmitted so far.
    pub fn output(&self) -> &[u8] {
        &self.mmio.state().output
    }

    /// Whether the UART currently drives its interrupt line.
    pub fn irq_asserted(&self) -> bool {
        self.mmio.state().irq.is_asserted()
    }
}
