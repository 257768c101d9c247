//! Register-level behaviour of the SMC, independent of threads and locking.
//!
//! [`SmcState`] is what the device lock protects. Every access takes the current time as an
//! argument so the whole model can be driven deterministically.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, trace};
use xenon_platform::PciConfigSpace;

use crate::command;
use crate::config::SmcConfig;
use crate::fifo::{FifoBuffer, Frame, ResponseQueue};
use crate::regs::*;
use crate::state::CoreState;
use crate::uart::{UartTransport, RX_CAPACITY};

pub const SMC_VENDOR_ID: u16 = 0x1414;
pub const SMC_DEVICE_ID: u16 = 0x580D;
/// Firmware-assigned base of the register window.
pub const SMC_BAR0_BASE: u32 = 0xEA00_1000;

/// Interrupt codes the SMC raises (core 0 only).
pub const SMC_SMI_INTERRUPT: u8 = 0x14;
pub const SMC_CLOCK_INTERRUPT: u8 = 0x74;
pub const SMC_INTERRUPT_CPU_MASK: u8 = 0x01;

/// UART queues plus the transport currently attached to them.
#[derive(Default)]
pub struct UartQueues {
    pub rx: VecDeque<u8>,
    pub tx: VecDeque<u8>,
    /// Configuration generation the UART threads have acted on.
    pub applied: u64,
    pub transport: Option<Arc<dyn UartTransport>>,
}

impl std::fmt::Debug for UartQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UartQueues")
            .field("rx", &self.rx.len())
            .field("tx", &self.tx.len())
            .field("applied", &self.applied)
            .field("attached", &self.transport.is_some())
            .finish()
    }
}

impl UartQueues {
    pub fn push_rx(&mut self, bytes: &[u8]) {
        let room = RX_CAPACITY.saturating_sub(self.rx.len());
        if bytes.len() > room {
            debug!(dropped = bytes.len() - room, "UART receive buffer full");
        }
        self.rx.extend(&bytes[..bytes.len().min(room)]);
    }
}

#[derive(Debug)]
pub struct SmcState {
    pub config: SmcConfig,
    pub regs: RegisterFile,
    pub fifo: FifoBuffer,
    pub responses: ResponseQueue,
    pub core: CoreState,
    pub uart: UartQueues,
    pub pci: PciConfigSpace,
    next_clock: Option<Instant>,
    /// Interrupt codes to route once the lock has been dropped.
    raised: Vec<u8>,
}

impl SmcState {
    pub fn new(config: SmcConfig, now: Instant) -> Self {
        let mut pci = PciConfigSpace::new(SMC_VENDOR_ID, SMC_DEVICE_ID);
        pci.set_class_code(0x0C, 0x05, 0x00, 0x01);
        pci.set_mmio_bar(0, SMC_WINDOW_SIZE as u32, SMC_BAR0_BASE);
        pci.set_interrupt_pin(1);

        Self {
            core: CoreState::new(&config, now),
            config,
            regs: RegisterFile::default(),
            fifo: FifoBuffer::default(),
            responses: ResponseQueue::default(),
            uart: UartQueues::default(),
            pci,
            next_clock: None,
            raised: Vec::new(),
        }
    }

    /// Interrupts raised since the last call.
    pub fn take_raised(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.raised)
    }

    pub fn read(&mut self, offset: u64, data: &mut [u8]) {
        let n = xenon_platform::clamp_access(SMC_WINDOW_SIZE as u64, offset, data.len());
        let (inside, outside) = data.split_at_mut(n);
        outside.fill(0xFF);

        let mut done = 0;
        while done < inside.len() {
            let addr = offset + done as u64;
            let reg = addr & !0x3;
            let byte = (addr - reg) as usize;
            let len = (4 - byte).min(inside.len() - done);
            self.read_register(reg, byte, &mut inside[done..done + len]);
            done += len;
        }
    }

    pub fn write(&mut self, offset: u64, data: &[u8], now: Instant) {
        let n = xenon_platform::clamp_access(SMC_WINDOW_SIZE as u64, offset, data.len());
        let data = &data[..n];

        let mut done = 0;
        while done < data.len() {
            let addr = offset + done as u64;
            let reg = addr & !0x3;
            let byte = (addr - reg) as usize;
            let len = (4 - byte).min(data.len() - done);
            self.write_register(reg, byte, &data[done..done + len], now);
            done += len;
        }
    }

    fn read_register(&mut self, reg: u64, byte: usize, out: &mut [u8]) {
        if reg == FIFO_OUT_MSG {
            for b in out.iter_mut() {
                *b = self.responses.read_byte();
            }
            return;
        }

        let value = match reg {
            UART_IN if byte == 0 => self.uart.rx.pop_front().map_or(0, u32::from),
            UART_IN => 0,
            UART_STATUS => {
                let rx = if self.uart.rx.is_empty() {
                    0
                } else {
                    UART_STATUS_RX_AVAILABLE
                };
                rx | UART_STATUS_TX_READY
            }
            FIFO_IN_STATUS => FIFO_STATUS_READY,
            FIFO_OUT_STATUS => {
                if self.responses.is_empty() {
                    0
                } else {
                    FIFO_STATUS_READY
                }
            }
            _ => self.regs.read_u32(reg),
        };
        out.copy_from_slice(&value.to_le_bytes()[byte..byte + out.len()]);
    }

    fn write_register(&mut self, reg: u64, byte: usize, bytes: &[u8], now: Instant) {
        let mut written = [0u8; 4];
        written[byte..byte + bytes.len()].copy_from_slice(bytes);
        let written = u32::from_le_bytes(written);

        match reg {
            FIFO_IN_MSG => {
                self.regs.write_bytes(reg + byte as u64, bytes);
                let mut frames = Vec::new();
                self.fifo.push(bytes, |frame| frames.push(*frame));
                for frame in frames {
                    self.dispatch(&frame, now);
                }
            }
            FIFO_IN_STATUS => {
                if written & FIFO_STATUS_READY != 0 {
                    if let Some(frame) = self.fifo.flush() {
                        self.dispatch(&frame, now);
                    }
                }
            }
            // READY lives in the low byte; writes to the upper bytes carry no request.
            FIFO_OUT_STATUS if byte != 0 => {}
            FIFO_OUT_STATUS => {
                if written & FIFO_STATUS_READY != 0 {
                    self.responses.rewind();
                } else if written == 0 {
                    self.responses.discard_current();
                }
            }
            UART_OUT => {
                self.regs.write_bytes(reg + byte as u64, bytes);
                if byte == 0 && self.core.uart.word != 0 {
                    self.uart.tx.push_back(bytes[0]);
                }
            }
            UART_CONFIG => {
                self.regs.write_bytes(reg + byte as u64, bytes);
                let word = self.regs.read_u32(reg);
                self.core.uart.reconfigure(word, &self.config);
                info!(
                    word = format_args!("{word:#010x}"),
                    line = self.core.uart.line_config(),
                    target = ?self.core.uart.target,
                    "UART reconfigured"
                );
            }
            SMI_INT_ACK => {
                self.regs.write_bytes(reg + byte as u64, bytes);
                let pending = self.regs.read_u32(SMI_INT_PENDING) & !written;
                self.regs.write_u32(SMI_INT_PENDING, pending);
                // Responses still queued re-raise the SMI.
                self.signal_response();
            }
            CLOCK_INT_STATUS => {
                let status = self.regs.read_u32(reg) & !written;
                self.regs.write_u32(reg, status);
            }
            UART_STATUS | SMI_INT_PENDING | FIFO_OUT_MSG => {
                trace!(reg, "write to read-only SMC register ignored");
            }
            _ => self.regs.write_bytes(reg + byte as u64, bytes),
        }
    }

    /// Run one command frame through the command table.
    pub fn dispatch(&mut self, frame: &Frame, now: Instant) {
        if let Some(response) = command::dispatch(&mut self.core, frame, now) {
            if self.responses.push(response) {
                self.signal_response();
            }
        }
    }

    fn signal_response(&mut self) {
        if self.responses.is_empty() || self.regs.read_u32(SMI_INT_ENABLE) & INT_BIT == 0 {
            return;
        }
        let pending = self.regs.read_u32(SMI_INT_PENDING);
        if pending & INT_BIT == 0 {
            self.regs.write_u32(SMI_INT_PENDING, pending | INT_BIT);
            self.raised.push(SMC_SMI_INTERRUPT);
        }
    }

    /// Advance time-driven state: tray motion and the clock interrupt. Returns when the next
    /// piece of work is due.
    pub fn tick(&mut self, now: Instant) -> Option<Instant> {
        self.core.poll_tray(now);

        if self.regs.read_u32(CLOCK_INT_ENABLE) & INT_BIT == 0 {
            self.next_clock = None;
        } else {
            let due = *self.next_clock.get_or_insert(now + self.config.clock_interval);
            if now >= due {
                let status = self.regs.read_u32(CLOCK_INT_STATUS);
                if status & INT_BIT == 0 {
                    self.regs.write_u32(CLOCK_INT_STATUS, status | INT_BIT);
                    self.raised.push(SMC_CLOCK_INTERRUPT);
                }
                self.next_clock = Some(now + self.config.clock_interval);
            }
        }

        match (self.core.tray.deadline(), self.next_clock) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::RESPONSE_CAPACITY;
    use crate::regs::TrayState;

    fn state() -> (SmcState, Instant) {
        let now = Instant::now();
        (SmcState::new(SmcConfig::default(), now), now)
    }

    fn read_u32(state: &mut SmcState, reg: u64) -> u32 {
        let mut buf = [0u8; 4];
        state.read(reg, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn write_u32(state: &mut SmcState, reg: u64, value: u32, now: Instant) {
        state.write(reg, &value.to_le_bytes(), now);
    }

    fn send_command(state: &mut SmcState, bytes: &[u8], now: Instant) {
        let mut frame = [0u8; 16];
        frame[..bytes.len()].copy_from_slice(bytes);
        write_u32(state, FIFO_IN_STATUS, FIFO_STATUS_READY, now);
        for word in frame.chunks(4) {
            state.write(FIFO_IN_MSG, word, now);
        }
        write_u32(state, FIFO_IN_STATUS, 0, now);
    }

    fn receive_response(state: &mut SmcState, now: Instant) -> Option<[u8; 16]> {
        if read_u32(state, FIFO_OUT_STATUS) & FIFO_STATUS_READY == 0 {
            return None;
        }
        write_u32(state, FIFO_OUT_STATUS, FIFO_STATUS_READY, now);
        let mut frame = [0u8; 16];
        for word in frame.chunks_mut(4) {
            state.read(FIFO_OUT_MSG, word);
        }
        write_u32(state, FIFO_OUT_STATUS, 0, now);
        Some(frame)
    }

    #[test]
    fn version_query_roundtrips_through_fifo_registers() {
        let (mut state, now) = state();
        send_command(&mut state, &[0x12], now);
        let resp = receive_response(&mut state, now).unwrap();
        assert_eq!(resp[..4], [0x12, 0x41, 0x02, 0x03]);
        assert_eq!(receive_response(&mut state, now), None);
    }

    #[test]
    fn drained_response_reads_zero() {
        let (mut state, now) = state();
        send_command(&mut state, &[0x0F], now);
        let mut buf = [0u8; 4];
        for _ in 0..4 {
            state.read(FIFO_OUT_MSG, &mut buf);
        }
        state.read(FIFO_OUT_MSG, &mut buf);
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn partial_frame_flush_dispatches_zero_padded_command() {
        let (mut state, now) = state();
        state.write(FIFO_IN_MSG, &[0x8B, 0x60], now);
        assert_eq!(state.core.tray.state(), TrayState::Closed);

        write_u32(&mut state, FIFO_IN_STATUS, FIFO_STATUS_READY, now);
        assert_eq!(state.core.tray.state(), TrayState::OpenRequest);
        assert_eq!(state.fifo.cursor(), 0);
    }

    #[test]
    fn fifo_in_status_always_reads_ready() {
        let (mut state, now) = state();
        write_u32(&mut state, FIFO_IN_STATUS, 0, now);
        assert_eq!(read_u32(&mut state, FIFO_IN_STATUS), FIFO_STATUS_READY);
    }

    #[test]
    fn smi_raised_once_per_ack_while_responses_remain() {
        let (mut state, now) = state();
        write_u32(&mut state, SMI_INT_ENABLE, INT_BIT, now);

        send_command(&mut state, &[0x01], now);
        send_command(&mut state, &[0x0A], now);
        assert_eq!(state.take_raised(), vec![SMC_SMI_INTERRUPT]);
        assert_eq!(read_u32(&mut state, SMI_INT_PENDING), INT_BIT);

        receive_response(&mut state, now).unwrap();
        write_u32(&mut state, SMI_INT_ACK, INT_BIT, now);
        assert_eq!(state.take_raised(), vec![SMC_SMI_INTERRUPT]);

        receive_response(&mut state, now).unwrap();
        write_u32(&mut state, SMI_INT_ACK, INT_BIT, now);
        assert!(state.take_raised().is_empty());
        assert_eq!(read_u32(&mut state, SMI_INT_PENDING), 0);
    }

    #[test]
    fn no_smi_without_enable() {
        let (mut state, now) = state();
        send_command(&mut state, &[0x01], now);
        assert!(state.take_raised().is_empty());
        assert_eq!(read_u32(&mut state, SMI_INT_PENDING), 0);
    }

    #[test]
    fn clock_interrupt_fires_each_interval_until_acknowledged() {
        let (mut state, t0) = state();
        let interval = state.config.clock_interval;
        write_u32(&mut state, CLOCK_INT_ENABLE, INT_BIT, t0);

        assert_eq!(state.tick(t0), Some(t0 + interval));
        assert!(state.take_raised().is_empty());

        state.tick(t0 + interval);
        assert_eq!(state.take_raised(), vec![SMC_CLOCK_INTERRUPT]);
        assert_eq!(read_u32(&mut state, CLOCK_INT_STATUS), INT_BIT);

        // Still unacknowledged: status stays set, no second interrupt.
        state.tick(t0 + interval * 2);
        assert!(state.take_raised().is_empty());

        write_u32(&mut state, CLOCK_INT_STATUS, INT_BIT, t0);
        assert_eq!(read_u32(&mut state, CLOCK_INT_STATUS), 0);
        state.tick(t0 + interval * 3);
        assert_eq!(state.take_raised(), vec![SMC_CLOCK_INTERRUPT]);

        write_u32(&mut state, CLOCK_INT_ENABLE, 0, t0);
        assert_eq!(state.tick(t0 + interval * 4), None);
    }

    #[test]
    fn uart_registers_move_bytes_through_queues() {
        let (mut state, now) = state();
        write_u32(&mut state, UART_OUT, u32::from(b'x'), now);
        assert!(state.uart.tx.is_empty(), "disabled UART drops output");

        write_u32(&mut state, UART_CONFIG, 0x0000_01E6, now);
        assert_eq!(state.core.uart.requested, 1);
        write_u32(&mut state, UART_OUT, u32::from(b'x'), now);
        assert_eq!(state.uart.tx, [b'x']);

        assert_eq!(read_u32(&mut state, UART_STATUS), UART_STATUS_TX_READY);
        state.uart.push_rx(b"ab");
        assert_eq!(
            read_u32(&mut state, UART_STATUS),
            UART_STATUS_TX_READY | UART_STATUS_RX_AVAILABLE
        );
        assert_eq!(read_u32(&mut state, UART_IN), u32::from(b'a'));
        assert_eq!(read_u32(&mut state, UART_IN), u32::from(b'b'));
        assert_eq!(read_u32(&mut state, UART_IN), 0);
    }

    #[test]
    fn rx_buffer_is_bounded() {
        let mut queues = UartQueues::default();
        queues.push_rx(&vec![0u8; RX_CAPACITY + 10]);
        assert_eq!(queues.rx.len(), RX_CAPACITY);
    }

    #[test]
    fn response_queue_is_bounded() {
        let (mut state, now) = state();
        for _ in 0..RESPONSE_CAPACITY + 8 {
            send_command(&mut state, &[0x12], now);
        }
        assert_eq!(state.responses.len(), RESPONSE_CAPACITY);

        let mut drained = 0;
        while receive_response(&mut state, now).is_some() {
            drained += 1;
        }
        assert_eq!(drained, RESPONSE_CAPACITY);
    }

    #[test]
    fn upper_byte_writes_to_fifo_out_status_keep_the_response() {
        let (mut state, now) = state();
        send_command(&mut state, &[0x12], now);
        write_u32(&mut state, FIFO_OUT_STATUS, FIFO_STATUS_READY, now);
        let mut buf = [0u8; 4];
        state.read(FIFO_OUT_MSG, &mut buf);
        assert_eq!(buf, [0x12, 0x41, 0x02, 0x03]);

        state.write(FIFO_OUT_STATUS + 1, &[0], now);
        state.write(FIFO_OUT_STATUS + 2, &[0, 0], now);
        assert_eq!(state.responses.len(), 1);
        assert_eq!(read_u32(&mut state, FIFO_OUT_STATUS), FIFO_STATUS_READY);

        state.write(FIFO_OUT_STATUS, &[0], now);
        assert!(state.responses.is_empty());
    }

    #[test]
    fn out_of_window_accesses_float_and_drop() {
        let (mut state, now) = state();
        state.write(0xFE, &[1, 2, 3, 4], now);
        let mut buf = [0u8; 4];
        state.read(0xFE, &mut buf);
        assert_eq!(buf, [1, 2, 0xFF, 0xFF]);

        state.read(0x200, &mut buf);
        assert_eq!(buf, [0xFF; 4]);
    }

    #[test]
    fn pci_header_identifies_the_smc() {
        let (state, _) = state();
        assert_eq!(state.pci.vendor_id(), 0x1414);
        assert_eq!(state.pci.device_id(), 0x580D);
        assert_eq!(state.pci.bar_base(0), Some(SMC_BAR0_BASE));
    }
}
