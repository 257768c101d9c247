//! Xenon interrupt controller (IIC).
//!
//! Every logical core (six on Xenon) owns a control block with its own register page and an
//! ordered set of pending interrupts. Devices and CPUs raise interrupts with
//! [`XenonIic::gen_interrupt`]; a core claims the best pending one by reading its ACK register
//! and retires it by writing EOI.
//!
//! All state sits behind a single lock. Calls on one core are totally ordered; the external
//! line callback runs after the lock has been released.
#![forbid(unsafe_code)]

mod block;
mod priority;

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};
use xenon_platform::{InterruptLine, InterruptSink, MmioDevice, NullInterruptLine};

use crate::block::ControlBlock;
pub use crate::priority::{interrupt_name, InterruptType, PRIORITY_TABLE};

/// Number of logical cores (and therefore control blocks).
pub const IIC_BLOCK_COUNT: usize = 6;
/// Distance between consecutive control-block pages.
pub const IIC_BLOCK_STRIDE: u64 = 0x1000;
/// Size of the controller's register window.
pub const IIC_WINDOW_SIZE: u64 = IIC_BLOCK_STRIDE * IIC_BLOCK_COUNT as u64;

/// Register offsets within a control block. Each register is 64 bits wide, big-endian.
pub mod reg {
    pub const WHOAMI: u64 = 0x00;
    pub const CURRENT_TSK_PRI: u64 = 0x08;
    pub const IPI_DISPATCH_0: u64 = 0x10;
    pub const ACK: u64 = 0x50;
    pub const ACK_SET_CPU_CURRENT_TSK_PRI: u64 = 0x58;
    pub const EOI: u64 = 0x60;
    pub const EOI_SET_CPU_CURRENT_TSK_PRI: u64 = 0x68;
    pub const INT_MCACK: u64 = 0x70;
}

const ALL_CORES_MASK: u8 = (1 << IIC_BLOCK_COUNT) - 1;

struct IicState {
    blocks: [ControlBlock; IIC_BLOCK_COUNT],
    next_seq: u64,
}

impl IicState {
    fn new() -> Self {
        Self {
            blocks: std::array::from_fn(ControlBlock::new),
            next_seq: 0,
        }
    }

    /// Queue `interrupt_type` on every selected core; returns the cores whose signal flag went
    /// up.
    fn generate(&mut self, interrupt_type: u8, cpu_mask: u8) -> u8 {
        let mut raised = 0u8;
        for core in selected_cores(cpu_mask) {
            let seq = self.next_seq;
            self.next_seq += 1;
            if self.blocks[core].push(interrupt_type, seq) {
                raised |= 1 << core;
            }
        }
        raised
    }

    fn cancel(&mut self, interrupt_type: u8, cpu_mask: u8) {
        for core in selected_cores(cpu_mask) {
            if self.blocks[core].cancel(interrupt_type) {
                trace!(core, int = interrupt_name(interrupt_type), "iic cancel");
            }
        }
    }
}

fn selected_cores(cpu_mask: u8) -> impl Iterator<Item = usize> {
    let mask = cpu_mask & ALL_CORES_MASK;
    (0..IIC_BLOCK_COUNT).filter(move |core| mask & (1 << core) != 0)
}

/// Splits a window offset into (control block, register, byte within the 64-bit register).
fn decode(addr: u64) -> Option<(usize, u64, usize)> {
    let block = ((addr >> 12) & 0x7) as usize;
    if block >= IIC_BLOCK_COUNT {
        return None;
    }
    let offset = addr & 0xFF;
    Some((block, offset & !0x7, (offset & 0x7) as usize))
}

pub struct XenonIic {
    state: Mutex<IicState>,
    line: Arc<dyn InterruptLine>,
}

impl Default for XenonIic {
    fn default() -> Self {
        Self::new()
    }
}

impl XenonIic {
    /// Controller whose external lines go nowhere; cores poll
    /// [`XenonIic::check_ext_interrupt`].
    pub fn new() -> Self {
        Self::with_line(Arc::new(NullInterruptLine))
    }

    pub fn with_line(line: Arc<dyn InterruptLine>) -> Self {
        Self {
            state: Mutex::new(IicState::new()),
            line,
        }
    }

    fn state(&self) -> MutexGuard<'_, IicState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn assert_lines(&self, raised: u8) {
        for core in selected_cores(raised) {
            self.line.assert_line(core);
        }
    }

    /// Guest write to a control-block register. `addr` is relative to the controller base.
    pub fn write_interrupt(&self, addr: u64, data: &[u8]) {
        let Some((core, reg, byte)) = decode(addr) else {
            return;
        };
        if data.is_empty() || byte >= 8 {
            return;
        }

        let mut raised = 0u8;
        {
            let mut state = self.state();
            let current = register_value(&state.blocks[core], reg);
            let mut bytes = current.to_be_bytes();
            let end = (byte + data.len()).min(8);
            bytes[byte..end].copy_from_slice(&data[..end - byte]);
            let value = u64::from_be_bytes(bytes) as u32;

            match reg {
                reg::CURRENT_TSK_PRI => state.blocks[core].set_current_task_priority(value),
                reg::IPI_DISPATCH_0 => {
                    state.blocks[core].set_ipi_dispatch(value);
                    let interrupt_type = (value & 0xFF) as u8;
                    let targets = ((value >> 16) & u32::from(ALL_CORES_MASK)) as u8;
                    trace!(
                        core,
                        int = interrupt_name(interrupt_type),
                        targets,
                        "iic ipi dispatch"
                    );
                    raised = state.generate(interrupt_type, targets);
                }
                reg::EOI | reg::EOI_SET_CPU_CURRENT_TSK_PRI => {
                    let block = &mut state.blocks[core];
                    let completed = block.end_of_interrupt(value);
                    if reg == reg::EOI_SET_CPU_CURRENT_TSK_PRI {
                        block.set_current_task_priority(value);
                    }
                    if let Some(interrupt_type) = completed {
                        trace!(core, int = interrupt_name(interrupt_type), "iic eoi");
                    }
                }
                reg::INT_MCACK => state.blocks[core].set_mcack(value),
                reg::WHOAMI | reg::ACK | reg::ACK_SET_CPU_CURRENT_TSK_PRI => {}
                _ => debug!(core, reg, value, "iic write to unknown register"),
            }
        }
        self.assert_lines(raised);
    }

    /// Guest read of a control-block register. `addr` is relative to the controller base.
    ///
    /// Reading ACK claims the highest-priority pending interrupt for the core. The ID sits in the
    /// register's low-order byte, so only an access that covers that byte claims; narrower reads
    /// return the last claimed ID without side effects.
    pub fn read_interrupt(&self, addr: u64, data: &mut [u8]) {
        data.fill(0);
        let Some((core, reg, byte)) = decode(addr) else {
            return;
        };
        if byte >= 8 {
            return;
        }

        let value = {
            let mut state = self.state();
            let block = &mut state.blocks[core];
            match reg {
                reg::ACK | reg::ACK_SET_CPU_CURRENT_TSK_PRI if byte + data.len() >= 8 => {
                    let claimed = block.acknowledge();
                    match claimed {
                        Some(interrupt_type) => {
                            trace!(core, int = interrupt_name(interrupt_type), "iic ack");
                            if reg == reg::ACK_SET_CPU_CURRENT_TSK_PRI {
                                block.set_current_task_priority(u32::from(interrupt_type));
                            }
                            u64::from(interrupt_type)
                        }
                        None => u64::from(InterruptType::Spurious.code()),
                    }
                }
                _ => register_value(block, reg),
            }
        };

        let bytes = value.to_be_bytes();
        let n = data.len().min(8 - byte);
        data[..n].copy_from_slice(&bytes[byte..byte + n]);
    }

    /// External interrupt line state for `core`: true while it has an unacknowledged interrupt.
    pub fn check_ext_interrupt(&self, core: usize) -> bool {
        if core >= IIC_BLOCK_COUNT {
            return false;
        }
        self.state().blocks[core].has_deliverable()
    }

    /// Queue `interrupt_type` for every core selected in `cpu_mask`.
    pub fn gen_interrupt(&self, interrupt_type: u8, cpu_mask: u8) {
        trace!(int = interrupt_name(interrupt_type), cpu_mask, "iic gen");
        let raised = self.state().generate(interrupt_type, cpu_mask);
        self.assert_lines(raised);
    }

    /// Withdraw a not-yet-acknowledged `interrupt_type` from every core selected in `cpu_mask`.
    pub fn cancel_interrupt(&self, interrupt_type: u8, cpu_mask: u8) {
        self.state().cancel(interrupt_type, cpu_mask);
    }

    /// Records queued on `core`, acknowledged or not.
    pub fn pending_count(&self, core: usize) -> usize {
        if core >= IIC_BLOCK_COUNT {
            return 0;
        }
        self.state().blocks[core].pending_len()
    }

    /// Whether `core`'s signal flag is raised (its pending set is non-empty).
    pub fn is_signaled(&self, core: usize) -> bool {
        core < IIC_BLOCK_COUNT && self.state().blocks[core].signaled()
    }
}

fn register_value(block: &ControlBlock, reg: u64) -> u64 {
    let value = match reg {
        reg::WHOAMI => block.whoami(),
        reg::CURRENT_TSK_PRI => block.current_task_priority(),
        reg::IPI_DISPATCH_0 => block.ipi_dispatch(),
        reg::ACK | reg::ACK_SET_CPU_CURRENT_TSK_PRI => block.ack_latch(),
        reg::EOI | reg::EOI_SET_CPU_CURRENT_TSK_PRI => block.eoi_shadow(),
        reg::INT_MCACK => block.mcack(),
        _ => 0,
    };
    u64::from(value)
}

impl InterruptSink for XenonIic {
    fn route_interrupt(&self, interrupt_type: u8, cpu_mask: u8) {
        self.gen_interrupt(interrupt_type, cpu_mask);
    }

    fn cancel_interrupt(&self, interrupt_type: u8, cpu_mask: u8) {
        XenonIic::cancel_interrupt(self, interrupt_type, cpu_mask);
    }
}

impl MmioDevice for XenonIic {
    fn window_size(&self) -> u64 {
        IIC_WINDOW_SIZE
    }

    fn read(&self, offset: u64, data: &mut [u8]) {
        if offset >= IIC_WINDOW_SIZE {
            data.fill(0xFF);
            return;
        }
        self.read_interrupt(offset, data);
    }

    fn write(&self, offset: u64, data: &[u8]) {
        if offset >= IIC_WINDOW_SIZE {
            return;
        }
        self.write_interrupt(offset, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CLOCK: u8 = InterruptType::Clock.code();
    const SMM: u8 = InterruptType::Smm.code();

    fn block_addr(core: usize, reg: u64) -> u64 {
        core as u64 * IIC_BLOCK_STRIDE + reg
    }

    fn read_u64(iic: &XenonIic, core: usize, reg: u64) -> u64 {
        let mut buf = [0u8; 8];
        iic.read_interrupt(block_addr(core, reg), &mut buf);
        u64::from_be_bytes(buf)
    }

    fn write_u64(iic: &XenonIic, core: usize, reg: u64, value: u64) {
        iic.write_interrupt(block_addr(core, reg), &value.to_be_bytes());
    }

    #[test]
    fn whoami_reports_block_index_and_ignores_writes() {
        let iic = XenonIic::new();
        for core in 0..IIC_BLOCK_COUNT {
            write_u64(&iic, core, reg::WHOAMI, 0xFFFF);
            assert_eq!(read_u64(&iic, core, reg::WHOAMI), core as u64);
        }
    }

    #[test]
    fn ack_with_nothing_pending_reads_spurious() {
        let iic = XenonIic::new();
        assert_eq!(read_u64(&iic, 0, reg::ACK), 0x7C);
        assert_eq!(iic.pending_count(0), 0);
    }

    #[test]
    fn narrow_reads_return_big_endian_slices() {
        let iic = XenonIic::new();
        write_u64(&iic, 2, reg::CURRENT_TSK_PRI, 0x1234_5678);

        let mut low = [0u8; 4];
        iic.read_interrupt(block_addr(2, reg::CURRENT_TSK_PRI + 4), &mut low);
        assert_eq!(low, [0x12, 0x34, 0x56, 0x78]);

        let mut high = [0u8; 4];
        iic.read_interrupt(block_addr(2, reg::CURRENT_TSK_PRI), &mut high);
        assert_eq!(high, [0; 4]);
    }

    #[test]
    fn ack_set_task_priority_latches_claimed_type() {
        let iic = XenonIic::new();
        iic.gen_interrupt(CLOCK, 0x01);
        assert_eq!(read_u64(&iic, 0, reg::ACK_SET_CPU_CURRENT_TSK_PRI), CLOCK as u64);
        assert_eq!(read_u64(&iic, 0, reg::CURRENT_TSK_PRI), CLOCK as u64);
        assert_eq!(read_u64(&iic, 0, reg::ACK), 0x7C);
    }

    #[test]
    fn eoi_set_task_priority_completes_and_stores_priority() {
        let iic = XenonIic::new();
        iic.gen_interrupt(SMM, 0x01);
        assert_eq!(read_u64(&iic, 0, reg::ACK), SMM as u64);

        write_u64(&iic, 0, reg::EOI_SET_CPU_CURRENT_TSK_PRI, 0x08);
        assert_eq!(iic.pending_count(0), 0);
        assert!(!iic.is_signaled(0));
        assert_eq!(read_u64(&iic, 0, reg::CURRENT_TSK_PRI), 0x08);
    }

    #[test]
    fn ipi_dispatch_targets_cores_in_mask() {
        let iic = XenonIic::new();
        let ipi = u64::from(InterruptType::Ipi4.code()) | (0b10_0110 << 16);
        write_u64(&iic, 0, reg::IPI_DISPATCH_0, ipi);

        let hit: Vec<usize> = (0..IIC_BLOCK_COUNT)
            .filter(|core| iic.check_ext_interrupt(*core))
            .collect();
        assert_eq!(hit, vec![1, 2, 5]);
        assert_eq!(read_u64(&iic, 5, reg::ACK), 0x08);
    }

    #[test]
    fn line_callback_fires_on_empty_to_nonempty_only() {
        let hits = Arc::new(AtomicUsize::new(0));
        let line = {
            let hits = hits.clone();
            move |core: usize| {
                assert_eq!(core, 3);
                hits.fetch_add(1, Ordering::SeqCst);
            }
        };
        let iic = XenonIic::with_line(Arc::new(line));

        iic.gen_interrupt(CLOCK, 1 << 3);
        iic.gen_interrupt(SMM, 1 << 3);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        read_u64(&iic, 3, reg::ACK);
        write_u64(&iic, 3, reg::EOI, 0);
        read_u64(&iic, 3, reg::ACK);
        write_u64(&iic, 3, reg::EOI, 0);
        assert!(!iic.is_signaled(3));

        iic.gen_interrupt(CLOCK, 1 << 3);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn line_callback_may_reenter_the_controller() {
        let iic = Arc::new_cyclic(|weak: &std::sync::Weak<XenonIic>| {
            let weak = weak.clone();
            XenonIic::with_line(Arc::new(move |core: usize| {
                if let Some(iic) = weak.upgrade() {
                    assert!(iic.check_ext_interrupt(core));
                }
            }))
        });
        iic.gen_interrupt(CLOCK, 0x01);
        assert!(iic.check_ext_interrupt(0));
    }

    #[test]
    fn missing_blocks_and_unknown_registers_are_inert() {
        let iic = XenonIic::new();
        let mut buf = [0xAAu8; 8];
        iic.read_interrupt(6 * IIC_BLOCK_STRIDE + reg::ACK, &mut buf);
        assert_eq!(buf, [0; 8]);

        write_u64(&iic, 0, 0x30, 0xFFFF);
        assert_eq!(read_u64(&iic, 0, 0x30), 0);

        iic.gen_interrupt(CLOCK, 0xC0);
        assert!((0..IIC_BLOCK_COUNT).all(|core| iic.pending_count(core) == 0));
    }
}
