use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use xenon_iic::{reg, InterruptType, XenonIic, IIC_BLOCK_COUNT, IIC_BLOCK_STRIDE, PRIORITY_TABLE};
use xenon_platform::{InterruptSink, MmioBus, MmioDevice};

const SPURIOUS: u64 = 0x7C;

fn ack(iic: &XenonIic, core: usize) -> u64 {
    let mut buf = [0u8; 8];
    iic.read_interrupt(core as u64 * IIC_BLOCK_STRIDE + reg::ACK, &mut buf);
    u64::from_be_bytes(buf)
}

fn eoi(iic: &XenonIic, core: usize) {
    iic.write_interrupt(core as u64 * IIC_BLOCK_STRIDE + reg::EOI, &[0u8; 8]);
}

fn interrupt_code() -> impl Strategy<Value = u8> {
    prop::sample::select(InterruptType::ALL.map(InterruptType::code).to_vec())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]
    #[test]
    fn acks_drain_in_priority_then_arrival_order(codes in prop::collection::vec(interrupt_code(), 1..24)) {
        let iic = XenonIic::new();
        for code in &codes {
            iic.gen_interrupt(*code, 0x01);
        }

        let mut expected: Vec<(u8, usize, u8)> = codes
            .iter()
            .enumerate()
            .map(|(seq, code)| (PRIORITY_TABLE.rank(*code), seq, *code))
            .collect();
        expected.sort();

        for (_, _, code) in expected {
            prop_assert_eq!(ack(&iic, 0), u64::from(code));
            eoi(&iic, 0);
        }
        prop_assert_eq!(ack(&iic, 0), SPURIOUS);
        prop_assert_eq!(iic.pending_count(0), 0);
        prop_assert!(!iic.is_signaled(0));
    }
}

#[test]
fn unknown_types_are_delivered_after_known_ones() {
    let iic = XenonIic::new();
    iic.gen_interrupt(0x0C, 0x01);
    iic.gen_interrupt(InterruptType::Ipi1.code(), 0x01);

    assert_eq!(ack(&iic, 0), 0x78);
    assert_eq!(ack(&iic, 0), 0x0C);
}

#[test]
fn extra_eoi_is_harmless() {
    let iic = XenonIic::new();
    iic.gen_interrupt(InterruptType::Clock.code(), 0x01);
    assert_eq!(ack(&iic, 0), 0x74);
    eoi(&iic, 0);
    eoi(&iic, 0);
    eoi(&iic, 0);

    iic.gen_interrupt(InterruptType::Smm.code(), 0x01);
    assert!(iic.check_ext_interrupt(0));
    assert_eq!(ack(&iic, 0), 0x14);
}

#[test]
fn only_reads_covering_the_id_byte_claim() {
    let iic = XenonIic::new();
    iic.gen_interrupt(InterruptType::Smm.code(), 0x01);

    let mut high = [0xFFu8; 4];
    iic.read_interrupt(reg::ACK, &mut high);
    assert_eq!(high, [0; 4]);
    assert!(iic.check_ext_interrupt(0), "upper half leaves the interrupt pending");

    let mut low = [0u8; 4];
    iic.read_interrupt(reg::ACK + 4, &mut low);
    assert_eq!(low, [0, 0, 0, 0x14]);
    assert!(!iic.check_ext_interrupt(0));

    let mut id = [0u8; 1];
    iic.read_interrupt(reg::ACK + 7, &mut id);
    assert_eq!(u64::from(id[0]), SPURIOUS);
    eoi(&iic, 0);
    assert_eq!(iic.pending_count(0), 0);
}

#[test]
fn cancel_removes_only_unacknowledged_records_on_selected_cores() {
    let iic = XenonIic::new();
    let clock = InterruptType::Clock.code();
    iic.gen_interrupt(clock, 0x03);
    assert_eq!(ack(&iic, 1), u64::from(clock));

    iic.cancel_interrupt(clock, 0x03);
    assert_eq!(iic.pending_count(0), 0);
    assert!(!iic.check_ext_interrupt(0));
    assert!(!iic.is_signaled(0));

    // Core 1 already claimed its copy; it stays until EOI.
    assert_eq!(iic.pending_count(1), 1);
    eoi(&iic, 1);
    assert_eq!(iic.pending_count(1), 0);

    // Cancelling something that was never raised does nothing.
    iic.cancel_interrupt(InterruptType::Audio.code(), 0x3F);
}

#[test]
fn eoi_set_task_priority_uses_written_value() {
    let iic = XenonIic::new();
    iic.gen_interrupt(InterruptType::Graphics.code(), 0x04);
    assert_eq!(ack(&iic, 2), 0x58);
    iic.write_interrupt(
        2 * IIC_BLOCK_STRIDE + reg::EOI_SET_CPU_CURRENT_TSK_PRI,
        &0x10u64.to_be_bytes(),
    );

    let mut buf = [0u8; 8];
    iic.read_interrupt(2 * IIC_BLOCK_STRIDE + reg::CURRENT_TSK_PRI, &mut buf);
    assert_eq!(u64::from_be_bytes(buf), 0x10);
    assert_eq!(iic.pending_count(2), 0);
}

#[test]
fn concurrent_generators_lose_nothing() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 50;

    let iic = Arc::new(XenonIic::new());
    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let iic = iic.clone();
            thread::spawn(move || {
                let code = InterruptType::ALL[i].code();
                for _ in 0..PER_THREAD {
                    iic.gen_interrupt(code, 0x3F);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for core in 0..IIC_BLOCK_COUNT {
        assert_eq!(iic.pending_count(core), THREADS * PER_THREAD);
    }

    let mut delivered = 0;
    while ack(&iic, 3) != SPURIOUS {
        delivered += 1;
    }
    assert_eq!(delivered, THREADS * PER_THREAD);
}

#[test]
fn reachable_through_bus_and_sink_trait() {
    let iic = Arc::new(XenonIic::new());
    let base = 0x2000_0000u64;
    let mut bus = MmioBus::new();
    bus.map(base, iic.clone());
    assert_eq!(iic.window_size(), 0x6000);

    let sink: Arc<dyn InterruptSink> = iic.clone();
    sink.route_interrupt(InterruptType::Enet.code(), 0x20);
    assert!(iic.check_ext_interrupt(5));

    let mut buf = [0u8; 8];
    bus.read(base + 5 * IIC_BLOCK_STRIDE + reg::ACK, &mut buf);
    assert_eq!(u64::from_be_bytes(buf), 0x4C);

    sink.route_interrupt(InterruptType::Enet.code(), 0x20);
    sink.cancel_interrupt(InterruptType::Enet.code(), 0x20);
    assert_eq!(iic.pending_count(5), 1);
}
