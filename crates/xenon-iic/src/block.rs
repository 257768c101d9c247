use std::collections::BTreeMap;

use crate::priority::{InterruptType, PRIORITY_TABLE};

/// Ordering key of a pending record: priority rank first, then arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PendingKey {
    rank: u8,
    seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingInterrupt {
    interrupt_type: u8,
    acked: bool,
}

/// Interrupt state of one logical core.
///
/// Records move PENDING -> ACKED -> (removed by EOI), or PENDING -> (removed by cancel). The
/// `signaled` flag mirrors "the pending set is non-empty" and exists so the external line is
/// asserted once per empty -> non-empty transition.
#[derive(Debug)]
pub(crate) struct ControlBlock {
    whoami: u32,
    current_task_priority: u32,
    ipi_dispatch: u32,
    ack: u32,
    mcack: u32,
    eoi: u32,
    pending: BTreeMap<PendingKey, PendingInterrupt>,
    /// Keys of acked records, most recent last. EOI completes from the top.
    in_service: Vec<PendingKey>,
    signaled: bool,
}

impl ControlBlock {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            whoami: index as u32,
            current_task_priority: 0,
            ipi_dispatch: 0,
            ack: u32::from(InterruptType::Spurious.code()),
            mcack: 0,
            eoi: 0,
            pending: BTreeMap::new(),
            in_service: Vec::new(),
            signaled: false,
        }
    }

    pub(crate) fn whoami(&self) -> u32 {
        self.whoami
    }

    pub(crate) fn current_task_priority(&self) -> u32 {
        self.current_task_priority
    }

    pub(crate) fn set_current_task_priority(&mut self, value: u32) {
        self.current_task_priority = value;
    }

    pub(crate) fn ipi_dispatch(&self) -> u32 {
        self.ipi_dispatch
    }

    pub(crate) fn set_ipi_dispatch(&mut self, value: u32) {
        self.ipi_dispatch = value;
    }

    pub(crate) fn ack_latch(&self) -> u32 {
        self.ack
    }

    pub(crate) fn mcack(&self) -> u32 {
        self.mcack
    }

    pub(crate) fn set_mcack(&mut self, value: u32) {
        self.mcack = value;
    }

    pub(crate) fn eoi_shadow(&self) -> u32 {
        self.eoi
    }

    pub(crate) fn signaled(&self) -> bool {
        self.signaled
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queue a new record. Returns `true` when this raised the signal flag.
    pub(crate) fn push(&mut self, interrupt_type: u8, seq: u64) -> bool {
        let key = PendingKey {
            rank: PRIORITY_TABLE.rank(interrupt_type),
            seq,
        };
        self.pending.insert(
            key,
            PendingInterrupt {
                interrupt_type,
                acked: false,
            },
        );
        let raised = !self.signaled;
        self.signaled = true;
        raised
    }

    /// Whether any record is still waiting to be acknowledged.
    pub(crate) fn has_deliverable(&self) -> bool {
        self.pending.values().any(|int| !int.acked)
    }

    /// Claim the best unacknowledged record and latch it into the ACK register.
    pub(crate) fn acknowledge(&mut self) -> Option<u8> {
        let (key, int) = self.pending.iter_mut().find(|(_, int)| !int.acked)?;
        int.acked = true;
        let interrupt_type = int.interrupt_type;
        self.in_service.push(*key);
        self.ack = u32::from(interrupt_type);
        Some(interrupt_type)
    }

    /// Complete the most recently acknowledged record. Returns the completed type, or `None`
    /// when nothing was in service.
    pub(crate) fn end_of_interrupt(&mut self, written: u32) -> Option<u8> {
        self.eoi = written;
        let key = self.in_service.pop()?;
        let completed = self.pending.remove(&key).map(|int| int.interrupt_type);

        self.ack = self
            .in_service
            .last()
            .and_then(|key| self.pending.get(key))
            .map_or(u32::from(InterruptType::Spurious.code()), |int| {
                u32::from(int.interrupt_type)
            });
        if self.pending.is_empty() {
            self.signaled = false;
        }
        completed
    }

    /// Withdraw the oldest unacknowledged record of `interrupt_type`, if any.
    pub(crate) fn cancel(&mut self, interrupt_type: u8) -> bool {
        let Some(key) = self
            .pending
            .iter()
            .find(|(_, int)| int.interrupt_type == interrupt_type && !int.acked)
            .map(|(key, _)| *key)
        else {
            return false;
        };
        self.pending.remove(&key);
        if self.pending.is_empty() {
            self.signaled = false;
        }
        true
    }
}
