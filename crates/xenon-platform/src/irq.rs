use std::sync::{Arc, Mutex};

/// Destination for interrupt requests raised by device models.
///
/// `interrupt_type` is the Xenon interrupt code (which doubles as its priority class) and
/// `cpu_mask` selects logical cores, bit N = core N.
pub trait InterruptSink: Send + Sync {
    fn route_interrupt(&self, interrupt_type: u8, cpu_mask: u8);

    /// Withdraw a request that has not been acknowledged yet.
    fn cancel_interrupt(&self, interrupt_type: u8, cpu_mask: u8);
}

impl<T: InterruptSink + ?Sized> InterruptSink for Arc<T> {
    fn route_interrupt(&self, interrupt_type: u8, cpu_mask: u8) {
        (**self).route_interrupt(interrupt_type, cpu_mask);
    }

    fn cancel_interrupt(&self, interrupt_type: u8, cpu_mask: u8) {
        (**self).cancel_interrupt(interrupt_type, cpu_mask);
    }
}

impl InterruptSink for () {
    fn route_interrupt(&self, _interrupt_type: u8, _cpu_mask: u8) {}

    fn cancel_interrupt(&self, _interrupt_type: u8, _cpu_mask: u8) {}
}

/// Per-core external interrupt line, driven by the interrupt controller.
///
/// `assert_line` is called once each time a core goes from "nothing pending" to "something
/// pending". It is never called while the controller holds its internal lock, so
/// implementations may call straight back into the controller.
pub trait InterruptLine: Send + Sync {
    fn assert_line(&self, core: usize);
}

impl<F> InterruptLine for F
where
    F: Fn(usize) + Send + Sync,
{
    fn assert_line(&self, core: usize) {
        self(core)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullInterruptLine;

impl InterruptLine for NullInterruptLine {
    fn assert_line(&self, _core: usize) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqEvent {
    Route { interrupt_type: u8, cpu_mask: u8 },
    Cancel { interrupt_type: u8, cpu_mask: u8 },
}

/// [`InterruptSink`] that only records what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<IrqEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_events(&self) -> Vec<IrqEvent> {
        std::mem::take(&mut *self.events())
    }

    pub fn routed_count(&self, interrupt_type: u8) -> usize {
        self.events()
            .iter()
            .filter(|ev| {
                matches!(ev, IrqEvent::Route { interrupt_type: ty, .. } if *ty == interrupt_type)
            })
            .count()
    }

    fn events(&self) -> std::sync::MutexGuard<'_, Vec<IrqEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl InterruptSink for RecordingSink {
    fn route_interrupt(&self, interrupt_type: u8, cpu_mask: u8) {
        self.events().push(IrqEvent::Route {
            interrupt_type,
            cpu_mask,
        });
    }

    fn cancel_interrupt(&self, interrupt_type: u8, cpu_mask: u8) {
        self.events().push(IrqEvent::Cancel {
            interrupt_type,
            cpu_mask,
        });
    }
}
