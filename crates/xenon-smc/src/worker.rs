//! Background threads of an SMC instance.
//!
//! - `smc-worker` advances tray motion and the clock interrupt.
//! - `smc-uart-tx` (re)opens the transport when the guest reconfigures the UART and sends queued
//!   output.
//! - `smc-uart-rx` blocks in [`UartTransport::receive`] and queues input for the guest.
//!
//! All three share the device lock with the bus-facing register path. Nothing blocks while
//! holding it: transport calls and interrupt routing happen after the guard is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use xenon_platform::InterruptSink;

use crate::device::{SmcState, SMC_INTERRUPT_CPU_MASK};
use crate::uart::{TransportFactory, UartTransport};

/// Upper bound on how long the worker sleeps without re-checking the running flag.
const IDLE_POLL: Duration = Duration::from_millis(100);

const RX_CHUNK: usize = 256;

pub(crate) struct Shared {
    state: Mutex<SmcState>,
    wake: Condvar,
    running: AtomicBool,
    irq: Arc<dyn InterruptSink>,
    factory: Arc<dyn TransportFactory>,
}

impl Shared {
    pub(crate) fn new(
        state: SmcState,
        irq: Arc<dyn InterruptSink>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            state: Mutex::new(state),
            wake: Condvar::new(),
            running: AtomicBool::new(true),
            irq,
            factory,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SmcState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, SmcState>) -> MutexGuard<'a, SmcState> {
        self.wake
            .wait(guard)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, SmcState>,
        timeout: Duration,
    ) -> MutexGuard<'a, SmcState> {
        self.wake
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .0
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wake every thread waiting on the device state.
    pub(crate) fn notify(&self) {
        self.wake.notify_all();
    }

    /// Route interrupts collected under the lock. Must be called without holding it.
    pub(crate) fn route(&self, raised: &[u8]) {
        for &interrupt_type in raised {
            debug!(interrupt_type, "SMC raising interrupt");
            self.irq
                .route_interrupt(interrupt_type, SMC_INTERRUPT_CPU_MASK);
        }
    }

    /// Clear the running flag and detach the transport. Returns the transport so the caller can
    /// shut it down after the lock is released.
    pub(crate) fn stop(&self) -> Option<Arc<dyn UartTransport>> {
        self.running.store(false, Ordering::SeqCst);
        let transport = self.lock().uart.transport.take();
        self.notify();
        transport
    }
}

/// Drop `transport` from the device if it is still the attached one.
fn detach(state: &mut SmcState, transport: &Arc<dyn UartTransport>) {
    let attached = state
        .uart
        .transport
        .as_ref()
        .is_some_and(|current| Arc::ptr_eq(current, transport));
    if attached {
        state.uart.transport = None;
        transport.shutdown();
    }
}

pub(crate) fn run_worker(shared: Arc<Shared>) {
    let mut state = shared.lock();
    while shared.is_running() {
        let now = Instant::now();
        let next = state.tick(now);
        let raised = state.take_raised();
        if !raised.is_empty() {
            drop(state);
            shared.route(&raised);
            state = shared.lock();
            continue;
        }

        let timeout = next
            .map_or(IDLE_POLL, |at| at.saturating_duration_since(now))
            .min(IDLE_POLL);
        state = shared.wait_timeout(state, timeout);
    }
    debug!("SMC worker stopped");
}

pub(crate) fn run_uart_tx(shared: Arc<Shared>) {
    let mut state = shared.lock();
    while shared.is_running() {
        if state.uart.applied != state.core.uart.requested {
            let generation = state.core.uart.requested;
            let target = state.core.uart.target.clone();
            state.uart.applied = generation;
            let old = state.uart.transport.take();
            drop(state);

            if let Some(old) = old {
                old.shutdown();
            }
            let opened = match &target {
                Some(target) => match shared.factory.open(target) {
                    Ok(transport) => {
                        info!(%target, "UART transport attached");
                        Some(transport)
                    }
                    Err(err) => {
                        warn!(%target, error = %err, "failed to open UART transport");
                        None
                    }
                },
                None => {
                    info!("UART disabled");
                    None
                }
            };

            state = shared.lock();
            if let Some(transport) = opened {
                if shared.is_running() && state.core.uart.requested == generation {
                    state.uart.transport = Some(transport);
                    shared.notify();
                } else {
                    transport.shutdown();
                }
            }
            continue;
        }

        if !state.uart.tx.is_empty() {
            let Some(transport) = state.uart.transport.clone() else {
                // Inert UART: output goes nowhere.
                state.uart.tx.clear();
                continue;
            };
            let bytes: Vec<u8> = state.uart.tx.drain(..).collect();
            drop(state);

            let result = transport.send(&bytes);

            state = shared.lock();
            if let Err(err) = result {
                warn!(error = %err, "UART send failed, detaching transport");
                detach(&mut state, &transport);
            }
            continue;
        }

        state = shared.wait(state);
    }
    debug!("SMC UART transmitter stopped");
}

pub(crate) fn run_uart_rx(shared: Arc<Shared>) {
    let mut buf = [0u8; RX_CHUNK];
    let mut state = shared.lock();
    while shared.is_running() {
        let Some(transport) = state.uart.transport.clone() else {
            state = shared.wait(state);
            continue;
        };
        drop(state);

        let result = transport.receive(&mut buf);

        state = shared.lock();
        match result {
            Ok(0) => {
                debug!("UART transport closed");
                detach(&mut state, &transport);
            }
            Ok(n) => state.uart.push_rx(&buf[..n]),
            Err(err) => {
                warn!(error = %err, "UART receive failed, detaching transport");
                detach(&mut state, &transport);
            }
        }
    }
    debug!("SMC UART receiver stopped");
}
