//! Xenon system management controller (SMC).
//!
//! The SMC is the southbridge microcontroller that handles power sequencing, the DVD tray, the
//! front panel, sensors and a debug UART. It is modeled at the register level: the guest talks to
//! it through a 0x100-byte PCI register window, mostly by pushing 16-byte command frames through
//! a FIFO and reading responses back. The firmware itself is not executed.
//!
//! [`Smc`] is the bus-facing device. It owns three background threads (see `worker`) which are
//! joined when it is dropped.
#![forbid(unsafe_code)]

pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod fifo;
pub mod regs;
pub mod state;
pub mod uart;
mod worker;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::info;
use xenon_platform::{InterruptSink, MmioDevice};

pub use crate::config::{ConfigError, SmcConfig};
pub use crate::device::{SmcState, SMC_BAR0_BASE, SMC_DEVICE_ID, SMC_VENDOR_ID};
pub use crate::error::{Result, SmcError, UnknownCode};
pub use crate::fifo::{Frame, FRAME_LEN, RESPONSE_CAPACITY};
pub use crate::regs::{AvPackType, FifoCommand, PowerOnReason, TrayState, SMC_WINDOW_SIZE};
pub use crate::uart::{
    loopback_pair, HostTransportFactory, LoopbackFactory, LoopbackTransport, TransportFactory,
    UartTarget, UartTransport,
};

use crate::worker::Shared;

pub struct Smc {
    shared: Arc<Shared>,
    threads: Vec<(&'static str, JoinHandle<()>)>,
}

impl Smc {
    /// Bring up an SMC that opens real host transports for its UART.
    pub fn new(config: SmcConfig, irq: Arc<dyn InterruptSink>) -> Result<Self> {
        Self::with_transport_factory(config, irq, Arc::new(HostTransportFactory))
    }

    pub fn with_transport_factory(
        config: SmcConfig,
        irq: Arc<dyn InterruptSink>,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            power_on_reason = ?config.power_on_reason,
            avpack = ?config.avpack,
            "starting SMC"
        );

        let state = SmcState::new(config, Instant::now());
        let mut smc = Self {
            shared: Arc::new(Shared::new(state, irq, factory)),
            threads: Vec::with_capacity(3),
        };
        // On failure `smc` is dropped here, which stops and joins whatever already started.
        smc.spawn("smc-worker", worker::run_worker)?;
        smc.spawn("smc-uart-tx", worker::run_uart_tx)?;
        smc.spawn("smc-uart-rx", worker::run_uart_rx)?;
        Ok(smc)
    }

    fn spawn(&mut self, name: &'static str, body: fn(Arc<Shared>)) -> Result<()> {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || body(shared))
            .map_err(|source| SmcError::ThreadSpawn { name, source })?;
        self.threads.push((name, handle));
        Ok(())
    }

    pub fn power_on_reason(&self) -> PowerOnReason {
        self.shared.lock().core.power_on_reason
    }

    pub fn set_power_on_reason(&self, reason: PowerOnReason) {
        self.shared.lock().core.power_on_reason = reason;
    }

    pub fn avpack(&self) -> AvPackType {
        self.shared.lock().core.avpack
    }

    pub fn set_avpack(&self, avpack: AvPackType) {
        self.shared.lock().core.avpack = avpack;
    }

    pub fn tray_state(&self) -> TrayState {
        self.shared.lock().core.tray.state()
    }

    /// Front-panel eject button.
    pub fn press_eject(&self) {
        self.shared.lock().core.tray.toggle(Instant::now());
        self.shared.notify();
    }

    /// Last value the guest wrote to the UART configuration register.
    pub fn uart_config(&self) -> u32 {
        self.shared.lock().core.uart.word
    }

    /// Whether a UART transport is currently attached.
    pub fn uart_attached(&self) -> bool {
        self.shared.lock().uart.transport.is_some()
    }
}

impl MmioDevice for Smc {
    fn window_size(&self) -> u64 {
        SMC_WINDOW_SIZE as u64
    }

    fn read(&self, offset: u64, data: &mut [u8]) {
        self.shared.lock().read(offset, data);
    }

    fn write(&self, offset: u64, data: &[u8]) {
        let raised = {
            let mut state = self.shared.lock();
            state.write(offset, data, Instant::now());
            state.take_raised()
        };
        self.shared.notify();
        self.shared.route(&raised);
    }

    fn config_read(&self, offset: u64, data: &mut [u8]) {
        self.shared.lock().pci.read_bytes(offset, data);
    }

    fn config_write(&self, offset: u64, data: &[u8]) {
        self.shared.lock().pci.write_bytes(offset, data);
    }
}

impl Drop for Smc {
    fn drop(&mut self) {
        if let Some(transport) = self.shared.stop() {
            transport.shutdown();
        }
        for (name, handle) in self.threads.drain(..) {
            if handle.join().is_err() {
                panic!("SMC thread `{name}` panicked");
            }
        }
        info!("SMC stopped");
    }
}
