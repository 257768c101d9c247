//! Bus-facing contracts shared by the Xenon I/O device models.
//!
//! Device crates implement [`MmioDevice`] for their register windows and talk to the interrupt
//! fabric through [`InterruptSink`]. The bus/bridge side owns the devices and forwards raw guest
//! accesses unmodified; [`MmioBus`] is a minimal implementation of that side used by the CLI and
//! by integration tests.
#![forbid(unsafe_code)]

pub mod irq;
pub mod mmio;
pub mod pci;

pub use irq::{InterruptLine, InterruptSink, IrqEvent, NullInterruptLine, RecordingSink};
pub use mmio::{clamp_access, MmioBus, MmioDevice};
pub use pci::{PciBdf, PciConfigSpace, PCI_CONFIG_SPACE_SIZE};
