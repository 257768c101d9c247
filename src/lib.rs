//! Xenon southbridge device models.
//!
//! Re-exports the member crates so integration code can depend on a single package:
//! [`xenon_platform`] for the bus and interrupt contracts, [`xenon_iic`] for the interrupt
//! controller and [`xenon_smc`] for the system management controller.
#![forbid(unsafe_code)]

pub use xenon_iic as iic;
pub use xenon_platform as platform;
pub use xenon_smc as smc;
