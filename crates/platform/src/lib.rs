//! Guest-visible bus plumbing shared by the device models.
//!
//! [`io::IoPortBus`] dispatches x86 port I/O, [`mmio::MmioBus`] dispatches physical MMIO
//! windows. Both float unmapped accesses high, matching an undriven ISA/PCI bus.

pub mod io;
pub mod mmio;

pub use io::{IoPortBus, PortIoDevice};
pub use mmio::{MapError, MmioBus, MmioHandler};
