//! Interrupt controller models for a PC-compatible platform.
//!
//! The crate contains the cascaded 8259A PIC pair and the I/O APIC, plus the
//! delivery contracts ([`ApicBus`], [`CpuIntLine`], [`MsiRemapper`]) through
//! which they talk to the rest of the machine. Each controller owns its
//! register state behind a single lock, so all operations take `&self` and
//! may be driven from any number of device or vCPU threads.
#![forbid(unsafe_code)]

pub mod apic_bus;
pub mod config;
pub mod error;
pub mod ioapic;
pub mod line;
pub mod msi;
pub mod pic8259;
pub mod tag;

mod sync;

pub use apic_bus::{ApicBus, ApicInterrupt, CpuIntLine, DeliveryStatus};
pub use config::{IoApicChipType, IoApicConfig, PicConfig};
pub use error::{InterruptError, Result};
pub use ioapic::IoApic;
pub use line::IrqLevel;
pub use msi::{MsiMessage, MsiRemapper, RemapOutcome};
pub use pic8259::DualPic8259;
pub use tag::TraceTag;
