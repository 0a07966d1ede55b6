//! Machine-side wiring of the interrupt controllers: bus adapters for the PIC
//! and I/O APIC, local APIC delivery targets and IRQ routing.
#![forbid(unsafe_code)]

pub mod apic;
pub mod interrupts;
pub mod ioapic;
pub mod irq;
pub mod pic8259;

pub use apic::{ApicSystem, LocalApic};
pub use interrupts::{AcknowledgedInterrupt, InterruptSource, PlatformInterrupts};
pub use irq::{InterruptInput, IrqRouter, IrqSink};
pub use pic8259::{register_pic8259, Pic8259Port, PicPortMap};
