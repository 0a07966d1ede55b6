//! Routing of device interrupt lines to the PIC and the I/O APIC.

use std::sync::Arc;

use aero_interrupts::{DualPic8259, IoApic, IrqLevel, TraceTag};
use tracing::{debug, trace};

/// An interrupt input as a device model names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterruptInput {
    /// Legacy ISA IRQ 0-15.
    IsaIrq(u8),
    /// Global system interrupt, i.e. an I/O APIC pin.
    Gsi(u32),
}

/// Something device models can drive an interrupt line into.
pub trait IrqSink {
    fn set_irq(&self, input: InterruptInput, level: IrqLevel, tag: TraceTag);

    fn raise_irq(&self, input: InterruptInput) {
        self.set_irq(input, IrqLevel::High, TraceTag::NONE);
    }

    fn lower_irq(&self, input: InterruptInput) {
        self.set_irq(input, IrqLevel::Low, TraceTag::NONE);
    }

    /// Forces an edge even if the line is already asserted.
    fn pulse_irq(&self, input: InterruptInput, tag: TraceTag) {
        self.set_irq(input, IrqLevel::FlipFlop, tag);
    }
}

/// Mirrors ISA IRQs onto both the PIC and the I/O APIC.
///
/// Each ISA IRQ is wired to the PIC input of the same number and to a GSI,
/// identity by default and overridable the way an ACPI interrupt source
/// override remaps IRQ0 to GSI2. GSIs at or above 16 reach only the I/O APIC.
/// Which controller actually delivers is up to the guest's masking.
pub struct IrqRouter {
    pic: Arc<DualPic8259>,
    ioapic: Arc<IoApic>,
    isa_irq_to_gsi: [u32; 16],
}

impl IrqRouter {
    pub fn new(pic: Arc<DualPic8259>, ioapic: Arc<IoApic>) -> Self {
        let mut isa_irq_to_gsi = [0u32; 16];
        for (irq, gsi) in isa_irq_to_gsi.iter_mut().enumerate() {
            *gsi = irq as u32;
        }
        Self {
            pic,
            ioapic,
            isa_irq_to_gsi,
        }
    }

    pub fn pic(&self) -> &Arc<DualPic8259> {
        &self.pic
    }

    pub fn ioapic(&self) -> &Arc<IoApic> {
        &self.ioapic
    }

    /// Redirects ISA IRQ `isa_irq` to `gsi` on the I/O APIC side.
    pub fn set_isa_irq_override(&mut self, isa_irq: u8, gsi: u32) {
        match self.isa_irq_to_gsi.get_mut(usize::from(isa_irq)) {
            Some(slot) => {
                debug!(isa_irq, gsi, "ISA IRQ override");
                *slot = gsi;
            }
            None => debug!(isa_irq, gsi, "override for non-ISA IRQ ignored"),
        }
    }

    pub fn isa_irq_to_gsi(&self, isa_irq: u8) -> Option<u32> {
        self.isa_irq_to_gsi.get(usize::from(isa_irq)).copied()
    }

    /// ISA IRQ whose GSI is `gsi`, if any.
    pub fn gsi_to_isa_irq(&self, gsi: u32) -> Option<u8> {
        self.isa_irq_to_gsi
            .iter()
            .position(|&mapped| mapped == gsi)
            .map(|irq| irq as u8)
    }
}

impl IrqSink for IrqRouter {
    fn set_irq(&self, input: InterruptInput, level: IrqLevel, tag: TraceTag) {
        trace!(?input, ?level, tag = tag.0, "IRQ line change");
        let (isa_irq, gsi) = match input {
            InterruptInput::IsaIrq(irq) => match self.isa_irq_to_gsi(irq) {
                Some(gsi) => (Some(irq), gsi),
                None => {
                    debug!(irq, "nonexistent ISA IRQ ignored");
                    return;
                }
            },
            InterruptInput::Gsi(gsi) => (self.gsi_to_isa_irq(gsi), gsi),
        };

        if let Some(irq) = isa_irq {
            self.pic.set_irq(irq, level, tag);
        }
        self.ioapic.set_irq(gsi, level, tag);
    }
}
