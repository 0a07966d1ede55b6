//! Local APICs and the bus that fans interrupts out to them.

mod local_apic;

pub use local_apic::{LocalApic, APIC_BROADCAST};

use std::sync::Arc;

use aero_interrupts::apic_bus::DeliveryMode;
use aero_interrupts::{ApicBus, ApicInterrupt, DeliveryStatus, IoApic, TraceTag};
use tracing::debug;

/// All local APICs of the machine, as seen from the I/O APIC and MSI path.
///
/// Fixed interrupts go to every matching APIC. Lowest-priority interrupts go
/// to the first match only, since task priorities are not modelled.
#[derive(Debug)]
pub struct ApicSystem {
    lapics: Vec<Arc<LocalApic>>,
}

impl ApicSystem {
    /// Creates `num_cpus` local APICs with IDs `0..num_cpus`. APIC ID 0xFF is
    /// the broadcast address, so at most 255 CPUs are addressable.
    pub fn new(num_cpus: u32) -> Self {
        let count = num_cpus.clamp(1, u32::from(APIC_BROADCAST)) as u8;
        Self::from_lapics((0..count).map(|id| Arc::new(LocalApic::new(id))).collect())
    }

    /// An empty list gets a single APIC with ID 0.
    pub fn from_lapics(mut lapics: Vec<Arc<LocalApic>>) -> Self {
        if lapics.is_empty() {
            lapics.push(Arc::new(LocalApic::new(0)));
        }
        Self { lapics }
    }

    pub fn lapic(&self, cpu: usize) -> Option<&Arc<LocalApic>> {
        self.lapics.get(cpu)
    }

    /// The bootstrap processor's APIC. The PIC's INTR line is wired here.
    pub fn bsp(&self) -> &Arc<LocalApic> {
        &self.lapics[0]
    }

    pub fn lapics(&self) -> &[Arc<LocalApic>] {
        &self.lapics
    }

    /// Makes every local APIC broadcast level-triggered EOIs to `ioapic`.
    pub fn connect_ioapic(&self, ioapic: &Arc<IoApic>) {
        for lapic in &self.lapics {
            lapic.connect_ioapic(ioapic);
        }
    }
}

impl ApicBus for ApicSystem {
    fn deliver(&self, interrupt: &ApicInterrupt, tag: TraceTag) -> DeliveryStatus {
        let mut targets = self.lapics.iter().filter(|lapic| lapic.accepts(interrupt));

        let status = if interrupt.delivery_mode == DeliveryMode::LowestPriority {
            targets
                .next()
                .map_or(DeliveryStatus::Discarded, |lapic| lapic.deliver(interrupt, tag))
        } else {
            targets.fold(DeliveryStatus::Discarded, |status, lapic| {
                match lapic.deliver(interrupt, tag) {
                    DeliveryStatus::Accepted => DeliveryStatus::Accepted,
                    DeliveryStatus::Discarded => status,
                }
            })
        };

        if !status.is_accepted() {
            debug!(
                destination = interrupt.destination,
                vector = interrupt.vector,
                "no local APIC accepted the interrupt"
            );
        }
        status
    }
}
