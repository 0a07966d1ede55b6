//! The interrupt fabric of a PC: PIC pair, I/O APIC, local APICs and the
//! router between device lines and controllers, wired together.

use std::sync::Arc;

use aero_interrupts::{
    DualPic8259, IoApic, IoApicConfig, IrqLevel, MsiMessage, MsiRemapper, PicConfig, TraceTag,
};
use aero_platform::io::IoPortBus;
use aero_platform::mmio::{MapError, MmioBus};
use tracing::{debug, trace};

use crate::apic::{ApicSystem, LocalApic};
use crate::ioapic::map_ioapic;
use crate::irq::{InterruptInput, IrqRouter, IrqSink};
use crate::pic8259::register_pic8259;

/// Which controller produced a vector handed to a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    LocalApic,
    Pic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcknowledgedInterrupt {
    pub vector: u8,
    pub tag: TraceTag,
    pub source: InterruptSource,
}

pub struct PlatformInterrupts {
    apics: Arc<ApicSystem>,
    pic: Arc<DualPic8259>,
    ioapic: Arc<IoApic>,
    router: IrqRouter,
}

impl PlatformInterrupts {
    pub fn new(cfg: &IoApicConfig) -> Self {
        Self::build(cfg, None)
    }

    /// Like [`PlatformInterrupts::new`], with an IOMMU interrupt-remapping unit
    /// in front of the I/O APIC.
    pub fn with_remapper(cfg: &IoApicConfig, remapper: Arc<dyn MsiRemapper>) -> Self {
        Self::build(cfg, Some(remapper))
    }

    fn build(cfg: &IoApicConfig, remapper: Option<Arc<dyn MsiRemapper>>) -> Self {
        let apics = Arc::new(ApicSystem::new(cfg.num_cpus));
        let pic = Arc::new(DualPic8259::new(apics.bsp().clone()));

        let ioapic = IoApic::new(cfg, apics.clone());
        let ioapic = Arc::new(match remapper {
            Some(remapper) => ioapic.with_remapper(remapper),
            None => ioapic,
        });
        apics.connect_ioapic(&ioapic);

        debug!(
            chip = %cfg.chip_type,
            cpus = apics.lapics().len(),
            "interrupt fabric wired"
        );
        let router = IrqRouter::new(pic.clone(), ioapic.clone());
        Self {
            apics,
            pic,
            ioapic,
            router,
        }
    }

    pub fn pic(&self) -> &Arc<DualPic8259> {
        &self.pic
    }

    pub fn ioapic(&self) -> &Arc<IoApic> {
        &self.ioapic
    }

    pub fn apics(&self) -> &Arc<ApicSystem> {
        &self.apics
    }

    pub fn lapic(&self, cpu: usize) -> Option<&Arc<LocalApic>> {
        self.apics.lapic(cpu)
    }

    pub fn router(&self) -> &IrqRouter {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut IrqRouter {
        &mut self.router
    }

    /// Puts the PIC ports and the I/O APIC window on the guest buses.
    pub fn attach(
        &self,
        io: &mut IoPortBus,
        mmio: &mut MmioBus,
        pic_cfg: &PicConfig,
    ) -> Result<(), MapError> {
        register_pic8259(io, self.pic.clone(), pic_cfg);
        map_ioapic(mmio, self.ioapic.clone())
    }

    /// A PCI device's MSI write, tagged with the device's requester ID.
    pub fn send_msi(&self, requester_id: Option<u16>, msi: &MsiMessage, tag: TraceTag) {
        self.ioapic.send_msi(requester_id, msi, tag);
    }

    /// Vector fetch for `cpu`. Local APIC interrupts take precedence over the
    /// PIC, which only ever reaches the bootstrap processor.
    pub fn acknowledge(&self, cpu: usize) -> Option<AcknowledgedInterrupt> {
        let lapic = self.apics.lapic(cpu)?;
        if let Some((vector, tag)) = lapic.acknowledge() {
            return Some(AcknowledgedInterrupt {
                vector,
                tag,
                source: InterruptSource::LocalApic,
            });
        }
        if cpu != 0 || !lapic.external_interrupt_pending() {
            return None;
        }
        lapic.clear_extint();
        let (vector, tag) = self.pic.acknowledge_vector();
        trace!(vector, tag = tag.0, "8259 acknowledge cycle");
        Some(AcknowledgedInterrupt {
            vector,
            tag,
            source: InterruptSource::Pic,
        })
    }

    /// Local APIC EOI register write on `cpu`.
    pub fn lapic_eoi(&self, cpu: usize) -> Option<u8> {
        self.apics.lapic(cpu)?.eoi()
    }

    pub fn reset(&self) {
        self.pic.reset();
        self.ioapic.reset();
        for lapic in self.apics.lapics() {
            lapic.reset();
        }
    }
}

impl IrqSink for PlatformInterrupts {
    fn set_irq(&self, input: InterruptInput, level: IrqLevel, tag: TraceTag) {
        self.router.set_irq(input, level, tag);
    }
}
