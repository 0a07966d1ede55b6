//! MMIO window of the I/O APIC.

use std::sync::Arc;

use aero_interrupts::ioapic::{IOAPIC_MMIO_BASE, IOAPIC_MMIO_SIZE};
use aero_interrupts::IoApic;
use aero_platform::mmio::{MapError, MmioBus, MmioHandler};
use tracing::debug;

/// Adapts an [`IoApic`] to the MMIO bus.
///
/// The register windows are 32 bits wide. Anything other than an aligned
/// dword access reads as all-ones and writes are dropped.
pub struct IoApicMmio {
    ioapic: Arc<IoApic>,
}

impl IoApicMmio {
    pub fn new(ioapic: Arc<IoApic>) -> Self {
        Self { ioapic }
    }
}

fn is_dword(offset: u64, size: usize) -> bool {
    size == 4 && offset % 4 == 0
}

impl MmioHandler for IoApicMmio {
    fn read(&mut self, offset: u64, size: usize) -> u64 {
        if !is_dword(offset, size) {
            debug!(offset, size, "I/O APIC read with unsupported width or alignment");
            return match size {
                1..=7 => (1u64 << (size * 8)) - 1,
                0 => 0,
                _ => u64::MAX,
            };
        }
        u64::from(self.ioapic.mmio_read(offset))
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) {
        if !is_dword(offset, size) {
            debug!(offset, size, value, "I/O APIC write with unsupported width or alignment dropped");
            return;
        }
        self.ioapic.mmio_write(offset, value as u32);
    }
}

/// Maps the I/O APIC at its architectural base `0xFEC0_0000`.
pub fn map_ioapic(bus: &mut MmioBus, ioapic: Arc<IoApic>) -> Result<(), MapError> {
    map_ioapic_at(bus, IOAPIC_MMIO_BASE, ioapic)
}

pub fn map_ioapic_at(bus: &mut MmioBus, base: u64, ioapic: Arc<IoApic>) -> Result<(), MapError> {
    bus.map_mmio(base, IOAPIC_MMIO_SIZE, Box::new(IoApicMmio::new(ioapic)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aero_interrupts::ioapic::{IOREGSEL, IOWIN};
    use aero_interrupts::{ApicBus, ApicInterrupt, DeliveryStatus, IoApicConfig, TraceTag};

    struct NullBus;

    impl ApicBus for NullBus {
        fn deliver(&self, _interrupt: &ApicInterrupt, _tag: TraceTag) -> DeliveryStatus {
            DeliveryStatus::Discarded
        }
    }

    fn mapped() -> MmioBus {
        let ioapic = Arc::new(IoApic::new(&IoApicConfig::default(), Arc::new(NullBus)));
        let mut bus = MmioBus::new();
        map_ioapic(&mut bus, ioapic).unwrap();
        bus
    }

    #[test]
    fn version_register_through_the_bus() {
        let mut bus = mapped();
        bus.write_u32(IOAPIC_MMIO_BASE + IOREGSEL, 0x01);
        assert_eq!(bus.read_u32(IOAPIC_MMIO_BASE + IOWIN), 0x0017_0020);
    }

    #[test]
    fn narrow_and_misaligned_accesses_are_ignored() {
        let mut bus = mapped();
        bus.write_u32(IOAPIC_MMIO_BASE + IOREGSEL, 0x01);

        // Byte write to the index register does not change the selection.
        bus.write(IOAPIC_MMIO_BASE + IOREGSEL, 1, 0x00);
        bus.write(IOAPIC_MMIO_BASE + 0x02, 4, 0x00);
        assert_eq!(bus.read_u32(IOAPIC_MMIO_BASE + IOWIN), 0x0017_0020);

        assert_eq!(bus.read(IOAPIC_MMIO_BASE + IOWIN, 1), 0xFF);
        assert_eq!(bus.read(IOAPIC_MMIO_BASE + IOWIN, 2), 0xFFFF);
        assert_eq!(bus.read(IOAPIC_MMIO_BASE + IOWIN + 1, 4), 0xFFFF_FFFF);
    }

    #[test]
    fn window_cannot_be_mapped_twice() {
        let ioapic = Arc::new(IoApic::new(&IoApicConfig::default(), Arc::new(NullBus)));
        let mut bus = MmioBus::new();
        map_ioapic(&mut bus, ioapic.clone()).unwrap();
        assert!(matches!(
            map_ioapic(&mut bus, ioapic),
            Err(MapError::Overlap { .. })
        ));
    }
}
