use std::sync::Arc;

use aero_devices::{InterruptInput, InterruptSource, IrqSink, PlatformInterrupts};
use aero_interrupts::apic_bus::{DeliveryMode, DestinationMode, TriggerMode};
use aero_interrupts::ioapic::{IOAPIC_MMIO_BASE, IOREDTBL_BASE, IOREGSEL, IOWIN};
use aero_interrupts::{IoApicConfig, MsiMessage, MsiRemapper, PicConfig, RemapOutcome, TraceTag};
use aero_platform::{IoPortBus, MmioBus};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn machine(cfg: &IoApicConfig) -> (PlatformInterrupts, IoPortBus, MmioBus) {
    init_tracing();
    let fabric = PlatformInterrupts::new(cfg);
    let mut io = IoPortBus::new();
    let mut mmio = MmioBus::new();
    fabric.attach(&mut io, &mut mmio, &PicConfig::default()).unwrap();
    (fabric, io, mmio)
}

/// Legacy BIOS setup: master at 0x08, slave at 0x70, everything unmasked.
fn program_pic(io: &mut IoPortBus) {
    for (cmd, data, base, icw3) in [(0x20, 0x21, 0x08, 0x04), (0xA0, 0xA1, 0x70, 0x02)] {
        io.write_u8(cmd, 0x11);
        io.write_u8(data, base);
        io.write_u8(data, icw3);
        io.write_u8(data, 0x01);
        io.write_u8(data, 0x00);
    }
}

fn write_rte(mmio: &mut MmioBus, pin: u8, value: u64) {
    let index = u32::from(IOREDTBL_BASE + pin * 2);
    mmio.write_u32(IOAPIC_MMIO_BASE + IOREGSEL, index);
    mmio.write_u32(IOAPIC_MMIO_BASE + IOWIN, value as u32);
    mmio.write_u32(IOAPIC_MMIO_BASE + IOREGSEL, index + 1);
    mmio.write_u32(IOAPIC_MMIO_BASE + IOWIN, (value >> 32) as u32);
}

fn read_rte_low(mmio: &mut MmioBus, pin: u8) -> u32 {
    mmio.write_u32(
        IOAPIC_MMIO_BASE + IOREGSEL,
        u32::from(IOREDTBL_BASE + pin * 2),
    );
    mmio.read_u32(IOAPIC_MMIO_BASE + IOWIN)
}

#[test]
fn keyboard_irq_through_the_pic() {
    let (fabric, mut io, _mmio) = machine(&IoApicConfig::default());
    program_pic(&mut io);

    fabric.pulse_irq(InterruptInput::IsaIrq(1), TraceTag(0x11));
    assert!(fabric.lapic(0).unwrap().external_interrupt_pending());

    let ack = fabric.acknowledge(0).unwrap();
    assert_eq!(ack.vector, 0x09);
    assert_eq!(ack.tag, TraceTag(0x11));
    assert_eq!(ack.source, InterruptSource::Pic);
    assert!(!fabric.lapic(0).unwrap().external_interrupt_pending());
    assert_eq!(fabric.acknowledge(0), None);

    // Non-specific EOI retires IRQ1 from ISR.
    io.write_u8(0x20, 0x0B);
    assert_eq!(io.read_u8(0x20), 0x02);
    io.write_u8(0x20, 0x20);
    assert_eq!(io.read_u8(0x20), 0x00);
}

#[test]
fn slave_irq_reaches_the_cpu_with_the_slave_vector() {
    let (fabric, mut io, _mmio) = machine(&IoApicConfig::default());
    program_pic(&mut io);

    fabric.raise_irq(InterruptInput::IsaIrq(12));
    let ack = fabric.acknowledge(0).unwrap();
    assert_eq!(ack.vector, 0x74);
    assert_eq!(ack.source, InterruptSource::Pic);
}

#[test]
fn level_gsi_waits_for_local_apic_eoi() {
    let (fabric, mut io, mut mmio) = machine(&IoApicConfig::default());
    program_pic(&mut io);
    // Keep the PIC out of the way for IRQ10.
    io.write_u8(0xA1, 0x04);

    write_rte(&mut mmio, 10, 0x0000_0000_0000_8060);
    fabric.raise_irq(InterruptInput::Gsi(10));

    let lapic = fabric.lapic(0).unwrap().clone();
    let ack = fabric.acknowledge(0).unwrap();
    assert_eq!(ack.vector, 0x60);
    assert_eq!(ack.source, InterruptSource::LocalApic);
    assert!(lapic.is_level_triggered(0x60));
    // Remote IRR is visible to the guest.
    assert_ne!(read_rte_low(&mut mmio, 10) & (1 << 14), 0);

    // Line still high: EOI clears remote IRR and the I/O APIC re-delivers.
    assert_eq!(fabric.lapic_eoi(0), Some(0x60));
    assert_eq!(lapic.pending_vector(), Some(0x60));
    fabric.acknowledge(0).unwrap();

    fabric.lower_irq(InterruptInput::Gsi(10));
    fabric.lapic_eoi(0);
    assert_eq!(lapic.pending_vector(), None);
    assert_eq!(read_rte_low(&mut mmio, 10) & (1 << 14), 0);
    assert_eq!(fabric.ioapic().stats().level_sent, 2);
}

#[test]
fn isa_override_routes_timer_to_gsi2() {
    let (mut fabric, mut io, mut mmio) = machine(&IoApicConfig::default());
    // APIC mode: the PIC sees IRQ0 too, so mask it.
    io.write_u8(0x21, 0xFF);
    fabric.router_mut().set_isa_irq_override(0, 2);
    write_rte(&mut mmio, 2, 0x0000_0000_0000_0030);
    write_rte(&mut mmio, 0, 0x0000_0000_0000_0031);

    fabric.pulse_irq(InterruptInput::IsaIrq(0), TraceTag::NONE);
    let ack = fabric.acknowledge(0).unwrap();
    assert_eq!(ack.vector, 0x30);
    assert_eq!(fabric.acknowledge(0), None);
}

#[test]
fn msi_to_a_secondary_cpu() {
    let cfg = IoApicConfig {
        num_cpus: 2,
        ..IoApicConfig::default()
    };
    let (fabric, _io, _mmio) = machine(&cfg);
    let msi = MsiMessage::compatibility(
        1,
        DestinationMode::Physical,
        DeliveryMode::Fixed,
        0x45,
        TriggerMode::Edge,
    );
    fabric.send_msi(Some(0x0010), &msi, TraceTag(9));

    assert_eq!(fabric.acknowledge(0), None);
    let ack = fabric.acknowledge(1).unwrap();
    assert_eq!((ack.vector, ack.tag), (0x45, TraceTag(9)));
    assert_eq!(fabric.acknowledge(2), None);
}

struct DropDevice(u16);

impl MsiRemapper for DropDevice {
    fn remap(&self, requester_id: Option<u16>, _msi: &MsiMessage) -> RemapOutcome {
        if requester_id == Some(self.0) {
            RemapOutcome::Discarded
        } else {
            RemapOutcome::NotPresent
        }
    }
}

#[test]
fn iommu_blocks_one_requester() {
    init_tracing();
    let fabric =
        PlatformInterrupts::with_remapper(&IoApicConfig::default(), Arc::new(DropDevice(0x0008)));
    let msi = MsiMessage::compatibility(
        0,
        DestinationMode::Physical,
        DeliveryMode::Fixed,
        0x50,
        TriggerMode::Edge,
    );

    fabric.send_msi(Some(0x0008), &msi, TraceTag::NONE);
    assert_eq!(fabric.acknowledge(0), None);

    fabric.send_msi(Some(0x0009), &msi, TraceTag::NONE);
    assert_eq!(fabric.acknowledge(0).map(|ack| ack.vector), Some(0x50));
}

#[test]
fn reset_returns_everything_to_power_on() {
    let (fabric, mut io, mut mmio) = machine(&IoApicConfig::default());
    program_pic(&mut io);
    io.write_u8(0x4D1, 0x0C);
    write_rte(&mut mmio, 5, 0x0000_0000_0000_0040);
    fabric.raise_irq(InterruptInput::Gsi(20));
    fabric.raise_irq(InterruptInput::IsaIrq(3));

    fabric.reset();

    assert_eq!(read_rte_low(&mut mmio, 5), 0x0001_0000);
    assert_eq!(io.read_u8(0x21), 0x00);
    assert_eq!(io.read_u8(0x4D1), 0x0C);
    assert!(!fabric.lapic(0).unwrap().external_interrupt_pending());
    assert_eq!(fabric.acknowledge(0), None);
}
