mod common;

use aero_interrupts::apic_bus::TriggerMode;
use aero_interrupts::ioapic::{IoApicState, RedirectionEntry};
use aero_interrupts::pic8259::{DualPicState, ELCR_SLAVE, MASTER_DATA};
use aero_interrupts::{InterruptError, IoApicChipType, IrqLevel, TraceTag};

use common::{new_ioapic, new_pic};

#[test]
fn ioapic_state_survives_json_round_trip() {
    let (ioapic, bus) = new_ioapic(IoApicChipType::Dmar);
    ioapic
        .program_redirection_entry(
            5,
            RedirectionEntry::fixed(0x35, 0).with_trigger_mode(TriggerMode::Level),
        )
        .unwrap();
    ioapic.set_irq(5, IrqLevel::High, TraceTag(0x55));
    ioapic.set_irq(6, IrqLevel::High, TraceTag(0x66));
    assert_eq!(bus.take().len(), 1);

    let json = serde_json::to_string(&ioapic.save_state()).unwrap();
    let state: IoApicState = serde_json::from_str(&json).unwrap();

    let (restored, restored_bus) = new_ioapic(IoApicChipType::Dmar);
    restored.load_state(&state).unwrap();
    assert_eq!(restored.save_state(), ioapic.save_state());
    // Loading does not deliver anything by itself.
    assert!(restored_bus.take().is_empty());

    // Remote IRR came along: the EOI re-delivers the still-asserted line.
    restored.set_eoi(0x35);
    let delivered = restored_bus.take();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].1, TraceTag(0x55));
}

#[test]
fn ioapic_rejects_foreign_snapshots() {
    let (ich9, _) = new_ioapic(IoApicChipType::Ich9);
    let (old, _) = new_ioapic(IoApicChipType::I82093aa);
    assert_eq!(
        old.load_state(&ich9.save_state()),
        Err(InterruptError::SnapshotMismatch("chipset type"))
    );

    let mut state = ich9.save_state();
    state.irr = 1 << 30;
    assert_eq!(
        ich9.load_state(&state),
        Err(InterruptError::SnapshotMismatch("pin bitmap"))
    );
}

#[test]
fn pic_state_round_trip_restores_cpu_line() {
    let (pic, _line) = new_pic();
    pic.port_write_u8(ELCR_SLAVE, 0x08);
    pic.port_write_u8(MASTER_DATA, 0x01);
    pic.set_irq(11, IrqLevel::High, TraceTag(0xB));

    let json = serde_json::to_string(&pic.save_state()).unwrap();
    let state: DualPicState = serde_json::from_str(&json).unwrap();

    let (restored, restored_line) = new_pic();
    restored.reset();
    assert!(!restored_line.is_high());
    restored.load_state(&state).unwrap();
    assert!(restored_line.is_high());
    assert_eq!(restored.save_state(), pic.save_state());
    assert_eq!(restored.acknowledge_vector(), (0x2B, TraceTag(0xB)));
}

#[test]
fn pic_rejects_impossible_init_step() {
    let (pic, _line) = new_pic();
    let mut state = pic.save_state();
    state.slave.init_step = 9;
    assert!(pic.load_state(&state).is_err());
}
