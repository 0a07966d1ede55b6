#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use aero_interrupts::ioapic::{IOREDTBL_BASE, IOREGSEL, IOWIN};
use aero_interrupts::pic8259::{MASTER_CMD, MASTER_DATA, SLAVE_CMD, SLAVE_DATA};
use aero_interrupts::{
    ApicBus, ApicInterrupt, CpuIntLine, DeliveryStatus, DualPic8259, IoApic, IoApicChipType,
    IoApicConfig, TraceTag,
};

/// APIC bus that accepts everything and records what it saw.
#[derive(Default)]
pub struct RecordingBus {
    delivered: Mutex<Vec<(ApicInterrupt, TraceTag)>>,
    pub reject: AtomicBool,
}

impl RecordingBus {
    pub fn take(&self) -> Vec<(ApicInterrupt, TraceTag)> {
        std::mem::take(&mut *self.delivered.lock().unwrap())
    }
}

impl ApicBus for RecordingBus {
    fn deliver(&self, interrupt: &ApicInterrupt, tag: TraceTag) -> DeliveryStatus {
        if self.reject.load(Ordering::SeqCst) {
            return DeliveryStatus::Discarded;
        }
        self.delivered.lock().unwrap().push((*interrupt, tag));
        DeliveryStatus::Accepted
    }
}

#[derive(Default)]
pub struct RecordingLine {
    level: AtomicBool,
    pub raises: AtomicUsize,
}

impl RecordingLine {
    pub fn is_high(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }
}

impl CpuIntLine for RecordingLine {
    fn set_level(&self, asserted: bool) {
        if asserted {
            self.raises.fetch_add(1, Ordering::SeqCst);
        }
        self.level.store(asserted, Ordering::SeqCst);
    }
}

/// Routes controller logs to the test harness; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn new_ioapic(chip: IoApicChipType) -> (IoApic, Arc<RecordingBus>) {
    init_tracing();
    let bus = Arc::new(RecordingBus::default());
    let cfg = IoApicConfig {
        chip_type: chip,
        ..IoApicConfig::default()
    };
    (IoApic::new(&cfg, bus.clone()), bus)
}

pub fn write_rte(ioapic: &IoApic, pin: u8, value: u64) {
    ioapic.mmio_write(IOREGSEL, u32::from(IOREDTBL_BASE + pin * 2));
    ioapic.mmio_write(IOWIN, value as u32);
    ioapic.mmio_write(IOREGSEL, u32::from(IOREDTBL_BASE + pin * 2 + 1));
    ioapic.mmio_write(IOWIN, (value >> 32) as u32);
}

pub fn read_rte(ioapic: &IoApic, pin: u8) -> u64 {
    ioapic.mmio_write(IOREGSEL, u32::from(IOREDTBL_BASE + pin * 2));
    let lo = ioapic.mmio_read(IOWIN);
    ioapic.mmio_write(IOREGSEL, u32::from(IOREDTBL_BASE + pin * 2 + 1));
    let hi = ioapic.mmio_read(IOWIN);
    u64::from(lo) | (u64::from(hi) << 32)
}

/// Standard PC init: master at `master_base`, slave at `slave_base`, given ICW4.
pub fn init_pic(pic: &DualPic8259, master_base: u8, slave_base: u8, icw4: u8) {
    pic.port_write_u8(MASTER_CMD, 0x11);
    pic.port_write_u8(MASTER_DATA, master_base);
    pic.port_write_u8(MASTER_DATA, 0x04);
    pic.port_write_u8(MASTER_DATA, icw4);

    pic.port_write_u8(SLAVE_CMD, 0x11);
    pic.port_write_u8(SLAVE_DATA, slave_base);
    pic.port_write_u8(SLAVE_DATA, 0x02);
    pic.port_write_u8(SLAVE_DATA, icw4);
}

pub fn new_pic() -> (DualPic8259, Arc<RecordingLine>) {
    init_tracing();
    let line = Arc::new(RecordingLine::default());
    let pic = DualPic8259::new(line.clone());
    init_pic(&pic, 0x20, 0x28, 0x01);
    (pic, line)
}
