//! I/O APIC model.
//!
//! Guest software programs the controller through two 32-bit windows in its
//! MMIO page: an index register at offset 0x00 selecting an indirect register
//! and a data register at 0x10 accessing it. ICH9-class parts also decode a
//! direct EOI register at 0x40.
//!
//! Pins are driven by device models through [`IoApic::set_irq`]; accepted
//! interrupts leave through the [`ApicBus`]. Level-triggered entries stay
//! blocked by their remote IRR bit until a matching EOI arrives, either from
//! the local APIC broadcast ([`IoApic::set_eoi`]) or the EOI register.

mod chip;
mod rte;

pub use chip::{ChipParams, VERSION_82093AA, VERSION_ICH9};
pub use rte::{bits as rte_bits, RedirectionEntry};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::apic_bus::{ApicBus, ApicInterrupt, DeliveryStatus};
use crate::config::{IoApicChipType, IoApicConfig};
use crate::error::{InterruptError, Result};
use crate::line::IrqLevel;
use crate::msi::{MsiMessage, MsiRemapper, RemapOutcome};
use crate::sync::{lock, try_lock};
use crate::tag::TraceTag;

pub const IOAPIC_MMIO_BASE: u64 = 0xFEC0_0000;
pub const IOAPIC_MMIO_SIZE: u64 = 0x1000;

pub const IOREGSEL: u64 = 0x00;
pub const IOWIN: u64 = 0x10;
pub const IOEOI: u64 = 0x40;

pub const IOAPICID: u8 = 0x00;
pub const IOAPICVER: u8 = 0x01;
pub const IOAPICARB: u8 = 0x02;
pub const IOREDTBL_BASE: u8 = 0x10;

/// The register decoder only looks at the low byte of the offset.
const MMIO_REG_MASK: u64 = 0xFF;

/// Counters exposed for observability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoApicStats {
    pub set_irq: u64,
    pub set_eoi: u64,
    pub mmio_reads: u64,
    pub mmio_writes: u64,
    pub redundant_edge: u64,
    pub redundant_level: u64,
    pub suppressed_level: u64,
    pub level_sent: u64,
    pub eoi_received: u64,
    pub iommu_remapped_intr: u64,
    pub iommu_discarded_intr: u64,
    pub iommu_remapped_msi: u64,
    pub iommu_discarded_msi: u64,
    pub lock_contention: u64,
}

/// Flat dump of the guest-visible and internal register state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoApicState {
    pub chip_type: IoApicChipType,
    pub id: u8,
    pub index: u8,
    pub redirection_table: Vec<RedirectionEntry>,
    /// Pending-level bitmap, one bit per pin.
    pub irr: u32,
    pub flip_flop: u32,
    pub tags: Vec<TraceTag>,
}

struct IoApicRegs {
    id: u8,
    index: u8,
    redir_table: Vec<RedirectionEntry>,
    irr: u32,
    flip_flop: u32,
    tags: Vec<TraceTag>,
    stats: IoApicStats,
}

impl IoApicRegs {
    fn new(num_pins: usize) -> Self {
        Self {
            id: 0,
            index: 0,
            redir_table: vec![RedirectionEntry::MASKED; num_pins],
            irr: 0,
            flip_flop: 0,
            tags: vec![TraceTag::NONE; num_pins],
            stats: IoApicStats::default(),
        }
    }

    fn reset(&mut self) {
        self.id = 0;
        self.index = 0;
        self.irr = 0;
        self.flip_flop = 0;
        self.redir_table.fill(RedirectionEntry::MASKED);
        self.tags.fill(TraceTag::NONE);
    }

    fn is_pending(&self, pin: usize) -> bool {
        self.irr & (1 << pin) != 0
    }
}

pub struct IoApic {
    chip: IoApicChipType,
    params: ChipParams,
    num_cpus: u32,
    pci_address: Option<u16>,
    regs: Mutex<IoApicRegs>,
    apic_bus: Arc<dyn ApicBus>,
    remapper: Option<Arc<dyn MsiRemapper>>,
    contention: AtomicU64,
}

impl std::fmt::Debug for IoApic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoApic")
            .field("chip", &self.chip)
            .field("num_cpus", &self.num_cpus)
            .field("pci_address", &self.pci_address)
            .field("remapper", &self.remapper.is_some())
            .finish_non_exhaustive()
    }
}

impl IoApic {
    pub fn new(config: &IoApicConfig, apic_bus: Arc<dyn ApicBus>) -> Self {
        let params = config.chip_type.params();
        debug!(
            chip = %config.chip_type,
            cpus = config.num_cpus,
            version = params.version,
            pins = params.num_pins(),
            "I/O APIC created"
        );
        Self {
            chip: config.chip_type,
            params,
            num_cpus: config.num_cpus,
            pci_address: config.pci_address,
            regs: Mutex::new(IoApicRegs::new(params.num_pins() as usize)),
            apic_bus,
            remapper: None,
            contention: AtomicU64::new(0),
        }
    }

    /// Attaches an interrupt-remapping unit consulted before every delivery.
    pub fn with_remapper(mut self, remapper: Arc<dyn MsiRemapper>) -> Self {
        self.remapper = Some(remapper);
        self
    }

    pub fn chip_type(&self) -> IoApicChipType {
        self.chip
    }

    pub fn params(&self) -> &ChipParams {
        &self.params
    }

    pub fn num_pins(&self) -> u32 {
        self.params.num_pins()
    }

    pub fn num_cpus(&self) -> u32 {
        self.num_cpus
    }

    /// Drives input `pin`. Pins the chipset does not have are ignored.
    pub fn set_irq(&self, pin: u32, level: IrqLevel, tag: TraceTag) {
        if pin >= self.num_pins() {
            debug!(pin, pins = self.num_pins(), "set_irq on nonexistent pin ignored");
            return;
        }
        let mut regs = lock(&self.regs);
        self.set_irq_locked(&mut regs, pin as usize, level, tag);
    }

    /// Like [`IoApic::set_irq`] but never blocks and reports bad pins.
    pub fn try_set_irq(&self, pin: u32, level: IrqLevel, tag: TraceTag) -> Result<()> {
        if pin >= self.num_pins() {
            return Err(InterruptError::PinOutOfRange {
                pin,
                pins: self.num_pins(),
            });
        }
        let mut regs = try_lock(&self.regs, &self.contention)?;
        self.set_irq_locked(&mut regs, pin as usize, level, tag);
        Ok(())
    }

    /// Delivers a message-signalled interrupt, bypassing the redirection table.
    ///
    /// `requester_id` is the PCI requester of the write. Interrupts raised by
    /// the IOMMU itself carry none and are never remapped.
    pub fn send_msi(&self, requester_id: Option<u16>, msi: &MsiMessage, tag: TraceTag) {
        let mut regs = lock(&self.regs);
        self.send_msi_locked(&mut regs, requester_id, msi, tag);
    }

    pub fn try_send_msi(
        &self,
        requester_id: Option<u16>,
        msi: &MsiMessage,
        tag: TraceTag,
    ) -> Result<()> {
        let mut regs = try_lock(&self.regs, &self.contention)?;
        self.send_msi_locked(&mut regs, requester_id, msi, tag);
        Ok(())
    }

    /// EOI broadcast from a local APIC for `vector`.
    pub fn set_eoi(&self, vector: u8) {
        let mut regs = lock(&self.regs);
        self.set_eoi_locked(&mut regs, vector);
    }

    pub fn try_set_eoi(&self, vector: u8) -> Result<()> {
        let mut regs = try_lock(&self.regs, &self.contention)?;
        self.set_eoi_locked(&mut regs, vector);
        Ok(())
    }

    pub fn mmio_read(&self, offset: u64) -> u32 {
        let mut regs = lock(&self.regs);
        self.mmio_read_locked(&mut regs, offset)
    }

    pub fn mmio_write(&self, offset: u64, value: u32) {
        let mut regs = lock(&self.regs);
        self.mmio_write_locked(&mut regs, offset, value);
    }

    pub fn try_mmio_read(&self, offset: u64) -> Result<u32> {
        let mut regs = try_lock(&self.regs, &self.contention)?;
        Ok(self.mmio_read_locked(&mut regs, offset))
    }

    pub fn try_mmio_write(&self, offset: u64, value: u32) -> Result<()> {
        let mut regs = try_lock(&self.regs, &self.contention)?;
        self.mmio_write_locked(&mut regs, offset, value);
        Ok(())
    }

    pub fn reset(&self) {
        let mut regs = lock(&self.regs);
        regs.reset();
        debug!(chip = %self.chip, "I/O APIC reset");
    }

    pub fn redirection_entry(&self, pin: u32) -> Option<RedirectionEntry> {
        lock(&self.regs).redir_table.get(pin as usize).copied()
    }

    /// Host-side programming of a whole entry, as firmware tables would leave it.
    ///
    /// Goes through the variant's write mask like a guest write would.
    pub fn program_redirection_entry(&self, pin: u32, entry: RedirectionEntry) -> Result<()> {
        if pin >= self.num_pins() {
            return Err(InterruptError::PinOutOfRange {
                pin,
                pins: self.num_pins(),
            });
        }
        let mut regs = lock(&self.regs);
        let idx = pin as usize;
        let mask = self.params.write_mask;
        let current = &mut regs.redir_table[idx];
        current.write_half(false, entry.0 as u32, mask);
        current.write_half(true, (entry.0 >> 32) as u32, mask);
        if regs.is_pending(idx) {
            self.signal_locked(&mut regs, idx);
        }
        Ok(())
    }

    /// Whether the pending-level bit for `pin` is set.
    pub fn is_pending(&self, pin: u32) -> bool {
        pin < self.num_pins() && lock(&self.regs).is_pending(pin as usize)
    }

    pub fn stats(&self) -> IoApicStats {
        let mut stats = lock(&self.regs).stats;
        stats.lock_contention = self.contention.load(Ordering::Relaxed);
        stats
    }

    pub fn save_state(&self) -> IoApicState {
        let regs = lock(&self.regs);
        IoApicState {
            chip_type: self.chip,
            id: regs.id,
            index: regs.index,
            redirection_table: regs.redir_table.clone(),
            irr: regs.irr,
            flip_flop: regs.flip_flop,
            tags: regs.tags.clone(),
        }
    }

    /// Restores a dump taken by [`IoApic::save_state`]. Nothing is re-delivered.
    pub fn load_state(&self, state: &IoApicState) -> Result<()> {
        if state.chip_type != self.chip {
            return Err(InterruptError::SnapshotMismatch("chipset type"));
        }
        let pins = self.num_pins() as usize;
        if state.redirection_table.len() != pins || state.tags.len() != pins {
            return Err(InterruptError::SnapshotMismatch("redirection table size"));
        }
        let pin_mask = pin_mask(pins);
        if state.irr & !pin_mask != 0 || state.flip_flop & !pin_mask != 0 {
            return Err(InterruptError::SnapshotMismatch("pin bitmap"));
        }

        let mut regs = lock(&self.regs);
        regs.id = state.id & self.params.id_mask;
        regs.index = state.index;
        regs.redir_table.copy_from_slice(&state.redirection_table);
        regs.irr = state.irr;
        regs.flip_flop = state.flip_flop;
        regs.tags.copy_from_slice(&state.tags);

        for (pin, rte) in regs.redir_table.iter().enumerate() {
            if rte.remote_irr() && !rte.is_level() {
                tracing::error!(pin, rte = rte.0, "restored edge entry has remote IRR set");
            }
        }
        Ok(())
    }

    fn set_irq_locked(&self, regs: &mut IoApicRegs, pin: usize, level: IrqLevel, tag: TraceTag) {
        regs.stats.set_irq += 1;
        let bit = 1u32 << pin;
        trace!(pin, ?level, tag = tag.0, "set_irq");

        match level {
            IrqLevel::Low => {
                regs.irr &= !bit;
                regs.tags[pin].clear();
            }
            IrqLevel::FlipFlop => {
                regs.flip_flop |= bit;
                regs.tags[pin] = tag;
                regs.irr |= bit;
                self.signal_locked(regs, pin);
            }
            IrqLevel::High => {
                regs.flip_flop &= !bit;
                let was_pending = regs.irr & bit != 0;
                if regs.redir_table[pin].is_level() {
                    if was_pending {
                        regs.stats.redundant_level += 1;
                        trace!(pin, "redundant level-triggered assert");
                    }
                } else if was_pending {
                    regs.stats.redundant_edge += 1;
                    trace!(pin, "redundant edge-triggered assert");
                    return;
                }
                regs.tags[pin].merge(tag);
                regs.irr |= bit;
                self.signal_locked(regs, pin);
            }
        }
    }

    /// Tries to deliver the interrupt for `pin`, whose pending bit is set.
    fn signal_locked(&self, regs: &mut IoApicRegs, pin: usize) {
        let rte = regs.redir_table[pin];
        if rte.is_masked() {
            return;
        }
        if rte.is_level() && rte.remote_irr() {
            regs.stats.suppressed_level += 1;
            trace!(pin, vector = rte.vector(), "level interrupt suppressed by remote IRR");
            return;
        }

        let mut interrupt = rte.to_apic_interrupt();
        if let Some(remapper) = &self.remapper {
            let msi = rte.to_msi(self.chip);
            if msi.is_remappable() {
                trace!(
                    pin,
                    index = msi.interrupt_index(),
                    shv = msi.sub_handle_valid(),
                    "remappable-format entry"
                );
            }
            match remapper.remap(self.pci_address, &msi) {
                RemapOutcome::NotPresent => {}
                RemapOutcome::Remapped(out) => {
                    interrupt.apply_msi(&out);
                    regs.stats.iommu_remapped_intr += 1;
                    trace!(pin, vector = interrupt.vector, "interrupt remapped by IOMMU");
                }
                RemapOutcome::Discarded => {
                    regs.stats.iommu_discarded_intr += 1;
                    debug!(pin, "interrupt discarded by IOMMU");
                    return;
                }
            }
        }

        let tag = regs.tags[pin];
        trace!(
            pin,
            vector = interrupt.vector,
            dest = interrupt.destination,
            dest_mode = ?interrupt.destination_mode,
            trigger = ?interrupt.trigger_mode,
            "signalling interrupt"
        );
        match self.apic_bus.deliver(&interrupt, tag) {
            DeliveryStatus::Accepted => {
                if rte.is_level() {
                    regs.redir_table[pin].set_remote_irr(true);
                    regs.stats.level_sent += 1;
                } else if regs.flip_flop & (1 << pin) != 0 {
                    // Nobody lowers a flip-flopped edge line, so retire it here.
                    regs.irr &= !(1 << pin);
                    regs.tags[pin].clear();
                }
            }
            DeliveryStatus::Discarded => {
                debug!(pin, vector = interrupt.vector, "interrupt not accepted");
            }
        }
    }

    fn send_msi_locked(
        &self,
        regs: &mut IoApicRegs,
        requester_id: Option<u16>,
        msi: &MsiMessage,
        tag: TraceTag,
    ) {
        trace!(
            requester = ?requester_id,
            address = msi.address,
            data = msi.data,
            tag = tag.0,
            "send_msi"
        );

        let mut msi = *msi;
        if let (Some(remapper), Some(_)) = (&self.remapper, requester_id) {
            if msi.is_remappable() {
                trace!(
                    index = msi.interrupt_index(),
                    shv = msi.sub_handle_valid(),
                    "remappable-format MSI"
                );
            }
            match remapper.remap(requester_id, &msi) {
                RemapOutcome::NotPresent => {}
                RemapOutcome::Remapped(out) => {
                    regs.stats.iommu_remapped_msi += 1;
                    msi = out;
                }
                RemapOutcome::Discarded => {
                    regs.stats.iommu_discarded_msi += 1;
                    debug!(requester = ?requester_id, "MSI discarded by IOMMU");
                    return;
                }
            }
        }

        let interrupt = ApicInterrupt::from_msi(&msi);
        if !self.apic_bus.deliver(&interrupt, tag).is_accepted() {
            debug!(vector = interrupt.vector, "MSI not accepted by any local APIC");
        }
    }

    fn set_eoi_locked(&self, regs: &mut IoApicRegs, vector: u8) {
        regs.stats.set_eoi += 1;
        let mut cleared = false;
        for pin in 0..regs.redir_table.len() {
            let rte = regs.redir_table[pin];
            // Edge entries sharing the vector must not be re-triggered.
            if rte.vector() != vector || !rte.is_level() {
                continue;
            }
            regs.redir_table[pin].set_remote_irr(false);
            regs.stats.eoi_received += 1;
            cleared = true;
            trace!(pin, vector, "remote IRR cleared");
            if regs.is_pending(pin) {
                self.signal_locked(regs, pin);
            }
        }
        if !cleared {
            trace!(vector, "EOI matched no level-triggered entry");
        }
    }

    fn mmio_read_locked(&self, regs: &mut IoApicRegs, offset: u64) -> u32 {
        regs.stats.mmio_reads += 1;
        let value = match offset & MMIO_REG_MASK {
            IOREGSEL => u32::from(regs.index),
            IOWIN => self.read_data(regs),
            reg => {
                debug!(offset, reg, "I/O APIC read from unknown register");
                u32::MAX
            }
        };
        trace!(offset, value, "I/O APIC MMIO read");
        value
    }

    fn mmio_write_locked(&self, regs: &mut IoApicRegs, offset: u64, value: u32) {
        regs.stats.mmio_writes += 1;
        trace!(offset, value, "I/O APIC MMIO write");
        match offset & MMIO_REG_MASK {
            IOREGSEL => regs.index = value as u8,
            IOWIN => self.write_data(regs, value),
            IOEOI if self.params.has_eoi_register => self.set_eoi_locked(regs, value as u8),
            IOEOI => debug!(chip = %self.chip, "write to EOI register ignored"),
            reg => debug!(offset, reg, value, "I/O APIC write to unknown register ignored"),
        }
    }

    fn rte_slot(&self, index: u8) -> Option<(usize, bool)> {
        if (IOREDTBL_BASE..=self.params.last_rte_reg).contains(&index) {
            let rel = index - IOREDTBL_BASE;
            Some((usize::from(rel >> 1), rel & 1 != 0))
        } else {
            None
        }
    }

    fn read_data(&self, regs: &IoApicRegs) -> u32 {
        let index = regs.index;
        if let Some((pin, high)) = self.rte_slot(index) {
            return regs.redir_table[pin].read_half(high, self.params.read_mask);
        }
        match index {
            IOAPICID => u32::from(regs.id) << 24,
            IOAPICVER => self.params.version_register(),
            IOAPICARB if self.params.has_arbitration_register => 0,
            _ => {
                debug!(index, "read from invalid I/O APIC register index");
                u32::MAX
            }
        }
    }

    fn write_data(&self, regs: &mut IoApicRegs, value: u32) {
        let index = regs.index;
        if let Some((pin, high)) = self.rte_slot(index) {
            regs.redir_table[pin].write_half(high, value, self.params.write_mask);
            trace!(pin, high, value, rte = regs.redir_table[pin].0, "redirection entry written");
            if regs.is_pending(pin) {
                self.signal_locked(regs, pin);
            }
            return;
        }
        match index {
            IOAPICID => regs.id = ((value >> 24) as u8) & self.params.id_mask,
            _ => debug!(index, value, "write to invalid I/O APIC register index ignored"),
        }
    }
}

fn pin_mask(pins: usize) -> u32 {
    if pins >= 32 {
        u32::MAX
    } else {
        (1u32 << pins) - 1
    }
}
