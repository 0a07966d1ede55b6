use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use aero_interrupts::apic_bus::{DeliveryMode, DestinationMode, TriggerMode};
use aero_interrupts::{ApicInterrupt, CpuIntLine, DeliveryStatus, IoApic, TraceTag};
use tracing::{debug, trace};

/// Broadcast destination in physical mode.
pub const APIC_BROADCAST: u8 = 0xFF;

type EoiNotifier = Arc<dyn Fn(u8) + Send + Sync>;

#[derive(Clone, Copy, Default)]
struct VectorSet([u32; 8]);

impl VectorSet {
    fn get(&self, vector: u8) -> bool {
        self.0[usize::from(vector >> 5)] & (1 << (vector & 31)) != 0
    }

    fn set(&mut self, vector: u8, on: bool) {
        let word = &mut self.0[usize::from(vector >> 5)];
        if on {
            *word |= 1 << (vector & 31);
        } else {
            *word &= !(1 << (vector & 31));
        }
    }

    fn highest(&self) -> Option<u8> {
        self.0
            .iter()
            .enumerate()
            .rev()
            .find(|&(_, &word)| word != 0)
            .map(|(i, &word)| (i as u8) * 32 + (31 - word.leading_zeros() as u8))
    }
}

struct LapicRegs {
    irr: VectorSet,
    isr: VectorSet,
    tmr: VectorSet,
    tags: [TraceTag; 256],
}

impl Default for LapicRegs {
    fn default() -> Self {
        Self {
            irr: VectorSet::default(),
            isr: VectorSet::default(),
            tmr: VectorSet::default(),
            tags: [TraceTag::NONE; 256],
        }
    }
}

/// Minimal local APIC used as the delivery target of the I/O APIC, MSIs and
/// the PIC's INTR line.
///
/// Only the interrupt acceptance path is modelled: IRR/ISR/TMR bitmaps,
/// NMI and ExtINT latches, and the EOI broadcast that clears remote IRR in
/// the I/O APIC for level-triggered vectors. Timers, IPIs and the register
/// page are out of scope.
pub struct LocalApic {
    apic_id: u8,
    logical_id: AtomicU8,
    regs: Mutex<LapicRegs>,
    nmi: AtomicBool,
    extint: AtomicBool,
    intr: AtomicBool,
    eoi_notifiers: Mutex<Vec<EoiNotifier>>,
}

impl std::fmt::Debug for LocalApic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalApic")
            .field("apic_id", &self.apic_id)
            .field("logical_id", &self.logical_id())
            .finish_non_exhaustive()
    }
}

impl LocalApic {
    /// The flat-model logical ID defaults to `1 << apic_id` for the first
    /// eight CPUs and 0 (no logical destination) beyond that.
    pub fn new(apic_id: u8) -> Self {
        Self {
            apic_id,
            logical_id: AtomicU8::new(1u8.checked_shl(u32::from(apic_id)).unwrap_or(0)),
            regs: Mutex::new(LapicRegs::default()),
            nmi: AtomicBool::new(false),
            extint: AtomicBool::new(false),
            intr: AtomicBool::new(false),
            eoi_notifiers: Mutex::new(Vec::new()),
        }
    }

    pub fn apic_id(&self) -> u8 {
        self.apic_id
    }

    pub fn logical_id(&self) -> u8 {
        self.logical_id.load(Ordering::Relaxed)
    }

    pub fn set_logical_id(&self, id: u8) {
        self.logical_id.store(id, Ordering::Relaxed);
    }

    fn regs(&self) -> MutexGuard<'_, LapicRegs> {
        self.regs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `interrupt` is addressed to this APIC.
    pub fn accepts(&self, interrupt: &ApicInterrupt) -> bool {
        match interrupt.destination_mode {
            DestinationMode::Physical => {
                interrupt.destination == self.apic_id || interrupt.destination == APIC_BROADCAST
            }
            DestinationMode::Logical => interrupt.destination & self.logical_id() != 0,
        }
    }

    /// Latches an interrupt that the bus has already routed here.
    pub fn deliver(&self, interrupt: &ApicInterrupt, tag: TraceTag) -> DeliveryStatus {
        match interrupt.delivery_mode {
            DeliveryMode::Fixed | DeliveryMode::LowestPriority => {
                let vector = interrupt.vector;
                if vector < 0x10 {
                    debug!(apic_id = self.apic_id, vector, "illegal vector discarded");
                    return DeliveryStatus::Discarded;
                }
                let mut regs = self.regs();
                regs.irr.set(vector, true);
                regs.tmr
                    .set(vector, interrupt.trigger_mode == TriggerMode::Level);
                regs.tags[usize::from(vector)].merge(tag);
                trace!(apic_id = self.apic_id, vector, tag = tag.0, "vector latched in IRR");
                DeliveryStatus::Accepted
            }
            DeliveryMode::Nmi => {
                self.nmi.store(true, Ordering::SeqCst);
                DeliveryStatus::Accepted
            }
            DeliveryMode::ExtInt => {
                self.extint.store(true, Ordering::SeqCst);
                DeliveryStatus::Accepted
            }
            mode => {
                debug!(apic_id = self.apic_id, ?mode, "unsupported delivery mode discarded");
                DeliveryStatus::Discarded
            }
        }
    }

    /// Highest vector waiting in IRR that outranks everything in service.
    pub fn pending_vector(&self) -> Option<u8> {
        Self::deliverable(&self.regs())
    }

    fn deliverable(regs: &LapicRegs) -> Option<u8> {
        let vector = regs.irr.highest()?;
        match regs.isr.highest() {
            Some(in_service) if in_service >> 4 >= vector >> 4 => None,
            _ => Some(vector),
        }
    }

    /// INTA cycle: moves the winning vector from IRR to ISR.
    pub fn acknowledge(&self) -> Option<(u8, TraceTag)> {
        let mut regs = self.regs();
        let vector = Self::deliverable(&regs)?;
        regs.irr.set(vector, false);
        regs.isr.set(vector, true);
        Some((vector, regs.tags[usize::from(vector)].take()))
    }

    /// EOI register write: retires the highest in-service vector and, if it
    /// was level triggered, broadcasts it to the EOI listeners.
    pub fn eoi(&self) -> Option<u8> {
        let (vector, level) = {
            let mut regs = self.regs();
            let vector = regs.isr.highest()?;
            regs.isr.set(vector, false);
            (vector, regs.tmr.get(vector))
        };
        trace!(apic_id = self.apic_id, vector, level, "EOI");
        if level {
            let notifiers = self
                .eoi_notifiers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for notify in notifiers {
                notify(vector);
            }
        }
        Some(vector)
    }

    pub fn register_eoi_notifier(&self, notifier: EoiNotifier) {
        self.eoi_notifiers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notifier);
    }

    /// Routes level-triggered EOIs to `ioapic` without keeping it alive.
    pub fn connect_ioapic(&self, ioapic: &Arc<IoApic>) {
        let weak: Weak<IoApic> = Arc::downgrade(ioapic);
        self.register_eoi_notifier(Arc::new(move |vector| {
            if let Some(ioapic) = weak.upgrade() {
                ioapic.set_eoi(vector);
            }
        }));
    }

    pub fn is_in_service(&self, vector: u8) -> bool {
        self.regs().isr.get(vector)
    }

    pub fn is_level_triggered(&self, vector: u8) -> bool {
        self.regs().tmr.get(vector)
    }

    pub fn take_nmi(&self) -> bool {
        self.nmi.swap(false, Ordering::SeqCst)
    }

    /// An ExtINT message or the PIC's INTR line asks the CPU to run an
    /// 8259 acknowledge cycle.
    pub fn external_interrupt_pending(&self) -> bool {
        self.extint.load(Ordering::SeqCst) || self.intr.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_extint(&self) {
        self.extint.store(false, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        *self.regs() = LapicRegs::default();
        self.nmi.store(false, Ordering::SeqCst);
        self.extint.store(false, Ordering::SeqCst);
    }
}

impl CpuIntLine for LocalApic {
    fn set_level(&self, asserted: bool) {
        self.intr.store(asserted, Ordering::SeqCst);
    }
}
