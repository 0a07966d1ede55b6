//! Cascaded Intel 8259A programmable interrupt controllers.
//!
//! The master sits at ports 0x20/0x21 and the slave at 0xA0/0xA1, with the
//! slave's INT output wired to master IR2. The edge/level control registers
//! live at 0x4D0 (master) and 0x4D1 (slave).
//!
//! The pair drives a single [`CpuIntLine`]. When the CPU takes the interrupt
//! it calls [`DualPic8259::acknowledge_vector`], which plays the role of the
//! two INTA cycles and returns the vector together with the trace tag of the
//! source that raised it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::apic_bus::CpuIntLine;
use crate::error::{InterruptError, Result};
use crate::line::IrqLevel;
use crate::sync::{lock, try_lock};
use crate::tag::TraceTag;

pub const MASTER_CMD: u16 = 0x20;
pub const MASTER_DATA: u16 = 0x21;
pub const SLAVE_CMD: u16 = 0xA0;
pub const SLAVE_DATA: u16 = 0xA1;
pub const ELCR_MASTER: u16 = 0x4D0;
pub const ELCR_SLAVE: u16 = 0x4D1;

/// Master IRQ0-2 are hardwired edge (timer, keyboard, cascade).
pub const ELCR_MASTER_MASK: u8 = 0xF8;
/// Slave IRQ8 (RTC) and IRQ13 (FPU) are hardwired edge.
pub const ELCR_SLAVE_MASK: u8 = 0xDE;

const CASCADE_PIN: u8 = 2;
const SPURIOUS_PIN: u8 = 7;

const ICW1_INIT: u8 = 0x10;
const ICW1_LTIM: u8 = 0x08;
const ICW1_SINGLE: u8 = 0x02;
const ICW1_IC4: u8 = 0x01;
const ICW4_SFNM: u8 = 0x10;
const ICW4_AEOI: u8 = 0x02;
const ICW4_8086: u8 = 0x01;
const OCW3_SELECT: u8 = 0x08;
const OCW3_POLL: u8 = 0x04;
const OCW3_RR: u8 = 0x02;
const OCW3_RIS: u8 = 0x01;
const OCW3_ESMM: u8 = 0x40;
const OCW3_SMM: u8 = 0x20;

bitflags! {
    /// Unsupported programming the guest has already been warned about.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    struct ProtocolWarnings: u8 {
        const SINGLE_MODE = 1 << 0;
        const LEVEL_TRIGGERED_ICW = 1 << 1;
        const MCS80_MODE = 1 << 2;
    }
}

/// Register file of one 8259A.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PicChannelState {
    pub irr: u8,
    /// Edge detector shadow of the input lines.
    pub last_irr: u8,
    pub imr: u8,
    pub isr: u8,
    /// Pin currently holding the highest priority.
    pub priority_add: u8,
    pub irq_base: u8,
    pub read_isr: bool,
    pub poll: bool,
    pub special_mask: bool,
    pub init_step: u8,
    pub expects_icw4: bool,
    pub auto_eoi: bool,
    pub rotate_on_auto_eoi: bool,
    pub special_fully_nested: bool,
    pub elcr: u8,
    pub elcr_mask: u8,
    pub tags: [TraceTag; 8],
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualPicState {
    pub master: PicChannelState,
    pub slave: PicChannelState,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PicStats {
    pub acknowledged: u64,
    pub spurious: u64,
    pub per_irq: [u64; 16],
    pub lock_contention: u64,
}

struct PicChannel {
    name: &'static str,
    is_master: bool,
    regs: PicChannelState,
    warned: ProtocolWarnings,
}

impl PicChannel {
    fn new(name: &'static str, is_master: bool, elcr_mask: u8) -> Self {
        Self {
            name,
            is_master,
            regs: PicChannelState {
                elcr_mask,
                ..PicChannelState::default()
            },
            warned: ProtocolWarnings::empty(),
        }
    }

    fn reset(&mut self) {
        let elcr = self.regs.elcr;
        let elcr_mask = self.regs.elcr_mask;
        self.regs = PicChannelState {
            elcr,
            elcr_mask,
            ..PicChannelState::default()
        };
    }

    fn warn_once(&mut self, kind: ProtocolWarnings, what: &str) {
        if !self.warned.contains(kind) {
            self.warned.insert(kind);
            warn!(pic = self.name, "{what} is not supported, ignoring");
        }
    }

    /// Rotation offset of the highest-priority bit set in `mask`, or 8 if none.
    fn priority(&self, mask: u8) -> u8 {
        if mask == 0 {
            return 8;
        }
        let mut priority = 0;
        while mask & (1 << ((priority + self.regs.priority_add) & 7)) == 0 {
            priority += 1;
        }
        priority
    }

    /// Pin that would be delivered next, if any.
    fn pending_irq(&self) -> Option<u8> {
        let r = &self.regs;
        let priority = self.priority(r.irr & !r.imr);
        if priority == 8 {
            return None;
        }

        let mut in_service = r.isr;
        if r.special_mask {
            in_service &= !r.imr;
        }
        if self.is_master && r.special_fully_nested {
            in_service &= !(1 << CASCADE_PIN);
        }
        if priority < self.priority(in_service) {
            Some((priority + r.priority_add) & 7)
        } else {
            None
        }
    }

    fn set_irq(&mut self, pin: u8, level: bool, tag: TraceTag) {
        let bit = 1u8 << pin;
        let r = &mut self.regs;
        if level {
            if r.elcr & bit != 0 || r.last_irr & bit == 0 {
                r.irr |= bit;
            }
            r.last_irr |= bit;
            r.tags[usize::from(pin)].merge(tag);
        } else {
            r.irr &= !bit;
            r.last_irr &= !bit;
        }
    }

    fn intack(&mut self, pin: u8) {
        let bit = 1u8 << pin;
        let r = &mut self.regs;
        if r.auto_eoi {
            if r.rotate_on_auto_eoi {
                r.priority_add = (pin + 1) & 7;
            }
        } else {
            r.isr |= bit;
        }
        if r.elcr & bit == 0 {
            r.irr &= !bit;
        }
    }

    /// Handles a command-port write. Returns whether delivery must be re-evaluated.
    fn write_command(&mut self, value: u8) -> bool {
        if value & ICW1_INIT != 0 {
            self.reset();
            self.regs.init_step = 1;
            self.regs.expects_icw4 = value & ICW1_IC4 != 0;
            if value & ICW1_SINGLE != 0 {
                self.warn_once(ProtocolWarnings::SINGLE_MODE, "single PIC mode");
            }
            if value & ICW1_LTIM != 0 {
                self.warn_once(
                    ProtocolWarnings::LEVEL_TRIGGERED_ICW,
                    "level-triggered mode via ICW1",
                );
            }
            debug!(pic = self.name, icw1 = value, "initialization started");
            return true;
        }

        let r = &mut self.regs;
        if value & OCW3_SELECT != 0 {
            if value & OCW3_POLL != 0 {
                r.poll = true;
            }
            if value & OCW3_RR != 0 {
                r.read_isr = value & OCW3_RIS != 0;
            }
            if value & OCW3_ESMM != 0 {
                r.special_mask = value & OCW3_SMM != 0;
            }
            trace!(pic = self.name, ocw3 = value, "OCW3");
            return false;
        }

        let cmd = value >> 5;
        let pin = value & 7;
        match cmd {
            0 | 4 => {
                r.rotate_on_auto_eoi = cmd >> 2 != 0;
                false
            }
            1 | 5 => {
                let priority = self.priority(self.regs.isr);
                if priority != 8 {
                    let r = &mut self.regs;
                    let irq = (priority + r.priority_add) & 7;
                    r.isr &= !(1 << irq);
                    if cmd == 5 {
                        r.priority_add = (irq + 1) & 7;
                    }
                }
                true
            }
            3 => {
                r.isr &= !(1 << pin);
                true
            }
            6 => {
                r.priority_add = (pin + 1) & 7;
                true
            }
            7 => {
                r.isr &= !(1 << pin);
                r.priority_add = (pin + 1) & 7;
                true
            }
            _ => false,
        }
    }

    /// Handles a data-port write. Returns whether delivery must be re-evaluated.
    fn write_data(&mut self, value: u8) -> bool {
        let r = &mut self.regs;
        match r.init_step {
            0 => {
                r.imr = value;
                true
            }
            1 => {
                r.irq_base = value & 0xF8;
                r.init_step = 2;
                false
            }
            2 => {
                // ICW3: cascade wiring is fixed.
                r.init_step = if r.expects_icw4 { 3 } else { 0 };
                false
            }
            _ => {
                r.special_fully_nested = value & ICW4_SFNM != 0;
                r.auto_eoi = value & ICW4_AEOI != 0;
                r.init_step = 0;
                if value & ICW4_8086 == 0 {
                    self.warn_once(ProtocolWarnings::MCS80_MODE, "MCS-80/85 mode");
                }
                debug!(
                    pic = self.name,
                    base = self.regs.irq_base,
                    aeoi = self.regs.auto_eoi,
                    sfnm = self.regs.special_fully_nested,
                    "initialization complete"
                );
                false
            }
        }
    }

    fn read_register(&self, data_port: bool) -> u8 {
        if data_port {
            self.regs.imr
        } else if self.regs.read_isr {
            self.regs.isr
        } else {
            self.regs.irr
        }
    }
}

struct PicPair {
    master: PicChannel,
    slave: PicChannel,
    stats: PicStats,
}

impl PicPair {
    fn new() -> Self {
        Self {
            master: PicChannel::new("master", true, ELCR_MASTER_MASK),
            slave: PicChannel::new("slave", false, ELCR_SLAVE_MASK),
            stats: PicStats::default(),
        }
    }

    fn channel(&mut self, slave: bool) -> &mut PicChannel {
        if slave {
            &mut self.slave
        } else {
            &mut self.master
        }
    }

    /// Recomputes the cascade input and the CPU line level.
    fn update(&mut self, line: &dyn CpuIntLine) {
        for _ in 0..2 {
            let slave_irq = self.slave.pending_irq();
            match slave_irq {
                Some(pin) => {
                    let tag = self.slave.regs.tags[usize::from(pin)];
                    self.master.set_irq(CASCADE_PIN, true, tag);
                }
                None => self.master.set_irq(CASCADE_PIN, false, TraceTag::NONE),
            }

            match self.master.pending_irq() {
                Some(pin) if pin != CASCADE_PIN || slave_irq.is_some() => {
                    line.set_level(true);
                    return;
                }
                Some(_) => {
                    // Cascade input set with nothing behind it on the slave.
                    trace!("stale cascade request cleared");
                    line.set_level(false);
                    self.master.regs.irr &= !(1 << CASCADE_PIN);
                }
                None => {
                    line.set_level(false);
                    return;
                }
            }
        }
    }

    fn pending_vector(&self) -> Option<u8> {
        let pin = self.master.pending_irq()?;
        if pin == CASCADE_PIN {
            let slave_pin = self.slave.pending_irq()?;
            return Some(self.slave.regs.irq_base.wrapping_add(slave_pin));
        }
        Some(self.master.regs.irq_base.wrapping_add(pin))
    }

    fn acknowledge(&mut self, line: &dyn CpuIntLine) -> (u8, TraceTag) {
        let (vector, tag, irq) = match self.master.pending_irq() {
            Some(CASCADE_PIN) => {
                self.master.intack(CASCADE_PIN);
                self.master.regs.tags[usize::from(CASCADE_PIN)].clear();
                let slave_pin = match self.slave.pending_irq() {
                    Some(pin) => {
                        self.slave.intack(pin);
                        pin
                    }
                    None => {
                        self.stats.spurious += 1;
                        debug!("spurious interrupt on slave PIC");
                        SPURIOUS_PIN
                    }
                };
                let tag = self.slave.regs.tags[usize::from(slave_pin)].take();
                (
                    self.slave.regs.irq_base.wrapping_add(slave_pin),
                    tag,
                    slave_pin + 8,
                )
            }
            Some(pin) => {
                self.master.intack(pin);
                let tag = self.master.regs.tags[usize::from(pin)].take();
                (self.master.regs.irq_base.wrapping_add(pin), tag, pin)
            }
            None => {
                self.stats.spurious += 1;
                debug!("spurious interrupt on master PIC");
                (
                    self.master.regs.irq_base.wrapping_add(SPURIOUS_PIN),
                    TraceTag::NONE,
                    SPURIOUS_PIN,
                )
            }
        };

        self.stats.acknowledged += 1;
        self.stats.per_irq[usize::from(irq)] += 1;
        trace!(irq, vector, tag = tag.0, "interrupt acknowledged");
        self.update(line);
        (vector, tag)
    }

    /// OCW3 poll: reads and services the highest pending pin in one step.
    fn poll_read(&mut self, slave: bool, line: &dyn CpuIntLine) -> u8 {
        let chan = self.channel(slave);
        chan.regs.poll = false;
        let Some(pin) = chan.pending_irq() else {
            self.update(line);
            return 0;
        };

        chan.regs.irr &= !(1 << pin);
        chan.regs.isr &= !(1 << pin);
        chan.regs.tags[usize::from(pin)].clear();
        if slave {
            self.master.regs.irr &= !(1 << CASCADE_PIN);
            self.master.regs.isr &= !(1 << CASCADE_PIN);
        }
        if slave || pin != CASCADE_PIN {
            self.update(line);
        }
        0x80 | pin
    }

    fn read_port(&mut self, port: u16, line: &dyn CpuIntLine) -> u8 {
        let (slave, data) = match port {
            MASTER_CMD => (false, false),
            MASTER_DATA => (false, true),
            SLAVE_CMD => (true, false),
            SLAVE_DATA => (true, true),
            ELCR_MASTER => return self.master.regs.elcr,
            ELCR_SLAVE => return self.slave.regs.elcr,
            _ => {
                debug!(port, "PIC read from unhandled port");
                return 0xFF;
            }
        };
        if self.channel(slave).regs.poll {
            return self.poll_read(slave, line);
        }
        self.channel(slave).read_register(data)
    }

    fn write_port(&mut self, port: u16, value: u8, line: &dyn CpuIntLine) {
        let (slave, data) = match port {
            MASTER_CMD => (false, false),
            MASTER_DATA => (false, true),
            SLAVE_CMD => (true, false),
            SLAVE_DATA => (true, true),
            ELCR_MASTER | ELCR_SLAVE => {
                let chan = self.channel(port == ELCR_SLAVE);
                chan.regs.elcr = value & chan.regs.elcr_mask;
                trace!(pic = chan.name, elcr = chan.regs.elcr, "ELCR write");
                return;
            }
            _ => {
                debug!(port, value, "PIC write to unhandled port ignored");
                return;
            }
        };

        let chan = self.channel(slave);
        trace!(pic = chan.name, data, value, "PIC port write");
        let reevaluate = if data {
            chan.write_data(value)
        } else {
            chan.write_command(value)
        };
        if reevaluate {
            self.update(line);
        }
    }
}

/// The master/slave 8259A pair behind one lock.
pub struct DualPic8259 {
    inner: Mutex<PicPair>,
    line: Arc<dyn CpuIntLine>,
    contention: AtomicU64,
}

impl std::fmt::Debug for DualPic8259 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualPic8259").finish_non_exhaustive()
    }
}

impl DualPic8259 {
    pub fn new(line: Arc<dyn CpuIntLine>) -> Self {
        Self {
            inner: Mutex::new(PicPair::new()),
            line,
            contention: AtomicU64::new(0),
        }
    }

    /// Drives ISA IRQ `irq` (0-15). IRQ8-15 are routed to the slave.
    ///
    /// A flip-flop lowers then raises the line, re-evaluating in between, so
    /// an edge is seen even when the line was already high.
    pub fn set_irq(&self, irq: u8, level: IrqLevel, tag: TraceTag) {
        if irq >= 16 {
            debug!(irq, "PIC set_irq on nonexistent IRQ ignored");
            return;
        }
        let mut pair = lock(&self.inner);
        Self::set_irq_locked(&mut pair, irq, level, tag, self.line.as_ref());
    }

    pub fn try_set_irq(&self, irq: u8, level: IrqLevel, tag: TraceTag) -> Result<()> {
        if irq >= 16 {
            return Err(InterruptError::PinOutOfRange {
                pin: u32::from(irq),
                pins: 16,
            });
        }
        let mut pair = try_lock(&self.inner, &self.contention)?;
        Self::set_irq_locked(&mut pair, irq, level, tag, self.line.as_ref());
        Ok(())
    }

    pub fn raise_irq(&self, irq: u8) {
        self.set_irq(irq, IrqLevel::High, TraceTag::NONE);
    }

    pub fn lower_irq(&self, irq: u8) {
        self.set_irq(irq, IrqLevel::Low, TraceTag::NONE);
    }

    pub fn port_read_u8(&self, port: u16) -> u8 {
        let mut pair = lock(&self.inner);
        pair.read_port(port, self.line.as_ref())
    }

    pub fn port_write_u8(&self, port: u16, value: u8) {
        let mut pair = lock(&self.inner);
        pair.write_port(port, value, self.line.as_ref());
    }

    pub fn try_port_read_u8(&self, port: u16) -> Result<u8> {
        let mut pair = try_lock(&self.inner, &self.contention)?;
        Ok(pair.read_port(port, self.line.as_ref()))
    }

    pub fn try_port_write_u8(&self, port: u16, value: u8) -> Result<()> {
        let mut pair = try_lock(&self.inner, &self.contention)?;
        pair.write_port(port, value, self.line.as_ref());
        Ok(())
    }

    /// Vector the next acknowledge would return, without side effects.
    pub fn get_pending_vector(&self) -> Option<u8> {
        lock(&self.inner).pending_vector()
    }

    /// INTA: returns the vector to dispatch and the tag of the source behind it.
    pub fn acknowledge_vector(&self) -> (u8, TraceTag) {
        let mut pair = lock(&self.inner);
        pair.acknowledge(self.line.as_ref())
    }

    /// Power-on reset of both channels. ELCR programming survives.
    pub fn reset(&self) {
        let mut pair = lock(&self.inner);
        pair.master.reset();
        pair.slave.reset();
        self.line.set_level(false);
        debug!("PIC reset");
    }

    pub fn stats(&self) -> PicStats {
        let mut stats = lock(&self.inner).stats;
        stats.lock_contention = self.contention.load(Ordering::Relaxed);
        stats
    }

    pub fn save_state(&self) -> DualPicState {
        let pair = lock(&self.inner);
        DualPicState {
            master: pair.master.regs.clone(),
            slave: pair.slave.regs.clone(),
        }
    }

    /// Restores a dump taken by [`DualPic8259::save_state`] and re-drives the CPU line.
    pub fn load_state(&self, state: &DualPicState) -> Result<()> {
        for chan in [&state.master, &state.slave] {
            if chan.init_step > 3 || chan.priority_add > 7 {
                return Err(InterruptError::SnapshotMismatch("PIC channel registers"));
            }
        }
        let mut pair = lock(&self.inner);
        pair.master.regs = state.master.clone();
        pair.slave.regs = state.slave.clone();
        pair.master.regs.elcr_mask = ELCR_MASTER_MASK;
        pair.slave.regs.elcr_mask = ELCR_SLAVE_MASK;
        pair.update(self.line.as_ref());
        Ok(())
    }

    fn set_irq_locked(
        pair: &mut PicPair,
        irq: u8,
        level: IrqLevel,
        tag: TraceTag,
        line: &dyn CpuIntLine,
    ) {
        trace!(irq, ?level, tag = tag.0, "PIC set_irq");
        let chan = pair.channel(irq >= 8);
        let pin = irq & 7;
        match level {
            IrqLevel::Low => chan.set_irq(pin, false, TraceTag::NONE),
            IrqLevel::High => chan.set_irq(pin, true, tag),
            IrqLevel::FlipFlop => {
                chan.set_irq(pin, false, TraceTag::NONE);
                pair.update(line);
                pair.channel(irq >= 8).set_irq(pin, true, tag);
            }
        }
        pair.update(line);
    }
}
