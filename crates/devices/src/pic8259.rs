//! Port I/O wiring for the 8259A pair.
//!
//! The controller model lives in `aero-interrupts`; this module maps its six
//! ports (two command/data pairs and the two ELCR bytes) onto an
//! [`IoPortBus`], honouring a relocated [`PicConfig`].

use std::sync::Arc;

use aero_interrupts::pic8259::{
    ELCR_MASTER, ELCR_SLAVE, MASTER_CMD, MASTER_DATA, SLAVE_CMD, SLAVE_DATA,
};
use aero_interrupts::{DualPic8259, PicConfig};
use aero_platform::io::{IoPortBus, PortIoDevice};

/// Guest port number to the controller's canonical port number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PicPortMap {
    entries: [(u16, u16); 6],
}

impl PicPortMap {
    pub fn new(cfg: &PicConfig) -> Self {
        Self {
            entries: [
                (cfg.master_base, MASTER_CMD),
                (cfg.master_base.wrapping_add(1), MASTER_DATA),
                (cfg.slave_base, SLAVE_CMD),
                (cfg.slave_base.wrapping_add(1), SLAVE_DATA),
                (cfg.master_elcr, ELCR_MASTER),
                (cfg.slave_elcr, ELCR_SLAVE),
            ],
        }
    }

    pub fn translate(&self, port: u16) -> Option<u16> {
        self.entries
            .iter()
            .find(|(guest, _)| *guest == port)
            .map(|&(_, canonical)| canonical)
    }

    pub fn guest_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.entries.iter().map(|&(guest, _)| guest)
    }
}

impl Default for PicPortMap {
    fn default() -> Self {
        Self::new(&PicConfig::default())
    }
}

/// One PIC port on the bus.
///
/// Word and dword accesses are split into byte accesses on consecutive
/// ports, low byte first. Bytes that fall outside the PIC's ports float high
/// on reads and are dropped on writes.
pub struct Pic8259Port {
    pic: Arc<DualPic8259>,
    map: PicPortMap,
}

impl Pic8259Port {
    pub fn new(pic: Arc<DualPic8259>, map: PicPortMap) -> Self {
        Self { pic, map }
    }

    fn read_byte(&self, port: u16) -> u8 {
        match self.map.translate(port) {
            Some(canonical) => self.pic.port_read_u8(canonical),
            None => 0xFF,
        }
    }

    fn write_byte(&self, port: u16, value: u8) {
        if let Some(canonical) = self.map.translate(port) {
            self.pic.port_write_u8(canonical, value);
        }
    }
}

impl PortIoDevice for Pic8259Port {
    fn read(&mut self, port: u16, size: u8) -> u32 {
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate().take(usize::from(size.min(4))) {
            *byte = self.read_byte(port.wrapping_add(i as u16));
        }
        u32::from_le_bytes(bytes)
    }

    fn write(&mut self, port: u16, size: u8, value: u32) {
        let bytes = value.to_le_bytes();
        for (i, &byte) in bytes.iter().enumerate().take(usize::from(size.min(4))) {
            self.write_byte(port.wrapping_add(i as u16), byte);
        }
    }
}

/// Registers the PIC's command, data and ELCR ports on `bus`.
pub fn register_pic8259(bus: &mut IoPortBus, pic: Arc<DualPic8259>, cfg: &PicConfig) {
    let map = PicPortMap::new(cfg);
    for port in map.guest_ports() {
        bus.register(port, Box::new(Pic8259Port::new(pic.clone(), map)));
    }
}
