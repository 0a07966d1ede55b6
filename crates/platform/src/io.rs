use std::collections::HashMap;

use tracing::trace;

/// A device reachable through x86 `IN`/`OUT` instructions.
///
/// `size` is always 1, 2 or 4; the bus filters everything else before dispatch.
pub trait PortIoDevice {
    fn read(&mut self, port: u16, size: u8) -> u32;
    fn write(&mut self, port: u16, size: u8, value: u32);
}

/// Exact-port dispatcher for legacy port I/O.
///
/// One handler per port. Devices that answer on several ports register one wrapper per port
/// and share their state behind the wrapper.
#[derive(Default)]
pub struct IoPortBus {
    devices: HashMap<u16, Box<dyn PortIoDevice>>,
}

fn floating(size: u8) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

impl IoPortBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `device` at `port`, returning the handler it replaced.
    pub fn register(
        &mut self,
        port: u16,
        device: Box<dyn PortIoDevice>,
    ) -> Option<Box<dyn PortIoDevice>> {
        self.devices.insert(port, device)
    }

    pub fn read(&mut self, port: u16, size: u8) -> u32 {
        if size == 0 {
            return 0;
        }
        if !matches!(size, 1 | 2 | 4) {
            return 0xFFFF_FFFF;
        }
        match self.devices.get_mut(&port) {
            Some(dev) => dev.read(port, size),
            None => {
                trace!(port, size, "read from unmapped I/O port");
                floating(size)
            }
        }
    }

    pub fn write(&mut self, port: u16, size: u8, value: u32) {
        if !matches!(size, 1 | 2 | 4) {
            return;
        }
        match self.devices.get_mut(&port) {
            Some(dev) => dev.write(port, size, value),
            None => trace!(port, size, value, "write to unmapped I/O port dropped"),
        }
    }

    pub fn read_u8(&mut self, port: u16) -> u8 {
        self.read(port, 1) as u8
    }

    pub fn write_u8(&mut self, port: u16, value: u8) {
        self.write(port, 1, u32::from(value));
    }
}
