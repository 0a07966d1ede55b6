//! Physical MMIO window dispatch.

use thiserror::Error;
use tracing::trace;

/// Handler for a memory-mapped register window.
///
/// `offset` is relative to the start of the mapping.
pub trait MmioHandler {
    fn read(&mut self, offset: u64, size: usize) -> u64;
    fn write(&mut self, offset: u64, size: usize, value: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("MMIO mapping must have a non-zero length")]
    ZeroLength,
    #[error("MMIO mapping at {start:#x} (len {len:#x}) wraps the address space")]
    AddressOverflow { start: u64, len: u64 },
    #[error("MMIO mapping at {start:#x} (len {len:#x}) overlaps an existing window")]
    Overlap { start: u64, len: u64 },
}

struct Region {
    start: u64,
    end: u64,
    handler: Box<dyn MmioHandler>,
}

/// Sorted, non-overlapping set of MMIO windows.
#[derive(Default)]
pub struct MmioBus {
    regions: Vec<Region>,
}

fn floating(size: usize) -> u64 {
    match size {
        0 => 0,
        1..=7 => (1u64 << (size * 8)) - 1,
        _ => u64::MAX,
    }
}

impl MmioBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_mmio(
        &mut self,
        start: u64,
        len: u64,
        handler: Box<dyn MmioHandler>,
    ) -> Result<(), MapError> {
        if len == 0 {
            return Err(MapError::ZeroLength);
        }
        let end = start
            .checked_add(len)
            .ok_or(MapError::AddressOverflow { start, len })?;

        let idx = self.regions.partition_point(|r| r.start < start);
        let overlaps_prev = idx > 0 && self.regions[idx - 1].end > start;
        let overlaps_next = self.regions.get(idx).is_some_and(|r| r.start < end);
        if overlaps_prev || overlaps_next {
            return Err(MapError::Overlap { start, len });
        }

        self.regions.insert(
            idx,
            Region {
                start,
                end,
                handler,
            },
        );
        Ok(())
    }

    fn find(&mut self, addr: u64) -> Option<&mut Region> {
        let idx = self.regions.partition_point(|r| r.start <= addr);
        let region = self.regions.get_mut(idx.checked_sub(1)?)?;
        (addr < region.end).then_some(region)
    }

    pub fn read(&mut self, addr: u64, size: usize) -> u64 {
        match self.find(addr) {
            Some(region) => {
                let offset = addr - region.start;
                region.handler.read(offset, size)
            }
            None => {
                trace!(addr, size, "read from unmapped MMIO address");
                floating(size)
            }
        }
    }

    pub fn write(&mut self, addr: u64, size: usize, value: u64) {
        match self.find(addr) {
            Some(region) => {
                let offset = addr - region.start;
                region.handler.write(offset, size, value);
            }
            None => trace!(addr, size, value, "write to unmapped MMIO address dropped"),
        }
    }

    pub fn read_u32(&mut self, addr: u64) -> u32 {
        self.read(addr, 4) as u32
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.write(addr, 4, u64::from(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingMmio {
        writes: Arc<Mutex<Vec<(u64, usize, u64)>>>,
    }

    impl MmioHandler for RecordingMmio {
        fn read(&mut self, offset: u64, _size: usize) -> u64 {
            0x1000 + offset
        }

        fn write(&mut self, offset: u64, size: usize, value: u64) {
            self.writes.lock().unwrap().push((offset, size, value));
        }
    }

    fn recording() -> (Box<dyn MmioHandler>, Arc<Mutex<Vec<(u64, usize, u64)>>>) {
        let writes = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(RecordingMmio {
                writes: writes.clone(),
            }),
            writes,
        )
    }

    #[test]
    fn dispatches_with_window_relative_offsets() {
        let mut bus = MmioBus::new();
        let (handler, writes) = recording();
        bus.map_mmio(0xFEC0_0000, 0x1000, handler).unwrap();

        assert_eq!(bus.read_u32(0xFEC0_0010), 0x1010);
        bus.write_u32(0xFEC0_0040, 0x21);
        assert_eq!(writes.lock().unwrap().as_slice(), &[(0x40, 4, 0x21)]);

        // One past the end is unmapped.
        assert_eq!(bus.read(0xFEC0_1000, 4), 0xFFFF_FFFF);
        assert_eq!(bus.read(0xFEBF_FFFF, 1), 0xFF);
        assert_eq!(bus.read(0, 8), u64::MAX);
    }

    #[test]
    fn rejects_overlapping_and_degenerate_windows() {
        let mut bus = MmioBus::new();
        bus.map_mmio(0x2000, 0x1000, recording().0).unwrap();

        assert_eq!(
            bus.map_mmio(0x2800, 0x1000, recording().0),
            Err(MapError::Overlap {
                start: 0x2800,
                len: 0x1000
            })
        );
        assert_eq!(
            bus.map_mmio(0x1800, 0x1000, recording().0),
            Err(MapError::Overlap {
                start: 0x1800,
                len: 0x1000
            })
        );
        assert_eq!(
            bus.map_mmio(0x4000, 0, recording().0),
            Err(MapError::ZeroLength)
        );
        assert!(matches!(
            bus.map_mmio(u64::MAX, 2, recording().0),
            Err(MapError::AddressOverflow { .. })
        ));

        // Adjacent windows are fine.
        bus.map_mmio(0x1000, 0x1000, recording().0).unwrap();
        bus.map_mmio(0x3000, 0x1000, recording().0).unwrap();
    }
}
