//! Message-signalled interrupts and the interrupt-remapping hook.
//!
//! Address word (compatibility format):
//! - bits 31:20: `0xFEE`
//! - bits 19:12: destination ID
//! - bit 3: redirection hint
//! - bit 2: destination mode (1 = logical)
//!
//! Address word (remappable format, bit 4 set):
//! - bits 19:5: interrupt index[14:0]
//! - bit 3: sub-handle valid
//! - bit 2: interrupt index[15]
//!
//! Data word: vector in 7:0, delivery mode in 10:8, level assert in 14 and
//! trigger mode in 15.

use serde::{Deserialize, Serialize};

use crate::apic_bus::{DeliveryMode, DestinationMode, TriggerMode};

pub const MSI_ADDRESS_BASE: u64 = 0xFEE0_0000;

const ADDR_DEST_SHIFT: u32 = 12;
const ADDR_REDIR_HINT: u64 = 1 << 3;
const ADDR_DEST_MODE: u64 = 1 << 2;
const ADDR_REMAP_FORMAT: u64 = 1 << 4;
const ADDR_REMAP_SHV: u64 = 1 << 3;
const ADDR_REMAP_INDEX_HI: u64 = 1 << 2;
const ADDR_REMAP_INDEX_LO_SHIFT: u32 = 5;
const ADDR_REMAP_INDEX_LO_MASK: u64 = 0x7FFF;

const DATA_DELIVERY_MODE_SHIFT: u32 = 8;
const DATA_TRIGGER: u32 = 1 << 15;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MsiMessage {
    pub address: u64,
    pub data: u32,
}

impl MsiMessage {
    pub fn new(address: u64, data: u32) -> Self {
        Self { address, data }
    }

    /// Builds a compatibility-format message aimed at the local APIC window.
    pub fn compatibility(
        destination: u8,
        destination_mode: DestinationMode,
        delivery_mode: DeliveryMode,
        vector: u8,
        trigger_mode: TriggerMode,
    ) -> Self {
        let mut address = MSI_ADDRESS_BASE | (u64::from(destination) << ADDR_DEST_SHIFT);
        if destination_mode == DestinationMode::Logical {
            address |= ADDR_DEST_MODE;
        }
        let mut data =
            u32::from(vector) | (u32::from(delivery_mode.bits()) << DATA_DELIVERY_MODE_SHIFT);
        if trigger_mode == TriggerMode::Level {
            data |= DATA_TRIGGER;
        }
        Self { address, data }
    }

    /// Builds a remappable-format message carrying a 16-bit interrupt index.
    pub fn remappable(index: u16, sub_handle_valid: bool) -> Self {
        let index = u64::from(index);
        let mut address = MSI_ADDRESS_BASE
            | ADDR_REMAP_FORMAT
            | ((index & ADDR_REMAP_INDEX_LO_MASK) << ADDR_REMAP_INDEX_LO_SHIFT);
        if index & 0x8000 != 0 {
            address |= ADDR_REMAP_INDEX_HI;
        }
        if sub_handle_valid {
            address |= ADDR_REMAP_SHV;
        }
        Self { address, data: 0 }
    }

    pub fn vector(&self) -> u8 {
        (self.data & 0xFF) as u8
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::from_bits((self.data >> DATA_DELIVERY_MODE_SHIFT) as u8)
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        if self.data & DATA_TRIGGER != 0 {
            TriggerMode::Level
        } else {
            TriggerMode::Edge
        }
    }

    pub fn destination_id(&self) -> u8 {
        ((self.address >> ADDR_DEST_SHIFT) & 0xFF) as u8
    }

    pub fn destination_mode(&self) -> DestinationMode {
        if self.address & ADDR_DEST_MODE != 0 {
            DestinationMode::Logical
        } else {
            DestinationMode::Physical
        }
    }

    pub fn redirection_hint(&self) -> bool {
        self.address & ADDR_REDIR_HINT != 0
    }

    pub fn is_remappable(&self) -> bool {
        self.address & ADDR_REMAP_FORMAT != 0
    }

    /// Interrupt-remapping table index. Only meaningful for remappable-format messages.
    pub fn interrupt_index(&self) -> u16 {
        let lo = (self.address >> ADDR_REMAP_INDEX_LO_SHIFT) & ADDR_REMAP_INDEX_LO_MASK;
        let hi = u64::from(self.address & ADDR_REMAP_INDEX_HI != 0) << 15;
        (lo | hi) as u16
    }

    pub fn sub_handle_valid(&self) -> bool {
        self.is_remappable() && self.address & ADDR_REMAP_SHV != 0
    }
}

/// Result of asking the IOMMU to translate an interrupt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemapOutcome {
    /// Remapping is not enabled for this requester; deliver the original.
    NotPresent,
    Remapped(MsiMessage),
    /// The IOMMU blocked the interrupt.
    Discarded,
}

/// Interrupt-remapping hook consulted before delivery.
pub trait MsiRemapper: Send + Sync {
    fn remap(&self, requester_id: Option<u16>, msi: &MsiMessage) -> RemapOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatibility_fields() {
        let msi = MsiMessage::compatibility(
            0x12,
            DestinationMode::Logical,
            DeliveryMode::Nmi,
            0x5A,
            TriggerMode::Level,
        );
        assert_eq!(msi.address, 0xFEE1_2004);
        assert_eq!(msi.data, 0x5A | (4 << 8) | (1 << 15));
        assert_eq!(msi.destination_id(), 0x12);
        assert_eq!(msi.delivery_mode(), DeliveryMode::Nmi);
        assert!(!msi.is_remappable());
    }

    #[test]
    fn remappable_index_splits_across_bit_two() {
        let msi = MsiMessage::remappable(0x8003, true);
        assert!(msi.is_remappable());
        assert!(msi.sub_handle_valid());
        assert_eq!(msi.address & ADDR_REMAP_INDEX_HI, ADDR_REMAP_INDEX_HI);
        assert_eq!((msi.address >> 5) & 0x7FFF, 3);
        assert_eq!(msi.interrupt_index(), 0x8003);

        let msi = MsiMessage::remappable(0x1234, false);
        assert!(!msi.sub_handle_valid());
        assert_eq!(msi.interrupt_index(), 0x1234);
    }

    #[test]
    fn physical_fixed_decode() {
        let msi = MsiMessage::new(0xFEE0_3000, 0x0045);
        assert_eq!(msi.vector(), 0x45);
        assert_eq!(msi.destination_id(), 3);
        assert_eq!(msi.destination_mode(), DestinationMode::Physical);
        assert_eq!(msi.trigger_mode(), TriggerMode::Edge);
    }
}
