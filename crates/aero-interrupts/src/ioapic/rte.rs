//! 64-bit redirection table entries.

use serde::{Deserialize, Serialize};

use crate::apic_bus::{ApicInterrupt, DeliveryMode, DestinationMode, Polarity, TriggerMode};
use crate::config::IoApicChipType;
use crate::msi::MsiMessage;

pub mod bits {
    pub const VECTOR: u64 = 0xFF;
    pub const DELIVERY_MODE: u64 = 0x7 << 8;
    pub const DEST_MODE: u64 = 1 << 11;
    pub const DELIVERY_STATUS: u64 = 1 << 12;
    pub const POLARITY: u64 = 1 << 13;
    pub const REMOTE_IRR: u64 = 1 << 14;
    pub const TRIGGER_MODE: u64 = 1 << 15;
    pub const MASK: u64 = 1 << 16;
    pub const EXT_DEST_ID: u64 = 0xFF << 48;
    pub const DEST: u64 = 0xFF << 56;

    // Remappable (VT-d) interpretation.
    pub const INTR_INDEX_LO: u64 = 0x7FFF << 49;
    pub const INTR_FORMAT: u64 = 1 << 48;
    pub const INTR_INDEX_HI: u64 = 1 << 11;
}

/// One redirection table entry, stored as the raw 64-bit register value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RedirectionEntry(pub u64);

impl RedirectionEntry {
    /// Power-on value: masked, everything else clear.
    pub const MASKED: RedirectionEntry = RedirectionEntry(bits::MASK);

    /// An unmasked, edge-triggered, active-high, physical-mode fixed entry.
    pub fn fixed(vector: u8, destination: u8) -> Self {
        Self(u64::from(vector) | (u64::from(destination) << 56))
    }

    pub fn with_trigger_mode(mut self, mode: TriggerMode) -> Self {
        self.set_bit(bits::TRIGGER_MODE, mode == TriggerMode::Level);
        self
    }

    pub fn with_polarity(mut self, polarity: Polarity) -> Self {
        self.set_bit(bits::POLARITY, polarity == Polarity::ActiveLow);
        self
    }

    pub fn with_masked(mut self, masked: bool) -> Self {
        self.set_bit(bits::MASK, masked);
        self
    }

    pub fn with_destination_mode(mut self, mode: DestinationMode) -> Self {
        self.set_bit(bits::DEST_MODE, mode == DestinationMode::Logical);
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.0 = (self.0 & !bits::DELIVERY_MODE) | (u64::from(mode.bits()) << 8);
        self
    }

    /// Remappable-format entry pointing at interrupt-remapping table `index`.
    pub fn remappable(vector: u8, index: u16) -> Self {
        let index = u64::from(index);
        let mut raw = u64::from(vector) | bits::INTR_FORMAT | ((index & 0x7FFF) << 49);
        if index & 0x8000 != 0 {
            raw |= bits::INTR_INDEX_HI;
        }
        Self(raw)
    }

    pub fn vector(self) -> u8 {
        (self.0 & bits::VECTOR) as u8
    }

    pub fn delivery_mode(self) -> DeliveryMode {
        DeliveryMode::from_bits((self.0 >> 8) as u8)
    }

    pub fn destination_mode(self) -> DestinationMode {
        if self.0 & bits::DEST_MODE != 0 {
            DestinationMode::Logical
        } else {
            DestinationMode::Physical
        }
    }

    pub fn delivery_status(self) -> bool {
        self.0 & bits::DELIVERY_STATUS != 0
    }

    pub fn polarity(self) -> Polarity {
        if self.0 & bits::POLARITY != 0 {
            Polarity::ActiveLow
        } else {
            Polarity::ActiveHigh
        }
    }

    pub fn remote_irr(self) -> bool {
        self.0 & bits::REMOTE_IRR != 0
    }

    pub fn trigger_mode(self) -> TriggerMode {
        if self.0 & bits::TRIGGER_MODE != 0 {
            TriggerMode::Level
        } else {
            TriggerMode::Edge
        }
    }

    pub fn is_level(self) -> bool {
        self.trigger_mode() == TriggerMode::Level
    }

    pub fn is_masked(self) -> bool {
        self.0 & bits::MASK != 0
    }

    pub fn extended_destination(self) -> u8 {
        ((self.0 & bits::EXT_DEST_ID) >> 48) as u8
    }

    pub fn destination(self) -> u8 {
        (self.0 >> 56) as u8
    }

    pub fn is_remappable(self) -> bool {
        self.0 & bits::INTR_FORMAT != 0
    }

    pub fn interrupt_index(self) -> u16 {
        let lo = (self.0 & bits::INTR_INDEX_LO) >> 49;
        let hi = u64::from(self.0 & bits::INTR_INDEX_HI != 0) << 15;
        (lo | hi) as u16
    }

    pub(crate) fn set_remote_irr(&mut self, set: bool) {
        self.set_bit(bits::REMOTE_IRR, set);
    }

    /// Guest view of the low (`high == false`) or high half through `read_mask`.
    pub fn read_half(self, high: bool, read_mask: u64) -> u32 {
        let value = self.0 & read_mask;
        if high {
            (value >> 32) as u32
        } else {
            value as u32
        }
    }

    /// Merges a guest write into one half. Bits outside `write_mask` keep their
    /// current value.
    pub fn write_half(&mut self, high: bool, value: u32, write_mask: u64) {
        let shift = if high { 32 } else { 0 };
        let half_mask = (write_mask >> shift) & 0xFFFF_FFFF;
        let current = (self.0 >> shift) & 0xFFFF_FFFF;
        let merged = (u64::from(value) & half_mask) | (current & !half_mask);
        let keep = !(0xFFFF_FFFF_u64 << shift);
        self.0 = (self.0 & keep) | (merged << shift);
    }

    pub fn to_apic_interrupt(self) -> ApicInterrupt {
        ApicInterrupt {
            destination: self.destination(),
            destination_mode: self.destination_mode(),
            delivery_mode: self.delivery_mode(),
            vector: self.vector(),
            polarity: self.polarity(),
            trigger_mode: self.trigger_mode(),
            redirection_hint: false,
        }
    }

    /// Builds the MSI an IOMMU sees for this entry. Only the DMAR variant
    /// interprets the remappable format.
    pub fn to_msi(self, chip: IoApicChipType) -> MsiMessage {
        if chip == IoApicChipType::Dmar && self.is_remappable() {
            // SHV is taken from the low delivery-mode bit.
            let shv = self.0 & (1 << 8) != 0;
            return MsiMessage::remappable(self.interrupt_index(), shv);
        }
        MsiMessage::compatibility(
            self.destination(),
            self.destination_mode(),
            self.delivery_mode(),
            self.vector(),
            self.trigger_mode(),
        )
    }

    fn set_bit(&mut self, bit: u64, set: bool) {
        if set {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}
