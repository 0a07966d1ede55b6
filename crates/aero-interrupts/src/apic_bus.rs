//! Contracts between the interrupt controllers and the CPU side of the machine.

use serde::{Deserialize, Serialize};

use crate::msi::MsiMessage;
use crate::tag::TraceTag;

/// APIC delivery mode as encoded in redirection entries and MSI data words.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryMode {
    Fixed,
    LowestPriority,
    Smi,
    Reserved3,
    Nmi,
    Init,
    Reserved6,
    ExtInt,
}

impl DeliveryMode {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x7 {
            0 => DeliveryMode::Fixed,
            1 => DeliveryMode::LowestPriority,
            2 => DeliveryMode::Smi,
            3 => DeliveryMode::Reserved3,
            4 => DeliveryMode::Nmi,
            5 => DeliveryMode::Init,
            6 => DeliveryMode::Reserved6,
            _ => DeliveryMode::ExtInt,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            DeliveryMode::Fixed => 0,
            DeliveryMode::LowestPriority => 1,
            DeliveryMode::Smi => 2,
            DeliveryMode::Reserved3 => 3,
            DeliveryMode::Nmi => 4,
            DeliveryMode::Init => 5,
            DeliveryMode::Reserved6 => 6,
            DeliveryMode::ExtInt => 7,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationMode {
    Physical,
    Logical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerMode {
    Edge,
    Level,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

/// A fully decoded interrupt on its way to the local APICs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApicInterrupt {
    pub destination: u8,
    pub destination_mode: DestinationMode,
    pub delivery_mode: DeliveryMode,
    pub vector: u8,
    pub polarity: Polarity,
    pub trigger_mode: TriggerMode,
    pub redirection_hint: bool,
}

impl ApicInterrupt {
    /// Decodes a compatibility-format MSI. MSIs have no polarity, they are
    /// always reported active-high.
    pub fn from_msi(msi: &MsiMessage) -> Self {
        Self {
            destination: msi.destination_id(),
            destination_mode: msi.destination_mode(),
            delivery_mode: msi.delivery_mode(),
            vector: msi.vector(),
            polarity: Polarity::ActiveHigh,
            trigger_mode: msi.trigger_mode(),
            redirection_hint: msi.redirection_hint(),
        }
    }

    /// Replaces the routing fields with those of a (remapped) MSI, keeping the
    /// polarity that came from the redirection entry.
    pub fn apply_msi(&mut self, msi: &MsiMessage) {
        let polarity = self.polarity;
        *self = Self::from_msi(msi);
        self.polarity = polarity;
    }
}

/// Outcome reported by an [`ApicBus`] for one delivery attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    Accepted,
    /// No local APIC took the interrupt; the controller leaves its state as if
    /// the attempt never happened.
    Discarded,
}

impl DeliveryStatus {
    pub fn is_accepted(self) -> bool {
        matches!(self, DeliveryStatus::Accepted)
    }
}

/// The APIC bus (local APICs) as seen by the I/O APIC and the MSI path.
///
/// Implementations are called with the controller lock held and must not
/// block or call back into the same controller synchronously.
pub trait ApicBus: Send + Sync {
    fn deliver(&self, interrupt: &ApicInterrupt, tag: TraceTag) -> DeliveryStatus;
}

/// The INTR line from the PIC pair to the CPU.
pub trait CpuIntLine: Send + Sync {
    fn set_level(&self, asserted: bool);
}
