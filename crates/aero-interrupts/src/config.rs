//! Construction-time configuration for the interrupt controllers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::InterruptError;

/// I/O APIC chipset generation. Each variant fixes the pin count, the
/// redirection-entry read/write masks and which optional registers exist.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IoApicChipType {
    #[default]
    Ich9,
    /// ICH9-class part with the VT-d remappable redirection-entry format.
    Dmar,
    I82093aa,
    I82379ab,
}

impl IoApicChipType {
    pub const ALL: [IoApicChipType; 4] = [
        IoApicChipType::Ich9,
        IoApicChipType::Dmar,
        IoApicChipType::I82093aa,
        IoApicChipType::I82379ab,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IoApicChipType::Ich9 => "ICH9",
            IoApicChipType::Dmar => "DMAR",
            IoApicChipType::I82093aa => "82093AA",
            IoApicChipType::I82379ab => "82379AB",
        }
    }
}

impl fmt::Display for IoApicChipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IoApicChipType {
    type Err = InterruptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IoApicChipType::ALL
            .into_iter()
            .find(|chip| chip.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| InterruptError::UnknownChipType(s.to_string()))
    }
}

impl TryFrom<String> for IoApicChipType {
    type Error = InterruptError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IoApicChipType> for String {
    fn from(chip: IoApicChipType) -> Self {
        chip.as_str().to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoApicConfig {
    pub chip_type: IoApicChipType,
    /// Number of vCPUs in the machine. Informational only.
    pub num_cpus: u32,
    /// PCI requester ID presented to the IOMMU for redirection-table interrupts.
    pub pci_address: Option<u16>,
}

impl Default for IoApicConfig {
    fn default() -> Self {
        Self {
            chip_type: IoApicChipType::Ich9,
            num_cpus: 1,
            pci_address: None,
        }
    }
}

/// Legacy port assignment for the PIC pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PicConfig {
    pub master_base: u16,
    pub slave_base: u16,
    pub master_elcr: u16,
    pub slave_elcr: u16,
}

impl Default for PicConfig {
    fn default() -> Self {
        Self {
            master_base: 0x20,
            slave_base: 0xA0,
            master_elcr: 0x4D0,
            slave_elcr: 0x4D1,
        }
    }
}
