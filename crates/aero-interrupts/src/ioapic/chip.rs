//! Per-chipset register parameters.

use crate::config::IoApicChipType;

use super::rte::bits;

pub const VERSION_ICH9: u8 = 0x20;
pub const VERSION_82093AA: u8 = 0x11;

const MAX_RTE: u8 = 23;
const REDUCED_MAX_RTE: u8 = 15;

const ICH9_WRITE_MASK: u64 = bits::DEST
    | bits::MASK
    | bits::TRIGGER_MODE
    | bits::POLARITY
    | bits::DEST_MODE
    | bits::DELIVERY_MODE
    | bits::VECTOR;
const ICH9_READ_MASK: u64 =
    ICH9_WRITE_MASK | bits::EXT_DEST_ID | bits::REMOTE_IRR | bits::DELIVERY_STATUS;

const DMAR_WRITE_MASK: u64 = bits::INTR_INDEX_LO
    | bits::INTR_FORMAT
    | bits::MASK
    | bits::TRIGGER_MODE
    | bits::POLARITY
    | bits::INTR_INDEX_HI
    | bits::DELIVERY_MODE
    | bits::VECTOR;
const DMAR_READ_MASK: u64 = DMAR_WRITE_MASK | bits::REMOTE_IRR | bits::DELIVERY_STATUS;

const I82093AA_WRITE_MASK: u64 = ICH9_WRITE_MASK;
const I82093AA_READ_MASK: u64 = ICH9_READ_MASK & !bits::EXT_DEST_ID;

/// Fixed parameters of one I/O APIC generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChipParams {
    pub version: u8,
    pub id_mask: u8,
    /// Highest redirection-table index, as reported in the version register.
    pub max_rte: u8,
    /// Last indirect register index that addresses the redirection table.
    pub last_rte_reg: u8,
    pub write_mask: u64,
    pub read_mask: u64,
    pub has_eoi_register: bool,
    pub has_arbitration_register: bool,
}

impl ChipParams {
    pub fn num_pins(&self) -> u32 {
        u32::from(self.max_rte) + 1
    }

    /// Value of the version register: version in 7:0, max RTE in 23:16.
    pub fn version_register(&self) -> u32 {
        u32::from(self.version) | (u32::from(self.max_rte) << 16)
    }
}

impl IoApicChipType {
    pub fn params(self) -> ChipParams {
        match self {
            IoApicChipType::Ich9 => ChipParams {
                version: VERSION_ICH9,
                id_mask: 0xFF,
                max_rte: MAX_RTE,
                last_rte_reg: 0x3F,
                write_mask: ICH9_WRITE_MASK,
                read_mask: ICH9_READ_MASK,
                has_eoi_register: true,
                has_arbitration_register: false,
            },
            IoApicChipType::Dmar => ChipParams {
                write_mask: DMAR_WRITE_MASK,
                read_mask: DMAR_READ_MASK,
                ..IoApicChipType::Ich9.params()
            },
            IoApicChipType::I82093aa => ChipParams {
                version: VERSION_82093AA,
                id_mask: 0x0F,
                max_rte: MAX_RTE,
                last_rte_reg: 0x3F,
                write_mask: I82093AA_WRITE_MASK,
                read_mask: I82093AA_READ_MASK,
                has_eoi_register: false,
                has_arbitration_register: true,
            },
            IoApicChipType::I82379ab => ChipParams {
                max_rte: REDUCED_MAX_RTE,
                last_rte_reg: 0x2F,
                ..IoApicChipType::I82093aa.params()
            },
        }
    }

    pub fn num_pins(self) -> u32 {
        self.params().num_pins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_registers() {
        assert_eq!(IoApicChipType::Ich9.params().version_register(), 0x0017_0020);
        assert_eq!(IoApicChipType::Dmar.params().version_register(), 0x0017_0020);
        assert_eq!(
            IoApicChipType::I82093aa.params().version_register(),
            0x0017_0011
        );
        assert_eq!(
            IoApicChipType::I82379ab.params().version_register(),
            0x000F_0011
        );
    }

    #[test]
    fn last_register_index_covers_every_pin() {
        for chip in IoApicChipType::ALL {
            let p = chip.params();
            assert_eq!(u32::from(p.last_rte_reg), 0x10 + p.num_pins() * 2 - 1);
        }
    }

    #[test]
    fn status_bits_are_never_writable() {
        for chip in IoApicChipType::ALL {
            let p = chip.params();
            assert_eq!(p.write_mask & (bits::REMOTE_IRR | bits::DELIVERY_STATUS), 0);
            assert_ne!(p.read_mask & bits::REMOTE_IRR, 0);
            assert_eq!(p.read_mask & p.write_mask, p.write_mask);
        }
    }

    #[test]
    fn dmar_exposes_remap_fields_instead_of_destination() {
        let p = IoApicChipType::Dmar.params();
        assert_eq!(p.write_mask & bits::DEST, bits::INTR_INDEX_LO & bits::DEST);
        assert_ne!(p.write_mask & bits::INTR_FORMAT, 0);
        assert_eq!(p.write_mask & bits::DEST_MODE, bits::INTR_INDEX_HI);
    }
}
