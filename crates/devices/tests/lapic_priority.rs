use std::collections::BTreeSet;

use aero_devices::LocalApic;
use aero_interrupts::apic_bus::{DeliveryMode, DestinationMode, Polarity, TriggerMode};
use aero_interrupts::{ApicInterrupt, TraceTag};
use proptest::prelude::*;

fn fixed(vector: u8) -> ApicInterrupt {
    ApicInterrupt {
        destination: 0,
        destination_mode: DestinationMode::Physical,
        delivery_mode: DeliveryMode::Fixed,
        vector,
        polarity: Polarity::ActiveHigh,
        trigger_mode: TriggerMode::Edge,
        redirection_hint: false,
    }
}

proptest! {
    #[test]
    fn vectors_are_serviced_highest_first(vectors in prop::collection::vec(0x10u8..=0xFF, 1..32)) {
        let lapic = LocalApic::new(0);
        for &vector in &vectors {
            prop_assert!(lapic.deliver(&fixed(vector), TraceTag::NONE).is_accepted());
        }

        let mut serviced = Vec::new();
        while let Some((vector, _)) = lapic.acknowledge() {
            serviced.push(vector);
            prop_assert_eq!(lapic.eoi(), Some(vector));
        }

        let expected: Vec<u8> = vectors.iter().copied().collect::<BTreeSet<_>>().into_iter().rev().collect();
        prop_assert_eq!(serviced, expected);
    }

    #[test]
    fn in_service_class_masks_lower_classes(high in 0x20u8..=0xFF, low in 0x10u8..=0xFF) {
        let lapic = LocalApic::new(0);
        lapic.deliver(&fixed(high), TraceTag::NONE);
        let (taken, _) = lapic.acknowledge().unwrap();
        prop_assert_eq!(taken, high);

        lapic.deliver(&fixed(low), TraceTag::NONE);
        let expect_blocked = low >> 4 <= high >> 4;
        prop_assert_eq!(lapic.pending_vector().is_none(), expect_blocked);
    }
}
