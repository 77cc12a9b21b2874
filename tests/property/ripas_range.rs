//! RIPAS range updates: progress reporting, truncation and idempotence.

use super::{map_tables, space, ROOT};
use proptest::prelude::*;
use realm_model::rtt::{Ripas, RttSpace};
use realm_model::types::{level_size, Ipa, GRANULE_SIZE, RTT_ENTRIES, RTT_MAX_LEVEL};

const BLOCK: u64 = 0x20_0000;

/// A level 3 table at the `block`-th 2 MiB block and a sub-range of its pages.
fn table_range() -> impl Strategy<Value = (u64, u64, u64)> {
    (0u64..64, 0u64..RTT_ENTRIES as u64)
        .prop_flat_map(|(block, first)| (Just(block), Just(first), 1..=RTT_ENTRIES as u64 - first))
}

fn with_table(block: u64) -> (RttSpace, Ipa) {
    let mut space = space();
    let mut next = ROOT + GRANULE_SIZE;
    let base = block * BLOCK;
    map_tables(&mut space, base, RTT_MAX_LEVEL, &mut next);
    (space, base)
}

fn ripas_at(space: &RttSpace, ipa: Ipa) -> Option<Ripas> {
    space.read_entry(0, ipa, RTT_MAX_LEVEL).unwrap().ripas
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn init_covers_exactly_the_range((block, first, pages) in table_range()) {
        let (mut space, base) = with_table(block);
        let lo = base + first * GRANULE_SIZE;
        let hi = lo + pages * GRANULE_SIZE;

        prop_assert_eq!(space.init_ripas(lo, hi).unwrap(), hi);
        prop_assert_eq!(ripas_at(&space, lo), Some(Ripas::Ram));
        prop_assert_eq!(ripas_at(&space, hi - GRANULE_SIZE), Some(Ripas::Ram));
        if first > 0 {
            prop_assert_eq!(ripas_at(&space, lo - GRANULE_SIZE), Some(Ripas::Empty));
        }
        if hi < base + BLOCK {
            prop_assert_eq!(ripas_at(&space, hi), Some(Ripas::Empty));
        }
    }

    #[test]
    fn range_past_the_table_stops_at_its_end(block in 0u64..64, first in 0u64..512, extra in 1u64..512) {
        let (mut space, base) = with_table(block);
        let lo = base + first * GRANULE_SIZE;
        let end = base + BLOCK;
        // The next 2 MiB is still a level 2 block, which the range only
        // partly covers.
        prop_assert_eq!(space.init_ripas(lo, end + extra * GRANULE_SIZE).unwrap(), end);
        prop_assert_eq!(level_size(2), BLOCK);
    }

    #[test]
    fn set_ripas_truncates_and_is_idempotent(
        (block, first, pages) in table_range(),
        slack in 0u64..GRANULE_SIZE,
        ripas in prop_oneof![Just(Ripas::Empty), Just(Ripas::Ram)],
    ) {
        let (mut space, base) = with_table(block);
        space.init_ripas(base, base + BLOCK).unwrap();
        let lo = base + first * GRANULE_SIZE;
        let hi = lo + pages * GRANULE_SIZE;

        let once = space.set_ripas(lo, hi + slack, ripas, false).unwrap();
        prop_assert_eq!(once, hi);
        let after_once: Vec<_> = (first..first + pages)
            .map(|p| ripas_at(&space, base + p * GRANULE_SIZE))
            .collect();
        prop_assert!(after_once.iter().all(|r| *r == Some(ripas)));

        let twice = space.set_ripas(lo, hi + slack, ripas, false).unwrap();
        prop_assert_eq!(twice, once);
        let after_twice: Vec<_> = (first..first + pages)
            .map(|p| ripas_at(&space, base + p * GRANULE_SIZE))
            .collect();
        prop_assert_eq!(after_twice, after_once);
    }

    #[test]
    fn destroyed_entry_ends_a_change_unless_allowed(
        (block, first, pages) in table_range(),
        at in 0u64..RTT_ENTRIES as u64,
    ) {
        prop_assume!(pages > 1);
        let (mut space, base) = with_table(block);
        space.init_ripas(base, base + BLOCK).unwrap();
        let lo = base + first * GRANULE_SIZE;
        let hi = lo + pages * GRANULE_SIZE;
        let victim = lo + (1 + at % (pages - 1)) * GRANULE_SIZE;
        space.assign_data(victim, 0x8800_0000, |_| Ripas::Ram).unwrap();
        space.unassign_data(victim).unwrap();
        prop_assert_eq!(ripas_at(&space, victim), Some(Ripas::Destroyed));

        prop_assert_eq!(space.set_ripas(lo, hi, Ripas::Empty, false).unwrap(), victim);
        prop_assert_eq!(space.set_ripas(victim, hi, Ripas::Empty, true).unwrap(), hi);
        prop_assert_eq!(ripas_at(&space, victim), Some(Ripas::Empty));
    }

    #[test]
    fn sub_granule_range_makes_no_progress(block in 0u64..64, first in 0u64..512, slack in 1u64..GRANULE_SIZE) {
        let (mut space, base) = with_table(block);
        space.init_ripas(base, base + BLOCK).unwrap();
        let lo = base + first * GRANULE_SIZE;

        prop_assert_eq!(space.set_ripas(lo, lo + slack, Ripas::Empty, false).unwrap(), lo);
        prop_assert_eq!(ripas_at(&space, lo), Some(Ripas::Ram));
    }
}
