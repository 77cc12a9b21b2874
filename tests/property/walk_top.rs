//! `top` reported after a short walk.

use super::{map_tables, space, ROOT};
use proptest::prelude::*;
use realm_model::rtt::{Ripas, RttState, TopPolicy};
use realm_model::types::{align_down, level_size, GRANULE_SIZE, RTT_MAX_LEVEL};

/// Page-aligned addresses in the protected half of a 40-bit realm.
fn protected_ipa() -> impl Strategy<Value = u64> {
    (0u64..(1 << 27)).prop_map(|page| page * GRANULE_SIZE)
}

#[test]
fn walk_stops_at_deepest_table_and_reports_entry_end() {
    let mut runner = proptest::test_runner::TestRunner::default();
    runner
        .run(&(protected_ipa(), 0u8..=RTT_MAX_LEVEL), |(ipa, depth)| {
            let mut space = space();
            let mut next = ROOT + GRANULE_SIZE;
            map_tables(&mut space, ipa, depth, &mut next);

            let walk = space.walk(0, ipa, RTT_MAX_LEVEL).unwrap();
            prop_assert_eq!(walk.level, depth);
            prop_assert_eq!(walk.entry.state, RttState::Unassigned);

            let size = level_size(depth);
            let top = space.walk_top(0, ipa, TopPolicy::EntryEnd).unwrap();
            prop_assert_eq!(top, align_down(ipa, size) + size);
            prop_assert!(top > ipa);
            Ok(())
        })
        .unwrap();
}

#[test]
fn skipping_non_live_entries_reaches_table_end() {
    let mut runner = proptest::test_runner::TestRunner::default();
    runner
        .run(&(protected_ipa(), 1u8..=RTT_MAX_LEVEL), |(ipa, depth)| {
            let mut space = space();
            let mut next = ROOT + GRANULE_SIZE;
            map_tables(&mut space, ipa, depth, &mut next);

            let entry_end = space.walk_top(0, ipa, TopPolicy::EntryEnd).unwrap();
            let skipped = space.walk_top(0, ipa, TopPolicy::SkipNonLive).unwrap();
            // Every sibling of a freshly created table is UNASSIGNED.
            let table_span = level_size(depth - 1);
            prop_assert!(skipped >= entry_end);
            prop_assert_eq!(skipped, align_down(ipa, table_span) + table_span);
            Ok(())
        })
        .unwrap();
}

proptest! {
    #[test]
    fn live_sibling_bounds_the_skip(page in 0u64..510, gap in 1u64..8) {
        let mut space = space();
        let mut next = ROOT + GRANULE_SIZE;
        let ipa = page * GRANULE_SIZE;
        map_tables(&mut space, ipa, RTT_MAX_LEVEL, &mut next);
        let live = (page + gap).min(511) * GRANULE_SIZE;
        space.assign_data(live, 0x8800_0000, |_| Ripas::Ram).unwrap();

        let skipped = space.walk_top(0, ipa, TopPolicy::SkipNonLive).unwrap();
        prop_assert_eq!(skipped, live);
    }
}
