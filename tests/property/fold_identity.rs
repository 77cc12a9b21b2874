//! Folding a homogeneous table and re-creating it restores every child.

use super::{map_tables, space, ROOT};
use proptest::prelude::*;
use realm_model::rtt::{Ripas, RttEntryView, RttSpace, RttState};
use realm_model::types::{Ipa, Pa, GRANULE_SIZE, RTT_ENTRIES, RTT_MAX_LEVEL};

const BLOCK: u64 = 0x20_0000;

#[derive(Debug, Clone, Copy)]
enum Fill {
    Empty,
    Ram,
    NonSecure { out: Pa, attr: u64 },
}

fn fill() -> impl Strategy<Value = Fill> {
    prop_oneof![
        Just(Fill::Empty),
        Just(Fill::Ram),
        ((1u64..64), (0u64..8)).prop_map(|(block, attr)| Fill::NonSecure {
            out: 0x8000_0000 + block * BLOCK,
            attr: attr << 2,
        }),
    ]
}

/// Builds a level 3 table at the `block`-th 2 MiB block of the half `fill`
/// belongs to and returns its base address.
fn build(space: &mut RttSpace, block: u64, fill: Fill) -> Ipa {
    let mut next = ROOT + GRANULE_SIZE;
    let base = match fill {
        Fill::NonSecure { .. } => space.unprotected_base() + block * BLOCK,
        _ => block * BLOCK,
    };
    map_tables(space, base, RTT_MAX_LEVEL, &mut next);
    match fill {
        Fill::Empty => {}
        Fill::Ram => {
            assert_eq!(space.init_ripas(base, base + BLOCK).unwrap(), base + BLOCK);
        }
        Fill::NonSecure { out, attr } => {
            for page in 0..RTT_ENTRIES as u64 {
                space
                    .map_unprotected(base + page * GRANULE_SIZE, RTT_MAX_LEVEL, out + page * GRANULE_SIZE, attr)
                    .unwrap();
            }
        }
    }
    base
}

fn children(space: &RttSpace, base: Ipa) -> Vec<RttEntryView> {
    (0..RTT_ENTRIES as u64)
        .map(|i| space.read_entry(0, base + i * GRANULE_SIZE, RTT_MAX_LEVEL).unwrap())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn fold_then_unfold_restores_children(block in 0u64..256, fill in fill()) {
        let mut space = space();
        let base = build(&mut space, block, fill);
        let before = children(&space, base);

        let folded = space.fold(0, base, RTT_MAX_LEVEL).unwrap();
        let parent = space.read_entry(0, base, 2).unwrap();
        prop_assert_eq!(parent.walk_level, 2);
        prop_assert_eq!(parent.state, before[0].state);
        prop_assert_eq!(parent.ripas, before[0].ripas);
        for (i, child) in before.iter().enumerate().step_by(97) {
            let read = space.read_entry(0, base + i as u64 * GRANULE_SIZE, RTT_MAX_LEVEL).unwrap();
            prop_assert_eq!(read.walk_level, 2);
            prop_assert_eq!(read.state, child.state);
            if child.state == RttState::AssignedNs {
                prop_assert_eq!(read.addr + i as u64 * GRANULE_SIZE, child.addr);
            }
        }

        space.create_table(0, base, RTT_MAX_LEVEL, folded.rtt).unwrap();
        prop_assert_eq!(children(&space, base), before);
    }

    #[test]
    fn mixed_ripas_does_not_fold(block in 0u64..256, odd in 0u64..RTT_ENTRIES as u64) {
        let mut space = space();
        let base = build(&mut space, block, Fill::Empty);
        let page = base + odd * GRANULE_SIZE;
        space.init_ripas(page, page + GRANULE_SIZE).unwrap();

        prop_assert!(space.fold(0, base, RTT_MAX_LEVEL).is_err());
        let read = space.read_entry(0, page, RTT_MAX_LEVEL).unwrap();
        prop_assert_eq!(read.walk_level, RTT_MAX_LEVEL);
        prop_assert_eq!(read.ripas, Some(Ripas::Ram));
    }
}

#[test]
fn misaligned_non_secure_run_does_not_fold() {
    let mut space = space();
    let mut next = ROOT + GRANULE_SIZE;
    let base = space.unprotected_base() + 3 * BLOCK;
    map_tables(&mut space, base, RTT_MAX_LEVEL, &mut next);
    // Contiguous pages whose first output address sits mid-block.
    let out = 0x8000_0000 + GRANULE_SIZE;
    for page in 0..RTT_ENTRIES as u64 {
        space
            .map_unprotected(base + page * GRANULE_SIZE, RTT_MAX_LEVEL, out + page * GRANULE_SIZE, 0)
            .unwrap();
    }
    assert!(space.fold(0, base, RTT_MAX_LEVEL).is_err());
    assert_eq!(space.read_entry(0, base, 2).unwrap().state, RttState::Table);
}
