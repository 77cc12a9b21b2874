//! Fold: collapse a homogeneous table into one entry of its parent.
//!
//! Unfold is table creation over a block entry (`create_table` replicates
//! the parent), so only the folding direction lives here.

use super::{RttEntry, RttError, RttSpace, RttState};
use crate::types::{is_aligned, level_size, Ipa, Pa, RTT_MIN_BLOCK_LEVEL};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoldOutcome {
    /// Granule of the removed table (the parent's output address before the fold).
    pub rtt: Pa,
    /// Parent entry after the fold.
    pub parent: RttEntry,
}

/// Checks that `entries` can be represented by a single entry one level up
/// and returns that entry.
pub fn homogeneous_entry(entries: &[RttEntry], level: u8) -> Option<RttEntry> {
    let first = *entries.first()?;
    if first.state == RttState::Table {
        return None;
    }
    let child_size = level_size(level);
    let uniform = entries.iter().enumerate().all(|(i, e)| {
        e.state == first.state
            && e.ripas == first.ripas
            && e.attr == first.attr
            && e.s2ap == first.s2ap
            && (!first.maps_output() || e.addr == first.addr + i as u64 * child_size)
    });
    if !uniform {
        return None;
    }
    if first.maps_output() {
        let parent_level = level - 1;
        if parent_level < RTT_MIN_BLOCK_LEVEL || !is_aligned(first.addr, level_size(parent_level)) {
            return None;
        }
    }
    Some(first)
}

impl RttSpace {
    pub fn fold(&mut self, tree: usize, ipa: Ipa, level: u8) -> Result<FoldOutcome, RttError> {
        let parent = self.walk_to_parent(tree, ipa, level)?;
        if parent.entry.state != RttState::Table {
            return Err(RttError::State {
                tree,
                level: level - 1,
            });
        }
        let rtt = parent.entry.addr;
        let table = self
            .tables
            .get(&rtt)
            .ok_or(RttError::Input("dangling table reference"))?;
        let folded = homogeneous_entry(&table.entries, level).ok_or(RttError::State { tree, level })?;
        if tree == 0 && self.is_protected(ipa) {
            if let Some(index) = self.aux_alias(ipa, level_size(level - 1)) {
                return Err(RttError::AuxLive { index });
            }
        }
        self.tables.remove(&rtt);
        self.set_entry(&parent, folded);
        debug!(
            tree,
            ipa = format_args!("{:#x}", ipa),
            level,
            state = ?folded.state,
            "table folded"
        );
        Ok(FoldOutcome {
            rtt,
            parent: folded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::rtt::Ripas;

    fn unprotected_block(space: &mut RttSpace, next: &mut Pa) -> Ipa {
        let base = space.unprotected_base();
        map_tables(space, 0, base, next);
        for i in 0..512u64 {
            space
                .map_unprotected(base + i * 0x1000, 3, 0x8020_0000 + i * 0x1000, 0x4)
                .unwrap();
        }
        base
    }

    #[test]
    fn test_fold_unprotected_block() {
        let mut space = space(false);
        let mut next = 0xa000_0000;
        let base = unprotected_block(&mut space, &mut next);
        let parent_before = space.read_entry(0, base, 2).unwrap();

        let outcome = space.fold(0, base, 3).unwrap();
        assert_eq!(outcome.rtt, parent_before.addr);
        assert_eq!(outcome.parent.addr, 0x8020_0000);

        let after = space.read_entry(0, base + 0x5000, 3).unwrap();
        assert_eq!(after.walk_level, 2);
        assert_eq!(after.state, RttState::AssignedNs);
        assert_eq!(after.addr, 0x8020_0000);
    }

    #[test]
    fn test_fold_then_unfold_is_identity() {
        let mut space = space(false);
        let mut next = 0xa000_0000;
        let base = unprotected_block(&mut space, &mut next);
        let before: Vec<_> = space.table(0xa000_2000).unwrap().entries.clone();
        let outcome = space.fold(0, base, 3).unwrap();
        space.create_table(0, base, 3, outcome.rtt).unwrap();
        assert_eq!(space.table(outcome.rtt).unwrap().entries, before);
    }

    #[test]
    fn test_fold_rejects_mixed_tables() {
        let mut space = space(false);
        let mut next = 0xa000_0000;
        let base = unprotected_block(&mut space, &mut next);
        space.unmap_unprotected(base + 0x3000, 3).unwrap();
        assert_eq!(
            space.fold(0, base, 3),
            Err(RttError::State { tree: 0, level: 3 })
        );
    }

    #[test]
    fn test_fold_rejects_misaligned_output() {
        let entries: Vec<_> = (0..512u64)
            .map(|i| RttEntry::assigned(0x8000_1000 + i * 0x1000, Ripas::Ram))
            .collect();
        assert!(homogeneous_entry(&entries, 3).is_none());
        let entries: Vec<_> = (0..512)
            .map(|_| RttEntry::unassigned(Some(Ripas::Empty)))
            .collect();
        assert_eq!(
            homogeneous_entry(&entries, 3),
            Some(RttEntry::unassigned(Some(Ripas::Empty)))
        );
    }

    #[test]
    fn test_fold_refused_while_aux_aliases() {
        let mut space = space(true);
        let mut next = 0xa000_0000;
        map_tables(&mut space, 0, 0, &mut next);
        for i in 0..512u64 {
            space
                .assign_data(i * 0x1000, 0x8040_0000 + i * 0x1000, |_| Ripas::Ram)
                .unwrap();
        }
        map_tables(&mut space, 1, 0, &mut next);
        space.aux_map_protected(0x2000, 1).unwrap();
        assert_eq!(space.fold(0, 0, 3), Err(RttError::AuxLive { index: 1 }));
        space.aux_unmap_protected(0x2000, 1).unwrap();
        let outcome = space.fold(0, 0, 3).unwrap();
        assert_eq!(outcome.parent.addr, 0x8040_0000);
        assert_eq!(outcome.parent.ripas, Some(Ripas::Ram));
    }
}
