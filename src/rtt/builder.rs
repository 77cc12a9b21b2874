//! Structural table operations and leaf state changes.
//!
//! These operate on the table arena only. Granule state changes (table and
//! data granules moving between DELEGATED and their typed state) are the
//! monitor's job and happen after an operation here succeeded.

use super::{Ripas, RttEntry, RttError, RttSpace, RttState, RttTable, Walk};
use crate::types::{
    is_aligned, level_size, Ipa, Pa, GRANULE_SIZE, RTT_ENTRIES, RTT_MAX_LEVEL, RTT_MIN_BLOCK_LEVEL,
};
use tracing::trace;

impl RttSpace {
    /// Walks to the parent entry of the table at `level` covering `ipa`.
    pub(crate) fn walk_to_parent(&self, tree: usize, ipa: Ipa, level: u8) -> Result<Walk, RttError> {
        self.check_tree(tree)?;
        if level <= self.start_level() || level > RTT_MAX_LEVEL {
            return Err(RttError::Input("table level out of range"));
        }
        self.check_ipa_level(ipa, level - 1, self.start_level())?;
        let walk = self.walk(tree, ipa, level - 1)?;
        if walk.level < level - 1 {
            return Err(RttError::Walk {
                tree,
                level: walk.level,
            });
        }
        Ok(walk)
    }

    /// Inserts table `rtt` at `level`; its entries replicate the parent entry.
    pub fn create_table(&mut self, tree: usize, ipa: Ipa, level: u8, rtt: Pa) -> Result<(), RttError> {
        let parent = self.walk_to_parent(tree, ipa, level)?;
        if parent.entry.state == RttState::Table {
            return Err(RttError::State {
                tree,
                level: level - 1,
            });
        }
        if self.tables.contains_key(&rtt) {
            return Err(RttError::Input("granule already holds a table"));
        }
        let entries = (0..RTT_ENTRIES)
            .map(|i| parent.entry.child(i, level))
            .collect();
        self.tables.insert(
            rtt,
            RttTable {
                level,
                tree,
                base: ipa,
                entries,
            },
        );
        self.set_entry(&parent, RttEntry::table(rtt));
        trace!(tree, ipa = format_args!("{:#x}", ipa), level, "table created");
        Ok(())
    }

    /// Removes an empty table and returns its granule address.
    pub fn destroy_table(&mut self, tree: usize, ipa: Ipa, level: u8) -> Result<Pa, RttError> {
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
        if table.has_live_entries() {
            return Err(RttError::State { tree, level });
        }
        if tree == 0 && self.is_protected(ipa) {
            if let Some(index) = self.aux_alias(ipa, level_size(level - 1)) {
                return Err(RttError::AuxLive { index });
            }
        }
        self.tables.remove(&rtt);
        let replacement = if self.is_protected(ipa) {
            RttEntry::destroyed()
        } else {
            RttEntry::unassigned(None)
        };
        self.set_entry(&parent, replacement);
        trace!(tree, ipa = format_args!("{:#x}", ipa), level, "table destroyed");
        Ok(rtt)
    }

    fn leaf_walk(&self, ipa: Ipa) -> Result<Walk, RttError> {
        self.check_ipa_level(ipa, RTT_MAX_LEVEL, self.start_level())?;
        if !self.is_protected(ipa) {
            return Err(RttError::Input("address in unprotected half"));
        }
        let walk = self.walk(0, ipa, RTT_MAX_LEVEL)?;
        if walk.level < RTT_MAX_LEVEL {
            return Err(RttError::Walk {
                tree: 0,
                level: walk.level,
            });
        }
        Ok(walk)
    }

    /// UNASSIGNED -> ASSIGNED for a protected leaf. `ripas_for` maps the
    /// previous RIPAS to the new one.
    pub fn assign_data(
        &mut self,
        ipa: Ipa,
        data: Pa,
        ripas_for: impl FnOnce(Option<Ripas>) -> Ripas,
    ) -> Result<(), RttError> {
        let walk = self.leaf_walk(ipa)?;
        if walk.entry.state != RttState::Unassigned {
            return Err(RttError::State {
                tree: 0,
                level: RTT_MAX_LEVEL,
            });
        }
        let mut entry = RttEntry::assigned(data, ripas_for(walk.entry.ripas));
        entry.s2ap = walk.entry.s2ap;
        self.set_entry(&walk, entry);
        Ok(())
    }

    /// ASSIGNED -> UNASSIGNED for a protected leaf; RAM content becomes DESTROYED.
    pub fn unassign_data(&mut self, ipa: Ipa) -> Result<Pa, RttError> {
        let walk = self.leaf_walk(ipa)?;
        if walk.entry.state != RttState::Assigned {
            return Err(RttError::State {
                tree: 0,
                level: RTT_MAX_LEVEL,
            });
        }
        if let Some(index) = self.aux_alias(ipa, GRANULE_SIZE) {
            return Err(RttError::AuxLive { index });
        }
        let ripas = match walk.entry.ripas {
            Some(Ripas::Ram) | None => Ripas::Destroyed,
            Some(other) => other,
        };
        let mut entry = RttEntry::unassigned(Some(ripas));
        entry.s2ap = walk.entry.s2ap;
        self.set_entry(&walk, entry);
        Ok(walk.entry.addr)
    }

    fn unprotected_walk(&self, ipa: Ipa, level: u8) -> Result<Walk, RttError> {
        self.check_ipa_level(ipa, level, self.start_level().max(RTT_MIN_BLOCK_LEVEL))?;
        if self.is_protected(ipa) {
            return Err(RttError::Input("address in protected half"));
        }
        let walk = self.walk(0, ipa, level)?;
        if walk.level < level {
            return Err(RttError::Walk {
                tree: 0,
                level: walk.level,
            });
        }
        Ok(walk)
    }

    pub fn map_unprotected(&mut self, ipa: Ipa, level: u8, addr: Pa, attr: u64) -> Result<(), RttError> {
        let walk = self.unprotected_walk(ipa, level)?;
        if !is_aligned(addr, level_size(level)) {
            return Err(RttError::Input("output address not aligned to level"));
        }
        if walk.entry.state != RttState::Unassigned {
            return Err(RttError::State { tree: 0, level });
        }
        self.set_entry(&walk, RttEntry::assigned_ns(addr, attr));
        Ok(())
    }

    pub fn unmap_unprotected(&mut self, ipa: Ipa, level: u8) -> Result<(), RttError> {
        let walk = self.unprotected_walk(ipa, level)?;
        if walk.entry.state != RttState::AssignedNs {
            return Err(RttError::State { tree: 0, level });
        }
        self.set_entry(&walk, RttEntry::unassigned(None));
        Ok(())
    }

    fn check_aux_index(&self, index: usize) -> Result<(), RttError> {
        if index == 0 || index >= self.tree_count() {
            return Err(RttError::Input("auxiliary tree index out of range"));
        }
        Ok(())
    }

    /// Aliases the primary protected mapping of `ipa` into auxiliary tree `index`,
    /// at the level the primary mapping lives at.
    pub fn aux_map_protected(&mut self, ipa: Ipa, index: usize) -> Result<(), RttError> {
        self.check_aux_index(index)?;
        self.check_ipa_level(ipa, RTT_MAX_LEVEL, self.start_level())?;
        if !self.is_protected(ipa) {
            return Err(RttError::Input("address in unprotected half"));
        }
        let primary = self.walk(0, ipa, RTT_MAX_LEVEL)?;
        if primary.entry.state != RttState::Assigned {
            return Err(RttError::State {
                tree: 0,
                level: primary.level,
            });
        }
        let aux = self.walk(index, ipa, primary.level)?;
        if aux.level < primary.level {
            return Err(RttError::Walk {
                tree: index,
                level: aux.level,
            });
        }
        if aux.entry.state != RttState::Unassigned {
            return Err(RttError::State {
                tree: index,
                level: aux.level,
            });
        }
        let mut entry = primary.entry;
        entry.s2ap = aux.entry.s2ap;
        self.set_entry(&aux, entry);
        Ok(())
    }

    pub fn aux_unmap_protected(&mut self, ipa: Ipa, index: usize) -> Result<(), RttError> {
        self.check_aux_index(index)?;
        self.check_ipa_level(ipa, RTT_MAX_LEVEL, self.start_level())?;
        if !self.is_protected(ipa) {
            return Err(RttError::Input("address in unprotected half"));
        }
        let aux = self.walk(index, ipa, RTT_MAX_LEVEL)?;
        if aux.entry.state != RttState::Assigned {
            return Err(RttError::State {
                tree: index,
                level: aux.level,
            });
        }
        let mut entry = RttEntry::unassigned(Some(Ripas::Empty));
        entry.s2ap = aux.entry.s2ap;
        self.set_entry(&aux, entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::types::align_down;

    #[test]
    fn test_create_table_rejects_short_walk_and_existing_table() {
        let mut space = space(false);
        assert_eq!(
            space.create_table(0, 0, 2, 0xa000_0000),
            Err(RttError::Walk { tree: 0, level: 0 })
        );
        space.create_table(0, 0, 1, 0xa000_0000).unwrap();
        assert_eq!(
            space.create_table(0, 0, 1, 0xa000_1000),
            Err(RttError::State { tree: 0, level: 0 })
        );
        assert_eq!(
            space.create_table(0, 0x1000, 2, 0xa000_1000),
            Err(RttError::Input("address not aligned to level"))
        );
    }

    #[test]
    fn test_data_assign_and_unassign() {
        let mut space = space(false);
        let mut next = 0xa000_0000;
        map_tables(&mut space, 0, 0x1000, &mut next);
        space
            .assign_data(0x1000, 0x8800_0000, |_| Ripas::Ram)
            .unwrap();
        let view = space.read_entry(0, 0x1000, 3).unwrap();
        assert_eq!(view.state, RttState::Assigned);
        assert_eq!(view.ripas, Some(Ripas::Ram));

        assert_eq!(space.unassign_data(0x1000), Ok(0x8800_0000));
        let view = space.read_entry(0, 0x1000, 3).unwrap();
        assert_eq!(view.state, RttState::Unassigned);
        assert_eq!(view.ripas, Some(Ripas::Destroyed));
        assert_eq!(
            space.unassign_data(0x1000),
            Err(RttError::State { tree: 0, level: 3 })
        );
    }

    #[test]
    fn test_destroy_table_marks_parent() {
        let mut space = space(false);
        let mut next = 0xa000_0000;
        map_tables(&mut space, 0, 0x1000, &mut next);
        space
            .assign_data(0x1000, 0x8800_0000, |_| Ripas::Ram)
            .unwrap();
        assert_eq!(
            space.destroy_table(0, 0, 3),
            Err(RttError::State { tree: 0, level: 3 })
        );
        space.unassign_data(0x1000).unwrap();
        let rtt = space.destroy_table(0, 0, 3).unwrap();
        assert_eq!(rtt, 0xa000_2000);
        let view = space.read_entry(0, 0, 2).unwrap();
        assert_eq!(view.state, RttState::Destroyed);
        assert_eq!(view.ripas, None);
    }

    #[test]
    fn test_unprotected_map_unmap() {
        let mut space = space(false);
        let mut next = 0xa000_0000;
        let ipa = space.unprotected_base();
        map_tables(&mut space, 0, ipa, &mut next);
        assert_eq!(
            space.map_unprotected(0x1000, 3, 0x1000, 0),
            Err(RttError::Input("address in protected half"))
        );
        space.map_unprotected(ipa, 3, 0x8000_0000, 0x4).unwrap();
        let view = space.read_entry(0, ipa, 3).unwrap();
        assert_eq!(view.state, RttState::AssignedNs);
        assert_eq!(view.ripas, None);
        assert_eq!(view.attr, 0x4);
        space.unmap_unprotected(ipa, 3).unwrap();
        assert_eq!(
            space.unmap_unprotected(ipa, 3),
            Err(RttError::State { tree: 0, level: 3 })
        );
    }

    #[test]
    fn test_aux_alias_blocks_data_destroy() {
        let mut space = space(true);
        let mut next = 0xa000_0000;
        map_tables(&mut space, 0, 0x1000, &mut next);
        space
            .assign_data(0x1000, 0x8800_0000, |_| Ripas::Ram)
            .unwrap();

        // Aux tree only has its root: walk stops short.
        assert_eq!(
            space.aux_map_protected(0x1000, 1),
            Err(RttError::Walk { tree: 1, level: 0 })
        );
        map_tables(&mut space, 1, 0x1000, &mut next);
        space.aux_map_protected(0x1000, 1).unwrap();
        assert_eq!(space.aux_alias(align_down(0x1000, 0x20_0000), 0x20_0000), Some(1));
        assert_eq!(space.unassign_data(0x1000), Err(RttError::AuxLive { index: 1 }));
        assert_eq!(RttError::AuxLive { index: 1 }.code().packed(), 0x107);

        space.aux_unmap_protected(0x1000, 1).unwrap();
        assert!(space.unassign_data(0x1000).is_ok());
    }
}
