//! Realm Translation Tables
//!
//! Stage-2 translation trees of one realm: a primary tree plus, when
//! per-plane trees are enabled, one auxiliary tree per plane. Tables are kept
//! in an arena keyed by the physical address of their RTT granule; entries
//! refer to child tables by that address.

pub mod builder;
pub mod fold;
pub mod ripas;
pub mod walker;

pub use fold::FoldOutcome;
pub use walker::Walk;

use crate::types::{is_aligned, level_size, Ipa, Pa, ReturnCode, RTT_ENTRIES, RTT_MAX_LEVEL};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Host-side mapping state of an entry (HIPAS).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RttState {
    Unassigned,
    Assigned,
    AssignedNs,
    Table,
    Destroyed,
}

impl RttState {
    /// Live entries keep a table from being destroyed.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            RttState::Assigned | RttState::AssignedNs | RttState::Table
        )
    }
}

/// Realm-visible content state of a protected address (RIPAS).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Ripas {
    Empty,
    Ram,
    Destroyed,
}

/// Which `top` a walking or destructive command reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopPolicy {
    /// End of the entry at which the walk terminated.
    #[default]
    EntryEnd,
    /// Additionally skip following non-live entries of the same table.
    SkipNonLive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RttEntry {
    pub state: RttState,
    pub ripas: Option<Ripas>,
    /// Output address: data granule, NS address or next-level table.
    pub addr: Pa,
    /// Host-provided memory attributes (ASSIGNED_NS only).
    pub attr: u64,
    /// Stage-2 access permission overlay index.
    pub s2ap: u8,
}

impl RttEntry {
    pub fn unassigned(ripas: Option<Ripas>) -> Self {
        Self {
            state: RttState::Unassigned,
            ripas,
            addr: 0,
            attr: 0,
            s2ap: 0,
        }
    }

    pub fn assigned(addr: Pa, ripas: Ripas) -> Self {
        Self {
            state: RttState::Assigned,
            ripas: Some(ripas),
            addr,
            attr: 0,
            s2ap: 0,
        }
    }

    pub fn assigned_ns(addr: Pa, attr: u64) -> Self {
        Self {
            state: RttState::AssignedNs,
            ripas: None,
            addr,
            attr,
            s2ap: 0,
        }
    }

    pub fn table(addr: Pa) -> Self {
        Self {
            state: RttState::Table,
            ripas: None,
            addr,
            attr: 0,
            s2ap: 0,
        }
    }

    pub fn destroyed() -> Self {
        Self {
            state: RttState::Destroyed,
            ripas: None,
            addr: 0,
            attr: 0,
            s2ap: 0,
        }
    }

    /// Whether the entry carries an output address that advances per child.
    pub fn maps_output(&self) -> bool {
        matches!(self.state, RttState::Assigned | RttState::AssignedNs)
    }

    /// Entry of the `index`-th child when this entry is split one level down.
    pub fn child(&self, index: usize, child_level: u8) -> Self {
        let mut child = *self;
        if self.maps_output() {
            child.addr = self.addr + index as u64 * level_size(child_level);
        }
        child
    }
}

/// Result of `read_entry`: the entry where the walk ended and its level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RttEntryView {
    pub walk_level: u8,
    pub state: RttState,
    pub ripas: Option<Ripas>,
    pub addr: Pa,
    pub attr: u64,
    pub s2ap: u8,
}

impl RttEntryView {
    pub fn new(walk_level: u8, entry: &RttEntry) -> Self {
        Self {
            walk_level,
            state: entry.state,
            ripas: entry.ripas,
            addr: entry.addr,
            attr: entry.attr,
            s2ap: entry.s2ap,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RttTable {
    pub level: u8,
    pub tree: usize,
    /// First IPA covered by the table.
    pub base: Ipa,
    pub entries: Vec<RttEntry>,
}

impl RttTable {
    fn has_live_entries(&self) -> bool {
        self.entries.iter().any(|e| e.state.is_live())
    }
}

/// Translation-table failures; `code()` gives the packed command status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RttError {
    #[error("Invalid argument: {0}")]
    Input(&'static str),

    #[error("Walk of tree {tree} stopped at level {level}")]
    Walk { tree: usize, level: u8 },

    #[error("Entry at level {level} of tree {tree} is in the wrong state")]
    State { tree: usize, level: u8 },

    #[error("Auxiliary tree {index} maps the address")]
    AuxLive { index: usize },
}

impl RttError {
    pub fn code(&self) -> ReturnCode {
        match *self {
            RttError::Input(_) => ReturnCode::input(),
            RttError::Walk { tree: 0, level } | RttError::State { tree: 0, level } => {
                ReturnCode::rtt(level)
            }
            RttError::Walk { level, .. } | RttError::State { level, .. } => {
                ReturnCode::rtt_aux(level)
            }
            RttError::AuxLive { index } => ReturnCode::rtt_aux(index as u8),
        }
    }
}

/// All translation trees of one realm.
#[derive(Debug, Clone)]
pub struct RttSpace {
    s2sz: u8,
    start_level: u8,
    roots: Vec<Vec<Pa>>,
    tables: BTreeMap<Pa, RttTable>,
}

impl RttSpace {
    /// Builds the starting-level tables of every tree. `roots[t]` holds the
    /// concatenated root tables of tree `t`.
    pub fn new(s2sz: u8, start_level: u8, roots: Vec<Vec<Pa>>) -> Self {
        let mut space = Self {
            s2sz,
            start_level,
            roots: roots.clone(),
            tables: BTreeMap::new(),
        };
        let span = level_size(start_level) * RTT_ENTRIES as u64;
        for (tree, tree_roots) in roots.iter().enumerate() {
            for (i, pa) in tree_roots.iter().enumerate() {
                let base = i as u64 * span;
                let entries = (0..RTT_ENTRIES)
                    .map(|j| space.initial_entry(base + j as u64 * level_size(start_level)))
                    .collect();
                space.tables.insert(
                    *pa,
                    RttTable {
                        level: start_level,
                        tree,
                        base,
                        entries,
                    },
                );
            }
        }
        space
    }

    fn initial_entry(&self, ipa: Ipa) -> RttEntry {
        if self.is_protected(ipa) {
            RttEntry::unassigned(Some(Ripas::Empty))
        } else {
            RttEntry::unassigned(None)
        }
    }

    pub fn s2sz(&self) -> u8 {
        self.s2sz
    }

    pub fn start_level(&self) -> u8 {
        self.start_level
    }

    pub fn tree_count(&self) -> usize {
        self.roots.len()
    }

    pub fn roots(&self, tree: usize) -> &[Pa] {
        self.roots.get(tree).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn all_roots(&self) -> impl Iterator<Item = Pa> + '_ {
        self.roots.iter().flatten().copied()
    }

    pub fn table(&self, pa: Pa) -> Option<&RttTable> {
        self.tables.get(&pa)
    }

    pub fn is_root(&self, pa: Pa) -> bool {
        self.roots.iter().any(|r| r.contains(&pa))
    }

    /// Tables below the starting level, any tree.
    pub fn non_root_tables(&self) -> impl Iterator<Item = (Pa, &RttTable)> + '_ {
        self.tables
            .iter()
            .filter(move |(pa, _)| !self.is_root(**pa))
            .map(|(pa, t)| (*pa, t))
    }

    pub fn unprotected_base(&self) -> Ipa {
        1u64 << (self.s2sz - 1)
    }

    pub fn ipa_limit(&self) -> Ipa {
        1u64 << self.s2sz
    }

    pub fn is_protected(&self, ipa: Ipa) -> bool {
        ipa < self.unprotected_base()
    }

    pub fn check_tree(&self, tree: usize) -> Result<(), RttError> {
        if tree >= self.tree_count() {
            return Err(RttError::Input("tree index out of range"));
        }
        Ok(())
    }

    /// Common argument checks: level in range, `ipa` aligned for the level and inside the realm.
    pub fn check_ipa_level(&self, ipa: Ipa, level: u8, min_level: u8) -> Result<(), RttError> {
        if level < min_level || level > RTT_MAX_LEVEL {
            return Err(RttError::Input("level out of range"));
        }
        if !is_aligned(ipa, level_size(level)) {
            return Err(RttError::Input("address not aligned to level"));
        }
        if ipa >= self.ipa_limit() {
            return Err(RttError::Input("address outside realm IPA space"));
        }
        Ok(())
    }

    /// Overwrites the entry a fresh walk ended at.
    fn set_entry(&mut self, walk: &Walk, entry: RttEntry) {
        if let Some(table) = self.tables.get_mut(&walk.table) {
            table.entries[walk.index] = entry;
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub const ROOT: Pa = 0x9000_0000;
    pub const AUX_ROOT: Pa = 0x9100_0000;

    /// 40-bit realm, level-0 start, optional single auxiliary tree.
    pub fn space(with_aux: bool) -> RttSpace {
        let mut roots = vec![vec![ROOT]];
        if with_aux {
            roots.push(vec![AUX_ROOT]);
        }
        RttSpace::new(40, 0, roots)
    }

    /// Creates tables for levels 1..=3 covering `ipa` in `tree`, drawing
    /// table addresses from `next`.
    pub fn map_tables(space: &mut RttSpace, tree: usize, ipa: Ipa, next: &mut Pa) {
        for level in 1..=RTT_MAX_LEVEL {
            let base = crate::types::align_down(ipa, level_size(level - 1));
            let walk = space.walk(tree, base, level - 1).unwrap();
            if walk.level == level - 1 && walk.entry.state != RttState::Table {
                space.create_table(tree, base, level, *next).unwrap();
                *next += crate::types::GRANULE_SIZE;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_initial_root_entries() {
        let space = space(false);
        let root = space.table(ROOT).unwrap();
        assert_eq!(root.entries[0].ripas, Some(Ripas::Empty));
        assert_eq!(root.entries[1].ripas, None);
        assert_eq!(root.entries[1].state, RttState::Unassigned);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(RttError::Walk { tree: 0, level: 2 }.code(), ReturnCode::rtt(2));
        assert_eq!(
            RttError::Walk { tree: 1, level: 2 }.code(),
            ReturnCode::rtt_aux(2)
        );
        assert_eq!(RttError::AuxLive { index: 1 }.code(), ReturnCode::rtt_aux(1));
        assert_eq!(RttError::Input("x").code(), ReturnCode::input());
    }

    #[test]
    fn test_child_replication() {
        let parent = RttEntry::assigned(0x4020_0000, Ripas::Ram);
        let child = parent.child(3, 3);
        assert_eq!(child.addr, 0x4020_3000);
        assert_eq!(child.ripas, Some(Ripas::Ram));
        let unassigned = RttEntry::unassigned(Some(Ripas::Empty)).child(5, 3);
        assert_eq!(unassigned.addr, 0);
    }
}
