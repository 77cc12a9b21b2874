//! Table walks, entry reads, `top` computation and range scans.

use super::{RttEntry, RttEntryView, RttError, RttSpace, RttState, TopPolicy};
use crate::types::{align_down, entry_index, level_size, Ipa, Pa, RTT_ENTRIES, RTT_MAX_LEVEL};

/// Where a walk stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Walk {
    pub level: u8,
    /// Table holding `entry`.
    pub table: Pa,
    pub index: usize,
    pub entry: RttEntry,
}

impl RttSpace {
    /// Descends from the root of `tree` towards `level`, stopping early at the
    /// first entry that is not a TABLE.
    pub fn walk(&self, tree: usize, ipa: Ipa, level: u8) -> Result<Walk, RttError> {
        self.check_tree(tree)?;
        if ipa >= self.ipa_limit() {
            return Err(RttError::Input("address outside realm IPA space"));
        }
        let span = level_size(self.start_level) * RTT_ENTRIES as u64;
        let mut table_pa = *self
            .roots(tree)
            .get((ipa / span) as usize)
            .ok_or(RttError::Input("address beyond starting tables"))?;
        let mut current = self.start_level;
        loop {
            let table = self
                .tables
                .get(&table_pa)
                .ok_or(RttError::Input("dangling table reference"))?;
            let index = entry_index(ipa, current);
            let entry = table.entries[index];
            if current >= level || entry.state != RttState::Table {
                return Ok(Walk {
                    level: current,
                    table: table_pa,
                    index,
                    entry,
                });
            }
            table_pa = entry.addr;
            current += 1;
        }
    }

    /// Reads the entry covering `ipa` at `level`. A short walk is reported
    /// through `walk_level`, never as an error.
    pub fn read_entry(&self, tree: usize, ipa: Ipa, level: u8) -> Result<RttEntryView, RttError> {
        self.check_tree(tree)?;
        self.check_ipa_level(ipa, level, self.start_level)?;
        let walk = self.walk(tree, ipa, level)?;
        Ok(RttEntryView::new(walk.level, &walk.entry))
    }

    /// `top` reported after walking `ipa` down to the leaf level.
    pub fn walk_top(&self, tree: usize, ipa: Ipa, policy: TopPolicy) -> Result<Ipa, RttError> {
        let walk = self.walk(tree, ipa, RTT_MAX_LEVEL)?;
        Ok(self.top_after(&walk, ipa, policy))
    }

    pub fn top_after(&self, walk: &Walk, ipa: Ipa, policy: TopPolicy) -> Ipa {
        let size = level_size(walk.level);
        let mut top = align_down(ipa, size) + size;
        if policy == TopPolicy::SkipNonLive {
            if let Some(table) = self.tables.get(&walk.table) {
                top += table.entries[walk.index + 1..]
                    .iter()
                    .take_while(|e| !e.state.is_live())
                    .count() as u64
                    * size;
            }
        }
        top.min(self.ipa_limit())
    }

    /// Lowest auxiliary tree index holding an ASSIGNED entry in `[base, base + size)`.
    pub fn aux_alias(&self, base: Ipa, size: u64) -> Option<usize> {
        (1..self.tree_count())
            .find(|tree| self.any_in_range(*tree, base, size, |e| e.state == RttState::Assigned))
    }

    /// Whether any leaf-most entry of `tree` overlapping the range satisfies `pred`.
    pub fn any_in_range(
        &self,
        tree: usize,
        base: Ipa,
        size: u64,
        pred: impl Fn(&RttEntry) -> bool,
    ) -> bool {
        let end = base.saturating_add(size);
        self.roots(tree)
            .iter()
            .any(|root| self.scan(*root, base, end, &pred))
    }

    fn scan(&self, table_pa: Pa, base: Ipa, end: Ipa, pred: &impl Fn(&RttEntry) -> bool) -> bool {
        let Some(table) = self.tables.get(&table_pa) else {
            return false;
        };
        let size = level_size(table.level);
        table.entries.iter().enumerate().any(|(i, entry)| {
            let start = table.base + i as u64 * size;
            if start >= end || start + size <= base {
                return false;
            }
            if entry.state == RttState::Table {
                self.scan(entry.addr, base, end, pred)
            } else {
                pred(entry)
            }
        })
    }
}
