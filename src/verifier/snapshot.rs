//! Before/after comparison for fold and unfold.

use crate::error::{CheckError, PrepError};
use crate::host::expect_ok;
use crate::monitor::Rmi;
use crate::rtt::{RttEntryView, RttState};
use crate::types::{is_aligned, level_size, Ipa, Pa, RTT_ENTRIES};

/// Every child entry of the table at `level` covering `base`, read before a fold.
#[derive(Debug, Clone)]
pub struct FoldSnapshot {
    pub base: Ipa,
    pub level: u8,
    /// Output address of the parent TABLE entry, i.e. the table granule.
    pub table: Pa,
    pub children: Vec<RttEntryView>,
}

impl FoldSnapshot {
    pub fn capture<M: Rmi + ?Sized>(m: &M, rd: Pa, base: Ipa, level: u8) -> Result<Self, PrepError> {
        if level == 0 || !is_aligned(base, level_size(level - 1)) {
            return Err(PrepError::step("fold snapshot", format!("{base:#x} is not a level {level} table base")));
        }
        let parent = expect_ok("read entry", m.rtt_read_entry(rd, base, level - 1))?;
        if parent.walk_level != level - 1 || parent.state != RttState::Table {
            return Err(PrepError::step("fold snapshot", format!("no level {level} table at {base:#x}")));
        }
        let size = level_size(level);
        let children = (0..RTT_ENTRIES as u64)
            .map(|i| expect_ok("read entry", m.rtt_read_entry(rd, base + i * size, level)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            base,
            level,
            table: parent.addr,
            children,
        })
    }

    fn child_ipa(&self, index: usize) -> Ipa {
        self.base + index as u64 * level_size(self.level)
    }

    /// After a fold: `returned_rtt` is the old table, every interior read
    /// stops one level up with the children's states and, for mapped
    /// entries, `parent.addr + offset == child.addr`.
    pub fn verify_folded<M: Rmi + ?Sized>(&self, m: &M, rd: Pa, returned_rtt: Pa) -> Result<(), CheckError> {
        if returned_rtt != self.table {
            return Err(CheckError::FoldMismatch {
                ipa: self.base,
                detail: format!("returned rtt {returned_rtt:#x}, table was {:#x}", self.table),
            });
        }
        for (index, before) in self.children.iter().enumerate() {
            let ipa = self.child_ipa(index);
            let after = m.rtt_read_entry(rd, ipa, self.level).map_err(|err| CheckError::FoldMismatch {
                ipa,
                detail: format!("read entry failed with {}", err.code),
            })?;
            let mismatch = |detail: String| CheckError::FoldMismatch { ipa, detail };
            if before.walk_level != after.walk_level + 1 {
                return Err(mismatch(format!(
                    "walk level {} after fold, {} before",
                    after.walk_level, before.walk_level
                )));
            }
            if before.state != after.state || before.ripas != after.ripas {
                return Err(mismatch(format!(
                    "{:?}/{:?} after fold, {:?}/{:?} before",
                    after.state, after.ripas, before.state, before.ripas
                )));
            }
            let mapped = matches!(after.state, RttState::Assigned | RttState::AssignedNs);
            if mapped && after.addr + (ipa - self.base) != before.addr {
                return Err(mismatch(format!(
                    "parent address {:#x} + offset {:#x} != child address {:#x}",
                    after.addr,
                    ipa - self.base,
                    before.addr
                )));
            }
        }
        Ok(())
    }

    /// After re-creating the table: every child reads back exactly as captured.
    pub fn verify_unfolded<M: Rmi + ?Sized>(&self, m: &M, rd: Pa) -> Result<(), CheckError> {
        for (index, before) in self.children.iter().enumerate() {
            let ipa = self.child_ipa(index);
            let after = m.rtt_read_entry(rd, ipa, self.level).map_err(|err| CheckError::FoldMismatch {
                ipa,
                detail: format!("read entry failed with {}", err.code),
            })?;
            if &after != before {
                return Err(CheckError::FoldMismatch {
                    ipa,
                    detail: format!("unfolded {after:?}, captured {before:?}"),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{create_realm, map_unprotected_range, unfold};
    use crate::monitor::ModelMonitor;
    use crate::realm::RealmParams;
    use crate::types::GRANULE_SIZE;

    #[test]
    fn test_snapshot_round_trip_over_unprotected_block() {
        let mut m = ModelMonitor::default();
        let mut realm = create_realm(&mut m, &RealmParams::default()).unwrap();
        let base = map_unprotected_range(&mut m, &mut realm, 0, level_size(2), 0x8820_0000, 0).unwrap();

        let snapshot = FoldSnapshot::capture(&m, realm.rd, base, 3).unwrap();
        let rtt = m.rtt_fold(realm.rd, base, 3).unwrap();
        snapshot.verify_folded(&m, realm.rd, rtt).unwrap();

        unfold(&mut m, &realm, base, 2, 3).unwrap();
        snapshot.verify_unfolded(&m, realm.rd).unwrap();
        assert_eq!(snapshot.children[1].addr, 0x8820_0000 + GRANULE_SIZE);
    }

    #[test]
    fn test_capture_rejects_missing_table() {
        let mut m = ModelMonitor::default();
        let realm = create_realm(&mut m, &RealmParams::default()).unwrap();
        assert!(FoldSnapshot::capture(&m, realm.rd, 0, 3).is_err());
    }
}
