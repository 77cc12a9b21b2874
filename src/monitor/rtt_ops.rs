//! Translation-table, data and range commands.

use super::{
    first_violation, DataDestroyed, ModelMonitor, RangeCheck, RmiError, RmiResult, RttDestroyed,
    DESC_ADDR_MASK, DESC_ATTR_MASK,
};
use crate::granule::GranuleState;
use crate::realm::{Realm, RealmState};
use crate::rtt::{Ripas, RttEntryView};
use crate::types::{is_aligned, Ipa, Pa, ReturnCode, GRANULE_SIZE};

impl ModelMonitor {
    fn realm_mut(&mut self, rd: Pa) -> Result<&mut Realm, RmiError> {
        self.realms
            .get_mut(&rd)
            .ok_or_else(|| ReturnCode::input().into())
    }

    fn check_aux_index(&self, rd: Pa, index: usize) -> RmiResult<()> {
        let realm = self.realm(rd)?;
        if index == 0 || index >= realm.rtt.tree_count() {
            return Err(ReturnCode::input().into());
        }
        Ok(())
    }

    pub(super) fn create_rtt(&mut self, rd: Pa, rtt: Pa, ipa: Ipa, level: u8, tree: usize) -> RmiResult<()> {
        self.realm(rd)?;
        self.expect_granule(rtt, GranuleState::Delegated)?;
        self.realm_mut(rd)?.rtt.create_table(tree, ipa, level, rtt)?;
        self.registry
            .transition(rtt, GranuleState::Delegated, GranuleState::Rtt, Some(rd))?;
        Ok(())
    }

    pub(super) fn destroy_rtt(&mut self, rd: Pa, ipa: Ipa, level: u8, tree: usize) -> RmiResult<RttDestroyed> {
        self.realm(rd)?;
        let policy = self.config.top_policy;
        let rtt = match self.realm_mut(rd)?.rtt.destroy_table(tree, ipa, level) {
            Ok(rtt) => rtt,
            Err(err) => return Err(self.rtt_failure(rd, tree, ipa, err)),
        };
        self.registry
            .transition(rtt, GranuleState::Rtt, GranuleState::Delegated, None)?;
        let top = self.realm(rd)?.rtt.walk_top(tree, ipa, policy)?;
        Ok(RttDestroyed { rtt, top })
    }

    pub(super) fn fold_rtt(&mut self, rd: Pa, ipa: Ipa, level: u8) -> RmiResult<Pa> {
        self.realm(rd)?;
        let outcome = self.realm_mut(rd)?.rtt.fold(0, ipa, level)?;
        self.registry
            .transition(outcome.rtt, GranuleState::Rtt, GranuleState::Delegated, None)?;
        Ok(outcome.rtt)
    }

    pub(super) fn read_rtt_entry(&self, rd: Pa, ipa: Ipa, level: u8) -> RmiResult<RttEntryView> {
        Ok(self.realm(rd)?.rtt.read_entry(0, ipa, level)?)
    }

    pub(super) fn create_aux_rtt(&mut self, rd: Pa, rtt: Pa, ipa: Ipa, level: u8, index: usize) -> RmiResult<()> {
        self.check_aux_index(rd, index)?;
        self.create_rtt(rd, rtt, ipa, level, index)
    }

    pub(super) fn destroy_aux_rtt(&mut self, rd: Pa, ipa: Ipa, level: u8, index: usize) -> RmiResult<RttDestroyed> {
        self.check_aux_index(rd, index)?;
        self.destroy_rtt(rd, ipa, level, index)
    }

    pub(super) fn aux_map(&mut self, rd: Pa, ipa: Ipa, index: usize) -> RmiResult<()> {
        self.check_aux_index(rd, index)?;
        self.realm_mut(rd)?.rtt.aux_map_protected(ipa, index)?;
        Ok(())
    }

    pub(super) fn aux_unmap(&mut self, rd: Pa, ipa: Ipa, index: usize) -> RmiResult<()> {
        self.check_aux_index(rd, index)?;
        self.realm_mut(rd)?.rtt.aux_unmap_protected(ipa, index)?;
        Ok(())
    }

    pub(super) fn create_data(&mut self, rd: Pa, data: Pa, ipa: Ipa, src: Pa, measure: bool) -> RmiResult<()> {
        let realm = self.realm(rd)?;
        let state = realm.state;
        self.expect_granule(data, GranuleState::Delegated)?;
        self.expect_granule(src, GranuleState::Undelegated)?;
        if state != RealmState::New {
            return Err(ReturnCode::realm().into());
        }
        self.realm_mut(rd)?
            .rtt
            .assign_data(ipa, data, |_| Ripas::Ram)?;
        self.registry
            .transition(data, GranuleState::Delegated, GranuleState::Data, Some(rd))?;
        self.registry.copy(src, data)?;
        let content = if measure {
            Some(self.registry.read(data)?)
        } else {
            None
        };
        self.realm_mut(rd)?
            .measurement
            .extend_data(ipa, content.as_deref());
        Ok(())
    }

    /// Maps a DATA granule without copying; DESTROYED content becomes EMPTY.
    pub(super) fn create_data_unknown(&mut self, rd: Pa, data: Pa, ipa: Ipa) -> RmiResult<()> {
        self.realm(rd)?;
        self.expect_granule(data, GranuleState::Delegated)?;
        self.realm_mut(rd)?.rtt.assign_data(ipa, data, |prev| match prev {
            Some(Ripas::Ram) => Ripas::Ram,
            _ => Ripas::Empty,
        })?;
        self.registry
            .transition(data, GranuleState::Delegated, GranuleState::Data, Some(rd))?;
        Ok(())
    }

    pub(super) fn destroy_data(&mut self, rd: Pa, ipa: Ipa) -> RmiResult<DataDestroyed> {
        self.realm(rd)?;
        let policy = self.config.top_policy;
        let data = match self.realm_mut(rd)?.rtt.unassign_data(ipa) {
            Ok(data) => data,
            Err(err) => return Err(self.rtt_failure(rd, 0, ipa, err)),
        };
        self.registry
            .transition(data, GranuleState::Data, GranuleState::Delegated, None)?;
        let top = self.realm(rd)?.rtt.walk_top(0, ipa, policy)?;
        Ok(DataDestroyed { data, top })
    }

    pub(super) fn map_unprotected(&mut self, rd: Pa, ipa: Ipa, level: u8, desc: u64) -> RmiResult<()> {
        self.realm(rd)?;
        if desc & !(DESC_ADDR_MASK | DESC_ATTR_MASK) != 0 {
            return Err(ReturnCode::input().into());
        }
        let addr = desc & DESC_ADDR_MASK;
        let attr = desc & DESC_ATTR_MASK;
        self.realm_mut(rd)?
            .rtt
            .map_unprotected(ipa, level, addr, attr)?;
        Ok(())
    }

    pub(super) fn unmap_unprotected(&mut self, rd: Pa, ipa: Ipa, level: u8) -> RmiResult<Ipa> {
        self.realm(rd)?;
        let policy = self.config.top_policy;
        if let Err(err) = self.realm_mut(rd)?.rtt.unmap_unprotected(ipa, level) {
            return Err(self.rtt_failure(rd, 0, ipa, err));
        }
        Ok(self.realm(rd)?.rtt.walk_top(0, ipa, policy)?)
    }

    pub(super) fn init_ripas(&mut self, rd: Pa, base: Ipa, top: Ipa) -> RmiResult<Ipa> {
        if self.realm(rd)?.state != RealmState::New {
            return Err(ReturnCode::realm().into());
        }
        let realm = self.realm_mut(rd)?;
        let next = realm.rtt.init_ripas(base, top)?;
        realm.measurement.extend_ripas(base, next);
        Ok(next)
    }

    /// Evaluates the configurable range checks for a pending request of `rec`.
    fn range_violation(
        &self,
        rd: Pa,
        rec: Pa,
        base: Ipa,
        top: Ipa,
        pending: Option<(Ipa, Ipa)>,
        check_top_alignment: bool,
    ) -> RmiResult<()> {
        let owner = self.rec(rec)?.rd;
        let violated = |check: RangeCheck| match check {
            RangeCheck::RecOwner => owner != rd,
            RangeCheck::PendingRequest => pending.is_none(),
            RangeCheck::InvalidSize => top <= base,
            RangeCheck::BaseMismatch => pending.is_some_and(|(next, _)| next != base),
            RangeCheck::TopOutOfBound => pending.is_some_and(|(_, limit)| top > limit),
            RangeCheck::TopUnaligned => check_top_alignment && !is_aligned(top, GRANULE_SIZE),
        };
        match first_violation(&self.config.range_precedence, violated) {
            Some(check) => Err(check.code().into()),
            // Checks left out of the precedence list still apply, after the listed ones.
            None if owner != rd || pending.is_none() => Err(ReturnCode::rec().into()),
            None => Ok(()),
        }
    }

    pub(super) fn set_ripas(&mut self, rd: Pa, rec: Pa, base: Ipa, top: Ipa) -> RmiResult<Ipa> {
        self.realm(rd)?;
        let request = self.rec(rec)?.pending_ripas;
        self.range_violation(rd, rec, base, top, request.map(|r| (r.next, r.top)), false)?;
        let Some(request) = request else {
            return Err(ReturnCode::rec().into());
        };
        let next = self
            .realm_mut(rd)?
            .rtt
            .set_ripas(base, top, request.ripas, request.change_destroyed)?;
        if let Some(pending) = self.recs.get_mut(&rec).and_then(|r| r.pending_ripas.as_mut()) {
            pending.next = next;
        }
        Ok(next)
    }

    /// Applies the pending S2AP change to the primary and auxiliary trees.
    /// Progress is the least any tree can reach; a failure writes nothing.
    pub(super) fn set_s2ap(&mut self, rd: Pa, rec: Pa, base: Ipa, top: Ipa) -> RmiResult<Ipa> {
        self.realm(rd)?;
        let request = self.rec(rec)?.pending_s2ap;
        self.range_violation(rd, rec, base, top, request.map(|r| (r.next, r.top)), true)?;
        let Some(request) = request else {
            return Err(ReturnCode::rec().into());
        };
        let next = self.realm_mut(rd)?.rtt.set_s2ap_all(base, top, request.index)?;
        if let Some(pending) = self.recs.get_mut(&rec).and_then(|r| r.pending_s2ap.as_mut()) {
            pending.next = next;
        }
        Ok(next)
    }
}
