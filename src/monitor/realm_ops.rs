//! Granule delegation, realm lifecycle, REC lifecycle and PSCI completion.

use super::{ModelMonitor, RealmCreate, RmiError, RmiResult};
use crate::granule::GranuleState;
use crate::realm::{mpidr_from_index, Realm, RealmState, Rec, RecParams, RsiEvent};
use crate::realm::rec::PSCI_CPU_ON;
use crate::rtt::RttState;
use crate::types::{is_aligned, Pa, PsciStatus, ReturnCode, GRANULE_SIZE};
use std::collections::BTreeSet;
use tracing::debug;

impl ModelMonitor {
    pub(super) fn delegate(&mut self, pa: Pa) -> RmiResult<()> {
        self.registry.delegate(pa)?;
        Ok(())
    }

    pub(super) fn undelegate(&mut self, pa: Pa) -> RmiResult<()> {
        self.registry.undelegate(pa)?;
        Ok(())
    }

    /// Collects the starting tables of one tree, checking each is a distinct DELEGATED granule.
    fn collect_roots(
        &self,
        base: Pa,
        count: usize,
        claimed: &mut BTreeSet<Pa>,
    ) -> Result<Vec<Pa>, RmiError> {
        if !is_aligned(base, GRANULE_SIZE * count.next_power_of_two() as u64) {
            return Err(ReturnCode::input().into());
        }
        let mut roots = Vec::with_capacity(count);
        for i in 0..count as u64 {
            let pa = base + i * GRANULE_SIZE;
            self.expect_granule(pa, GranuleState::Delegated)?;
            if !claimed.insert(pa) {
                return Err(ReturnCode::input().into());
            }
            roots.push(pa);
        }
        Ok(roots)
    }

    pub(super) fn create_realm(&mut self, rd: Pa, create: &RealmCreate) -> RmiResult<()> {
        self.expect_granule(rd, GranuleState::Delegated)?;
        let params = &create.params;
        if let Err(err) = params.validate(&self.config.features) {
            debug!(rd = format_args!("{:#x}", rd), error = %err, "realm parameters rejected");
            return Err(ReturnCode::input().into());
        }
        if self.realms.values().any(|r| r.params.vmid == params.vmid) {
            return Err(ReturnCode::input().into());
        }
        if create.aux_rtt_base.len() != params.tree_count() - 1 {
            return Err(ReturnCode::input().into());
        }

        let mut claimed = BTreeSet::from([rd]);
        let mut roots = vec![self.collect_roots(create.rtt_base, params.num_start_rtts, &mut claimed)?];
        for base in &create.aux_rtt_base {
            roots.push(self.collect_roots(*base, params.num_start_rtts, &mut claimed)?);
        }

        self.registry
            .transition(rd, GranuleState::Delegated, GranuleState::Rd, Some(rd))?;
        for pa in roots.iter().flatten() {
            self.registry
                .transition(*pa, GranuleState::Delegated, GranuleState::Rtt, Some(rd))?;
        }
        self.realms.insert(rd, Realm::new(rd, params.clone(), roots));
        Ok(())
    }

    pub(super) fn activate_realm(&mut self, rd: Pa) -> RmiResult<()> {
        self.realm(rd)?;
        let realm = self.realms.get_mut(&rd).ok_or(RmiError::from(ReturnCode::input()))?;
        if realm.state != RealmState::New {
            return Err(ReturnCode::realm().into());
        }
        realm.state = RealmState::Active;
        debug!(
            rd = format_args!("{:#x}", rd),
            rim = %realm.measurement.to_hex(),
            "realm activated"
        );
        Ok(())
    }

    pub(super) fn destroy_realm(&mut self, rd: Pa) -> RmiResult<()> {
        let realm = self.realm(rd)?;
        let roots_live = realm.rtt.all_roots().any(|root| {
            realm.rtt.table(root).is_some_and(|t| {
                t.entries
                    .iter()
                    .any(|e| matches!(e.state, RttState::Assigned | RttState::AssignedNs))
            })
        });
        if !realm.recs.is_empty() || realm.rtt.non_root_tables().next().is_some() || roots_live {
            return Err(ReturnCode::realm().into());
        }
        let roots: Vec<Pa> = realm.rtt.all_roots().collect();
        for pa in roots {
            self.registry
                .transition(pa, GranuleState::Rtt, GranuleState::Delegated, None)?;
        }
        self.registry
            .transition(rd, GranuleState::Rd, GranuleState::Delegated, None)?;
        self.realms.remove(&rd);
        Ok(())
    }

    pub(super) fn create_rec(&mut self, rd: Pa, rec: Pa, params: &RecParams) -> RmiResult<()> {
        let realm = self.realm(rd)?;
        self.expect_granule(rec, GranuleState::Delegated)?;
        if realm.state != RealmState::New {
            return Err(ReturnCode::realm().into());
        }
        if params.mpidr != mpidr_from_index(realm.next_rec_index) {
            return Err(ReturnCode::input().into());
        }
        if params.aux.len() != self.config.features.rec_aux_count {
            return Err(ReturnCode::input().into());
        }
        let mut claimed = BTreeSet::from([rd, rec]);
        for aux in &params.aux {
            self.expect_granule(*aux, GranuleState::Delegated)?;
            if !claimed.insert(*aux) {
                return Err(ReturnCode::input().into());
            }
        }

        self.registry
            .transition(rec, GranuleState::Delegated, GranuleState::Rec, Some(rd))?;
        for aux in &params.aux {
            self.registry
                .transition(*aux, GranuleState::Delegated, GranuleState::RecAux, Some(rd))?;
        }
        let realm = self.realms.get_mut(&rd).ok_or(RmiError::from(ReturnCode::input()))?;
        let index = realm.next_rec_index;
        realm.next_rec_index += 1;
        realm.recs.insert(index, rec);
        realm.measurement.extend_rec(params.pc, params.runnable);
        self.recs.insert(rec, Rec::new(rec, rd, index, params));
        Ok(())
    }

    /// A REC is live while runnable in an ACTIVE realm.
    pub(super) fn rec_is_live(&self, rec: &Rec) -> bool {
        self.realms
            .get(&rec.rd)
            .is_some_and(|realm| realm.state == RealmState::Active && rec.runnable)
    }

    pub(super) fn destroy_rec(&mut self, pa: Pa) -> RmiResult<()> {
        let rec = self.rec(pa)?;
        if self.rec_is_live(rec) {
            return Err(ReturnCode::rec().into());
        }
        let (rd, index, aux) = (rec.rd, rec.index, rec.aux.clone());
        self.registry
            .transition(pa, GranuleState::Rec, GranuleState::Delegated, None)?;
        for aux in aux {
            self.registry
                .transition(aux, GranuleState::RecAux, GranuleState::Delegated, None)?;
        }
        if let Some(realm) = self.realms.get_mut(&rd) {
            realm.recs.remove(&index);
        }
        self.recs.remove(&pa);
        Ok(())
    }

    pub(super) fn complete_psci(&mut self, calling: Pa, target: Pa, status: PsciStatus) -> RmiResult<()> {
        let input = || RmiError::from(ReturnCode::input());
        if calling == target {
            return Err(input());
        }
        let caller = self.rec(calling)?;
        let callee = self.rec(target)?;
        let request = caller.pending_psci.ok_or_else(input)?;
        if caller.rd != callee.rd || callee.mpidr != request.target_mpidr {
            return Err(input());
        }
        let permitted = match (request.function, callee.runnable) {
            (PSCI_CPU_ON, true) => status == PsciStatus::AlreadyOn,
            (PSCI_CPU_ON, false) => matches!(status, PsciStatus::Success | PsciStatus::Denied),
            _ => status == PsciStatus::Success,
        };
        if !permitted {
            return Err(input());
        }

        if request.function == PSCI_CPU_ON && status == PsciStatus::Success {
            if let Some(callee) = self.recs.get_mut(&target) {
                callee.runnable = true;
            }
        }
        if let Some(caller) = self.recs.get_mut(&calling) {
            caller.pending_psci = None;
            caller.gprs[0] = status.raw() as u64;
            caller.events.push(RsiEvent::PsciResult {
                function: request.function,
                status,
            });
        }
        Ok(())
    }
}
