//! REC entry: resolves the previous exit, then runs the REC's guest script
//! until the next step that needs the host.

use super::{ModelMonitor, RmiResult};
use crate::granule::GranuleState;
use crate::realm::rec::{PSCI_CPU_ON, PSCI_SYSTEM_OFF, PSCI_SYSTEM_RESET, REC_GPRS};
use crate::realm::{
    AccessKind, ExitReason, GuestStep, PsciRequest, RealmState, RecEnter, RecExit, RipasRequest,
    RsiEvent, S2apRequest,
};
use crate::rtt::{Ripas, RttSpace, RttState};
use crate::types::{Ipa, Pa, ReturnCode, RmiStatus, RTT_MAX_LEVEL};
use tracing::trace;

/// What a realm access to `ipa` resolves to.
enum AccessOutcome {
    Completes,
    /// Synchronous external abort injected into the realm.
    InjectSea,
    /// Stage-2 fault reported to the host.
    HostFault,
}

fn resolve_access(rtt: &RttSpace, ipa: Ipa) -> AccessOutcome {
    let Ok(walk) = rtt.walk(0, ipa, RTT_MAX_LEVEL) else {
        return AccessOutcome::HostFault;
    };
    let entry = walk.entry;
    if !rtt.is_protected(ipa) {
        return match entry.state {
            RttState::AssignedNs => AccessOutcome::Completes,
            _ => AccessOutcome::HostFault,
        };
    }
    match (entry.state, entry.ripas) {
        (RttState::Assigned, Some(Ripas::Ram)) => AccessOutcome::Completes,
        (RttState::Assigned | RttState::Unassigned, Some(Ripas::Empty)) => AccessOutcome::InjectSea,
        _ => AccessOutcome::HostFault,
    }
}

fn rpv_words(rpv: &[u8]) -> [u64; REC_GPRS] {
    let mut words = [0u64; REC_GPRS];
    for (word, chunk) in words.iter_mut().zip(rpv.chunks(8)) {
        let mut bytes = [0u8; 8];
        bytes[..chunk.len()].copy_from_slice(chunk);
        *word = u64::from_le_bytes(bytes);
    }
    words
}

impl ModelMonitor {
    pub(super) fn enter_rec(&mut self, pa: Pa, enter: &RecEnter) -> RmiResult<RecExit> {
        self.registry.expect_state(pa, GranuleState::Rec)?;
        let rec = self
            .recs
            .get_mut(&pa)
            .ok_or(ReturnCode::input())?;
        let realm = self
            .realms
            .get_mut(&rec.rd)
            .ok_or(ReturnCode::input())?;
        match realm.state {
            RealmState::Active => {}
            RealmState::SystemOff => return Err(ReturnCode::new(RmiStatus::ErrorRealm, 1).into()),
            RealmState::New => return Err(ReturnCode::realm().into()),
        }
        if !rec.runnable || rec.has_blocking_request() {
            return Err(ReturnCode::rec().into());
        }

        if let Some(request) = rec.pending_ripas.take() {
            let accepted = !enter.reject_ripas;
            rec.events.push(RsiEvent::IpaStateSet {
                base: request.base,
                top: request.top,
                next: if accepted { request.next } else { request.base },
                accepted,
            });
        }
        if let Some(request) = rec.pending_s2ap.take() {
            rec.events.push(RsiEvent::S2apSet {
                base: request.base,
                top: request.top,
                next: request.next,
            });
        }
        rec.gprs = enter.gprs;

        while let Some(step) = rec.script.pop_front() {
            trace!(rec = format_args!("{:#x}", pa), ?step, "guest step");
            let exit = match step {
                GuestStep::HostCall { imm, gprs } => {
                    let mut exit = RecExit::new(ExitReason::HostCall);
                    exit.imm = imm;
                    for (slot, value) in exit.gprs.iter_mut().zip(gprs) {
                        *slot = value;
                    }
                    exit
                }
                GuestStep::ReportRpv => {
                    let mut exit = RecExit::new(ExitReason::HostCall);
                    exit.gprs = rpv_words(&realm.params.rpv);
                    exit
                }
                GuestStep::PsciCpuOn {
                    target_mpidr,
                    entry,
                } => {
                    rec.pending_psci = Some(PsciRequest {
                        function: PSCI_CPU_ON,
                        target_mpidr,
                    });
                    let mut exit = RecExit::new(ExitReason::Psci);
                    exit.gprs[0] = PSCI_CPU_ON;
                    exit.gprs[1] = target_mpidr;
                    exit.gprs[2] = entry;
                    exit
                }
                GuestStep::PsciSystemOff => {
                    realm.state = RealmState::SystemOff;
                    let mut exit = RecExit::new(ExitReason::SystemOff);
                    exit.gprs[0] = PSCI_SYSTEM_OFF;
                    exit
                }
                GuestStep::PsciSystemReset => {
                    realm.state = RealmState::SystemOff;
                    let mut exit = RecExit::new(ExitReason::Psci);
                    exit.gprs[0] = PSCI_SYSTEM_RESET;
                    exit
                }
                GuestStep::RipasChange {
                    base,
                    top,
                    ripas,
                    change_destroyed,
                } => {
                    rec.pending_ripas = Some(RipasRequest {
                        base,
                        top,
                        next: base,
                        ripas,
                        change_destroyed,
                    });
                    let mut exit = RecExit::new(ExitReason::RipasChange);
                    exit.ripas_base = base;
                    exit.ripas_top = top;
                    exit.ripas_value = Some(ripas);
                    exit
                }
                GuestStep::S2apChange { base, top, index } => {
                    rec.pending_s2ap = Some(S2apRequest {
                        base,
                        top,
                        next: base,
                        index,
                    });
                    let mut exit = RecExit::new(ExitReason::S2apChange);
                    exit.s2ap_base = base;
                    exit.s2ap_top = top;
                    exit
                }
                GuestStep::Access { ipa, kind } => match resolve_access(&realm.rtt, ipa) {
                    AccessOutcome::Completes => continue,
                    AccessOutcome::InjectSea => {
                        rec.events.push(RsiEvent::InjectedAbort { ipa, kind });
                        continue;
                    }
                    AccessOutcome::HostFault => {
                        let mut exit = RecExit::abort(ipa, kind);
                        if kind == AccessKind::Data {
                            exit.far = ipa;
                        }
                        exit
                    }
                },
            };
            return Ok(exit);
        }
        Ok(RecExit::new(ExitReason::HostCall))
    }
}
