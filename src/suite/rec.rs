use super::{expect_failure, granule_table, run_table, Recorder, Stimulus, SuiteResult};
use crate::error::{CheckError, PrepError};
use crate::granule::GranuleState;
use crate::host::{RealmSpec, RecSpec};
use crate::monitor::Platform;
use crate::realm::rec::{PSCI_CPU_ON, PSCI_SYSTEM_RESET};
use crate::realm::{mpidr_from_index, ExitReason, GuestStep, RecEnter, RsiEvent};
use crate::sequencer::{GranuleContext, GranuleIntent, Prepared, RecContext, RecIntent, Sequencer};
use crate::types::{PsciStatus, ReturnCode, RmiStatus};
use crate::verifier::expect_granule;

fn skipped(intent: impl std::fmt::Debug) -> Result<Prepared<()>, CheckError> {
    Ok(Prepared::Skip(format!("{intent:?} not available")))
}

pub fn rec_destroy<M: Platform>(seq: &mut Sequencer<'_, M>, rec: &mut Recorder) -> SuiteResult {
    let (realm, valid) = rec.prepare("setup", 1, || {
        let realm = seq.realm(RealmSpec {
            recs: vec![RecSpec::parked()],
            ..RealmSpec::default()
        })?;
        Ok((realm, seq.rec(realm, 0)?))
    })?;
    let ctx = GranuleContext {
        realm,
        valid,
        data_ipa: 0x3000,
    };

    let table = granule_table(GranuleIntent::Rec, ReturnCode::input());
    run_table(rec, "rec destroy", 2, &table, |stimulus| {
        let Some(pa) = stimulus.intent.prepare(seq, &ctx)?.ready() else {
            return skipped(stimulus.intent);
        };
        expect_failure(seq.platform().rec_destroy(pa), stimulus.expected)?;
        Ok(Prepared::Ready(()))
    })?;

    rec.check("rec destroy: REC and auxiliary granules return to DELEGATED", 20, || {
        seq.platform()
            .rec_destroy(valid)
            .map_err(|err| PrepError::command("rec destroy", err.code))?;
        expect_granule(seq.platform_ref(), valid, GranuleState::Delegated)?;
        let aux = seq
            .handle(realm)?
            .rec_aux(0)
            .map(<[_]>::to_vec)
            .unwrap_or_default();
        for pa in aux {
            expect_granule(seq.platform_ref(), pa, GranuleState::Delegated)?;
        }
        Ok(Prepared::Ready(()))
    })?;

    rec.check("rec destroy: a live REC cannot be reclaimed", 21, || {
        let active = seq.realm(RealmSpec {
            recs: vec![RecSpec::runnable(vec![GuestStep::PsciSystemOff])],
            activate: true,
            ..RealmSpec::default()
        })?;
        let live = seq.rec(active, 0)?;
        expect_failure(seq.platform().rec_destroy(live), ReturnCode::rec())?;
        expect_failure(seq.platform().granule_undelegate(live), ReturnCode::input())?;
        expect_granule(seq.platform_ref(), live, GranuleState::Rec)?;

        seq.enter_expecting(live, &RecEnter::default(), ExitReason::SystemOff)?;
        seq.platform()
            .rec_destroy(live)
            .map_err(|err| PrepError::command("rec destroy", err.code))?;
        expect_granule(seq.platform_ref(), live, GranuleState::Delegated)?;
        Ok(Prepared::Ready(()))
    })
}

fn rec_table() -> Vec<Stimulus<RecIntent>> {
    vec![
        Stimulus::new("target owned by another realm", RecIntent::OtherOwner, ReturnCode::input()),
        Stimulus::new("calling and target are the same REC", RecIntent::Alias, ReturnCode::input()),
        Stimulus::new("no PSCI request pending", RecIntent::NoRequest, ReturnCode::input()),
        Stimulus::new("target MPIDR not requested", RecIntent::OtherMpidr, ReturnCode::input()),
        Stimulus::new("status not permitted", RecIntent::StatusNotPermitted, ReturnCode::input()),
    ]
}

pub fn psci_complete<M: Platform>(seq: &mut Sequencer<'_, M>, rec: &mut Recorder) -> SuiteResult {
    let (realm, calling, target, idle) = rec.prepare("setup", 1, || {
        let realm = seq.realm(RealmSpec {
            recs: vec![
                RecSpec::runnable(vec![
                    GuestStep::PsciCpuOn {
                        target_mpidr: mpidr_from_index(1),
                        entry: 0x8000_0000,
                    },
                    GuestStep::PsciSystemOff,
                ]),
                RecSpec::parked(),
                RecSpec::parked(),
            ],
            activate: true,
            ..RealmSpec::default()
        })?;
        let (calling, target, idle) = (seq.rec(realm, 0)?, seq.rec(realm, 1)?, seq.rec(realm, 2)?);
        seq.enter_expecting(calling, &RecEnter::default(), ExitReason::Psci)?;
        Ok((realm, calling, target, idle))
    })?;
    let fixtures = rec.prepare("setup", 1, || seq.realm(RealmSpec::default()))?;

    let table = granule_table(GranuleIntent::Rec, ReturnCode::input());
    let calling_ctx = GranuleContext {
        realm: fixtures,
        valid: calling,
        data_ipa: 0x3000,
    };
    run_table(rec, "psci complete calling", 2, &table, |stimulus| {
        let Some(pa) = stimulus.intent.prepare(seq, &calling_ctx)?.ready() else {
            return skipped(stimulus.intent);
        };
        expect_failure(
            seq.platform().psci_complete(pa, target, PsciStatus::Success),
            stimulus.expected,
        )?;
        Ok(Prepared::Ready(()))
    })?;

    let target_ctx = GranuleContext {
        realm: fixtures,
        valid: target,
        data_ipa: 0x4000,
    };
    run_table(rec, "psci complete target", 20, &table, |stimulus| {
        let Some(pa) = stimulus.intent.prepare(seq, &target_ctx)?.ready() else {
            return skipped(stimulus.intent);
        };
        expect_failure(
            seq.platform().psci_complete(calling, pa, PsciStatus::Success),
            stimulus.expected,
        )?;
        Ok(Prepared::Ready(()))
    })?;

    let recs = RecContext {
        realm,
        calling,
        target,
        idle,
        status: PsciStatus::Success,
    };
    run_table(rec, "psci complete", 40, &rec_table(), |stimulus| {
        let Some(args) = stimulus.intent.prepare(seq, &recs)?.ready() else {
            return skipped(stimulus.intent);
        };
        expect_failure(
            seq.platform().psci_complete(args.calling, args.target, args.status),
            stimulus.expected,
        )?;
        Ok(Prepared::Ready(()))
    })?;

    rec.check("psci complete: CPU_ON makes the target runnable", 60, || {
        seq.platform()
            .psci_complete(calling, target, PsciStatus::Success)
            .map_err(|err| PrepError::command("psci complete", err.code))?;
        let events = seq
            .platform_ref()
            .rsi_events(calling)
            .map_err(|status| PrepError::step("rsi events", format!("{status:?}")))?;
        let reported = events.contains(&RsiEvent::PsciResult {
            function: PSCI_CPU_ON,
            status: PsciStatus::Success,
        });
        if !reported {
            return Err(CheckError::UnexpectedExit(
                "calling REC never saw the CPU_ON result".into(),
            ));
        }
        seq.enter_expecting(target, &RecEnter::default(), ExitReason::HostCall)?;
        Ok(Prepared::Ready(()))
    })?;

    rec.check("psci complete: a completed request cannot be completed again", 61, || {
        expect_failure(
            seq.platform().psci_complete(calling, target, PsciStatus::Success),
            ReturnCode::input(),
        )?;
        Ok(Prepared::Ready(()))
    })
}

/// Re-entering a REC once its realm has reset is refused at the realm.
const REALM_OFF: ReturnCode = ReturnCode::new(RmiStatus::ErrorRealm, 1);

pub fn system_reset<M: Platform>(seq: &mut Sequencer<'_, M>, rec: &mut Recorder) -> SuiteResult {
    let rec0 = rec.prepare("setup", 1, || {
        let realm = seq.realm(RealmSpec {
            recs: vec![RecSpec::runnable(vec![GuestStep::PsciSystemReset])],
            activate: true,
            ..RealmSpec::default()
        })?;
        seq.rec(realm, 0)
    })?;

    rec.check("system reset: PSCI exit carries the function id", 2, || {
        let exit = seq.enter_expecting(rec0, &RecEnter::default(), ExitReason::Psci)?;
        if exit.gprs[0] != PSCI_SYSTEM_RESET {
            return Err(CheckError::UnexpectedExit(format!(
                "PSCI function {:#x}, expected SYSTEM_RESET",
                exit.gprs[0]
            )));
        }
        Ok(Prepared::Ready(()))
    })?;

    rec.check("system reset: REC of a reset realm cannot be entered", 3, || {
        expect_failure(seq.platform().rec_enter(rec0, &RecEnter::default()), REALM_OFF)?;
        Ok(Prepared::Ready(()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::ModelMonitor;
    use crate::suite::Verdict;

    fn passes(body: fn(&mut Sequencer<'_, ModelMonitor>, &mut Recorder) -> SuiteResult) {
        let mut m = ModelMonitor::default();
        let mut rec = Recorder::new("rec");
        let mut seq = Sequencer::new(&mut m);
        body(&mut seq, &mut rec).unwrap();
        assert_eq!(seq.release(), 0);
        let checks = rec.checks();
        assert!(checks.iter().all(|c| c.verdict == Verdict::Pass), "{checks:?}");
    }

    #[test]
    fn test_rec_destroy_passes_on_reference_monitor() {
        passes(rec_destroy::<ModelMonitor>);
    }

    #[test]
    fn test_psci_complete_passes_on_reference_monitor() {
        passes(psci_complete::<ModelMonitor>);
    }

    #[test]
    fn test_system_reset_passes_on_reference_monitor() {
        passes(system_reset::<ModelMonitor>);
    }

    #[test]
    fn test_reset_realm_code_is_packed_with_index_one() {
        assert_eq!(REALM_OFF.packed(), 0x102);
    }
}
