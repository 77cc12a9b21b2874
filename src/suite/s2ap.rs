use super::{
    expect_failure, granule_table, range_expectation, run_table, Recorder, Stimulus, SuiteResult,
};
use crate::error::{CheckError, PrepError};
use crate::host::{self, RealmSpec, RecSpec};
use crate::monitor::{Platform, RangeCheck};
use crate::realm::{mpidr_from_index, ExitReason, GuestStep, RealmParams, RecEnter, RsiEvent};
use crate::sequencer::{
    CheckSettings, GranuleContext, GranuleIntent, Prepared, RangeContext, RangeIntent, RecContext,
    RecIntent, Sequencer,
};
use crate::types::{level_size, Ipa, PsciStatus, ReturnCode, GRANULE_SIZE, RTT_ENTRIES};
use tracing::debug;

/// Overlay index the realm asks to apply.
const OVERLAY: u8 = 1;

fn l2() -> Ipa {
    level_size(2)
}

fn rec_table(checks: &CheckSettings) -> Vec<Stimulus<RecIntent>> {
    let owner = range_expectation(checks, |c| {
        matches!(c, RangeCheck::RecOwner | RangeCheck::PendingRequest)
    })
    .unwrap_or_else(ReturnCode::rec);
    let pending = range_expectation(checks, |c| c == RangeCheck::PendingRequest)
        .unwrap_or_else(ReturnCode::rec);
    vec![
        Stimulus::new("REC owned by another realm", RecIntent::OtherOwner, owner),
        Stimulus::new("no S2AP change pending", RecIntent::NoRequest, pending),
    ]
}

fn range_table(checks: &CheckSettings) -> Vec<Stimulus<RangeIntent>> {
    let ordered = |intent: RangeIntent| {
        range_expectation(checks, |c| Some(c) == intent.violation()).unwrap_or_else(ReturnCode::input)
    };
    vec![
        Stimulus::new("empty range", RangeIntent::InvalidSize, ordered(RangeIntent::InvalidSize)),
        Stimulus::new(
            "base differs from request",
            RangeIntent::BaseMismatch,
            ordered(RangeIntent::BaseMismatch),
        ),
        Stimulus::new(
            "top beyond request",
            RangeIntent::TopOutOfBound,
            ordered(RangeIntent::TopOutOfBound),
        ),
        Stimulus::new("top not aligned", RangeIntent::TopUnaligned, ordered(RangeIntent::TopUnaligned)),
        Stimulus::new(
            "base inside a primary block",
            RangeIntent::BasePrimaryUnaligned,
            ReturnCode::rtt(2),
        ),
        Stimulus::new(
            "base inside an auxiliary block",
            RangeIntent::BaseAuxiliaryUnaligned,
            ReturnCode::rtt_aux(2),
        ),
    ]
}

pub fn rtt_set_s2ap<M: Platform>(seq: &mut Sequencer<'_, M>, rec: &mut Recorder) -> SuiteResult {
    let features = seq.platform_ref().features();
    if !features.planes {
        return rec.skip_suite("platform does not support planes");
    }

    let (realm, recs) = rec.prepare("setup", 1, || {
        let requested = GuestStep::S2apChange {
            base: l2() + GRANULE_SIZE,
            top: 2 * l2(),
            index: OVERLAY,
        };
        let realm = seq.realm(RealmSpec {
            params: RealmParams {
                num_aux_planes: 1,
                rtt_tree_per_plane: features.rtt_tree_per_plane,
                ..RealmParams::default()
            },
            recs: vec![
                RecSpec::runnable(vec![
                    GuestStep::PsciCpuOn {
                        target_mpidr: mpidr_from_index(1),
                        entry: 0,
                    },
                    GuestStep::S2apChange {
                        base: 0,
                        top: l2(),
                        index: OVERLAY,
                    },
                    GuestStep::PsciSystemOff,
                ]),
                RecSpec {
                    script: vec![requested.clone(), requested],
                    ..RecSpec::parked()
                },
                RecSpec::parked(),
            ],
            activate: false,
        })?;
        // Level 2 tables over [0, 1GiB) in every tree.
        seq.map_data(realm, 4 * l2(), None)?;
        let planes = seq.handle(realm)?.params.tree_count();
        for plane in 1..planes {
            seq.with_realm(realm, |m, handle| {
                host::create_mapping_at(m, handle, 0, true, plane, 2).map(|_| ())
            })?;
        }
        let rd = seq.rd(realm)?;
        host::expect_ok("realm activate", seq.platform().realm_activate(rd))?;

        let recs = [seq.rec(realm, 0)?, seq.rec(realm, 1)?, seq.rec(realm, 2)?];
        seq.enter_expecting(recs[0], &RecEnter::default(), ExitReason::Psci)?;
        host::expect_ok(
            "psci complete",
            seq.platform().psci_complete(recs[0], recs[1], PsciStatus::Success),
        )?;
        let exit = seq.enter_expecting(recs[0], &RecEnter::default(), ExitReason::S2apChange)?;
        debug!(
            base = format_args!("{:#x}", exit.s2ap_base),
            top = format_args!("{:#x}", exit.s2ap_top),
            "S2AP change requested"
        );
        Ok((realm, recs))
    })?;
    let [calling, second, idle] = recs;
    let rd = rec.prepare("setup", 1, || seq.rd(realm))?;
    let fixtures = rec.prepare("setup", 1, || seq.realm(RealmSpec::default()))?;
    let (base, top) = (0, l2());

    let rd_table = granule_table(GranuleIntent::Rd, ReturnCode::input());
    let rd_ctx = GranuleContext {
        realm: fixtures,
        valid: rd,
        data_ipa: 0x3000,
    };
    run_table(rec, "set s2ap rd", 2, &rd_table, |stimulus| {
        let Some(pa) = stimulus.intent.prepare(seq, &rd_ctx)?.ready() else {
            return Ok(Prepared::Skip(format!("{:?} not available", stimulus.intent)));
        };
        expect_failure(seq.platform().rtt_set_s2ap(pa, calling, base, top), stimulus.expected)?;
        Ok(Prepared::Ready(()))
    })?;

    let rec_granules = granule_table(GranuleIntent::Rec, ReturnCode::input());
    let rec_ctx = GranuleContext {
        realm: fixtures,
        valid: calling,
        data_ipa: 0x4000,
    };
    run_table(rec, "set s2ap rec", 20, &rec_granules, |stimulus| {
        let Some(pa) = stimulus.intent.prepare(seq, &rec_ctx)?.ready() else {
            return Ok(Prepared::Skip(format!("{:?} not available", stimulus.intent)));
        };
        expect_failure(seq.platform().rtt_set_s2ap(rd, pa, base, top), stimulus.expected)?;
        Ok(Prepared::Ready(()))
    })?;

    let checks = seq.checks().clone();
    let rec_args = RecContext {
        realm,
        calling,
        target: second,
        idle,
        status: PsciStatus::Success,
    };
    run_table(rec, "set s2ap", 40, &rec_table(&checks), |stimulus| {
        let Some(args) = stimulus.intent.prepare(seq, &rec_args)?.ready() else {
            return Ok(Prepared::Skip(format!("{:?} not available", stimulus.intent)));
        };
        let subject = stimulus.intent.subject(&args);
        expect_failure(seq.platform().rtt_set_s2ap(rd, subject, base, top), stimulus.expected)?;
        Ok(Prepared::Ready(()))
    })?;

    let range_ctx = RangeContext {
        realm,
        rec: calling,
        base,
        top,
        second,
    };
    run_table(rec, "set s2ap", 50, &range_table(&checks), |stimulus| {
        if let Some(check) = stimulus.intent.violation() {
            if !checks.range_precedence.contains(&check) {
                return Ok(Prepared::Skip(format!("{check:?} check disabled by configuration")));
            }
        }
        let Some(args) = stimulus.intent.prepare(seq, &range_ctx)?.ready() else {
            return Ok(Prepared::Skip(format!("{:?} not available", stimulus.intent)));
        };
        expect_failure(
            seq.platform().rtt_set_s2ap(rd, args.rec, args.base, args.top),
            stimulus.expected,
        )?;
        if stimulus.intent == RangeIntent::BaseAuxiliaryUnaligned {
            // The primary tree took the range whole; a refused change leaves it alone.
            let read = host::expect_ok("read entry", seq.platform_ref().rtt_read_entry(rd, args.base, 3))?;
            if read.s2ap != 0 {
                return Err(CheckError::EntryMismatch {
                    ipa: args.base,
                    detail: format!("overlay {} written by a refused change", read.s2ap),
                });
            }
        }
        Ok(Prepared::Ready(()))
    })?;

    rec.check("set s2ap: whole range applied in every tree", 70, || {
        let mut next = base;
        for _ in 0..RTT_ENTRIES {
            next = seq
                .platform()
                .rtt_set_s2ap(rd, calling, next, top)
                .map_err(|err| PrepError::command("rtt set s2ap", err.code))?;
            if next == top {
                break;
            }
        }
        if next != top {
            return Err(CheckError::TopMismatch {
                actual: next,
                expected: top,
            });
        }
        let entry = host::expect_ok("read entry", seq.platform_ref().rtt_read_entry(rd, base, 2))?;
        if entry.s2ap != OVERLAY {
            return Err(CheckError::EntryMismatch {
                ipa: base,
                detail: format!("overlay index {}, expected {OVERLAY}", entry.s2ap),
            });
        }
        Ok(Prepared::Ready(()))
    })?;

    rec.check("set s2ap: realm observes completion", 71, || {
        seq.enter_expecting(calling, &RecEnter::default(), ExitReason::SystemOff)?;
        let events = seq
            .platform_ref()
            .rsi_events(calling)
            .map_err(|status| PrepError::step("rsi events", format!("{status:?}")))?;
        let completed = RsiEvent::S2apSet {
            base,
            top,
            next: top,
        };
        if !events.contains(&completed) {
            return Err(CheckError::UnexpectedExit(format!(
                "no completed S2AP change among {events:?}"
            )));
        }
        Ok(Prepared::Ready(()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{ModelMonitor, MonitorConfig};
    use crate::suite::{CheckRecord, Verdict};

    fn run(config: MonitorConfig) -> Vec<CheckRecord> {
        let checks = CheckSettings::from(&config);
        let mut m = ModelMonitor::new(config);
        let mut rec = Recorder::new("rtt_set_s2ap");
        let mut seq = Sequencer::with_checks(&mut m, checks);
        rtt_set_s2ap(&mut seq, &mut rec).unwrap();
        assert_eq!(seq.release(), 0);
        rec.checks().to_vec()
    }

    #[test]
    fn test_set_s2ap_passes_with_per_plane_trees() {
        let checks = run(MonitorConfig::default());
        assert!(checks.iter().all(|c| c.verdict == Verdict::Pass), "{checks:?}");
    }

    #[test]
    fn test_set_s2ap_skips_auxiliary_case_with_single_tree() {
        let mut config = MonitorConfig::default();
        config.features.rtt_tree_per_plane = false;
        let checks = run(config);
        let aux = checks
            .iter()
            .find(|c| c.name.contains("auxiliary block"))
            .unwrap();
        assert!(matches!(aux.verdict, Verdict::Skip { .. }));
        assert!(checks.iter().all(|c| !matches!(c.verdict, Verdict::Fail { .. })));
    }

    #[test]
    fn test_set_s2ap_follows_reordered_checks() {
        let config = MonitorConfig {
            range_precedence: vec![
                RangeCheck::PendingRequest,
                RangeCheck::RecOwner,
                RangeCheck::TopUnaligned,
                RangeCheck::InvalidSize,
                RangeCheck::BaseMismatch,
            ],
            ..MonitorConfig::default()
        };
        let checks = run(config);
        let disabled = checks.iter().find(|c| c.name.contains("top beyond")).unwrap();
        assert!(matches!(disabled.verdict, Verdict::Skip { .. }));
        assert!(checks.iter().all(|c| !matches!(c.verdict, Verdict::Fail { .. })), "{checks:?}");
    }

    #[test]
    fn test_set_s2ap_skipped_without_planes() {
        let mut config = MonitorConfig::default();
        config.features.planes = false;
        let checks = run(config);
        assert_eq!(checks.len(), 1);
        assert!(matches!(checks[0].verdict, Verdict::Skip { .. }));
    }
}
