use super::{Recorder, SuiteResult};
use crate::error::{CheckError, PrepError};
use crate::host::{self, expect_ok, RealmSpec, RecSpec};
use crate::monitor::Platform;
use crate::realm::{AccessKind, ExitReason, GuestStep, RealmParams, RecEnter, RsiEvent};
use crate::rtt::{Ripas, RttState};
use crate::sequencer::{Prepared, Sequencer};
use crate::types::{level_size, Ipa, Pa, GRANULE_SIZE, RTT_ENTRIES};
use crate::verifier::{expect_entry, expect_leaf, FoldSnapshot};

fn host_call() -> GuestStep {
    GuestStep::HostCall {
        imm: 0,
        gprs: Vec::new(),
    }
}

fn rsi_failed(step: &'static str) -> impl Fn(crate::types::RsiStatus) -> PrepError {
    move |status| PrepError::step(step, format!("{status:?}"))
}

/// Unprotected IPA (relative to the unprotected half) of the folded block.
const NS_BLOCK: Ipa = 0x80_0000;

pub fn rtt_fold_assigned_ns<M: Platform>(seq: &mut Sequencer<'_, M>, rec: &mut Recorder) -> SuiteResult {
    let block = level_size(2);
    let (realm, rd, ipa, phys) = rec.prepare("setup", 1, || {
        let realm = seq.realm(RealmSpec {
            recs: vec![RecSpec::runnable(vec![host_call(), GuestStep::PsciSystemOff])],
            ..RealmSpec::default()
        })?;
        let phys = seq
            .platform()
            .alloc_granules(RTT_ENTRIES, block)
            .ok_or(PrepError::PoolExhausted { count: RTT_ENTRIES })?;
        for page in 0..RTT_ENTRIES as u64 {
            seq.track_granule(phys + page * GRANULE_SIZE);
        }
        let ipa = seq.with_realm(realm, |m, handle| {
            host::map_unprotected_range(m, handle, NS_BLOCK, block, phys, 0)
        })?;
        Ok((realm, seq.rd(realm)?, ipa, phys))
    })?;

    let mut folded: Option<(FoldSnapshot, Pa)> = None;
    rec.check("fold: returned table and parent address", 2, || {
        let snapshot = FoldSnapshot::capture(seq.platform_ref(), rd, ipa, 3)?;
        let rtt = expect_ok("rtt fold", seq.platform().rtt_fold(rd, ipa, 3))?;
        seq.track_granule(rtt);
        snapshot.verify_folded(seq.platform_ref(), rd, rtt)?;
        let parent = expect_leaf(seq.platform_ref(), rd, ipa, 2, RttState::AssignedNs, None)?;
        if parent.addr != phys {
            return Err(CheckError::FoldMismatch {
                ipa,
                detail: format!("block maps {:#x}, first page was {phys:#x}", parent.addr),
            });
        }
        folded = Some((snapshot, rtt));
        Ok(Prepared::Ready(()))
    })?;
    let Some((snapshot, rtt)) = folded else {
        return Ok(());
    };

    rec.check("fold: block mapping survives realm entry", 3, || {
        let rec0 = seq.rec(realm, 0)?;
        expect_ok("realm activate", seq.platform().realm_activate(rd))?;
        seq.enter_expecting(rec0, &RecEnter::default(), ExitReason::HostCall)?;
        let interior = ipa + block / 4;
        let read = expect_ok("read entry", seq.platform_ref().rtt_read_entry(rd, interior, 3))?;
        if read.walk_level != 2 || read.addr != phys {
            return Err(CheckError::FoldMismatch {
                ipa: interior,
                detail: format!("level {} address {:#x} after entry", read.walk_level, read.addr),
            });
        }
        snapshot.verify_folded(seq.platform_ref(), rd, rtt)?;
        Ok(Prepared::Ready(()))
    })?;

    rec.check("unfold: every entry reads back as before the fold", 4, || {
        seq.with_realm(realm, |m, handle| host::unfold(m, handle, ipa, 2, 3))?;
        snapshot.verify_unfolded(seq.platform_ref(), rd)?;
        Ok(Prepared::Ready(()))
    })
}

const RIPAS_BASE: Ipa = 0x20_0000;
const RIPAS_PAGES: u64 = 4;

fn last_ipa_state_set(events: &[RsiEvent]) -> Option<(Ipa, bool)> {
    events.iter().rev().find_map(|event| match event {
        RsiEvent::IpaStateSet { next, accepted, .. } => Some((*next, *accepted)),
        _ => None,
    })
}

fn expect_response(events: &[RsiEvent], next: Ipa, accepted: bool) -> Result<(), CheckError> {
    match last_ipa_state_set(events) {
        Some(seen) if seen == (next, accepted) => Ok(()),
        seen => Err(CheckError::UnexpectedExit(format!(
            "realm saw {seen:?}, expected next {next:#x} accepted {accepted}"
        ))),
    }
}

fn expect_ripas<M: Platform>(m: &M, rec: Pa, base: Ipa, top: Ipa, ripas: Ripas) -> Result<(), CheckError> {
    let (end, found) = m
        .rsi_ipa_state_get(rec, base, top)
        .map_err(rsi_failed("ipa state get"))?;
    if end != top || found != ripas {
        return Err(CheckError::EntryMismatch {
            ipa: base,
            detail: format!("{found:?} up to {end:#x}, expected {ripas:?} up to {top:#x}"),
        });
    }
    Ok(())
}

pub fn ripas_change_reject<M: Platform>(seq: &mut Sequencer<'_, M>, rec: &mut Recorder) -> SuiteResult {
    let (base, top) = (RIPAS_BASE, RIPAS_BASE + RIPAS_PAGES * GRANULE_SIZE);
    let half = base + 2 * GRANULE_SIZE;
    let (rd, rec0) = rec.prepare("setup", 1, || {
        let realm = seq.realm(RealmSpec {
            recs: vec![RecSpec::runnable(vec![
                host_call(),
                host_call(),
                host_call(),
                GuestStep::PsciSystemOff,
            ])],
            ..RealmSpec::default()
        })?;
        seq.create_mapping(realm, base, true, 0)?;
        let rd = seq.rd(realm)?;
        let m = seq.platform();
        expect_ok("init ripas", m.rtt_init_ripas(rd, base, top))?;
        expect_ok("realm activate", m.realm_activate(rd))?;
        Ok((rd, seq.rec(realm, 0)?))
    })?;

    rec.check("ripas change: host rejection leaves RAM in place", 2, || {
        seq.platform()
            .rsi_ipa_state_set(rec0, base, top, Ripas::Empty, false)
            .map_err(rsi_failed("ipa state set"))?;
        let exit = seq.enter_expecting(rec0, &RecEnter::default(), ExitReason::RipasChange)?;
        if exit.ripas_base != base || exit.ripas_top != top {
            return Err(CheckError::UnexpectedExit(format!(
                "RIPAS change for [{:#x}, {:#x})",
                exit.ripas_base, exit.ripas_top
            )));
        }
        let reject = RecEnter {
            reject_ripas: true,
            ..RecEnter::default()
        };
        seq.enter_expecting(rec0, &reject, ExitReason::HostCall)?;
        let events = seq.platform_ref().rsi_events(rec0).map_err(rsi_failed("rsi events"))?;
        expect_response(&events, base, false)?;
        expect_ripas(seq.platform_ref(), rec0, base, top, Ripas::Ram)?;
        Ok(Prepared::Ready(()))
    })?;

    rec.check("ripas change: accepted change reports its end", 3, || {
        seq.platform()
            .rsi_ipa_state_set(rec0, base, half, Ripas::Empty, false)
            .map_err(rsi_failed("ipa state set"))?;
        seq.enter_expecting(rec0, &RecEnter::default(), ExitReason::RipasChange)?;
        let next = expect_ok("rtt set ripas", seq.platform().rtt_set_ripas(rd, rec0, base, half))?;
        if next != half {
            return Err(CheckError::TopMismatch {
                actual: next,
                expected: half,
            });
        }
        seq.enter_expecting(rec0, &RecEnter::default(), ExitReason::HostCall)?;
        let events = seq.platform_ref().rsi_events(rec0).map_err(rsi_failed("rsi events"))?;
        expect_response(&events, half, true)?;
        expect_ripas(seq.platform_ref(), rec0, base, half, Ripas::Empty)?;
        expect_ripas(seq.platform_ref(), rec0, half, top, Ripas::Ram)?;
        Ok(Prepared::Ready(()))
    })?;

    rec.check("ripas change: partial progress is reported to the realm", 4, || {
        seq.platform()
            .rsi_ipa_state_set(rec0, base, top, Ripas::Ram, false)
            .map_err(rsi_failed("ipa state set"))?;
        seq.enter_expecting(rec0, &RecEnter::default(), ExitReason::RipasChange)?;
        expect_ok("rtt set ripas", seq.platform().rtt_set_ripas(rd, rec0, base, half))?;
        seq.enter_expecting(rec0, &RecEnter::default(), ExitReason::HostCall)?;
        let events = seq.platform_ref().rsi_events(rec0).map_err(rsi_failed("rsi events"))?;
        expect_response(&events, half, true)?;
        expect_ripas(seq.platform_ref(), rec0, base, top, Ripas::Ram)?;
        Ok(Prepared::Ready(()))
    })
}

const FETCH_IPA: Ipa = 0x1000;

pub fn rec_exit_ia_ripas_destroyed<M: Platform>(seq: &mut Sequencer<'_, M>, rec: &mut Recorder) -> SuiteResult {
    let features = seq.platform_ref().features();
    let (rd, rec0) = rec.prepare("setup", 1, || {
        let mut script = vec![host_call()];
        if features.planes {
            script.push(GuestStep::S2apChange {
                base: FETCH_IPA,
                top: FETCH_IPA + GRANULE_SIZE,
                index: 1,
            });
        }
        script.push(GuestStep::Access {
            ipa: FETCH_IPA,
            kind: AccessKind::Instruction,
        });
        script.push(GuestStep::PsciSystemOff);

        let realm = seq.realm(RealmSpec {
            params: RealmParams {
                num_aux_planes: u8::from(features.planes),
                rtt_tree_per_plane: features.planes && features.rtt_tree_per_plane,
                ..RealmParams::default()
            },
            recs: vec![RecSpec::runnable(script)],
            activate: false,
        })?;
        seq.map_data(realm, FETCH_IPA, Some(b"realm code"))?;
        let rd = seq.rd(realm)?;
        if seq.handle(realm)?.has_aux_trees() {
            seq.with_realm(realm, |m, handle| host::aux_map(m, handle, FETCH_IPA, 1))?;
            expect_ok(
                "aux unmap protected",
                seq.platform().rtt_aux_unmap_protected(rd, FETCH_IPA, 1),
            )?;
        }
        let destroyed = expect_ok("data destroy", seq.platform().data_destroy(rd, FETCH_IPA))?;
        seq.track_granule(destroyed.data);
        expect_ok("realm activate", seq.platform().realm_activate(rd))?;
        Ok((rd, seq.rec(realm, 0)?))
    })?;

    rec.check("fetch: address is UNASSIGNED and DESTROYED", 2, || {
        let read = expect_ok("read entry", seq.platform_ref().rtt_read_entry(rd, FETCH_IPA, 3))?;
        expect_entry(FETCH_IPA, &read, RttState::Unassigned, Some(Ripas::Destroyed))?;
        seq.enter_expecting(rec0, &RecEnter::default(), ExitReason::HostCall)?;
        Ok(Prepared::Ready(()))
    })?;

    rec.check("fetch: overlay permissions applied before the fetch", 3, || {
        if !features.planes {
            return Ok(Prepared::Skip("platform does not support planes".into()));
        }
        let exit = seq.enter_expecting(rec0, &RecEnter::default(), ExitReason::S2apChange)?;
        let mut next = exit.s2ap_base;
        while next < exit.s2ap_top {
            next = expect_ok(
                "rtt set s2ap",
                seq.platform().rtt_set_s2ap(rd, rec0, next, exit.s2ap_top),
            )?;
        }
        Ok(Prepared::Ready(()))
    })?;

    rec.check("fetch: instruction abort reported to the host", 4, || {
        let exit = seq.enter_expecting(rec0, &RecEnter::default(), ExitReason::Sync)?;
        if !exit.is_instruction_abort() || exit.fault_ipa() != FETCH_IPA {
            return Err(CheckError::UnexpectedExit(format!(
                "ESR {:#x} HPFAR {:#x}",
                exit.esr, exit.hpfar
            )));
        }
        Ok(Prepared::Ready(()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{ModelMonitor, MonitorConfig};
    use crate::sequencer::CheckSettings;
    use crate::suite::Verdict;

    fn passes(
        config: MonitorConfig,
        body: fn(&mut Sequencer<'_, ModelMonitor>, &mut Recorder) -> SuiteResult,
    ) -> Vec<crate::suite::CheckRecord> {
        let checks = CheckSettings::from(&config);
        let mut m = ModelMonitor::new(config);
        let mut rec = Recorder::new("memory");
        let mut seq = Sequencer::with_checks(&mut m, checks);
        body(&mut seq, &mut rec).unwrap();
        assert_eq!(seq.release(), 0);
        let checks = rec.checks().to_vec();
        assert!(checks.iter().all(|c| !matches!(c.verdict, Verdict::Fail { .. })), "{checks:?}");
        checks
    }

    #[test]
    fn test_fold_assigned_ns_passes() {
        let checks = passes(MonitorConfig::default(), rtt_fold_assigned_ns::<ModelMonitor>);
        assert_eq!(checks.len(), 3);
    }

    #[test]
    fn test_ripas_change_reject_passes() {
        let checks = passes(MonitorConfig::default(), ripas_change_reject::<ModelMonitor>);
        assert!(checks.iter().all(|c| c.verdict == Verdict::Pass));
    }

    #[test]
    fn test_ia_ripas_destroyed_with_and_without_planes() {
        passes(MonitorConfig::default(), rec_exit_ia_ripas_destroyed::<ModelMonitor>);
        let mut config = MonitorConfig::default();
        config.features.planes = false;
        let checks = passes(config, rec_exit_ia_ripas_destroyed::<ModelMonitor>);
        assert!(matches!(checks[1].verdict, Verdict::Skip { .. }));
    }
}
