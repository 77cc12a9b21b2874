use super::{expect_failure, granule_table, run_table, Recorder, Stimulus, SuiteResult};
use crate::error::{CheckError, PrepError};
use crate::granule::GranuleState;
use crate::host::{expect_ok, RealmSpec, RecSpec};
use crate::monitor::Platform;
use crate::rtt::{Ripas, RttState, TopPolicy};
use crate::sequencer::{GranuleContext, GranuleIntent, IpaContext, IpaIntent, Prepared, Sequencer};
use crate::types::{Ipa, ReturnCode, GRANULE_SIZE, RTT_MAX_LEVEL};
use crate::verifier::{expect_granule, expect_leaf, expect_top};

// One page each: UNASSIGNED RAM, ASSIGNED RAM, DESTROYED, ASSIGNED RAM,
// ASSIGNED EMPTY.
const UNASSIGNED_RAM_IPA: Ipa = 0x0;
const VALID_IPA: Ipa = 0x1000;
const DESTROYED_IPA: Ipa = 0x2000;
const LIVE_IPA: Ipa = 0x3000;
const EMPTY_IPA: Ipa = 0x4000;

/// `top` reported when destroying `VALID_IPA`: the DESTROYED neighbour is
/// not live, so skipping non-live entries runs on to `LIVE_IPA`.
fn destroy_top(policy: TopPolicy) -> Ipa {
    match policy {
        TopPolicy::EntryEnd => DESTROYED_IPA,
        TopPolicy::SkipNonLive => LIVE_IPA,
    }
}

fn ipa_table() -> Vec<Stimulus<IpaIntent>> {
    vec![
        Stimulus::new("ipa not aligned", IpaIntent::Unaligned, ReturnCode::input()),
        Stimulus::new("ipa unprotected", IpaIntent::Unprotected, ReturnCode::input()),
        Stimulus::new(
            "ipa outside permitted range",
            IpaIntent::OutsideOfPermittedIpa,
            ReturnCode::input(),
        ),
        Stimulus::new("ipa not mapped", IpaIntent::NotMapped, ReturnCode::rtt(1)),
        Stimulus::new("ipa entry unassigned", IpaIntent::RtteUnassigned, ReturnCode::rtt(RTT_MAX_LEVEL)),
        Stimulus::new(
            "unprotected ipa not mapped",
            IpaIntent::UnprotectedNotMapped,
            ReturnCode::input(),
        ),
        Stimulus::new(
            "unprotected ipa entry unassigned",
            IpaIntent::UnprotectedRtteUnassigned,
            ReturnCode::input(),
        ),
        Stimulus::new("ipa aliased by auxiliary tree", IpaIntent::AuxLive, ReturnCode::rtt_aux(1)),
    ]
}

pub fn data_destroy<M: Platform>(seq: &mut Sequencer<'_, M>, rec: &mut Recorder) -> SuiteResult {
    let (realm, data) = rec.prepare("setup", 1, || {
        let realm = seq.realm(RealmSpec {
            recs: vec![RecSpec::parked()],
            ..RealmSpec::default()
        })?;
        let data = seq.map_data(realm, VALID_IPA, Some(b"realm data"))?;
        seq.map_data(realm, DESTROYED_IPA, None)?;
        seq.map_data(realm, LIVE_IPA, None)?;
        let rd = seq.rd(realm)?;
        let unknown = seq.delegated()?;
        let m = seq.platform();
        expect_ok("init ripas", m.rtt_init_ripas(rd, UNASSIGNED_RAM_IPA, VALID_IPA))?;
        expect_ok("data create unknown", m.data_create_unknown(rd, unknown, EMPTY_IPA))?;
        let destroyed = expect_ok("data destroy", m.data_destroy(rd, DESTROYED_IPA))?;
        seq.track_granule(destroyed.data);
        Ok((realm, data))
    })?;
    let rd = rec.prepare("setup", 1, || seq.rd(realm))?;

    let granules = GranuleContext {
        realm,
        valid: rd,
        data_ipa: 0x6000,
    };
    let table = granule_table(GranuleIntent::Rd, ReturnCode::input());
    run_table(rec, "data destroy rd", 2, &table, |stimulus| {
        let Some(pa) = stimulus.intent.prepare(seq, &granules)?.ready() else {
            return Ok(Prepared::Skip(format!("{:?} not available", stimulus.intent)));
        };
        expect_failure(seq.platform().data_destroy(pa, VALID_IPA), stimulus.expected)?;
        Ok(Prepared::Ready(()))
    })?;

    let ipas = IpaContext {
        realm,
        valid: VALID_IPA,
        free: UNASSIGNED_RAM_IPA,
    };
    run_table(rec, "data destroy ipa", 20, &ipa_table(), |stimulus| {
        let Some(fixture) = stimulus.intent.prepare(seq, &ipas)?.ready() else {
            return Ok(Prepared::Skip(format!("{:?} not available", stimulus.intent)));
        };
        let top = expect_failure(seq.platform().data_destroy(fixture.rd, fixture.ipa), stimulus.expected)?;
        if let Some(walk_top) = fixture.walk_top {
            let top = top.ok_or_else(|| CheckError::EntryMismatch {
                ipa: fixture.ipa,
                detail: "walk failure reported no top".into(),
            })?;
            expect_top(top, walk_top)?;
            if stimulus.intent == IpaIntent::RtteUnassigned {
                // The next entry is ASSIGNED, so neither policy reaches past it.
                expect_top(top, GRANULE_SIZE)?;
            }
        }
        Ok(Prepared::Ready(()))
    })?;

    rec.check("data destroy: returns the granule and leaves DESTROYED", 40, || {
        let destroyed = seq
            .platform()
            .data_destroy(rd, VALID_IPA)
            .map_err(|err| PrepError::command("data destroy", err.code))?;
        seq.track_granule(destroyed.data);
        if destroyed.data != data {
            return Err(CheckError::GranuleMismatch {
                pa: destroyed.data,
                actual: seq.platform_ref().granule_state(destroyed.data),
                expected: GranuleState::Data,
            });
        }
        expect_granule(seq.platform_ref(), data, GranuleState::Delegated)?;
        expect_top(destroyed.top, destroy_top(seq.checks().top_policy))?;
        expect_leaf(
            seq.platform_ref(),
            rd,
            VALID_IPA,
            RTT_MAX_LEVEL,
            RttState::Unassigned,
            Some(Ripas::Destroyed),
        )?;
        Ok(Prepared::Ready(()))
    })?;

    rec.check("data destroy: unknown content over DESTROYED leaves EMPTY", 41, || {
        let unknown = seq.delegated()?;
        let m = seq.platform();
        m.data_create_unknown(rd, unknown, VALID_IPA)
            .map_err(|err| PrepError::command("data create unknown", err.code))?;
        m.data_destroy(rd, VALID_IPA)
            .map_err(|err| PrepError::command("data destroy", err.code))?;
        expect_leaf(
            seq.platform_ref(),
            rd,
            VALID_IPA,
            RTT_MAX_LEVEL,
            RttState::Unassigned,
            Some(Ripas::Empty),
        )?;
        Ok(Prepared::Ready(()))
    })?;

    rec.check("data destroy: ASSIGNED EMPTY becomes UNASSIGNED EMPTY", 42, || {
        let ipa = 0x5000;
        let unknown = seq.delegated()?;
        let m = seq.platform();
        m.data_create_unknown(rd, unknown, ipa)
            .map_err(|err| PrepError::command("data create unknown", err.code))?;
        expect_leaf(seq.platform_ref(), rd, ipa, RTT_MAX_LEVEL, RttState::Assigned, Some(Ripas::Empty))?;
        seq.platform()
            .data_destroy(rd, ipa)
            .map_err(|err| PrepError::command("data destroy", err.code))?;
        expect_leaf(
            seq.platform_ref(),
            rd,
            ipa,
            RTT_MAX_LEVEL,
            RttState::Unassigned,
            Some(Ripas::Empty),
        )?;
        Ok(Prepared::Ready(()))
    })
}
