use super::{expect_failure, granule_table, run_table, Recorder, SuiteResult};
use crate::error::PrepError;
use crate::granule::GranuleState;
use crate::host::RealmSpec;
use crate::monitor::Platform;
use crate::sequencer::{GranuleContext, GranuleIntent, Prepared, Sequencer};
use crate::types::{ReturnCode, GRANULE_SIZE};
use crate::verifier::{expect_granule, expect_wiped};

/// Pattern written through a DATA granule before it is handed back.
const SECRET: u8 = 0x0a;

pub fn granule_undelegate<M: Platform>(seq: &mut Sequencer<'_, M>, rec: &mut Recorder) -> SuiteResult {
    let (realm, valid) = rec.prepare("setup", 1, || {
        let realm = seq.realm(RealmSpec::default())?;
        Ok((realm, seq.delegated()?))
    })?;
    let ctx = GranuleContext {
        realm,
        valid,
        data_ipa: 0x3000,
    };

    let table = granule_table(GranuleIntent::Delegated, ReturnCode::input());
    run_table(rec, "undelegate", 2, &table, |stimulus| {
        let Some(pa) = stimulus.intent.prepare(seq, &ctx)?.ready() else {
            return Ok(Prepared::Skip(format!("{:?} not available", stimulus.intent)));
        };
        let before = seq.platform_ref().granule_state(pa);
        expect_failure(seq.platform().granule_undelegate(pa), stimulus.expected)?;
        // A refused undelegate leaves the granule as it was.
        expect_granule(seq.platform_ref(), pa, before)?;
        Ok(Prepared::Ready(()))
    })?;

    rec.check("undelegate: delegated granule returns to the host", 20, || {
        seq.platform()
            .granule_undelegate(valid)
            .map_err(|err| PrepError::command("granule undelegate", err.code))?;
        expect_granule(seq.platform_ref(), valid, GranuleState::Undelegated)?;
        Ok(Prepared::Ready(()))
    })?;

    rec.check("undelegate: realm data does not leak to the host", 21, || {
        let rd = seq.rd(realm)?;
        let ipa = 0x4000;
        seq.create_mapping(realm, ipa, true, 0)?;
        let src = seq.undelegated()?;
        let data = seq.delegated()?;
        let pattern = [SECRET; GRANULE_SIZE as usize];
        seq.platform()
            .write_granule(src, 0, &pattern)
            .map_err(|err| PrepError::step("fill source", err.to_string()))?;
        let m = seq.platform();
        m.data_create(rd, data, ipa, src, false)
            .map_err(|err| PrepError::command("data create", err.code))?;
        m.data_destroy(rd, ipa)
            .map_err(|err| PrepError::command("data destroy", err.code))?;
        m.granule_undelegate(data)
            .map_err(|err| PrepError::command("granule undelegate", err.code))?;
        expect_granule(seq.platform_ref(), data, GranuleState::Undelegated)?;
        expect_wiped(seq.platform_ref(), data, &pattern[..64])?;
        Ok(Prepared::Ready(()))
    })?;

    rec.check("undelegate: torn-down realm granules return to the host", 22, || {
        let rd = seq.rd(realm)?;
        seq.teardown(realm)?;
        expect_granule(seq.platform_ref(), rd, GranuleState::Undelegated)?;
        Ok(Prepared::Ready(()))
    })
}
