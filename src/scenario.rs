//! Worked scenarios
//!
//! Short end-to-end flows that print what the monitor reported at each step,
//! for use from the command line. Each one builds its fixtures in a fresh
//! sequencer and releases them afterwards.

use crate::attestation::CHALLENGE_SIZE;
use crate::error::{CheckError, ModelError, PrepError};
use crate::host::{self, expect_ok, RealmSpec, RecSpec};
use crate::monitor::{ModelMonitor, MonitorConfig, Platform};
use crate::realm::GuestStep;
use crate::rtt::{Ripas, RttState};
use crate::sequencer::{CheckSettings, Sequencer};
use crate::types::{level_size, Ipa, GRANULE_SIZE, RTT_ENTRIES, RTT_MAX_LEVEL};
use crate::verifier::{assemble_token, expect_leaf, expect_top, expected_top, FoldSnapshot};
use serde::Serialize;
use tracing::{info, warn};

/// Name/value pairs observed while a scenario ran.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioOutcome {
    pub scenario: String,
    pub facts: Vec<(String, String)>,
}

impl ScenarioOutcome {
    fn note(&mut self, name: &str, value: impl ToString) {
        self.facts.push((name.to_string(), value.to_string()));
    }

    pub fn fact(&self, name: &str) -> Option<&str> {
        self.facts
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

type Body = fn(&mut Sequencer<'_, ModelMonitor>, &mut ScenarioOutcome) -> Result<(), CheckError>;

pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    body: Body,
}

static SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "map_destroy",
        description: "Map a DATA granule at 0x1000 in a 40-bit realm and destroy it",
        body: map_destroy::<ModelMonitor>,
    },
    Scenario {
        name: "fold_unprotected",
        description: "Fold a fully mapped 2 MiB unprotected region and unfold it again",
        body: fold_unprotected::<ModelMonitor>,
    },
    Scenario {
        name: "token_assembly",
        description: "Retrieve an attestation token one granule-sized buffer at a time",
        body: token_assembly::<ModelMonitor>,
    },
];

pub fn all() -> &'static [Scenario] {
    SCENARIOS
}

pub fn run_scenario(name: &str, config: &MonitorConfig) -> Result<ScenarioOutcome, ModelError> {
    let scenario = SCENARIOS
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| ModelError::UnknownScenario(name.to_string()))?;
    let mut monitor = ModelMonitor::new(config.clone());
    let mut seq = Sequencer::with_checks(&mut monitor, CheckSettings::from(config));
    let mut outcome = ScenarioOutcome {
        scenario: name.to_string(),
        ..ScenarioOutcome::default()
    };
    let result = (scenario.body)(&mut seq, &mut outcome);
    let leaked = seq.release();
    if leaked > 0 {
        warn!(scenario = name, leaked, "scenario left fixtures behind");
    }
    result.map_err(|source| ModelError::ScenarioFailed {
        name: name.to_string(),
        source,
    })?;
    info!(scenario = name, facts = outcome.facts.len(), "scenario complete");
    Ok(outcome)
}

const MAPPED_IPA: Ipa = 0x1000;

fn map_destroy<M: Platform>(seq: &mut Sequencer<'_, M>, out: &mut ScenarioOutcome) -> Result<(), CheckError> {
    let realm = seq.realm(RealmSpec {
        recs: vec![RecSpec::parked()],
        ..RealmSpec::default()
    })?;
    let rd = seq.rd(realm)?;
    let data = seq.map_data(realm, MAPPED_IPA, Some(b"scenario"))?;
    out.note("data", format!("{data:#x}"));
    expect_leaf(seq.platform_ref(), rd, MAPPED_IPA, RTT_MAX_LEVEL, RttState::Assigned, Some(Ripas::Ram))?;
    out.note("mapped", "ASSIGNED/RAM");

    let destroyed = expect_ok("data destroy", seq.platform().data_destroy(rd, MAPPED_IPA))?;
    seq.track_granule(destroyed.data);
    expect_leaf(
        seq.platform_ref(),
        rd,
        MAPPED_IPA,
        RTT_MAX_LEVEL,
        RttState::Unassigned,
        Some(Ripas::Destroyed),
    )?;
    let expected = expected_top(seq.platform_ref(), rd, MAPPED_IPA, seq.checks().top_policy)?;
    expect_top(destroyed.top, expected)?;
    out.note("destroyed", "UNASSIGNED/DESTROYED");
    out.note("top", format!("{:#x}", destroyed.top));
    Ok(())
}

fn fold_unprotected<M: Platform>(seq: &mut Sequencer<'_, M>, out: &mut ScenarioOutcome) -> Result<(), CheckError> {
    let block = level_size(2);
    let realm = seq.realm(RealmSpec::default())?;
    let rd = seq.rd(realm)?;
    let phys = seq
        .platform()
        .alloc_granules(RTT_ENTRIES, block)
        .ok_or(PrepError::PoolExhausted { count: RTT_ENTRIES })?;
    for page in 0..RTT_ENTRIES as u64 {
        seq.track_granule(phys + page * GRANULE_SIZE);
    }
    let ipa = seq.with_realm(realm, |m, handle| {
        host::map_unprotected_range(m, handle, block, block, phys, 0)
    })?;
    out.note("base", format!("{ipa:#x}"));

    let snapshot = FoldSnapshot::capture(seq.platform_ref(), rd, ipa, RTT_MAX_LEVEL)?;
    let rtt = expect_ok("rtt fold", seq.platform().rtt_fold(rd, ipa, RTT_MAX_LEVEL))?;
    seq.track_granule(rtt);
    snapshot.verify_folded(seq.platform_ref(), rd, rtt)?;
    let parent = expect_ok("read entry", seq.platform_ref().rtt_read_entry(rd, ipa, 2))?;
    out.note("returned rtt", format!("{rtt:#x}"));
    out.note("block address", format!("{:#x}", parent.addr));

    seq.with_realm(realm, |m, handle| host::unfold(m, handle, ipa, 2, RTT_MAX_LEVEL))?;
    snapshot.verify_unfolded(seq.platform_ref(), rd)?;
    out.note("unfolded", format!("{RTT_ENTRIES} entries identical"));
    Ok(())
}

const TOKEN_PAGE: usize = GRANULE_SIZE as usize;

fn token_assembly<M: Platform>(seq: &mut Sequencer<'_, M>, out: &mut ScenarioOutcome) -> Result<(), CheckError> {
    let realm = seq.realm(RealmSpec {
        recs: vec![RecSpec::runnable(vec![GuestStep::PsciSystemOff])],
        activate: true,
        ..RealmSpec::default()
    })?;
    let rec = seq.rec(realm, 0)?;
    let challenge = [0x5a; CHALLENGE_SIZE];
    let token = assemble_token(seq.platform(), rec, &challenge, TOKEN_PAGE)?;
    out.note("length", token.len());
    out.note("buffers", token.len().div_ceil(TOKEN_PAGE));
    out.note("digest", hex::encode(&blake3::hash(&token).as_bytes()[..8]));
    Ok(())
}
