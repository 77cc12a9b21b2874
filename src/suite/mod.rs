//! Conformance suites
//!
//! Each suite drives the reference monitor through one command (or one
//! memory-management or attestation flow) and records a verdict per check:
//! first the negative checks from a stimulus table, then the positive
//! observability checks. A failing check halts the suite; a skipped check
//! does not.

mod attestation;
mod data;
mod granule;
mod memory;
mod multithread;
mod rec;
mod s2ap;

use crate::error::{CheckError, PrepError};
use crate::monitor::{first_violation, ModelMonitor, MonitorConfig, Platform, RangeCheck, RmiResult};
use crate::sequencer::{CheckSettings, GranuleIntent, Prepared, Sequencer};
use crate::types::{Ipa, ReturnCode};
use crate::verifier::expect_outcome;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tracing::{error, info, warn};

/// One row of a negative-check table.
#[derive(Debug, Clone)]
pub struct Stimulus<I> {
    pub msg: &'static str,
    pub intent: I,
    pub expected: ReturnCode,
}

impl<I> Stimulus<I> {
    pub fn new(msg: &'static str, intent: I, expected: ReturnCode) -> Self {
        Self {
            msg,
            intent,
            expected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail { point: u32, error: String },
    Skip { reason: String },
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail { .. } => "FAIL",
            Verdict::Skip { .. } => "SKIP",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Fail { point, error } => write!(f, "FAIL at point {point}: {error}"),
            Verdict::Skip { reason } => write!(f, "SKIP: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckRecord {
    pub index: usize,
    pub name: String,
    #[serde(flatten)]
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub suite: String,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub checks: Vec<CheckRecord>,
    /// Realms or granules the suite could not give back.
    pub leaked: usize,
}

impl SuiteReport {
    fn count(&self, f: impl Fn(&Verdict) -> bool) -> usize {
        self.checks.iter().filter(|c| f(&c.verdict)).count()
    }

    pub fn passed(&self) -> usize {
        self.count(|v| *v == Verdict::Pass)
    }

    pub fn failed(&self) -> usize {
        self.count(|v| matches!(v, Verdict::Fail { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|v| matches!(v, Verdict::Skip { .. }))
    }

    /// Fail if any check failed, skip if nothing ran, pass otherwise.
    pub fn verdict(&self) -> Verdict {
        if let Some(failed) = self
            .checks
            .iter()
            .find(|c| matches!(c.verdict, Verdict::Fail { .. }))
        {
            return failed.verdict.clone();
        }
        if self.passed() == 0 {
            let reason = self
                .checks
                .iter()
                .find_map(|c| match &c.verdict {
                    Verdict::Skip { reason } => Some(reason.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| "no checks ran".to_string());
            return Verdict::Skip { reason };
        }
        Verdict::Pass
    }
}

/// A failed check stops the suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Halt;

pub type SuiteResult = Result<(), Halt>;

/// Collects check verdicts for one suite run.
#[derive(Debug)]
pub struct Recorder {
    suite: &'static str,
    checks: Vec<CheckRecord>,
}

impl Recorder {
    pub fn new(suite: &'static str) -> Self {
        Self {
            suite,
            checks: Vec::new(),
        }
    }

    pub fn checks(&self) -> &[CheckRecord] {
        &self.checks
    }

    fn record(&mut self, name: String, verdict: Verdict) {
        match &verdict {
            Verdict::Pass => info!(suite = self.suite, check = %name, "check passed"),
            Verdict::Fail { point, error } => {
                error!(suite = self.suite, check = %name, point, %error, "check failed")
            }
            Verdict::Skip { reason } => info!(suite = self.suite, check = %name, %reason, "check skipped"),
        }
        self.checks.push(CheckRecord {
            index: self.checks.len(),
            name,
            verdict,
        });
    }

    /// Runs one check; a failure halts the suite.
    pub fn check(
        &mut self,
        name: impl Into<String>,
        point: u32,
        f: impl FnOnce() -> Result<Prepared<()>, CheckError>,
    ) -> SuiteResult {
        let name = name.into();
        match f() {
            Ok(Prepared::Ready(())) => {
                self.record(name, Verdict::Pass);
                Ok(())
            }
            Ok(Prepared::Skip(reason)) => {
                self.record(name, Verdict::Skip { reason });
                Ok(())
            }
            Err(err) => {
                self.record(
                    name,
                    Verdict::Fail {
                        point,
                        error: err.to_string(),
                    },
                );
                Err(Halt)
            }
        }
    }

    /// Builds suite-level state; a failure is recorded as a failed check.
    pub fn prepare<T>(
        &mut self,
        name: &'static str,
        point: u32,
        f: impl FnOnce() -> Result<T, PrepError>,
    ) -> Result<T, Halt> {
        f().map_err(|err| {
            self.record(
                name.to_string(),
                Verdict::Fail {
                    point,
                    error: err.to_string(),
                },
            );
            Halt
        })
    }

    /// Records that the whole suite does not apply to this platform.
    pub fn skip_suite(&mut self, reason: impl Into<String>) -> SuiteResult {
        self.record(
            "suite".to_string(),
            Verdict::Skip {
                reason: reason.into(),
            },
        );
        Ok(())
    }
}

/// Runs `table` in order, naming checks `label: msg` and numbering failure
/// points from `first_point`.
pub(crate) fn run_table<I>(
    rec: &mut Recorder,
    label: &str,
    first_point: u32,
    table: &[Stimulus<I>],
    mut run: impl FnMut(&Stimulus<I>) -> Result<Prepared<()>, CheckError>,
) -> SuiteResult {
    for (i, stimulus) in table.iter().enumerate() {
        let name = format!("{label}: {}", stimulus.msg);
        rec.check(name, first_point + i as u32, || run(stimulus))?;
    }
    Ok(())
}

/// Every granule shape except `valid`, each expected to fail with `expected`.
pub(crate) fn granule_table(valid: GranuleIntent, expected: ReturnCode) -> Vec<Stimulus<GranuleIntent>> {
    use GranuleIntent::*;
    [
        (Unaligned, "granule not aligned"),
        (DevMem, "granule in device memory"),
        (OutsideOfPermittedPa, "granule outside permitted PA range"),
        (Undelegated, "granule undelegated"),
        (Delegated, "granule delegated"),
        (Rd, "granule is an RD"),
        (Rec, "granule is a REC"),
        (RecAux, "granule is a REC auxiliary"),
        (Rtt, "granule is an RTT"),
        (Data, "granule is DATA"),
    ]
    .into_iter()
    .filter(|(intent, _)| *intent != valid)
    .map(|(intent, msg)| Stimulus::new(msg, intent, expected))
    .collect()
}

/// Requires `result` to have failed with `expected`; yields the reported `top`.
pub(crate) fn expect_failure<T>(result: RmiResult<T>, expected: ReturnCode) -> Result<Option<Ipa>, CheckError> {
    match result {
        Ok(_) => Err(CheckError::OutcomeMismatch {
            actual: ReturnCode::SUCCESS,
            expected,
        }),
        Err(err) => {
            expect_outcome(err.code, expected)?;
            Ok(err.top)
        }
    }
}

pub type SequencedBody = fn(&mut Sequencer<'_, ModelMonitor>, &mut Recorder) -> SuiteResult;
pub type StandaloneBody = fn(&MonitorConfig, &mut Recorder) -> SuiteResult;

#[derive(Clone, Copy)]
pub enum SuiteBody {
    /// Runs against one monitor through a fixture sequencer.
    Sequenced(SequencedBody),
    /// Builds its own monitors.
    Standalone(StandaloneBody),
}

#[derive(Clone, Copy)]
pub struct Suite {
    pub name: &'static str,
    pub description: &'static str,
    pub body: SuiteBody,
}

impl fmt::Debug for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suite").field("name", &self.name).finish()
    }
}

static SUITES: &[Suite] = &[
    Suite {
        name: "granule_undelegate",
        description: "GRANULE_UNDELEGATE argument checks, state transition and scrubbing",
        body: SuiteBody::Sequenced(granule::granule_undelegate::<ModelMonitor>),
    },
    Suite {
        name: "data_destroy",
        description: "DATA_DESTROY argument checks, walk top and resulting HIPAS/RIPAS",
        body: SuiteBody::Sequenced(data::data_destroy::<ModelMonitor>),
    },
    Suite {
        name: "rec_destroy",
        description: "REC_DESTROY argument checks and REC liveness",
        body: SuiteBody::Sequenced(rec::rec_destroy::<ModelMonitor>),
    },
    Suite {
        name: "psci_complete",
        description: "PSCI_COMPLETE argument checks and CPU_ON completion",
        body: SuiteBody::Sequenced(rec::psci_complete::<ModelMonitor>),
    },
    Suite {
        name: "system_reset",
        description: "PSCI_SYSTEM_RESET exit and refused re-entry of the REC",
        body: SuiteBody::Sequenced(rec::system_reset::<ModelMonitor>),
    },
    Suite {
        name: "rtt_set_s2ap",
        description: "RTT_SET_S2AP argument checks, check ordering and plane permissions",
        body: SuiteBody::Sequenced(s2ap::rtt_set_s2ap::<ModelMonitor>),
    },
    Suite {
        name: "rtt_fold_assigned_ns",
        description: "Fold and unfold of a fully mapped unprotected table",
        body: SuiteBody::Sequenced(memory::rtt_fold_assigned_ns::<ModelMonitor>),
    },
    Suite {
        name: "ripas_change_reject",
        description: "Host rejection and partial acceptance of RIPAS change requests",
        body: SuiteBody::Sequenced(memory::ripas_change_reject::<ModelMonitor>),
    },
    Suite {
        name: "rec_exit_ia_ripas_destroyed",
        description: "Instruction fetch from a DESTROYED address exits to the host",
        body: SuiteBody::Sequenced(memory::rec_exit_ia_ripas_destroyed::<ModelMonitor>),
    },
    Suite {
        name: "attestation_token",
        description: "Attestation token retrieval granule by granule",
        body: SuiteBody::Sequenced(attestation::attestation_token::<ModelMonitor>),
    },
    Suite {
        name: "attestation_rpv",
        description: "Realm personalization value reported to the realm",
        body: SuiteBody::Sequenced(attestation::attestation_rpv::<ModelMonitor>),
    },
    Suite {
        name: "multithread_realm_up",
        description: "Secondary REC bring-up with realms running on several threads",
        body: SuiteBody::Standalone(multithread::multithread_realm_up),
    },
];

pub fn all() -> &'static [Suite] {
    SUITES
}

pub fn find(name: &str) -> Option<&'static Suite> {
    SUITES.iter().find(|s| s.name == name)
}

/// Runs one suite body against `m` and releases its fixtures.
pub fn run_sequenced<M: Platform>(
    m: &mut M,
    checks: CheckSettings,
    rec: &mut Recorder,
    body: fn(&mut Sequencer<'_, M>, &mut Recorder) -> SuiteResult,
) -> usize {
    let mut seq = Sequencer::with_checks(m, checks);
    // A halt is already recorded as a failed check.
    let _ = body(&mut seq, rec);
    seq.release()
}

/// Runs `suite` against a fresh reference monitor built from `config`.
pub fn run_suite(suite: &Suite, config: &MonitorConfig) -> SuiteReport {
    let started_at = Utc::now();
    let mut recorder = Recorder::new(suite.name);
    let leaked = match suite.body {
        SuiteBody::Sequenced(body) => {
            let mut monitor = ModelMonitor::new(config.clone());
            run_sequenced(&mut monitor, CheckSettings::from(config), &mut recorder, body)
        }
        SuiteBody::Standalone(body) => {
            let _ = body(config, &mut recorder);
            0
        }
    };
    if leaked > 0 {
        warn!(suite = suite.name, leaked, "suite left fixtures behind");
    }
    let duration_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
    SuiteReport {
        suite: suite.name.to_string(),
        description: suite.description.to_string(),
        started_at,
        duration_ms,
        checks: recorder.checks,
        leaked,
    }
}

/// Expected status when an intent violates `check` of a range command,
/// or `None` when that check is disabled by configuration.
pub(crate) fn range_expectation(
    settings: &CheckSettings,
    violated: impl Fn(RangeCheck) -> bool,
) -> Option<ReturnCode> {
    first_violation(&settings.range_precedence, violated).map(|c| c.code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_halts_on_failure_and_keeps_skips() {
        let mut rec = Recorder::new("unit");
        assert!(rec.check("passes", 1, || Ok(Prepared::Ready(()))).is_ok());
        assert!(rec
            .check("skips", 2, || Ok(Prepared::Skip("not here".into())))
            .is_ok());
        let halted = rec.check("fails", 3, || {
            Err(CheckError::TokenMismatch("short".into()))
        });
        assert_eq!(halted, Err(Halt));
        assert_eq!(rec.checks().len(), 3);
        assert_eq!(rec.checks()[2].index, 2);
        assert!(matches!(rec.checks()[2].verdict, Verdict::Fail { point: 3, .. }));
    }

    #[test]
    fn test_report_verdict_precedence() {
        let record = |verdict| CheckRecord {
            index: 0,
            name: "c".into(),
            verdict,
        };
        let mut report = SuiteReport {
            suite: "unit".into(),
            description: String::new(),
            started_at: Utc::now(),
            duration_ms: 0,
            checks: vec![record(Verdict::Skip { reason: "r".into() })],
            leaked: 0,
        };
        assert_eq!(report.verdict(), Verdict::Skip { reason: "r".into() });
        report.checks.push(record(Verdict::Pass));
        assert_eq!(report.verdict(), Verdict::Pass);
        report.checks.push(record(Verdict::Fail {
            point: 7,
            error: "e".into(),
        }));
        assert_eq!(report.failed(), 1);
        assert!(matches!(report.verdict(), Verdict::Fail { point: 7, .. }));
    }

    #[test]
    fn test_verdict_serializes_with_tag() {
        let json = serde_json::to_string(&Verdict::Fail {
            point: 2,
            error: "boom".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"verdict":"fail","point":2,"error":"boom"}"#);
    }

    #[test]
    fn test_suite_names_are_unique() {
        let mut names: Vec<_> = all().iter().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), all().len());
        assert!(find("data_destroy").is_some());
        assert!(find("missing").is_none());
    }
}
