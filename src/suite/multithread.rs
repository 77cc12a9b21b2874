//! Concurrent realm bring-up against one shared monitor.
//!
//! Every host thread owns its realm but the command stream of all threads is
//! interleaved at command granularity through `SharedMonitor`.

use super::{Recorder, SuiteResult};
use crate::error::{CheckError, PrepError};
use crate::granule::GranuleState;
use crate::host::{self, expect_ok, RealmSpec, RecSpec};
use crate::monitor::{ModelMonitor, MonitorConfig, Rmi, SharedMonitor};
use crate::realm::{mpidr_from_index, ExitReason, GuestStep, RealmParams, RecEnter, RecExit};
use crate::sequencer::Prepared;
use crate::types::{Pa, PsciStatus};
use std::thread;
use tracing::debug;

const HOST_THREADS: u16 = 4;

fn enter(shared: &SharedMonitor, rec: Pa, reason: ExitReason) -> Result<RecExit, PrepError> {
    let exit = shared.with(|m| expect_ok("rec enter", m.rec_enter(rec, &RecEnter::default())))?;
    if exit.reason != reason {
        return Err(PrepError::UnexpectedExit {
            step: "rec enter",
            detail: format!("got {:?}, wanted {:?}", exit.reason, reason),
        });
    }
    Ok(exit)
}

/// Brings one realm up to two running RECs, then tears it down.
fn realm_up(shared: &SharedMonitor, vmid: u16) -> Result<(), PrepError> {
    let spec = RealmSpec {
        params: RealmParams {
            vmid,
            ..RealmParams::default()
        },
        recs: vec![
            RecSpec::runnable(vec![
                GuestStep::PsciCpuOn {
                    target_mpidr: mpidr_from_index(1),
                    entry: 0x8000_0000,
                },
                GuestStep::HostCall {
                    imm: vmid,
                    gprs: Vec::new(),
                },
                GuestStep::PsciSystemOff,
            ]),
            RecSpec::parked(),
        ],
        activate: true,
    };
    let realm = shared.with(|m| host::realm_setup(m, &spec))?;
    let (primary, secondary) = (realm.recs[0], realm.recs[1]);

    let steps = || -> Result<(), PrepError> {
        enter(shared, primary, ExitReason::Psci)?;
        shared.with(|m| {
            expect_ok(
                "psci complete",
                m.psci_complete(primary, secondary, PsciStatus::Success),
            )
        })?;
        enter(shared, secondary, ExitReason::HostCall)?;
        let exit = enter(shared, primary, ExitReason::HostCall)?;
        if exit.imm != vmid {
            return Err(PrepError::UnexpectedExit {
                step: "rec enter",
                detail: format!("host call {} from realm {vmid}", exit.imm),
            });
        }
        Ok(())
    };
    let result = steps();
    shared.with(|m| host::teardown(m, realm))?;
    debug!(vmid, "realm brought up and torn down");
    result
}

pub fn multithread_realm_up(config: &MonitorConfig, rec: &mut Recorder) -> SuiteResult {
    let shared = SharedMonitor::new(ModelMonitor::new(config.clone()));

    let results: Vec<Result<(), PrepError>> = thread::scope(|s| {
        let workers: Vec<_> = (0..HOST_THREADS)
            .map(|i| {
                let shared = shared.clone();
                s.spawn(move || realm_up(&shared, i + 1))
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| {
                worker
                    .join()
                    .unwrap_or_else(|_| Err(PrepError::step("host thread", "panicked")))
            })
            .collect()
    });

    for (i, result) in results.into_iter().enumerate() {
        rec.check(format!("multithread: realm {} up and down", i + 1), i as u32 + 1, || {
            result?;
            Ok(Prepared::Ready(()))
        })?;
    }

    rec.check("multithread: nothing left behind", 20, || {
        let monitor = shared
            .into_inner()
            .map_err(|_| PrepError::step("monitor handle", "still shared"))?;
        let left = monitor.realm_count();
        let recs = monitor.registry().count(GranuleState::Rec);
        if left != 0 || recs != 0 {
            return Err(CheckError::UnexpectedExit(format!(
                "{left} realm(s) and {recs} REC(s) still present"
            )));
        }
        Ok(Prepared::Ready(()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::Verdict;

    #[test]
    fn test_concurrent_bring_up_passes() {
        let mut rec = Recorder::new("multithread_realm_up");
        multithread_realm_up(&MonitorConfig::default(), &mut rec).unwrap();
        let checks = rec.checks();
        assert_eq!(checks.len(), HOST_THREADS as usize + 1);
        assert!(checks.iter().all(|c| c.verdict == Verdict::Pass), "{checks:?}");
    }
}
