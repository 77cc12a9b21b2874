//! Concurrent hosts sharing one monitor.

use realm_model::granule::GranuleState;
use realm_model::host::{self, RealmSpec};
use realm_model::monitor::{ModelMonitor, SharedMonitor};
use realm_model::realm::RealmParams;
use std::thread;

const THREADS: u16 = 6;
const PAGES: u64 = 4;

#[test]
fn test_parallel_realms_map_and_tear_down_cleanly() {
    let shared = SharedMonitor::new(ModelMonitor::default());
    thread::scope(|s| {
        for vmid in 1..=THREADS {
            let shared = shared.clone();
            s.spawn(move || {
                let spec = RealmSpec {
                    params: RealmParams {
                        vmid,
                        ..RealmParams::default()
                    },
                    ..RealmSpec::default()
                };
                let mut realm = shared.with(|m| host::realm_setup(m, &spec)).unwrap();
                for page in 0..PAGES {
                    let ipa = 0x1000 * (page + 1);
                    let content = vmid.to_le_bytes();
                    shared
                        .with(|m| host::map_protected_data(m, &mut realm, ipa, Some(&content)))
                        .unwrap();
                }
                shared.with(|m| host::teardown(m, realm)).unwrap();
            });
        }
    });

    let monitor = shared.into_inner().unwrap();
    assert_eq!(monitor.realm_count(), 0);
    for state in [GranuleState::Rd, GranuleState::Rtt, GranuleState::Data, GranuleState::Delegated] {
        assert_eq!(monitor.registry().count(state), 0, "{state:?} granules left");
    }
}

#[test]
fn test_duplicate_vmid_is_refused_across_threads() {
    let shared = SharedMonitor::new(ModelMonitor::default());
    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let shared = shared.clone();
                s.spawn(move || shared.with(|m| host::realm_setup(m, &RealmSpec::default())))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    let ok = results.iter().filter(|r| r.is_ok()).count();
    for realm in results.into_iter().flatten() {
        shared.with(|m| host::teardown(m, realm)).unwrap();
    }
    assert_eq!(ok, 1);
    assert_eq!(shared.with(|m| m.realm_count()), 0);
    // The refused create hands its granules back.
    assert_eq!(shared.with(|m| m.registry().count(GranuleState::Delegated)), 0);
}
