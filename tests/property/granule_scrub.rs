//! Realm content never survives the return of a granule to the host.

use proptest::prelude::*;
use realm_model::granule::GranuleState;
use realm_model::host::RealmSpec;
use realm_model::monitor::{HostMemory, ModelMonitor, Rmi};
use realm_model::sequencer::Sequencer;
use realm_model::types::GRANULE_SIZE;

fn pattern() -> impl Strategy<Value = (usize, Vec<u8>)> {
    (0usize..GRANULE_SIZE as usize - 64, prop::collection::vec(any::<u8>(), 8..64))
        .prop_filter("pattern must differ from scrubbed memory", |(_, bytes)| {
            bytes.iter().any(|b| *b != 0)
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn undelegated_data_granule_is_scrubbed((offset, bytes) in pattern(), page in 1u64..64) {
        let mut m = ModelMonitor::default();
        let mut seq = Sequencer::new(&mut m);
        let realm = seq.realm(RealmSpec::default()).unwrap();
        let rd = seq.rd(realm).unwrap();
        let ipa = page * GRANULE_SIZE;
        seq.create_mapping(realm, ipa, true, 0).unwrap();

        let src = seq.undelegated().unwrap();
        let data = seq.delegated().unwrap();
        let m = seq.platform();
        m.write_granule(src, offset, &bytes).unwrap();
        m.data_create(rd, data, ipa, src, false).unwrap();
        m.data_destroy(rd, ipa).unwrap();
        m.granule_undelegate(data).unwrap();

        prop_assert_eq!(m.granule_state(data), GranuleState::Undelegated);
        let content = m.read_granule(data).unwrap();
        prop_assert_ne!(&content[offset..offset + bytes.len()], bytes.as_slice());
        prop_assert_eq!(seq.release(), 0);
    }

    #[test]
    fn refused_undelegate_keeps_state((offset, bytes) in pattern()) {
        let mut m = ModelMonitor::default();
        let mut seq = Sequencer::new(&mut m);
        let realm = seq.realm(RealmSpec::default()).unwrap();
        let rd = seq.rd(realm).unwrap();
        seq.create_mapping(realm, 0x1000, true, 0).unwrap();
        let src = seq.undelegated().unwrap();
        let data = seq.delegated().unwrap();
        let m = seq.platform();
        m.write_granule(src, offset, &bytes).unwrap();
        m.data_create(rd, data, 0x1000, src, false).unwrap();

        // Still mapped: the host cannot have it back.
        prop_assert!(m.granule_undelegate(data).is_err());
        prop_assert_eq!(m.granule_state(data), GranuleState::Data);
        prop_assert!(m.granule_undelegate(rd).is_err());
        prop_assert_eq!(m.granule_state(rd), GranuleState::Rd);
        prop_assert_eq!(seq.release(), 0);
    }
}
