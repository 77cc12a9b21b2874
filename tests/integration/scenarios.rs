//! Worked scenarios under both top policies.

use super::test_utils::monitor_configs;
use realm_model::error::ModelError;
use realm_model::monitor::MonitorConfig;
use realm_model::scenario;

#[test]
fn test_every_scenario_completes() {
    for (label, config) in monitor_configs() {
        for s in scenario::all() {
            let outcome = scenario::run_scenario(s.name, &config)
                .unwrap_or_else(|err| panic!("[{label}] {} failed: {err}", s.name));
            assert_eq!(outcome.scenario, s.name);
            assert!(!outcome.facts.is_empty());
        }
    }
}

#[test]
fn test_map_destroy_reports_entry_end_top() {
    let outcome = scenario::run_scenario("map_destroy", &MonitorConfig::default()).unwrap();
    assert_eq!(outcome.fact("destroyed"), Some("UNASSIGNED/DESTROYED"));
    assert_eq!(outcome.fact("top"), Some("0x2000"));
}

#[test]
fn test_unknown_scenario_is_named_in_error() {
    let err = scenario::run_scenario("nope", &MonitorConfig::default()).unwrap_err();
    assert!(matches!(err, ModelError::UnknownScenario(ref name) if name == "nope"));
}
