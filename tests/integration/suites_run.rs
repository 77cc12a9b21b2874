//! Every registered suite runs clean against the reference monitor.

use super::test_utils::{failures, monitor_configs};
use realm_model::monitor::{MonitorConfig, RangeCheck};
use realm_model::suite::{self, Verdict};

#[test]
fn test_all_suites_pass_without_leaks() {
    for (label, config) in monitor_configs() {
        for s in suite::all() {
            let report = suite::run_suite(s, &config);
            assert!(
                failures(&report).is_empty(),
                "[{label}] {} failed: {:#?}",
                s.name,
                failures(&report)
            );
            assert_eq!(report.leaked, 0, "[{label}] {} leaked fixtures", s.name);
            assert!(!report.checks.is_empty(), "[{label}] {} recorded nothing", s.name);
        }
    }
}

#[test]
fn test_suite_names_are_unique_and_findable() {
    let names: Vec<_> = suite::all().iter().map(|s| s.name).collect();
    for name in &names {
        assert_eq!(names.iter().filter(|n| *n == name).count(), 1, "{name} registered twice");
        assert!(suite::find(name).is_some());
    }
    assert!(suite::find("no_such_suite").is_none());
}

#[test]
fn test_reordered_range_checks_still_pass() {
    let mut precedence = RangeCheck::default_precedence();
    precedence.reverse();
    let config = MonitorConfig {
        range_precedence: precedence,
        ..MonitorConfig::default()
    };
    let report = suite::run_suite(suite::find("rtt_set_s2ap").unwrap(), &config);
    assert!(failures(&report).is_empty(), "{:#?}", failures(&report));
}

#[test]
fn test_disabled_range_check_is_reported_as_skip() {
    let config = MonitorConfig {
        range_precedence: RangeCheck::default_precedence()
            .into_iter()
            .filter(|c| *c != RangeCheck::TopUnaligned)
            .collect(),
        ..MonitorConfig::default()
    };
    let report = suite::run_suite(suite::find("rtt_set_s2ap").unwrap(), &config);
    assert!(failures(&report).is_empty(), "{:#?}", failures(&report));
    let unaligned = report
        .checks
        .iter()
        .find(|c| c.name.contains("top not aligned"))
        .unwrap();
    assert!(matches!(unaligned.verdict, Verdict::Skip { .. }));
}

#[test]
fn test_report_serializes_verdicts() {
    let report = suite::run_suite(suite::find("granule_undelegate").unwrap(), &MonitorConfig::default());
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["suite"], "granule_undelegate");
    assert_eq!(json["leaked"], 0);
    assert!(json["checks"]
        .as_array()
        .unwrap()
        .iter()
        .all(|c| c["verdict"] == "pass"));
}
