//! Shared helpers for integration tests

use realm_model::monitor::MonitorConfig;
use realm_model::rtt::TopPolicy;
use realm_model::suite::{SuiteReport, Verdict};
use std::fs;
use std::path::Path;

/// The configurations every suite is expected to pass under.
pub fn monitor_configs() -> Vec<(&'static str, MonitorConfig)> {
    vec![
        ("entry_end", MonitorConfig::default()),
        (
            "skip_non_live",
            MonitorConfig {
                top_policy: TopPolicy::SkipNonLive,
                ..MonitorConfig::default()
            },
        ),
    ]
}

pub fn failures(report: &SuiteReport) -> Vec<String> {
    report
        .checks
        .iter()
        .filter_map(|c| match &c.verdict {
            Verdict::Fail { point, error } => Some(format!("{} (point {point}): {error}", c.name)),
            _ => None,
        })
        .collect()
}

pub fn write_file(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}
