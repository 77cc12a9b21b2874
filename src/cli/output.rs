//! CLI output: error mapping and text presentation of suites, reports and
//! scenarios.

use crate::error::ModelError;
use crate::scenario::{Scenario, ScenarioOutcome};
use crate::suite::{Suite, SuiteReport, Verdict};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use owo_colors::OwoColorize;

/// Map domain errors to a string for CLI output.
pub fn map_error(e: &ModelError) -> String {
    match e {
        ModelError::UnknownSuite(name) => {
            format!("{e}\nRun `realm-model suites` to list the available suites ({name} is not one).")
        }
        ModelError::UnknownScenario(_) => format!("{e}\nRun `realm-model scenario` to list them."),
        _ => e.to_string(),
    }
}

pub fn format_section_heading(title: &str) -> String {
    format!("{}", title.bold().underline())
}

fn verdict_label(verdict: &Verdict) -> String {
    match verdict {
        Verdict::Pass => verdict.label().green().to_string(),
        Verdict::Fail { .. } => verdict.label().red().bold().to_string(),
        Verdict::Skip { .. } => verdict.label().yellow().to_string(),
    }
}

pub fn format_suite_list(suites: &[Suite]) -> String {
    let mut out = format!("{}\n\n", format_section_heading("Suites"));
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Suite", "Description"]);
    for suite in suites {
        table.add_row(vec![suite.name, suite.description]);
    }
    out.push_str(&format!("{table}\n"));
    out
}

pub fn format_scenario_list(scenarios: &[Scenario]) -> String {
    let mut out = format!("{}\n\n", format_section_heading("Scenarios"));
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Scenario", "Description"]);
    for scenario in scenarios {
        table.add_row(vec![scenario.name, scenario.description]);
    }
    out.push_str(&format!("{table}\n"));
    out
}

/// One summary row per suite, then the failing and skipped checks.
pub fn format_run_report(reports: &[SuiteReport]) -> String {
    let mut out = format!("{}\n\n", format_section_heading("Conformance run"));
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Suite", "Passed", "Failed", "Skipped", "Verdict", "Time"]);
    for report in reports {
        table.add_row(vec![
            report.suite.clone(),
            report.passed().to_string(),
            report.failed().to_string(),
            report.skipped().to_string(),
            verdict_label(&report.verdict()),
            format!("{} ms", report.duration_ms),
        ]);
    }
    out.push_str(&format!("{table}\n"));

    let notable: Vec<_> = reports
        .iter()
        .flat_map(|r| r.checks.iter().map(move |c| (r.suite.as_str(), c)))
        .filter(|(_, c)| c.verdict != Verdict::Pass)
        .collect();
    if !notable.is_empty() {
        out.push_str(&format!("\n{}\n\n", format_section_heading("Checks not passed")));
        let mut table = Table::new();
        table.load_preset(UTF8_BORDERS_ONLY);
        table.set_header(vec!["Suite", "Check", "Verdict", "Detail"]);
        for (suite, check) in notable {
            let detail = match &check.verdict {
                Verdict::Fail { point, error } => format!("point {point}: {error}"),
                Verdict::Skip { reason } => reason.clone(),
                Verdict::Pass => String::new(),
            };
            table.add_row(vec![
                suite.to_string(),
                check.name.clone(),
                verdict_label(&check.verdict),
                detail,
            ]);
        }
        out.push_str(&format!("{table}\n"));
    }

    let failed = reports
        .iter()
        .filter(|r| matches!(r.verdict(), Verdict::Fail { .. }))
        .count();
    let leaked: usize = reports.iter().map(|r| r.leaked).sum();
    out.push_str(&format!(
        "\n{} suite(s), {} failed, {} fixture(s) leaked\n",
        reports.len(),
        failed,
        leaked
    ));
    out
}

pub fn format_scenario(outcome: &ScenarioOutcome) -> String {
    let mut out = format!(
        "{}\n\n",
        format_section_heading(&format!("Scenario {}", outcome.scenario))
    );
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Observation", "Value"]);
    for (name, value) in &outcome.facts {
        table.add_row(vec![name.clone(), value.clone()]);
    }
    out.push_str(&format!("{table}\n"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::CheckRecord;
    use chrono::Utc;

    fn report(checks: Vec<Verdict>) -> SuiteReport {
        SuiteReport {
            suite: "demo".into(),
            description: "demo suite".into(),
            started_at: Utc::now(),
            duration_ms: 3,
            checks: checks
                .into_iter()
                .enumerate()
                .map(|(index, verdict)| CheckRecord {
                    index,
                    name: format!("check {index}"),
                    verdict,
                })
                .collect(),
            leaked: 0,
        }
    }

    #[test]
    fn test_run_report_lists_failures_with_point() {
        let text = format_run_report(&[report(vec![
            Verdict::Pass,
            Verdict::Fail {
                point: 7,
                error: "Command returned ERROR_INPUT".into(),
            },
        ])]);
        assert!(text.contains("demo"));
        assert!(text.contains("point 7: Command returned ERROR_INPUT"));
        assert!(text.contains("1 suite(s), 1 failed"));
    }

    #[test]
    fn test_run_report_omits_detail_table_when_all_pass() {
        let text = format_run_report(&[report(vec![Verdict::Pass, Verdict::Pass])]);
        assert!(!text.contains("Checks not passed"));
        assert!(text.contains("0 failed"));
    }

    #[test]
    fn test_map_error_hints_at_listing() {
        let hint = map_error(&ModelError::UnknownSuite("bogus".into()));
        assert!(hint.contains("realm-model suites"));
    }
}
