//! Command-line parsing and routing end to end, without spawning the binary.

use clap::Parser;
use realm_model::cli::{Cli, Commands, OutputFormat, RunContext};
use realm_model::config::ModelConfig;
use realm_model::error::ModelError;

fn context() -> RunContext {
    RunContext::from_config(ModelConfig::default())
}

fn execute(args: &[&str]) -> Result<realm_model::cli::CommandOutput, ModelError> {
    let cli = Cli::try_parse_from(args).unwrap();
    context().execute(&cli.command)
}

#[test]
fn test_parse_run_with_suites_and_format() {
    let cli = Cli::try_parse_from([
        "realm-model",
        "--log-level",
        "debug",
        "run",
        "data_destroy",
        "rec_destroy",
        "--format",
        "json",
    ])
    .unwrap();
    assert_eq!(cli.log_level.as_deref(), Some("debug"));
    match cli.command {
        Commands::Run { suites, format } => {
            assert_eq!(suites, vec!["data_destroy", "rec_destroy"]);
            assert_eq!(format, OutputFormat::Json);
        }
        other => panic!("parsed {other:?}"),
    }
}

#[test]
fn test_parse_rejects_unknown_format() {
    assert!(Cli::try_parse_from(["realm-model", "suites", "--format", "yaml"]).is_err());
}

#[test]
fn test_suites_lists_every_suite() {
    let out = execute(&["realm-model", "suites"]).unwrap();
    assert!(out.success);
    for s in realm_model::suite::all() {
        assert!(out.text.contains(s.name), "{} missing from listing", s.name);
    }
}

#[test]
fn test_suites_json_is_an_array() {
    let out = execute(&["realm-model", "suites", "--format", "json"]).unwrap();
    let rows: serde_json::Value = serde_json::from_str(&out.text).unwrap();
    assert_eq!(rows.as_array().unwrap().len(), realm_model::suite::all().len());
}

#[test]
fn test_run_text_report_summarises() {
    let out = execute(&["realm-model", "run", "granule_undelegate", "data_destroy"]).unwrap();
    assert!(out.success, "{}", out.text);
    assert!(out.text.contains("2 suite(s), 0 failed, 0 fixture(s) leaked"));
}

#[test]
fn test_run_unknown_suite_fails() {
    let err = execute(&["realm-model", "run", "bogus"]).unwrap_err();
    assert!(matches!(err, ModelError::UnknownSuite(ref name) if name == "bogus"));
    assert!(realm_model::cli::map_error(&err).contains("realm-model suites"));
}

#[test]
fn test_scenario_json_carries_facts() {
    let out = execute(&["realm-model", "scenario", "map_destroy", "--format", "json"]).unwrap();
    let outcome: serde_json::Value = serde_json::from_str(&out.text).unwrap();
    assert_eq!(outcome["scenario"], "map_destroy");
    assert!(!outcome["facts"].as_array().unwrap().is_empty());
}

#[test]
fn test_config_validate_reports_valid() {
    let out = execute(&["realm-model", "config", "validate"]).unwrap();
    assert!(out.success);
    assert!(out.text.contains("valid"));
}
