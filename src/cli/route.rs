//! CLI route: single route table and run context. Dispatches to the suite
//! runner, the scenarios and the configuration, then to presentation.

use crate::cli::output::{format_run_report, format_scenario, format_scenario_list, format_suite_list};
use crate::cli::parse::{Commands, ConfigCommands, OutputFormat};
use crate::config::{ConfigLoader, ModelConfig};
use crate::error::ModelError;
use crate::monitor::MonitorConfig;
use crate::scenario;
use crate::suite::{self, Suite, SuiteReport, Verdict};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// Text to print and whether the command succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub text: String,
    pub success: bool,
}

impl CommandOutput {
    fn ok(text: String) -> Self {
        Self { text, success: true }
    }
}

/// Runtime context for CLI execution: the effective configuration.
/// Built from the workspace path and optional config path using ConfigLoader only.
#[derive(Debug, Clone)]
pub struct RunContext {
    config: ModelConfig,
    monitor: MonitorConfig,
}

impl RunContext {
    pub fn new(workspace_root: &Path, config_path: Option<&PathBuf>) -> Result<Self, ModelError> {
        let config = match config_path {
            Some(path) => ConfigLoader::load_from_file(path)?,
            None => ConfigLoader::load(workspace_root)?,
        };
        config.validate().map_err(|errors| {
            let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            ModelError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                msgs.join("\n")
            ))
        })?;
        Ok(Self::from_config(config))
    }

    /// Context over an already validated configuration.
    pub fn from_config(config: ModelConfig) -> Self {
        let monitor = config.monitor_config();
        Self { config, monitor }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn execute(&self, command: &Commands) -> Result<CommandOutput, ModelError> {
        match command {
            Commands::Suites { format } => self.list_suites(*format),
            Commands::Run { suites, format } => self.run_suites(suites, *format),
            Commands::Scenario { name, format } => self.run_scenario(name.as_deref(), *format),
            Commands::Config { command } => match command {
                ConfigCommands::Show => self
                    .config
                    .to_toml()
                    .map(CommandOutput::ok)
                    .map_err(|e| ModelError::ConfigError(e.to_string())),
                ConfigCommands::Validate => Ok(CommandOutput::ok("Configuration is valid.".to_string())),
            },
        }
    }

    fn list_suites(&self, format: OutputFormat) -> Result<CommandOutput, ModelError> {
        let suites = suite::all();
        let text = match format {
            OutputFormat::Text => format_suite_list(suites),
            OutputFormat::Json => {
                let rows: Vec<_> = suites
                    .iter()
                    .map(|s| json!({ "name": s.name, "description": s.description }))
                    .collect();
                serde_json::to_string_pretty(&rows)?
            }
        };
        Ok(CommandOutput::ok(text))
    }

    fn select(names: &[String]) -> Result<Vec<&'static Suite>, ModelError> {
        if names.is_empty() {
            return Ok(suite::all().iter().collect());
        }
        names
            .iter()
            .map(|name| suite::find(name).ok_or_else(|| ModelError::UnknownSuite(name.clone())))
            .collect()
    }

    fn run_suites(&self, names: &[String], format: OutputFormat) -> Result<CommandOutput, ModelError> {
        let selected = Self::select(names)?;
        let start = Instant::now();
        let reports: Vec<SuiteReport> = selected
            .into_iter()
            .map(|s| suite::run_suite(s, &self.monitor))
            .collect();
        let failed = reports
            .iter()
            .filter(|r| matches!(r.verdict(), Verdict::Fail { .. }))
            .count();
        info!(
            suites = reports.len(),
            failed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "conformance run finished"
        );
        if failed > 0 {
            warn!(failed, "conformance run has failing suites");
        }
        let text = match format {
            OutputFormat::Text => format_run_report(&reports),
            OutputFormat::Json => serde_json::to_string_pretty(&reports)?,
        };
        Ok(CommandOutput {
            text,
            success: failed == 0,
        })
    }

    fn run_scenario(&self, name: Option<&str>, format: OutputFormat) -> Result<CommandOutput, ModelError> {
        let Some(name) = name else {
            return Ok(CommandOutput::ok(format_scenario_list(scenario::all())));
        };
        let outcome = scenario::run_scenario(name, &self.monitor)?;
        let text = match format {
            OutputFormat::Text => format_scenario(&outcome),
            OutputFormat::Json => serde_json::to_string_pretty(&outcome)?,
        };
        Ok(CommandOutput::ok(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> RunContext {
        RunContext::from_config(ModelConfig::default())
    }

    #[test]
    fn test_run_single_suite_as_json() {
        let out = context()
            .execute(&Commands::Run {
                suites: vec!["granule_undelegate".into()],
                format: OutputFormat::Json,
            })
            .unwrap();
        assert!(out.success);
        let reports: serde_json::Value = serde_json::from_str(&out.text).unwrap();
        assert_eq!(reports[0]["suite"], "granule_undelegate");
        assert_eq!(reports[0]["checks"][0]["verdict"], "pass");
    }

    #[test]
    fn test_unknown_suite_is_an_error() {
        let err = context()
            .execute(&Commands::Run {
                suites: vec!["no_such_suite".into()],
                format: OutputFormat::Text,
            })
            .unwrap_err();
        assert!(matches!(err, ModelError::UnknownSuite(name) if name == "no_such_suite"));
    }

    #[test]
    fn test_config_show_is_toml() {
        let out = context()
            .execute(&Commands::Config {
                command: ConfigCommands::Show,
            })
            .unwrap();
        let parsed: ModelConfig = toml::from_str(&out.text).unwrap();
        assert_eq!(&parsed, context().config());
    }

    #[test]
    fn test_scenario_without_name_lists_scenarios() {
        let out = context()
            .execute(&Commands::Scenario {
                name: None,
                format: OutputFormat::Text,
            })
            .unwrap();
        assert!(out.text.contains("map_destroy"));
    }

    #[test]
    fn test_invalid_config_file_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[platform]\ntoken_chunk_size = 0\n").unwrap();
        let err = RunContext::new(dir.path(), Some(&path)).unwrap_err();
        assert!(err.to_string().contains("token_chunk_size"));
    }
}
