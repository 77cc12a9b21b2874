//! Configuration System
//!
//! Layered configuration for the model: built-in defaults, then the global
//! file in the user config directory, then the workspace files, then
//! `REALM_MODEL__*` environment variables. The result is validated as a
//! whole and turned into a `MonitorConfig` for the reference monitor.

use crate::granule::{MemRegion, MemoryMap};
use crate::logging::LoggingConfig;
use crate::monitor::{MonitorConfig, RangeCheck};
use crate::realm::{HashAlgo, PlatformFeatures, RealmParams};
use crate::rtt::TopPolicy;
use crate::types::GRANULE_SIZE;
use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

mod merge {
    pub mod merge_policy;
}
mod sources {
    pub mod global_file;
    pub mod workspace_file;
}

pub use sources::global_file::global_config_path;
pub use sources::workspace_file::ENV_VAR;

/// Prefix of environment overrides; `__` separates nested keys, e.g.
/// `REALM_MODEL__CHECKS__TOP_POLICY=skip_non_live`.
pub const ENV_PREFIX: &str = "REALM_MODEL";

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Realm parameters suites start from.
    #[serde(default)]
    pub realm: RealmDefaults,

    #[serde(default)]
    pub checks: ChecksConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Physical memory, features and attestation limits of the modelled platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub dram_base: u64,
    pub dram_size: u64,
    pub pa_width: u8,
    pub device: Vec<MemRegion>,
    pub max_ipa_width: u8,
    pub max_aux_planes: u8,
    pub planes: bool,
    pub rtt_tree_per_plane: bool,
    pub rtt_tree_single: bool,
    pub rec_aux_count: usize,
    pub hash_algos: Vec<HashAlgo>,
    /// Upper bound on token bytes copied per continue call.
    pub token_chunk_size: usize,
    pub platform_claims_len: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        let monitor = MonitorConfig::default();
        let features = monitor.features;
        Self {
            dram_base: monitor.memory.dram.base,
            dram_size: monitor.memory.dram.size,
            pa_width: monitor.memory.pa_width,
            device: monitor.memory.device,
            max_ipa_width: features.max_ipa_width,
            max_aux_planes: features.max_aux_planes,
            planes: features.planes,
            rtt_tree_per_plane: features.rtt_tree_per_plane,
            rtt_tree_single: features.rtt_tree_single,
            rec_aux_count: features.rec_aux_count,
            hash_algos: features.hash_algos,
            token_chunk_size: monitor.token_chunk_size,
            platform_claims_len: monitor.platform_claims_len,
        }
    }
}

impl PlatformConfig {
    pub fn features(&self) -> PlatformFeatures {
        PlatformFeatures {
            max_ipa_width: self.max_ipa_width,
            max_aux_planes: self.max_aux_planes,
            planes: self.planes,
            rtt_tree_per_plane: self.rtt_tree_per_plane,
            rtt_tree_single: self.rtt_tree_single,
            rec_aux_count: self.rec_aux_count,
            hash_algos: self.hash_algos.clone(),
        }
    }

    pub fn memory_map(&self) -> MemoryMap {
        MemoryMap {
            dram: MemRegion {
                base: self.dram_base,
                size: self.dram_size,
            },
            device: self.device.clone(),
            pa_width: self.pa_width,
        }
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let aligned = |v: u64| v % GRANULE_SIZE == 0;
        if self.dram_size == 0 || !aligned(self.dram_base) || !aligned(self.dram_size) {
            errors.push(format!(
                "DRAM window {:#x}+{:#x} must be non-empty and granule aligned",
                self.dram_base, self.dram_size
            ));
        }
        if self.pa_width == 0 || self.pa_width > 52 {
            errors.push(format!("pa_width {} outside 1..=52", self.pa_width));
        } else if self.dram_base.saturating_add(self.dram_size) > 1u64 << self.pa_width {
            errors.push(format!("DRAM window exceeds the {}-bit PA space", self.pa_width));
        }
        let dram = self.memory_map().dram;
        for region in &self.device {
            if !aligned(region.base) || !aligned(region.size) {
                errors.push(format!("device region {:#x} is not granule aligned", region.base));
            }
            if region.base < dram.end() && dram.base < region.end() {
                errors.push(format!("device region {:#x} overlaps DRAM", region.base));
            }
        }
        if !(32..=52).contains(&self.max_ipa_width) {
            errors.push(format!("max_ipa_width {} outside 32..=52", self.max_ipa_width));
        }
        if self.max_aux_planes > 3 {
            errors.push(format!("max_aux_planes {} exceeds 3", self.max_aux_planes));
        }
        if self.planes && !self.rtt_tree_per_plane && !self.rtt_tree_single {
            errors.push("planes need per-plane or single-tree translation".to_string());
        }
        if self.hash_algos.is_empty() {
            errors.push("at least one hash algorithm must be supported".to_string());
        }
        if self.token_chunk_size == 0 || self.token_chunk_size as u64 > GRANULE_SIZE {
            errors.push(format!(
                "token_chunk_size {} outside 1..={GRANULE_SIZE}",
                self.token_chunk_size
            ));
        }
        errors
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealmDefaults {
    pub s2sz: u8,
    pub start_level: u8,
    pub num_start_rtts: usize,
    pub hash_algo: HashAlgo,
}

impl Default for RealmDefaults {
    fn default() -> Self {
        let params = RealmParams::default();
        Self {
            s2sz: params.s2sz,
            start_level: params.start_level,
            num_start_rtts: params.num_start_rtts,
            hash_algo: params.hash_algo,
        }
    }
}

impl RealmDefaults {
    pub fn params(&self) -> RealmParams {
        RealmParams {
            s2sz: self.s2sz,
            start_level: self.start_level,
            num_start_rtts: self.num_start_rtts,
            hash_algo: self.hash_algo,
            ..RealmParams::default()
        }
    }
}

/// Ordering and reporting choices the monitor and the expectations share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksConfig {
    pub range_precedence: Vec<RangeCheck>,
    pub top_policy: TopPolicy,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            range_precedence: RangeCheck::default_precedence(),
            top_policy: TopPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Platform: {0}")]
    Platform(String),
    #[error("Realm defaults: {0}")]
    Realm(String),
    #[error("Checks: {0}")]
    Checks(String),
    #[error("Logging: {0}")]
    Logging(String),
}

impl ModelConfig {
    /// Validate the entire configuration, reporting every problem found.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors: Vec<ValidationError> = self
            .platform
            .validate()
            .into_iter()
            .map(ValidationError::Platform)
            .collect();

        if let Err(e) = self.realm.params().validate(&self.platform.features()) {
            errors.push(ValidationError::Realm(e.to_string()));
        }

        let mut seen = HashSet::new();
        for check in &self.checks.range_precedence {
            if !seen.insert(check) {
                errors.push(ValidationError::Checks(format!(
                    "{check:?} listed more than once in range_precedence"
                )));
            }
        }

        if let Err(e) = self.logging.validate() {
            errors.push(ValidationError::Logging(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Tunables for a reference monitor built from this configuration.
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            memory: self.platform.memory_map(),
            features: self.platform.features(),
            top_policy: self.checks.top_policy,
            range_precedence: self.checks.range_precedence.clone(),
            token_chunk_size: self.platform.token_chunk_size,
            platform_claims_len: self.platform.platform_claims_len,
        }
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Builds a `ModelConfig` from the configured sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load with the global file from the user config directory.
    pub fn load(workspace_root: &Path) -> Result<ModelConfig, ConfigError> {
        Self::load_with_global(workspace_root, global_config_path().as_deref())
    }

    /// Load with an explicit global file (or none).
    pub fn load_with_global(workspace_root: &Path, global: Option<&Path>) -> Result<ModelConfig, ConfigError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder, global)?;
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        builder
            .add_source(environment())
            .build()?
            .try_deserialize()
    }

    /// Load defaults overlaid with one file, ignoring every other source.
    pub fn load_from_file(path: &Path) -> Result<ModelConfig, ConfigError> {
        merge::merge_policy::builder_with_defaults()?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("checks.range_precedence")
        .with_list_parse_key("platform.hash_algos")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid_and_matches_monitor() {
        let config = ModelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.monitor_config(), MonitorConfig::default());
        assert_eq!(config.realm.params(), RealmParams::default());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.toml");
        std::fs::write(
            &path,
            r#"
[platform]
planes = false
token_chunk_size = 512

[checks]
top_policy = "skip_non_live"
range_precedence = ["pending_request", "rec_owner", "invalid_size"]
"#,
        )
        .unwrap();

        let config = ConfigLoader::load_from_file(&path).unwrap();
        assert!(!config.platform.planes);
        assert_eq!(config.platform.token_chunk_size, 512);
        assert_eq!(config.platform.max_ipa_width, 48);
        assert_eq!(config.checks.top_policy, TopPolicy::SkipNonLive);
        assert_eq!(config.checks.range_precedence[0], RangeCheck::PendingRequest);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_workspace_file_overrides_global_file() {
        let global_dir = TempDir::new().unwrap();
        let global = global_dir.path().join("config.toml");
        std::fs::write(&global, "[platform]\nrec_aux_count = 4\nmax_aux_planes = 1\n").unwrap();

        let workspace = TempDir::new().unwrap();
        std::fs::write(
            workspace.path().join("realm-model.toml"),
            "[platform]\nmax_aux_planes = 2\n",
        )
        .unwrap();

        let config = ConfigLoader::load_with_global(workspace.path(), Some(&global)).unwrap();
        assert_eq!(config.platform.rec_aux_count, 4);
        assert_eq!(config.platform.max_aux_planes, 2);
    }

    #[test]
    fn test_missing_files_yield_defaults() {
        let workspace = TempDir::new().unwrap();
        let missing = workspace.path().join("absent.toml");
        let config = ConfigLoader::load_with_global(workspace.path(), Some(&missing)).unwrap();
        assert_eq!(config.platform, PlatformConfig::default());
        assert_eq!(config.checks, ChecksConfig::default());
    }

    #[test]
    fn test_validate_collects_every_error() {
        let mut config = ModelConfig::default();
        config.platform.dram_size = 0x1234;
        config.platform.token_chunk_size = 0;
        config.realm.s2sz = 60;
        config.checks.range_precedence = vec![RangeCheck::RecOwner, RangeCheck::RecOwner];
        config.logging.format = "xml".into();

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().filter(|e| matches!(e, ValidationError::Platform(_))).count() >= 2);
        assert!(errors.iter().any(|e| matches!(e, ValidationError::Realm(_))));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::Checks(_))));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::Logging(_))));
    }

    #[test]
    fn test_device_region_overlapping_dram_is_rejected() {
        let mut config = ModelConfig::default();
        config.platform.device.push(MemRegion {
            base: config.platform.dram_base,
            size: GRANULE_SIZE,
        });
        let errors = config.validate().unwrap_err();
        assert!(errors[0].to_string().contains("overlaps DRAM"));
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = ModelConfig::default();
        let text = config.to_toml().unwrap();
        let parsed: ModelConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
