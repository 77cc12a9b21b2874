//! Merge rules: defaults first, later sources override earlier ones key by key.

use crate::config::ModelConfig;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError};

/// Create a Config builder seeded with the scalar defaults of `ModelConfig`.
///
/// List-valued keys (`platform.device`, `platform.hash_algos`,
/// `checks.range_precedence`) are left to the serde defaults so that a file
/// naming a shorter list replaces the default outright.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let d = ModelConfig::default();
    let p = &d.platform;
    Config::builder()
        .set_default("platform.dram_base", p.dram_base)?
        .set_default("platform.dram_size", p.dram_size)?
        .set_default("platform.pa_width", p.pa_width as u64)?
        .set_default("platform.max_ipa_width", p.max_ipa_width as u64)?
        .set_default("platform.max_aux_planes", p.max_aux_planes as u64)?
        .set_default("platform.planes", p.planes)?
        .set_default("platform.rtt_tree_per_plane", p.rtt_tree_per_plane)?
        .set_default("platform.rtt_tree_single", p.rtt_tree_single)?
        .set_default("platform.rec_aux_count", p.rec_aux_count as u64)?
        .set_default("platform.token_chunk_size", p.token_chunk_size as u64)?
        .set_default("platform.platform_claims_len", p.platform_claims_len as u64)?
        .set_default("realm.s2sz", d.realm.s2sz as u64)?
        .set_default("realm.start_level", d.realm.start_level as u64)?
        .set_default("realm.num_start_rtts", d.realm.num_start_rtts as u64)?
        .set_default("logging.level", d.logging.level.as_str())?
        .set_default("logging.format", d.logging.format.as_str())?
        .set_default("logging.output", d.logging.output.as_str())
}
