//! Workspace config sources: `realm-model.toml` and `config/{env}.toml`.

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, File};
use std::path::Path;
use tracing::debug;

/// Selects `config/{env}.toml`; defaults to `development`.
pub const ENV_VAR: &str = "REALM_MODEL_ENV";

/// Add workspace config files to builder.
/// Precedence: realm-model.toml (base) then config/{REALM_MODEL_ENV}.toml.
pub fn add_to_builder(
    mut builder: ConfigBuilder<DefaultState>,
    workspace_root: &Path,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let env_name = std::env::var(ENV_VAR).unwrap_or_else(|_| "development".to_string());
    let candidates = [
        workspace_root.join("realm-model.toml"),
        workspace_root.join("config").join(format!("{env_name}.toml")),
    ];
    for path in candidates.iter().filter(|p| p.exists()) {
        debug!(config_path = %path.display(), "loading workspace configuration");
        builder = builder.add_source(File::from(path.as_path()).required(false));
    }
    Ok(builder)
}
