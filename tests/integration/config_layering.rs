//! Configuration sources and their precedence.

use super::test_utils::write_file;
use realm_model::cli::RunContext;
use realm_model::config::{ConfigLoader, ModelConfig};
use realm_model::monitor::RangeCheck;
use realm_model::rtt::TopPolicy;
use tempfile::TempDir;

#[test]
fn test_empty_workspace_yields_defaults() {
    let workspace = TempDir::new().unwrap();
    let config = ConfigLoader::load_with_global(workspace.path(), None).unwrap();
    assert_eq!(config, ModelConfig::default());
}

#[test]
fn test_workspace_file_overrides_global_file() {
    let workspace = TempDir::new().unwrap();
    let global_dir = TempDir::new().unwrap();
    write_file(
        global_dir.path(),
        "config.toml",
        "[platform]\ntoken_chunk_size = 512\nplatform_claims_len = 100\n",
    );
    write_file(workspace.path(), "realm-model.toml", "[platform]\ntoken_chunk_size = 2048\n");

    let config =
        ConfigLoader::load_with_global(workspace.path(), Some(&global_dir.path().join("config.toml"))).unwrap();
    assert_eq!(config.platform.token_chunk_size, 2048);
    // Keys the workspace file leaves alone keep the global value.
    assert_eq!(config.platform.platform_claims_len, 100);
}

#[test]
fn test_missing_global_file_is_ignored() {
    let workspace = TempDir::new().unwrap();
    let missing = workspace.path().join("nowhere").join("config.toml");
    let config = ConfigLoader::load_with_global(workspace.path(), Some(&missing)).unwrap();
    assert_eq!(config, ModelConfig::default());
}

#[test]
fn test_checks_section_reaches_monitor_config() {
    let workspace = TempDir::new().unwrap();
    write_file(
        workspace.path(),
        "realm-model.toml",
        r#"
[checks]
top_policy = "skip_non_live"
range_precedence = ["pending_request", "rec_owner", "invalid_size"]
"#,
    );
    let config = ConfigLoader::load_with_global(workspace.path(), None).unwrap();
    assert!(config.validate().is_ok());
    let monitor = config.monitor_config();
    assert_eq!(monitor.top_policy, TopPolicy::SkipNonLive);
    assert_eq!(
        monitor.range_precedence,
        vec![
            RangeCheck::PendingRequest,
            RangeCheck::RecOwner,
            RangeCheck::InvalidSize
        ]
    );
}

#[test]
fn test_run_context_rejects_invalid_workspace_config() {
    let workspace = TempDir::new().unwrap();
    write_file(workspace.path(), "realm-model.toml", "[platform]\npa_width = 8\n");
    let err = RunContext::new(workspace.path(), None).unwrap_err();
    assert!(err.to_string().contains("validation failed"), "{err}");
}

#[test]
fn test_explicit_config_file_skips_workspace_files() {
    let workspace = TempDir::new().unwrap();
    write_file(workspace.path(), "realm-model.toml", "[platform]\ntoken_chunk_size = 0\n");
    write_file(workspace.path(), "alt.toml", "[platform]\ntoken_chunk_size = 256\n");
    let path = workspace.path().join("alt.toml");
    let ctx = RunContext::new(workspace.path(), Some(&path)).unwrap();
    assert_eq!(ctx.config().platform.token_chunk_size, 256);
}
