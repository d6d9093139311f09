use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{
    env_subst::substitute_env,
    schema::{LateHookPolicy, ScriptboxConfig},
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "scriptbox.toml",
    "scriptbox.yaml",
    "scriptbox.yml",
    "scriptbox.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<ScriptboxConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    let mut config = parse_config(&raw, path)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./scriptbox.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/scriptbox/scriptbox.{toml,yaml,yml,json}` (user-global)
///
/// Returns `ScriptboxConfig::default()` (with env overrides) if no config file
/// is found or the file fails to parse.
pub fn discover_and_load() -> ScriptboxConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    let mut config = ScriptboxConfig::default();
    apply_env_overrides(&mut config);
    config
}

fn find_config_file() -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .or_else(|| {
            let dir = config_dir()?;
            CONFIG_FILENAMES
                .iter()
                .map(|name| dir.join(name))
                .find(|p| p.exists())
        })
}

/// Returns the user-global config directory (`~/.config/scriptbox/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "scriptbox").map(|d| d.config_dir().to_path_buf())
}

/// Apply `SCRIPTBOX_*` environment overrides on top of a loaded config.
pub fn apply_env_overrides(config: &mut ScriptboxConfig) {
    apply_env_overrides_with(config, |name| std::env::var(name).ok());
}

fn apply_env_overrides_with(config: &mut ScriptboxConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(id) = lookup("SCRIPTBOX_SANDBOX_ID").filter(|v| !v.is_empty()) {
        config.sandbox.id = Some(id);
    }
    if let Some(raw) = lookup("SCRIPTBOX_LATE_HOOK_POLICY") {
        match raw.parse::<LateHookPolicy>() {
            Ok(policy) => config.sandbox.late_hook_policy = policy,
            Err(e) => warn!(error = %e, "ignoring SCRIPTBOX_LATE_HOOK_POLICY"),
        }
    }
    if let Some(raw) = lookup("SCRIPTBOX_MAX_OPEN_COMMANDS") {
        match raw.parse::<usize>() {
            Ok(limit) => config.sandbox.max_open_commands = limit,
            Err(e) => warn!(error = %e, value = %raw, "ignoring SCRIPTBOX_MAX_OPEN_COMMANDS"),
        }
    }
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<ScriptboxConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
