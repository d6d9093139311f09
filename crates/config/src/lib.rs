//! Configuration loading, validation, and env substitution.
//!
//! Config files: `scriptbox.toml`, `scriptbox.yaml`, or `scriptbox.json`
//! Searched in `./` then `~/.config/scriptbox/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{apply_env_overrides, config_dir, discover_and_load, load_config},
    schema::{
        ApiConfig, ConfigResourceConfig, KvResourceConfig, LateHookPolicy, LimitsConfig,
        LogResourceConfig, MetricsResourceConfig, OutboundResourceConfig, ResourcesConfig, SandboxConfig,
        ScriptboxConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
