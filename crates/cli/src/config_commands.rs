use {
    anyhow::Result,
    clap::{Subcommand, ValueEnum},
    scriptbox_config::{ScriptboxConfig, Severity, validate},
};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration.
    Show {
        #[arg(long, value_enum, default_value_t = Format::Toml)]
        format: Format,
    },
    /// Validate the configuration and report errors/warnings.
    Validate,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Format {
    Toml,
    Json,
}

pub fn handle_config(action: ConfigAction, config: &ScriptboxConfig) -> Result<()> {
    match action {
        ConfigAction::Show { format } => {
            println!("{}", render(config, format)?);
            Ok(())
        },
        ConfigAction::Validate => check(config),
    }
}

fn render(config: &ScriptboxConfig, format: Format) -> Result<String> {
    Ok(match format {
        Format::Toml => toml::to_string_pretty(config)?,
        Format::Json => serde_json::to_string_pretty(config)?,
    })
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check(config: &ScriptboxConfig) -> Result<()> {
    let result = validate(config);

    for d in &result.diagnostics {
        let (color, label) = match d.severity {
            Severity::Error => (RED, "error"),
            Severity::Warning => (YELLOW, "warning"),
        };
        eprintln!("  {BOLD}{color}{label}{RESET} {}: {}", d.path, d.message);
    }

    let count = |severity| {
        result
            .diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    };
    let errors = count(Severity::Error);
    let warnings = count(Severity::Warning);

    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("\n{errors} error(s), {warnings} warning(s)");
    }

    if result.has_errors() {
        anyhow::bail!("configuration is invalid");
    }
    Ok(())
}
