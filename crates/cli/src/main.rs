mod config_commands;
mod run_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::{debug, info},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "scriptbox", about = "Scriptbox, a host for sandboxed scripts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file to use instead of the discovered one.
    #[arg(long, global = true, env = "SCRIPTBOX_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a script and dispatch JSON-lines commands to it.
    Run {
        /// Script to load.
        script: PathBuf,
        /// File with one JSON command per line, or `-` for stdin.
        #[arg(long)]
        commands: Option<String>,
    },
    /// Load a script and report the hooks it installs.
    Check {
        /// Script to load.
        script: PathBuf,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr; stdout carries command outcomes.
    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// The explicit `--config` file, or whatever discovery finds.
fn load_config(path: Option<&PathBuf>) -> anyhow::Result<scriptbox_config::ScriptboxConfig> {
    match path {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            scriptbox_config::load_config(path)
        },
        None => Ok(scriptbox_config::discover_and_load()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "scriptbox starting");

    let config = load_config(cli.config.as_ref())?;
    match cli.command {
        Commands::Run { script, commands } => {
            let mut stdout = std::io::stdout();
            run_commands::run(&config, &script, commands.as_deref(), &mut stdout).await
        },
        Commands::Check { script } => run_commands::check(&config, &script).await,
        Commands::Config { action } => config_commands::handle_config(action, &config),
    }
}
