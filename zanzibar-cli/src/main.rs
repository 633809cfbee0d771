//! Zanzibar operations CLI
//!
//! Loads an authorization model and a settings file, opens the configured tuple storage
//! and runs a single command against it.
//!
//! Usage:
//!   zanzibar --model demos/documents.json --tuples demos/tuples.txt check doc:mydoc#viewer@user:myuser
//!   zanzibar --postgres-url postgresql://... migrate
//!   zanzibar --sqlite-url sqlite://zanzibar.db write doc:mydoc#viewer@user:myuser
//!
//! The memory backend lives for one invocation; seed it with `--tuples`.
//!
//! Exit status: 0 on success (`check`: allowed), 1 when `check` denies, 2 on any error,
//! including a check that could not be decided within its depth or time bound.

mod commands;
mod settings;

use anyhow::Context;
use clap::Parser;
use commands::Command;
use settings::{Backend, LoggingSettings, Settings};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "zanzibar")]
#[command(version, about = "Relationship-based authorization checks and tuple management")]
struct Cli {
    /// Settings file (TOML, YAML or JSON)
    #[arg(long, short, env = "ZANZIBAR_CONFIG", default_value = "zanzibar.toml")]
    config: PathBuf,

    /// Authorization model file, overrides model.path
    #[arg(long)]
    model: Option<PathBuf>,

    /// Traversal depth bound, overrides resolver.max_depth
    #[arg(long)]
    max_depth: Option<usize>,

    /// Use the PostgreSQL backend at this URL
    #[arg(long, conflicts_with = "sqlite_url")]
    postgres_url: Option<String>,

    /// Use the SQLite backend at this URL, e.g. sqlite://zanzibar.db
    #[arg(long)]
    sqlite_url: Option<String>,

    /// Seed the memory backend from this file, one tuple per line
    #[arg(long)]
    tuples: Option<PathBuf>,

    /// Debug logging
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(model) = &self.model {
            settings.model.path.clone_from(model);
        }
        if let Some(max_depth) = self.max_depth {
            settings.resolver.max_depth = max_depth;
        }
        if let Some(url) = &self.postgres_url {
            settings.storage.backend = Backend::Postgres;
            settings.storage.postgres_url = Some(url.clone());
        }
        if let Some(url) = &self.sqlite_url {
            settings.storage.backend = Backend::Sqlite;
            settings.storage.sqlite_url = Some(url.clone());
        }
        if let Some(tuples) = &self.tuples {
            settings.storage.tuples = Some(tuples.clone());
        }
    }
}

fn init_tracing(logging: &LoggingSettings, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("zanzibar={level},zanzibar_engine={level},sqlx=warn"))
    });

    // Logs go to stderr; stdout carries command output.
    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.json {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false).json())
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    commands::exit_status(run(cli).await)
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut settings = Settings::load(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;
    cli.apply_overrides(&mut settings);
    init_tracing(&settings.logging, cli.verbose);

    commands::run(cli.command, &settings).await
}
