use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use foreman_core::agent::loader::{self, DescriptorFormat};
use foreman_core::assistant::AssistantClient;
use foreman_core::config::Settings;
use foreman_core::{Foreman, runtime};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Foreman - run assistant-backed agents in response to events
#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: layered `config/` lookup)
    #[arg(short, long, global = true, env = "FOREMAN_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine and run until Ctrl-C
    Run,

    /// Validate and list agent descriptors
    Agents {
        /// Descriptor directory (default: `agents.directory` from config)
        dir: Option<PathBuf>,
    },

    /// Check that the assistant program is installed and authenticated
    Check,
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run(cli.config.as_deref()).await,
        Commands::Agents { dir } => {
            let settings = load_settings(cli.config.as_deref())?;
            let dir = dir
                .or(settings.agents.directory)
                .context("no agent directory given and `agents.directory` is not configured")?;
            list_agents(&dir)
        }
        Commands::Check => {
            let settings = load_settings(cli.config.as_deref())?;
            let status = AssistantClient::new(settings.assistant).check().await?;
            println!("assistant {} (authenticated: {})", status.version, status.authenticated);
            Ok(())
        }
    }
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let settings = match path {
        Some(path) => Settings::from_file(path),
        None => Settings::new(),
    };
    settings.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e.into()
    })
}

async fn run(config: Option<&Path>) -> anyhow::Result<()> {
    info!("Starting Foreman");

    let owned;
    let foreman: &Foreman = match config {
        Some(path) => {
            owned = Foreman::from_settings(load_settings(Some(path))?).await?;
            &owned
        }
        None => runtime::global().await?,
    };

    info!(
        "{} agent(s) registered",
        foreman.registry().list_agents().await.len()
    );

    foreman.start().await?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!("Shutting down");
    foreman.shutdown().await;
    Ok(())
}

fn list_agents(dir: &Path) -> anyhow::Result<()> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| DescriptorFormat::from_path(path).is_some())
        .collect();
    paths.sort();

    let mut invalid = 0;
    for path in &paths {
        match loader::load_agent_file(path) {
            Ok(def) => {
                let triggers: Vec<_> = def
                    .triggers
                    .iter()
                    .map(|t| format!("{} -> {}", t.event, t.action))
                    .collect();
                println!(
                    "{:<24} {:<8} max_turns={:<3} {}",
                    def.id,
                    def.trust_level.as_str(),
                    def.max_turns,
                    triggers.join(", ")
                );
            }
            Err(e) => {
                invalid += 1;
                println!("{}: {}", path.display(), e);
            }
        }
    }

    println!(
        "{} descriptor(s), {} invalid",
        paths.len(),
        invalid
    );
    if invalid > 0 {
        anyhow::bail!("{} invalid descriptor(s)", invalid);
    }
    Ok(())
}
