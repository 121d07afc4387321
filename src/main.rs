//! llmpool - load-balancing reverse proxy for OpenAI-compatible APIs
//!
//! Spreads requests across a pool of upstream providers, skipping endpoints
//! that are over quota or failing, and keeps a running token ledger.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llmpool::config::Config;
use llmpool::proxy::run_server;

#[derive(Parser)]
#[command(name = "llmpool")]
#[command(about = "Load-balancing reverse proxy for OpenAI-compatible APIs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },

    /// Show configured endpoints, their models and limits
    Endpoints {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn init_tracing(default_level: &str) {
    let fallback = format!("llmpool={},tower_http=info", default_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load(path: &Path) -> anyhow::Result<Config> {
    Config::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn format_limit(limit: i64) -> String {
    if limit < 0 {
        "unlimited".to_string()
    } else {
        limit.to_string()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => {
            let mut loaded = match load(&config) {
                Ok(loaded) => loaded,
                Err(e) => {
                    init_tracing("info");
                    return Err(e);
                }
            };
            init_tracing(&loaded.logging.level);
            tracing::info!(config = %config.display(), "Loaded configuration");

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                loaded.server.listen = addr;
            }

            run_server(loaded, Some(config)).await
        }

        Commands::Check { config } => {
            init_tracing("warn");
            let loaded = load(&config)?;
            let usable = loaded
                .apis
                .iter()
                .filter(|api| api.is_structurally_valid())
                .count();
            println!("Configuration OK: {}", config.display());
            println!("  listen:       {}", loaded.server.listen);
            println!(
                "  endpoints:    {} ({} usable, {} enabled)",
                loaded.apis.len(),
                usable,
                loaded.apis.iter().filter(|api| api.enabled).count()
            );
            println!("  max attempts: {}", loaded.dispatch.max_attempts);
            println!("  ledger:       {}", loaded.ledger.path);
            Ok(())
        }

        Commands::Endpoints { config } => {
            init_tracing("warn");
            let loaded = load(&config)?;
            for api in &loaded.apis {
                println!(
                    "{} ({}){}",
                    api.id,
                    api.name,
                    if api.enabled { "" } else { " [disabled]" }
                );
                println!("  url:    {}", api.base_url);
                println!(
                    "  limits: {} rpm, {} rpd",
                    format_limit(api.rpm),
                    format_limit(api.rpd)
                );
                if !api.models.is_empty() {
                    println!("  models: {}", api.models.join(", "));
                }
                let mut mappings: Vec<_> = api.model_mapping.iter().collect();
                mappings.sort();
                for (from, to) in mappings {
                    println!("  map:    {} -> {}", from, to);
                }
                if !api.is_structurally_valid() {
                    println!("  WARNING: incomplete entry, never selected");
                }
            }
            Ok(())
        }
    }
}
