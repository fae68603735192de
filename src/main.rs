//! WolfBalance - Write-Replicating Load Balancer
//!
//! Command line front end: configuration helpers, backlog inspection and a
//! line-oriented shell that routes statements through the load balancer.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfbalance::backlog::BacklogStore;
use wolfbalance::config::BalancerConfig;
use wolfbalance::LoadBalancer;

/// WolfBalance - Write-Replicating Load Balancer
#[derive(Parser)]
#[command(name = "wolfbalance")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfbalance.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfbalance.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Show statements pending for each backend
    Backlog,

    /// Route statements read from stdin, one per line
    Exec {
        /// Statement broadcast to every backend before reading stdin
        #[arg(long)]
        init_query: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { output } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"));
            run_init(output)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"));
            run_validate(cli.config)
        }
        Commands::Backlog => {
            let config = load_config(&cli.config)?;
            init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level));
            run_backlog(config).await
        }
        Commands::Exec { init_query } => {
            let config = load_config(&cli.config)?;
            init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level));
            run_exec(config, init_query).await
        }
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: &Path) -> anyhow::Result<BalancerConfig> {
    BalancerConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {:?}", path))
}

/// Write a sample configuration file
fn run_init(output: PathBuf) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("Configuration file {:?} already exists", output);
    }

    let content = toml::to_string_pretty(&BalancerConfig::sample())
        .context("Failed to render sample configuration")?;
    std::fs::write(&output, content)
        .with_context(|| format!("Failed to write {:?}", output))?;

    println!("Created configuration file: {:?}", output);
    println!("Edit the [[backends]] entries, then run: wolfbalance validate");
    Ok(())
}

/// Validate a configuration file
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;

    println!("Configuration is valid");
    for (index, backend) in config.backends.iter().enumerate() {
        println!("  backend {}: {}", index, backend.display_target());
    }
    println!("  backlog: {:?} (flushed every {:?})", config.backlog.path, config.flush_interval());
    println!("  reconnect interval: {:?}", config.reconnect_interval());
    Ok(())
}

/// Print the persisted backlog
async fn run_backlog(config: BalancerConfig) -> anyhow::Result<()> {
    let path = &config.backlog.path;
    if !path.exists() {
        println!("No backlog file at {:?}", path);
        return Ok(());
    }

    // a snapshot that does not fit the configured backends is logged and shown empty
    let store = BacklogStore::open(path.clone(), config.backends.len()).await;
    let snapshot = store.snapshot().await;

    for (index, queue) in snapshot.queues.iter().enumerate() {
        println!(
            "backend {} ({}): {} pending",
            index,
            config.backends[index].display_target(),
            queue.len()
        );
        for statement in queue {
            match statement.parameters() {
                Some(params) if !params.is_empty() => {
                    let rendered: Vec<String> = params.iter().map(|p| p.to_string()).collect();
                    println!("  {} -- [{}]", statement.query, rendered.join(", "));
                }
                _ => println!("  {}", statement.query),
            }
        }
    }
    Ok(())
}

/// Route stdin statements through a load balancer
async fn run_exec(config: BalancerConfig, init_query: Option<String>) -> anyhow::Result<()> {
    let lb = LoadBalancer::new(&config)?;

    if let Some(query) = init_query {
        lb.send_initialization_query(&query)
            .await
            .context("Initialization query failed")?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let query = line.trim();
        if query.is_empty() {
            continue;
        }

        match lb.process(None, query).await {
            Ok(result) => {
                for row in &result.rows {
                    let cells: Vec<String> = row
                        .columns
                        .iter()
                        .map(|(name, value)| format!("{}={}", name, value))
                        .collect();
                    println!("{}", cells.join(" | "));
                }
                println!("OK ({} rows affected)", result.rows_affected);
            }
            Err(e) => println!("ERROR: {}", e),
        }
    }

    let stats = lb.stats().await;
    tracing::info!(
        "Session finished: active {:?}, inactive {:?}, backlog {:?}",
        stats.active_backends,
        stats.inactive_backends,
        stats.backlog_lengths
    );

    lb.shutdown().await?;
    Ok(())
}
