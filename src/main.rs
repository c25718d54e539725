// ============================================================================
// COMMAND LINE INTERFACE
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use nginx_telemetry::aggregate::{finalize, Collections};
use nginx_telemetry::logging::init_logging;
use nginx_telemetry::{sink_from_config, Agent, AgentConfig, ConfigManager, AGENT_NAME, VERSION};

/// NGINX telemetry agent CLI
#[derive(Parser, Debug)]
#[command(
    name = "nginx-telemetry",
    version,
    about = "Collects, deltas and aggregates NGINX, container and host metrics"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "nginx-telemetry.toml", env = "NGX_TELEMETRY_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "NGX_TELEMETRY_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the agent (default)
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run one collection tick and print the report as JSON
    Once,

    /// Show version information
    Version,
}

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());
    let config = AgentConfig::load(config_path)
        .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;
    println!("Configuration is valid");

    if verbose {
        println!("{}", toml::to_string_pretty(&config)?);
    }

    println!("  collection interval: {}", humantime::format_duration(config.agent.collection_interval));
    println!("  report interval:     {}", humantime::format_duration(config.agent.report_interval));
    println!("  mode:                {:?}", config.agent.mode);
    println!("  system metrics:      {}", config.system.enabled);
    println!("  container metrics:   {}", config.container.enabled);
    for instance in config.collector_configs() {
        let method = if instance.is_plus() {
            "plus api"
        } else if !instance.stub_status.is_empty() {
            "stub status"
        } else {
            "none"
        };
        println!(
            "  nginx {}: {} ({} access logs, {} error logs)",
            instance.nginx_id,
            method,
            instance.access_logs.len(),
            instance.error_logs.len()
        );
    }
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config_str = AgentConfig::generate_default_config();
    match output {
        Some(path) => {
            fs::write(path, &config_str).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }
    Ok(())
}

fn handle_version() {
    println!("{} v{}", AGENT_NAME, VERSION);
    println!("  target: {}-{}", std::env::consts::ARCH, std::env::consts::OS);
}

fn load_manager(path: &Path) -> AnyhowResult<ConfigManager> {
    if path.exists() {
        ConfigManager::from_file(path).with_context(|| format!("Failed to load config from {}", path.display()))
    } else {
        eprintln!("Config file not found at {}, using defaults", path.display());
        Ok(ConfigManager::new(AgentConfig::default()))
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Unable to install SIGTERM handler"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Unable to listen for Ctrl-C");
    }
}

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => return handle_generate_config(output.as_deref()),
        Some(Commands::Validate { verbose }) => return handle_validate(&cli.config, *verbose),
        _ => {}
    }

    let manager = Arc::new(load_manager(&cli.config)?);
    let config = manager.get();

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    init_logging(&logging_config)?;

    let sink = sink_from_config(&config.export)?;
    let agent = Arc::new(Agent::new(Arc::clone(&manager), sink));

    match cli.command {
        Some(Commands::Once) => {
            let report = agent.collect_once().await;
            let mut window = Collections::new();
            window.accumulate(&report);
            let finalized = finalize(&window, config.aggregation.unknown_metric_policy);
            println!("{}", serde_json::to_string_pretty(&finalized)?);
            agent.shutdown();
        }
        _ => {
            info!("{} v{}", AGENT_NAME, VERSION);
            let signal_agent = Arc::clone(&agent);
            tokio::spawn(async move {
                wait_for_signal().await;
                signal_agent.shutdown();
            });
            agent.run().await?;
        }
    }

    Ok(())
}
