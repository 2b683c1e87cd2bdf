use clap::{Parser, Subcommand};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use meshbot::application::errors::BotError;
use meshbot::domain::traits::{ConnectorFactory, DocumentStore};
use meshbot::infrastructure::adapters::ConsoleConnectorFactory;
use meshbot::infrastructure::config::Config;
use meshbot::infrastructure::storage::JsonFileStore;
use meshbot::plugins::PluginCatalog;
use meshbot::runtime::{ShutdownReason, Supervisor};

#[derive(Parser)]
#[command(name = "meshbot")]
#[command(about = "A multi-account chat bot host", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every configured account
    Run,
    /// Show version
    Version,
    /// Generate default config
    InitConfig,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    match cli.command {
        Commands::Run => {
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!("Failed to start runtime: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            match rt.block_on(run(&cli.config)) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!("{}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Version => {
            println!("meshbot v{}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        Commands::InitConfig => match Config::default().to_yaml() {
            Ok(yaml) => {
                println!("{}", yaml);
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!("{}", e);
                ExitCode::FAILURE
            }
        },
    }
}

fn load_config(path: &str) -> Result<Config, BotError> {
    if Path::new(path).exists() {
        Ok(Config::load(path)?)
    } else {
        tracing::warn!("Config file {} not found, using defaults", path);
        Ok(Config::load_env())
    }
}

/// Boots a supervisor, and boots a fresh one from re-read config on restart
async fn run(config_path: &str) -> Result<(), BotError> {
    loop {
        let config = Arc::new(load_config(config_path)?);
        let catalog = Arc::new(PluginCatalog::builtin(&config)?);
        let store: Arc<dyn DocumentStore> = Arc::new(JsonFileStore::new(&config.data_dir));
        let factory: Arc<dyn ConnectorFactory> = Arc::new(ConsoleConnectorFactory);

        tracing::info!(
            accounts = config.accounts.len(),
            plugins = config.plugins.mounted.len(),
            "Starting meshbot"
        );
        let (handle, mut supervisor) = Supervisor::start(config, catalog, factory, store).await?;

        let finished = tokio::select! {
            reason = &mut supervisor => Some(reason),
            _ = tokio::signal::ctrl_c() => None,
        };
        let reason = match finished {
            Some(reason) => reason,
            None => {
                tracing::info!("Interrupted, shutting down");
                handle.shutdown(ShutdownReason::Shutdown)?;
                supervisor.await
            }
        }
        .map_err(|e| BotError::Internal(e.to_string()))?;

        match reason {
            ShutdownReason::Shutdown => return Ok(()),
            ShutdownReason::Restart => tracing::info!("Restarting with reloaded configuration"),
        }
    }
}
