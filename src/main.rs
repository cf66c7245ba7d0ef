use anyhow::Result;
use backup_core::application::command_handlers::write_sample_config;
use backup_core::application::*;
use backup_core::config::LogFormat;
use backup_core::monitoring::HealthStatus;
use backup_core::Config;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "backup-core")]
#[command(about = "Backup and restore orchestration engine")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "BACKUP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API with the scheduler and background services
    Serve,
    /// Run one manual backup of a policy and wait for it
    Backup {
        #[arg(long)]
        policy: String,
    },
    /// Apply retention to a policy
    Retention {
        #[arg(long)]
        policy: String,
        /// Print the plan without deleting or archiving anything
        #[arg(long)]
        dry_run: bool,
    },
    /// List storage providers
    Providers {
        /// Test every registered provider first
        #[arg(long)]
        test: bool,
    },
    /// Verify a sample of stored backups end to end
    Verify,
    /// Check system health
    Health,
    /// Write a sample configuration file
    InitConfig {
        #[arg(long, default_value = "backup.toml")]
        output: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::InitConfig { output, force }) = &cli.command {
        init_tracing("info", LogFormat::Text);
        return write_sample_config(output, *force);
    }

    let config = Config::load(cli.config.as_deref())?;
    init_tracing(&config.server.log_level, config.server.log_format);

    let app = Application::new(config).await?;
    app.initialize().await?;

    let container = app.container.clone();
    match cli.command {
        Some(Commands::Serve) | None => {
            let handler = ServerCommandHandler::new(container, app.lifecycle.clone());
            handler.serve().await
        }
        Some(Commands::Backup { policy }) => {
            let handler = BackupCommandHandler::new(container);
            handler.run_backup(&policy).await
        }
        Some(Commands::Retention { policy, dry_run }) => {
            let handler = RetentionCommandHandler::new(container);
            handler.run(&policy, dry_run).await
        }
        Some(Commands::Providers { test }) => {
            let handler = ProviderCommandHandler::new(container);
            handler.list(test).await
        }
        Some(Commands::Verify) => {
            let handler = VerifyCommandHandler::new(container);
            handler.run().await
        }
        Some(Commands::Health) => run_health_check(&app).await,
        Some(Commands::InitConfig { .. }) => Ok(()),
    }
}

async fn run_health_check(app: &Application) -> Result<()> {
    let health = app.container.health_checker.check_system_health().await?;
    info!("System health: {:?}", health.status);

    for (component, component_health) in &health.components {
        match component_health.status {
            HealthStatus::Healthy => info!("{}: healthy", component),
            HealthStatus::Degraded => {
                warn!("{}: degraded - {:?}", component, component_health.message)
            }
            HealthStatus::Unhealthy => {
                error!("{}: unhealthy - {:?}", component, component_health.message)
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&health)?);
    match health.status {
        HealthStatus::Unhealthy => Err(anyhow::anyhow!("System is unhealthy")),
        _ => Ok(()),
    }
}
