use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use skiff_core::{Config, EngineBackend, ImageBuilder};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod commands;
mod output;

#[derive(Parser)]
#[command(name = "skiff")]
#[command(about = "Build, tag and push container images", long_about = None)]
struct Cli {
    /// Engine endpoint (overrides config and DOCKER_HOST)
    #[arg(long, global = true)]
    engine: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image and tag it by content digest
    Build(commands::build::BuildArgs),

    /// Push a tagged image
    Push {
        /// Image reference (e.g., "localhost:5000/app:skiff-0123456789abcdef")
        reference: String,
    },

    /// Check whether an image exists in the engine
    Exists {
        /// Image reference
        reference: String,
    },

    /// Print the digest-tagged reference of an existing image
    DeployRef {
        /// Image reference
        reference: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = Config::load().context("Failed to load config")?;
    if let Some(engine) = cli.engine {
        config.engine_host = engine;
    }

    skiff_core::init_observability(&config.log_level, config.metrics_port)
        .map_err(|e| anyhow::anyhow!("Failed to initialize observability: {}", e))?;

    // Ctrl-C cancels whatever is running
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let backend = EngineBackend::from_config(&config).context("Failed to create engine client")?;
    let builder =
        ImageBuilder::new(Arc::new(backend)).with_extra_labels(config.extra_labels.clone());

    match cli.command {
        Commands::Build(args) => {
            commands::build(&builder, args, &cancel).await?;
        }

        Commands::Push { reference } => {
            commands::push(&builder, &reference, &cancel).await?;
        }

        Commands::Exists { reference } => {
            if !commands::exists(&builder, &reference).await? {
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::DeployRef { reference } => {
            commands::deploy_ref(&builder, &reference).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
