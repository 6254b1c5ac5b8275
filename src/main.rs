// ABOUTME: Main entry point for kernelpool
//
// Binary: kernelpool
// Usage: kernelpool [--config PATH] [COMMAND]
// - No command / serve: run the kernel pool behind the TCP front end
// - config: print the effective configuration

#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use kernelpool::auto_exit::AutoExit;
use kernelpool::cli::{Cli, Commands};
use kernelpool::pool::{IdleSweeper, KernelPool};
use kernelpool::runtime::ProcessKernelFactory;
use kernelpool::server::KernelServer;
use kernelpool::service::KernelService;
use kernelpool::PoolConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let config = args.load_config()?;

    match args.command {
        Some(Commands::Config) => {
            let text = toml::to_string_pretty(&config).context("Failed to render config")?;
            print!("{text}");
            Ok(())
        }
        Some(Commands::Serve(_)) | None => {
            setup_logging(&config)?;
            setup_panic_handler();
            serve(config).await
        }
    }
}

async fn serve(config: PoolConfig) -> Result<()> {
    let factory = Arc::new(ProcessKernelFactory::from_config(&config));
    info!(kinds = ?factory.kinds(), default_kind = %config.default_kind, "Kernel kinds configured");

    let pool = Arc::new(KernelPool::new(factory));

    let mut sweeper = IdleSweeper::from_config(&config);
    sweeper.start(Arc::clone(&pool));

    let auto_exit = Arc::new(AutoExit::from_config(&config));
    let service = Arc::new(KernelService::new(
        Arc::clone(&pool),
        Arc::clone(&auto_exit),
        &config.default_kind,
    ));

    let server = KernelServer::bind(&config.listen_addr, service).await?;

    let shutdown = async {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("Interrupt received, shutting down"),
                Err(e) => error!(error = %e, "Failed to listen for interrupt, shutting down"),
            },
            () = auto_exit.wait_for_idle() => {
                info!("Idle for too long, shutting down");
            }
        }
    };

    server.run(shutdown).await?;

    sweeper.stop().await;
    let stopped = pool.shutdown_all().await;
    info!(stopped = stopped, metrics = ?pool.metrics().snapshot(), "Kernel pool shut down");
    Ok(())
}

fn setup_logging(config: &PoolConfig) -> Result<()> {
    use tracing_subscriber::prelude::*;

    let log_dir = config.get_log_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    // JSONL log file with timestamp
    let log_file = log_dir.join(format!(
        "kernelpool-{}.jsonl",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .with_context(|| format!("Failed to create log file {}", log_file.display()))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_writer(file)
                .with_ansi(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kernelpool=info".into()),
        )
        .init();

    info!(log_file = %log_file.display(), "Logging initialized");
    Ok(())
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        error!("Application panicked: {}", panic_info);
        eprintln!("Application panicked: {panic_info}");
    }));
}
