// ABOUTME: CLI argument parsing for kernelpool
//
// Provides command-line interface for:
// - Serving the kernel pool over TCP (serve, default)
// - Printing the effective configuration (config)

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::PoolConfig;

/// Pool of long-lived interpreter kernels keyed by session id
#[derive(Debug, Parser)]
#[command(name = "kernelpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file to load instead of the default locations
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available CLI commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Serve the kernel pool (default if no command given)
    Serve(ServeArgs),

    /// Print the effective configuration as TOML
    Config,
}

/// Arguments for the serve command
#[derive(Debug, Default, clap::Args)]
pub struct ServeArgs {
    /// Address to listen on, overriding the configured one
    #[arg(long)]
    pub listen: Option<String>,
}

impl Cli {
    /// Load configuration and apply command-line overrides
    pub fn load_config(&self) -> anyhow::Result<PoolConfig> {
        let mut config = PoolConfig::load(self.config.as_deref())?;
        if let Some(Commands::Serve(ServeArgs {
            listen: Some(listen),
        })) = &self.command
        {
            config.listen_addr.clone_from(listen);
        }
        Ok(config)
    }
}
