use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qpipe::plugin::PluginManifest;
use qpipe::{Runtime, RuntimeConfig};
use std::path::{Path, PathBuf};

/// Plugin-orchestrated query runtime
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve and set up the plugins declared in a manifest, printing their
    /// initialization order
    Resolve {
        /// Plugin manifest (TOML, one [[plugins]] table per plugin)
        manifest: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::load_default()?,
    };

    match cli.command {
        Command::Resolve { manifest } => resolve(config, &manifest).await,
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn resolve(config: RuntimeConfig, manifest: &Path) -> Result<()> {
    let plugins = PluginManifest::load(manifest)?.into_plugins();

    let mut runtime = Runtime::new(config);
    if let Err(err) = runtime.initialize(plugins).await {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }

    for (pos, name) in runtime.plugin_order().iter().enumerate() {
        println!("{:>3}. {}", pos + 1, name);
    }

    runtime
        .shutdown()
        .await
        .context("Failed to shut down plugins")?;
    Ok(())
}
