mod agent;
mod cache;
mod commands;
mod config;
mod http;
mod logging;
mod server;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "asset-agent")]
#[command(about = "Caching proxy that keeps a single-page app fresh online and usable offline")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/asset-agent/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache version to use instead of the configured one
  #[arg(long)]
  cache_version: Option<String>,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.log_file.as_deref())?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let version = config.cache_version(args.cache_version.as_deref())?;
  let options = agent::AgentOptions::from_config(&config, version)?;

  commands::run(args.command, config, options).await
}
