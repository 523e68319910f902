//! CLI subcommands.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use url::Url;

use crate::agent::{Agent, AgentOptions, HttpNetwork, InstallReport};
use crate::cache::{CacheStorage, MemoryStorage, SqliteStorage};
use crate::config::Config;
use crate::http::{Request, RequestMode};
use crate::server;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Install, activate and run the caching proxy
  Serve {
    /// Address to listen on (overrides `listen` in the config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// Keep the cache in memory only
    #[arg(long)]
    ephemeral: bool,
  },

  /// Precache the app shell into the current generation
  Install,

  /// Install and activate immediately, deleting old generations
  Activate,

  /// List cache generations
  Generations,

  /// List entries of a generation (default: current)
  Entries {
    #[arg(short, long)]
    generation: Option<String>,
  },

  /// Route a single request through the agent and print the outcome.
  ///
  /// Uses the current generation as it is, precaching it first if it does
  /// not exist yet. Other generations are left alone.
  Fetch {
    /// URL, or a path relative to the origin
    url: String,

    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,

    /// Accept header to send
    #[arg(long)]
    accept: Option<String>,
  },
}

pub async fn run(command: Command, config: Config, options: AgentOptions) -> Result<()> {
  match command {
    Command::Serve { listen, ephemeral } => {
      let listen = listen.unwrap_or_else(|| config.listen.clone());
      if ephemeral {
        serve(MemoryStorage::new(), options, &listen).await
      } else {
        serve(open_store(&config)?, options, &listen).await
      }
    }
    Command::Install => {
      let agent = new_agent(open_store(&config)?, options)?;
      let report = agent.install().await?;
      print_install(&agent, &report);
      Ok(())
    }
    Command::Activate => {
      let options = AgentOptions {
        skip_waiting_on_install: true,
        ..options
      };
      let agent = new_agent(open_store(&config)?, options)?;
      let report = agent.install().await?;
      print_install(&agent, &report);
      Ok(())
    }
    Command::Generations => {
      let storage = open_store(&config)?;
      let current = options.cache_name();
      for name in storage.keys()? {
        let marker = if name == current { "*" } else { " " };
        println!("{} {}", marker, name);
      }
      Ok(())
    }
    Command::Entries { generation } => {
      let storage = open_store(&config)?;
      let generation = generation.unwrap_or_else(|| options.cache_name());
      if !storage.has(&generation)? {
        return Err(eyre!("No such generation: {}", generation));
      }
      for entry in storage.entries(&generation)? {
        println!(
          "{:<6} {:>3} {:>9} {} {} {}",
          entry.method,
          entry.status,
          entry.size,
          &entry.digest[..entry.digest.len().min(12)],
          entry.cached_at.format("%Y-%m-%d %H:%M:%S"),
          entry.url
        );
      }
      Ok(())
    }
    Command::Fetch {
      url,
      navigate,
      accept,
    } => {
      let options = AgentOptions {
        skip_waiting_on_install: false,
        ..options
      };
      let target = resolve_url(&url, &options.scope)?;
      let agent = new_agent(open_store(&config)?, options)?;
      if !agent.storage().has(agent.generation())? {
        agent.install().await?;
      }
      agent.resume()?;

      let mut request = Request::get(target);
      if navigate {
        request = request.with_mode(RequestMode::Navigate);
      }
      if let Some(accept) = accept {
        request = request.with_header("Accept", accept);
      }

      let result = agent.respond(request).await?;
      println!("status: {}", result.data.status);
      println!("source: {}", result.source.as_str());
      if let Some(cached_at) = result.cached_at {
        println!("cached: {}", cached_at.format("%Y-%m-%d %H:%M:%S"));
      }
      println!("bytes:  {}", result.data.body.len());

      // A stale hit refreshes in the background; let it land before exiting
      agent.settle().await;
      Ok(())
    }
  }
}

fn open_store(config: &Config) -> Result<SqliteStorage> {
  SqliteStorage::open_at(config.database.as_deref())
}

fn new_agent<S: CacheStorage>(storage: S, options: AgentOptions) -> Result<Agent<S, HttpNetwork>> {
  let network = Arc::new(HttpNetwork::new()?);
  Ok(Agent::new(options, storage, network))
}

async fn serve<S: CacheStorage>(storage: S, options: AgentOptions, listen: &str) -> Result<()> {
  let agent = Arc::new(new_agent(storage, options)?);
  agent.install().await?;
  server::run(agent, listen).await
}

fn print_install<S: CacheStorage>(agent: &Agent<S, HttpNetwork>, report: &InstallReport) {
  println!(
    "{}: precached {}/{}",
    agent.generation(),
    report.precached,
    report.attempted
  );
  match &report.activation {
    Some(activation) if activation.deleted.is_empty() => println!("activated"),
    Some(activation) => println!("activated, deleted {}", activation.deleted.join(", ")),
    None => println!("installed, waiting for skip-waiting"),
  }
}

/// Accept either an absolute http(s) URL or a path relative to the scope.
fn resolve_url(input: &str, scope: &Url) -> Result<Url> {
  if let Ok(url) = Url::parse(input) {
    if matches!(url.scheme(), "http" | "https") {
      return Ok(url);
    }
  }
  scope
    .join(&format!("./{}", input.trim_start_matches('/')))
    .map_err(|e| eyre!("Invalid path {}: {}", input, e))
}
