use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

/// Environment variable that overrides the configured cache version.
pub const VERSION_ENV: &str = "ASSET_AGENT_CACHE_VERSION";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Where the application is served from, e.g. https://example.github.io/app/
  pub origin: String,
  /// Cache version; bump on each deploy
  pub version: Option<String>,
  #[serde(default = "default_app_name")]
  pub app_name: String,
  /// Paths cached at install time, relative to `origin`
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,
  /// App shell served to offline navigations
  #[serde(default = "default_entry_document")]
  pub entry_document: String,
  #[serde(default = "default_true")]
  pub navigation_preload: bool,
  #[serde(default = "default_true")]
  pub skip_waiting_on_install: bool,
  #[serde(default = "default_listen")]
  pub listen: String,
  /// Cache database (default: $XDG_DATA_HOME/asset-agent/cache.db)
  pub database: Option<PathBuf>,
}

fn default_app_name() -> String {
  "downtime-tracker".to_string()
}

pub fn default_precache() -> Vec<String> {
  [
    "./",
    "./index.html",
    "./manifest.webmanifest",
    "./icons/icon-192.png",
    "./icons/icon-512.png",
    "./icons/apple-touch-icon.png",
    "./favicon.ico",
  ]
  .iter()
  .map(|s| s.to_string())
  .collect()
}

fn default_entry_document() -> String {
  "./index.html".to_string()
}

fn default_true() -> bool {
  true
}

fn default_listen() -> String {
  "127.0.0.1:8080".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./asset-agent.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/asset-agent/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/asset-agent/config.yaml\n\
                 with at least `origin` and `version`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("asset-agent.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("asset-agent").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.scope()?;
    Ok(config)
  }

  /// The application origin as a base URL. A trailing slash is added so that
  /// relative paths resolve inside it.
  pub fn scope(&self) -> Result<Url> {
    let mut url =
      Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))?;
    if !matches!(url.scheme(), "http" | "https") {
      return Err(eyre!("Origin must be http or https: {}", self.origin));
    }
    if !url.path().ends_with('/') {
      let path = format!("{}/", url.path());
      url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
  }

  /// Resolve the cache version.
  ///
  /// Precedence: explicit override, then ASSET_AGENT_CACHE_VERSION, then the
  /// config file.
  pub fn cache_version(&self, explicit: Option<&str>) -> Result<String> {
    let from_env = std::env::var(VERSION_ENV).ok();
    let version = explicit
      .map(String::from)
      .or(from_env)
      .or_else(|| self.version.clone())
      .ok_or_else(|| {
        eyre!(
          "Cache version not set. Add `version` to the config file or set {}.",
          VERSION_ENV
        )
      })?;
    validate_version(&version)?;
    Ok(version)
  }
}

fn validate_version(version: &str) -> Result<()> {
  if version.is_empty() {
    return Err(eyre!("Cache version must not be empty"));
  }
  if version.chars().any(char::is_whitespace) {
    return Err(eyre!("Cache version must not contain whitespace: {:?}", version));
  }
  Ok(())
}
