//! The request interception agent.
//!
//! An [`Agent`] owns one cache generation, runs the install/activate
//! lifecycle against it, and answers intercepted requests using the routing
//! policy in [`routing`].

mod lifecycle;
mod message;
mod network;
mod offline;
mod routing;

#[cfg(test)]
pub(crate) mod testing;

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheStorage, RequestKey};
use crate::config::Config;
use crate::http::{Request, RequestMode, Response};

pub use lifecycle::LifecycleState;
pub use message::ControlMessage;
pub use network::{HttpNetwork, Network, PRELOAD_HEADER};
pub use routing::{classify, Route};

use lifecycle::Lifecycle;
use offline::offline_document;

/// Static settings for one agent version.
#[derive(Debug, Clone)]
pub struct AgentOptions {
  /// Prefix that keeps our generations apart from unrelated stores
  pub app_name: String,
  pub version: String,
  /// Origin and base path of the application
  pub scope: Url,
  /// Paths relative to `scope` to cache at install time
  pub precache: Vec<String>,
  /// Path relative to `scope` of the app shell document
  pub entry_document: String,
  pub navigation_preload: bool,
  pub skip_waiting_on_install: bool,
}

impl AgentOptions {
  pub fn from_config(config: &Config, version: String) -> Result<Self> {
    Ok(Self {
      app_name: config.app_name.clone(),
      version,
      scope: config.scope()?,
      precache: config.precache.clone(),
      entry_document: config.entry_document.clone(),
      navigation_preload: config.navigation_preload,
      skip_waiting_on_install: config.skip_waiting_on_install,
    })
  }

  /// Name of the generation this version reads and writes.
  pub fn cache_name(&self) -> String {
    format!("{}-{}", self.app_name, self.version)
  }

  fn resolve(&self, path: &str) -> Result<Url> {
    self
      .scope
      .join(path)
      .map_err(|e| eyre!("Invalid path {} relative to {}: {}", path, self.scope, e))
  }
}

/// Navigation preload started by the host before routing.
pub type Preload = JoinHandle<Result<Response>>;

/// One intercepted request, plus a preload response if one was started.
pub struct FetchEvent {
  pub request: Request,
  pub preload: Option<Preload>,
}

impl FetchEvent {
  pub fn new(request: Request) -> Self {
    Self {
      request,
      preload: None,
    }
  }
}

/// Snapshot of the agent's state, reported by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
  pub generation: String,
  pub state: LifecycleState,
  pub controlling: bool,
  pub navigation_preload: bool,
  pub skip_waiting: bool,
}

/// Report from an install run.
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
  pub precached: usize,
  pub attempted: usize,
  pub activation: Option<ActivationReport>,
}

/// Report from an activation run.
#[derive(Debug, Clone, Default)]
pub struct ActivationReport {
  /// Generations removed because they were not current
  pub deleted: Vec<String>,
}

pub struct Agent<S: CacheStorage, N: Network> {
  options: AgentOptions,
  cache: CacheLayer<S>,
  network: Arc<N>,
  lifecycle: Mutex<Lifecycle>,
}

impl<S: CacheStorage, N: Network> Agent<S, N> {
  pub fn new(options: AgentOptions, storage: S, network: Arc<N>) -> Self {
    let cache = CacheLayer::new(storage, options.cache_name());
    Self {
      options,
      cache,
      network,
      lifecycle: Mutex::new(Lifecycle::new()),
    }
  }

  pub fn scope(&self) -> &Url {
    &self.options.scope
  }

  pub fn generation(&self) -> &str {
    self.cache.generation()
  }

  pub fn storage(&self) -> &S {
    self.cache.storage()
  }

  fn lifecycle(&self) -> Result<MutexGuard<'_, Lifecycle>> {
    self
      .lifecycle
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  pub fn status(&self) -> Result<AgentStatus> {
    let lifecycle = self.lifecycle()?;
    Ok(AgentStatus {
      generation: self.generation().to_string(),
      state: lifecycle.state(),
      controlling: lifecycle.is_controlling(),
      navigation_preload: lifecycle.navigation_preload(),
      skip_waiting: lifecycle.skip_waiting_requested(),
    })
  }

  /// Open the current generation and precache the app shell.
  ///
  /// Individual precache failures are logged and skipped; installation
  /// itself always succeeds. If skip-waiting was requested, activation
  /// follows immediately.
  pub async fn install(&self) -> Result<InstallReport> {
    {
      let mut lifecycle = self.lifecycle()?;
      lifecycle.begin_install()?;
      if self.options.skip_waiting_on_install {
        lifecycle.request_skip_waiting();
      }
    }

    if let Err(e) = self.cache.open() {
      warn!(generation = %self.generation(), "failed to open generation: {e}");
    }

    let attempts = self
      .options
      .precache
      .iter()
      .map(|path| self.precache_one(path));
    let results = join_all(attempts).await;
    let precached = results.iter().filter(|stored| **stored).count();

    info!(
      generation = %self.generation(),
      precached,
      attempted = results.len(),
      "installed"
    );

    let ready = {
      let mut lifecycle = self.lifecycle()?;
      lifecycle.finish_install(true);
      let ready = lifecycle.ready_to_activate();
      if ready {
        lifecycle.begin_activate()?;
      }
      ready
    };

    let activation = if ready {
      Some(self.activate().await?)
    } else {
      info!(generation = %self.generation(), "waiting for skip-waiting signal");
      None
    };

    Ok(InstallReport {
      precached,
      attempted: results.len(),
      activation,
    })
  }

  async fn precache_one(&self, path: &str) -> bool {
    let url = match self.options.resolve(path) {
      Ok(url) => url,
      Err(e) => {
        warn!("skipping precache entry: {e}");
        return false;
      }
    };
    let request = Request::get(url);
    match self.network.fetch(&request).await {
      Ok(response) if response.is_ok() => self.cache.store(&request.key(), &response),
      Ok(response) => {
        debug!(url = %request.url, status = response.status, "precache skipped");
        false
      }
      Err(e) => {
        debug!(url = %request.url, "precache failed: {e}");
        false
      }
    }
  }

  /// Delete stale generations, enable navigation preload and take control.
  ///
  /// The caller must already have moved the lifecycle to `Activating`.
  async fn activate(&self) -> Result<ActivationReport> {
    let deleted = match self.cache.prune() {
      Ok(deleted) => deleted,
      Err(e) => {
        warn!("failed to enumerate generations: {e}");
        Vec::new()
      }
    };
    for name in &deleted {
      info!(generation = %name, "deleted stale generation");
    }

    {
      let mut lifecycle = self.lifecycle()?;
      if self.options.navigation_preload {
        lifecycle.enable_navigation_preload();
      }
      lifecycle.finish_activate();
      lifecycle.claim()?;
    }

    info!(generation = %self.generation(), "activated and controlling");
    Ok(ActivationReport { deleted })
  }

  /// Activate as soon as installation allows it.
  ///
  /// Only one of several concurrent requests performs the activation.
  pub async fn skip_waiting(&self) -> Result<Option<ActivationReport>> {
    let activate_now = self.lifecycle()?.request_skip_waiting();
    if activate_now {
      return Ok(Some(self.activate().await?));
    }
    Ok(None)
  }

  /// Control an existing generation without installing into it.
  ///
  /// Unlike activation this deletes nothing, so it is safe to point at any
  /// version already in the store.
  pub fn resume(&self) -> Result<()> {
    if !self.storage().has(self.generation())? {
      return Err(eyre!("No such generation: {}", self.generation()));
    }
    self
      .lifecycle()?
      .resume(self.options.navigation_preload)?;
    info!(generation = %self.generation(), "resumed and controlling");
    Ok(())
  }

  /// Wait for background refreshes to finish.
  pub async fn settle(&self) {
    self.cache.settle().await;
  }

  /// Handle a control message from a page.
  pub async fn on_message(&self, payload: &Value) -> Result<()> {
    match ControlMessage::parse(payload) {
      Some(ControlMessage::SkipWaiting) => {
        info!("skip-waiting requested by page");
        self.skip_waiting().await?;
      }
      None => debug!(%payload, "ignoring unrecognized message"),
    }
    Ok(())
  }

  /// Answer a request, starting a navigation preload when enabled.
  pub async fn respond(&self, request: Request) -> Result<CacheResult<Response>> {
    let mut event = FetchEvent::new(request);
    if self.preload_applies(&event.request)? {
      event.preload = Some(self.start_preload(&event.request));
    }
    self.handle_fetch(event).await
  }

  fn preload_applies(&self, request: &Request) -> Result<bool> {
    let lifecycle = self.lifecycle()?;
    Ok(
      lifecycle.is_controlling()
        && lifecycle.navigation_preload()
        && request.mode == RequestMode::Navigate
        && classify(request, self.scope()) == Route::Navigation,
    )
  }

  fn start_preload(&self, request: &Request) -> Preload {
    let network = Arc::clone(&self.network);
    let request = request.reload().with_header(PRELOAD_HEADER, "true");
    tokio::spawn(async move { network.fetch(&request).await })
  }

  /// Route one intercepted request to its strategy.
  pub async fn handle_fetch(&self, event: FetchEvent) -> Result<CacheResult<Response>> {
    let controlling = self.lifecycle()?.is_controlling();
    if !controlling {
      return self.passthrough(&event.request).await;
    }

    let route = classify(&event.request, self.scope());
    debug!(
      method = %event.request.method,
      url = %event.request.url,
      route = route.as_str(),
      "intercepted"
    );

    match route {
      Route::Navigation => Ok(self.navigate(event).await),
      Route::NetworkFirst => {
        let request = event.request.reload();
        let network = Arc::clone(&self.network);
        self
          .cache
          .network_first(&request.key(), || async move { network.fetch(&request).await })
          .await
      }
      Route::StaleWhileRevalidate => {
        let request = event.request;
        let key = request.key();
        let network = Arc::clone(&self.network);
        self
          .cache
          .stale_while_revalidate(&key, move || async move { network.fetch(&request).await })
          .await
      }
      Route::Passthrough => self.passthrough(&event.request).await,
    }
  }

  async fn passthrough(&self, request: &Request) -> Result<CacheResult<Response>> {
    let response = self.network.fetch(request).await?;
    Ok(CacheResult::passthrough(response))
  }

  /// Navigation chain: preload, fresh network (or the cached copy of this
  /// page), cached entry document, offline notice. Never fails.
  async fn navigate(&self, event: FetchEvent) -> CacheResult<Response> {
    let FetchEvent { request, preload } = event;
    let key = request.key();

    if let Some(preload) = preload {
      match preload.await {
        Ok(Ok(response)) => {
          self.cache.store(&key, &response);
          return CacheResult::from_preload(response);
        }
        Ok(Err(e)) => debug!(url = %request.url, "navigation preload failed: {e}"),
        Err(e) => debug!(url = %request.url, "navigation preload task failed: {e}"),
      }
    }

    let fresh = request.reload();
    let network = Arc::clone(&self.network);
    match self
      .cache
      .network_first(&key, || async move { network.fetch(&fresh).await })
      .await
    {
      Ok(result) => return result,
      Err(e) => debug!(url = %request.url, "navigation fetch failed: {e}"),
    }

    match self.options.resolve(&self.options.entry_document) {
      Ok(entry_url) => {
        if let Some(entry) = self.cache.lookup(&RequestKey::get(&entry_url)) {
          debug!(url = %request.url, "serving cached entry document");
          return CacheResult::from_cache(entry.response, entry.cached_at);
        }
      }
      Err(e) => warn!("entry document unavailable: {e}"),
    }

    info!(url = %request.url, "offline with nothing cached, serving offline notice");
    CacheResult::offline(offline_document(&self.options.app_name))
  }
}
