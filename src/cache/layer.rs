//! Cache layer that orchestrates caching strategies with network fetching.

use color_eyre::Result;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::entry::{digest, CachedEntry, RequestKey};
use super::storage::CacheStorage;
use super::traits::CacheResult;
use crate::http::Response;

/// Cache layer bound to the current generation.
///
/// Storage failures never fail a request: reads degrade to a miss and
/// writes are skipped, both with a warning.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  generation: String,
  /// Background refreshes that have not been joined yet
  refreshes: Arc<Mutex<JoinSet<()>>>,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer writing into `generation`.
  pub fn new(storage: S, generation: impl Into<String>) -> Self {
    Self {
      storage: Arc::new(storage),
      generation: generation.into(),
      refreshes: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  pub fn generation(&self) -> &str {
    &self.generation
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Create the current generation if absent.
  pub fn open(&self) -> Result<()> {
    self.storage.open(&self.generation)
  }

  /// Delete every generation except the current one.
  ///
  /// Returns the names that were deleted. Individual delete failures are
  /// logged and skipped.
  pub fn prune(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.storage.keys()? {
      if name == self.generation {
        continue;
      }
      match self.storage.delete(&name) {
        Ok(true) => deleted.push(name),
        Ok(false) => {}
        Err(e) => warn!(generation = %name, "failed to delete stale generation: {e}"),
      }
    }
    Ok(deleted)
  }

  /// Read from the current generation, treating storage errors as a miss.
  pub fn lookup(&self, key: &RequestKey) -> Option<CachedEntry> {
    match self.storage.lookup(&self.generation, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(url = %key.url, "cache read failed, treating as miss: {e}");
        None
      }
    }
  }

  /// Write a snapshot into the current generation.
  ///
  /// Only successful responses replace the last known good copy. Returns
  /// whether anything was written.
  pub fn store(&self, key: &RequestKey, response: &Response) -> bool {
    if !response.is_ok() {
      debug!(url = %key.url, status = response.status, "not caching unsuccessful response");
      return false;
    }
    if varies_on_everything(response) {
      debug!(url = %key.url, "not caching response with Vary: *");
      return false;
    }
    match self.storage.put(&self.generation, key, response) {
      Ok(()) => true,
      Err(e) => {
        warn!(url = %key.url, "cache write failed: {e}");
        false
      }
    }
  }

  /// Network first, falling back to the cached copy.
  ///
  /// 1. Fetch from network; on success store a copy and return it
  /// 2. On network failure return the cached copy if there is one
  /// 3. Otherwise propagate the network error
  pub async fn network_first<F, Fut>(
    &self,
    key: &RequestKey,
    fetcher: F,
  ) -> Result<CacheResult<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    match fetcher().await {
      Ok(response) => {
        self.store(key, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(err) => match self.lookup(key) {
        Some(entry) => {
          debug!(url = %key.url, "network failed, serving cached copy: {err}");
          Ok(CacheResult::from_cache(entry.response, entry.cached_at))
        }
        None => Err(err),
      },
    }
  }

  /// Serve the cached copy immediately and refresh it in the background.
  ///
  /// Without a cached copy the fetch is awaited directly and its result is
  /// both stored and returned. The background refresh is not awaited by the
  /// request and its failure is swallowed; [`CacheLayer::settle`] waits for
  /// it.
  pub async fn stale_while_revalidate<F, Fut>(
    &self,
    key: &RequestKey,
    fetcher: F,
  ) -> Result<CacheResult<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>> + Send + 'static,
  {
    let cached = self.lookup(key);
    let refresh = fetcher();

    match cached {
      Some(entry) => {
        let layer = self.clone();
        let key = key.clone();
        let previous = entry.digest.clone();
        self.spawn_refresh(async move {
          match refresh.await {
            Ok(response) => {
              let changed = digest(&response.body) != previous;
              if layer.store(&key, &response) {
                debug!(url = %key.url, changed, "background refresh stored");
              }
            }
            Err(e) => debug!(url = %key.url, "background refresh failed: {e}"),
          }
        });
        Ok(CacheResult::from_cache(entry.response, entry.cached_at))
      }
      None => {
        let response = refresh.await?;
        self.store(key, &response);
        Ok(CacheResult::from_network(response))
      }
    }
  }
}

impl<S: CacheStorage> CacheLayer<S> {
  fn spawn_refresh<F>(&self, refresh: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let mut refreshes = self.refreshes.lock().unwrap_or_else(PoisonError::into_inner);
    // Reap finished refreshes so the set only holds running ones
    while refreshes.try_join_next().is_some() {}
    refreshes.spawn(refresh);
  }

  /// Wait until every background refresh started so far has finished.
  pub async fn settle(&self) {
    let mut pending = std::mem::take(
      &mut *self.refreshes.lock().unwrap_or_else(PoisonError::into_inner),
    );
    while let Some(joined) = pending.join_next().await {
      if let Err(e) = joined {
        warn!("background refresh task failed: {e}");
      }
    }
  }
}

/// `Vary: *` means no later request can be matched against this response.
fn varies_on_everything(response: &Response) -> bool {
  response
    .header("vary")
    .map(|vary| vary.split(',').any(|field| field.trim() == "*"))
    .unwrap_or(false)
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      generation: self.generation.clone(),
      refreshes: Arc::clone(&self.refreshes),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage};
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;
  use url::Url;

  const GENERATION: &str = "downtime-tracker-v1";

  fn key(path: &str) -> RequestKey {
    RequestKey::get(&Url::parse("https://app.test/").unwrap().join(path).unwrap())
  }

  fn ok(body: &str) -> Response {
    Response::new(200).with_body(body)
  }

  fn layer() -> CacheLayer<MemoryStorage> {
    CacheLayer::new(MemoryStorage::new(), GENERATION)
  }

  async fn wait_for_body(layer: &CacheLayer<MemoryStorage>, key: &RequestKey, body: &[u8]) -> bool {
    for _ in 0..100 {
      if layer.lookup(key).map(|e| e.response.body) == Some(body.to_vec()) {
        return true;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
  }

  #[tokio::test]
  async fn test_network_first_stores_success() {
    let layer = layer();
    let k = key("app.js");

    let result = layer
      .network_first(&k, || async { Ok(ok("fresh")) })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"fresh");
    assert_eq!(layer.lookup(&k).unwrap().response.body, b"fresh");
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache() {
    let layer = layer();
    let k = key("app.css");
    layer.store(&k, &ok("cached"));

    let result = layer
      .network_first(&k, || async { Err(eyre!("connection refused")) })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Cache);
    assert!(result.cached_at.is_some());
    assert_eq!(result.data.body, b"cached");
  }

  #[tokio::test]
  async fn test_network_first_without_cache_propagates_failure() {
    let layer = layer();

    let result = layer
      .network_first(&key("app.js"), || async { Err(eyre!("offline")) })
      .await;

    assert!(result.is_err());
    assert!(layer.storage().entries(GENERATION).unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_network_first_keeps_last_good_copy_on_error_status() {
    let layer = layer();
    let k = key("app.js");
    layer.store(&k, &ok("good"));

    let result = layer
      .network_first(&k, || async { Ok(Response::new(500).with_body("oops")) })
      .await
      .unwrap();

    assert_eq!(result.data.status, 500);
    assert_eq!(layer.lookup(&k).unwrap().response.body, b"good");
  }

  #[tokio::test]
  async fn test_stale_serves_cached_then_refreshes() {
    let layer = layer();
    let k = key("logo.png");
    layer.store(&k, &ok("old"));

    let result = layer
      .stale_while_revalidate(&k, || async { Ok(ok("new")) })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"old");
    assert!(wait_for_body(&layer, &k, b"new").await);
  }

  #[tokio::test]
  async fn test_settle_waits_for_background_refresh() {
    let layer = layer();
    let k = key("logo.png");
    layer.store(&k, &ok("old"));

    let result = layer
      .stale_while_revalidate(&k, || async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(ok("new"))
      })
      .await
      .unwrap();
    assert_eq!(result.data.body, b"old");

    layer.settle().await;
    assert_eq!(layer.lookup(&k).unwrap().response.body, b"new");

    // Nothing left to wait for
    layer.settle().await;
  }

  #[tokio::test]
  async fn test_stale_refresh_failure_is_swallowed() {
    let layer = layer();
    let k = key("font.woff2");
    layer.store(&k, &ok("old"));

    let result = layer
      .stale_while_revalidate(&k, || async { Err(eyre!("offline")) })
      .await
      .unwrap();

    assert_eq!(result.data.body, b"old");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(layer.lookup(&k).unwrap().response.body, b"old");
  }

  #[tokio::test]
  async fn test_stale_without_cache_awaits_single_fetch() {
    let layer = layer();
    let k = key("data.json");
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result = layer
      .stale_while_revalidate(&k, move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(ok("{}"))
      })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"{}");
    assert_eq!(layer.lookup(&k).unwrap().response.body, b"{}");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_stale_without_cache_propagates_failure() {
    let layer = layer();
    let result = layer
      .stale_while_revalidate(&key("icon.svg"), || async { Err(eyre!("offline")) })
      .await;
    assert!(result.is_err());
  }

  #[test]
  fn test_vary_star_is_not_stored() {
    let layer = layer();
    let k = key("data.json");
    let response = ok("{}").with_header("Vary", "Accept-Encoding, *");
    assert!(!layer.store(&k, &response));
    assert!(layer.lookup(&k).is_none());
    assert!(layer.store(&k, &ok("{}").with_header("Vary", "Accept-Encoding")));
  }

  #[test]
  fn test_prune_keeps_only_current() {
    let layer = layer();
    let storage = layer.storage();
    storage.open("downtime-tracker-v0").unwrap();
    storage.open("unrelated").unwrap();
    layer.open().unwrap();

    let mut deleted = layer.prune().unwrap();
    deleted.sort();

    assert_eq!(deleted, vec!["downtime-tracker-v0", "unrelated"]);
    assert_eq!(storage.keys().unwrap(), vec![GENERATION]);
  }
}
