//! Result types describing where a response came from.

use chrono::{DateTime, Utc};

/// Result from a strategy, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Data from a navigation preload started before routing.
  pub fn from_preload(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Preload,
      cached_at: None,
    }
  }

  /// Data served from the current generation.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Synthesized offline notice.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: None,
    }
  }

  /// Direct network response that never touched the cache.
  pub fn passthrough(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Passthrough,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network, written to the cache when successful
  Network,
  /// Navigation preload response
  Preload,
  /// Last known good copy from the cache
  Cache,
  /// Network unavailable and nothing cached, synthesized notice
  Offline,
  /// Not subject to caching at all
  Passthrough,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Preload => "preload",
      Self::Cache => "cache",
      Self::Offline => "offline",
      Self::Passthrough => "passthrough",
    }
  }
}
