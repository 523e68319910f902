//! Request and response values passed between the proxy front end, the
//! routing policy and the cache.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::RequestKey;

/// Headers that describe a single connection rather than the resource.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "proxy-connection",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

/// Returns true for headers that must not be copied from one hop to the next.
///
/// `content-length` and `content-encoding` are included because bodies are
/// buffered and decompressed on the way through.
pub fn is_hop_by_hop(name: &str) -> bool {
  let name = name.to_ascii_lowercase();
  HOP_BY_HOP.contains(&name.as_str())
    || name == "host"
    || name == "content-length"
    || name == "content-encoding"
}

/// How the page issued the request, taken from `Sec-Fetch-Mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Top-level document load
  Navigate,
  SameOrigin,
  #[default]
  NoCors,
  Cors,
  Websocket,
}

impl RequestMode {
  pub fn from_fetch_mode(value: Option<&str>) -> Self {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
      Some("navigate") => Self::Navigate,
      Some("same-origin") => Self::SameOrigin,
      Some("cors") => Self::Cors,
      Some("websocket") => Self::Websocket,
      _ => Self::NoCors,
    }
  }
}

/// Whether intermediate HTTP caches may answer the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
  #[default]
  Default,
  /// Force revalidation with the origin
  Reload,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub cache: CacheMode,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      mode: RequestMode::default(),
      cache: CacheMode::default(),
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = body;
    self
  }

  /// First value of a header, matched case-insensitively.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// True if the declared acceptable content types include HTML.
  pub fn accepts_html(&self) -> bool {
    self
      .header("accept")
      .map(|accept| accept.to_ascii_lowercase().contains("text/html"))
      .unwrap_or(false)
  }

  /// Copy of this request that bypasses intermediate HTTP caches.
  pub fn reload(&self) -> Self {
    Self {
      cache: CacheMode::Reload,
      ..self.clone()
    }
  }

  pub fn key(&self) -> RequestKey {
    RequestKey::new(self.method.clone(), &self.url)
  }

  /// Headers safe to forward upstream.
  pub fn forwardable_headers(&self) -> impl Iterator<Item = (&str, &str)> {
    self
      .headers
      .iter()
      .filter(|(name, _)| !is_hop_by_hop(name) && !name.eq_ignore_ascii_case("accept-encoding"))
      .map(|(n, v)| (n.as_str(), v.as_str()))
  }
}

/// A fully buffered response. Cached copies are immutable snapshots of this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = body.into();
    self
  }

  /// 2xx status
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}
