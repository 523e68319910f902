use color_eyre::{eyre::eyre, Result};
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use std::future::Future;

use crate::http::{CacheMode, Request, Response};

/// Header marking a request as a navigation preload.
pub const PRELOAD_HEADER: &str = "Service-Worker-Navigation-Preload";

/// The upstream network as seen by the agent.
///
/// A returned `Err` means the request never produced a response (DNS,
/// connection, TLS, body read). HTTP error statuses are ordinary responses.
pub trait Network: Send + Sync + 'static {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// reqwest-backed upstream client
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
    let client = self.client.clone();
    let request = request.clone();

    async move {
      let mut builder = client.request(request.method.clone(), request.url.clone());
      for (name, value) in request.forwardable_headers() {
        builder = builder.header(name, value);
      }
      if request.cache == CacheMode::Reload {
        builder = builder
          .header(CACHE_CONTROL, "no-cache")
          .header(PRAGMA, "no-cache");
      }
      if !request.body.is_empty() {
        builder = builder.body(request.body.clone());
      }

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?
        .to_vec();

      Ok(Response {
        status,
        headers,
        body,
      })
    }
  }
}
