//! In-process network double for agent tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

use super::{AgentOptions, Network};
use crate::config::default_precache;
use crate::http::{Request, Response};

pub fn options(version: &str) -> AgentOptions {
  AgentOptions {
    app_name: "downtime-tracker".to_string(),
    version: version.to_string(),
    scope: Url::parse("https://example.github.io/downtime-tracker/").unwrap(),
    precache: default_precache(),
    entry_document: "./index.html".to_string(),
    navigation_preload: true,
    skip_waiting_on_install: true,
  }
}

/// Serves canned bodies by URL and records every request it sees.
///
/// Unknown URLs get a 404; while offline every fetch fails.
pub struct ScriptedNetwork {
  routes: Mutex<HashMap<String, Vec<u8>>>,
  calls: Mutex<Vec<Request>>,
  online: AtomicBool,
}

impl ScriptedNetwork {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      routes: Mutex::new(HashMap::new()),
      calls: Mutex::new(Vec::new()),
      online: AtomicBool::new(true),
    })
  }

  pub fn serve(&self, url: &Url, body: &str) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), body.as_bytes().to_vec());
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn calls_to(&self, url: &Url) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url == *url)
      .count()
  }

  pub fn last_call(&self) -> Option<Request> {
    self.calls.lock().unwrap().last().cloned()
  }

  fn reply(&self, request: &Request) -> Result<Response> {
    self.calls.lock().unwrap().push(request.clone());

    if !self.online.load(Ordering::SeqCst) {
      return Err(eyre!("network unreachable: {}", request.url));
    }

    let response = match self.routes.lock().unwrap().get(request.url.as_str()) {
      Some(body) => Response::new(200).with_body(body.clone()),
      None => Response::new(404).with_body("not found"),
    };
    Ok(response)
  }
}

impl Network for ScriptedNetwork {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
    let result = self.reply(request);
    async move { result }
  }
}
