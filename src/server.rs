//! Reverse proxy front end.
//!
//! Every request that is not a control endpoint is converted into a
//! [`Request`] and handed to the agent. Paths are resolved against the
//! agent's scope, so the proxy root maps onto the application root.

use actix_web::http::StatusCode;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::agent::{Agent, Network};
use crate::cache::{CacheResult, CacheStorage};
use crate::http::{is_hop_by_hop, Request, RequestMode, Response};

/// Response header naming where the body came from.
pub const SOURCE_HEADER: &str = "x-asset-agent-source";

pub const MESSAGE_PATH: &str = "/__agent/message";
pub const STATUS_PATH: &str = "/__agent/status";

/// Serve the agent on `listen` until the process is stopped.
pub async fn run<S: CacheStorage, N: Network>(agent: Arc<Agent<S, N>>, listen: &str) -> Result<()> {
  let scope = agent.scope().clone();
  let data = web::Data::from(agent);

  let server = HttpServer::new(move || {
    App::new()
      .app_data(data.clone())
      .configure(routes::<S, N>)
  })
  .bind(listen)
  .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;

  info!(%listen, %scope, "proxy listening");

  server
    .run()
    .await
    .map_err(|e| eyre!("Proxy server failed: {}", e))?;

  Ok(())
}

/// Control endpoints, with everything else intercepted by the agent.
fn routes<S: CacheStorage, N: Network>(cfg: &mut web::ServiceConfig) {
  cfg
    .route(MESSAGE_PATH, web::post().to(message::<S, N>))
    .route(STATUS_PATH, web::get().to(status::<S, N>))
    .default_service(web::to(intercept::<S, N>));
}

async fn intercept<S: CacheStorage, N: Network>(
  req: HttpRequest,
  body: web::Bytes,
  agent: web::Data<Agent<S, N>>,
) -> HttpResponse {
  let request = match to_agent_request(&req, &body, agent.scope()) {
    Ok(request) => request,
    Err(e) => return HttpResponse::BadRequest().body(e.to_string()),
  };
  let url = request.url.clone();

  match agent.respond(request).await {
    Ok(result) => to_http_response(result),
    Err(e) => {
      warn!(%url, "request failed: {e}");
      HttpResponse::BadGateway().body(format!("Upstream request failed: {e}"))
    }
  }
}

async fn message<S: CacheStorage, N: Network>(
  body: web::Bytes,
  agent: web::Data<Agent<S, N>>,
) -> HttpResponse {
  let payload: serde_json::Value = match serde_json::from_slice(&body) {
    Ok(payload) => payload,
    Err(e) => return HttpResponse::BadRequest().body(format!("Invalid JSON: {e}")),
  };

  match agent.on_message(&payload).await {
    Ok(()) => HttpResponse::Accepted().finish(),
    Err(e) => {
      warn!("control message failed: {e}");
      HttpResponse::InternalServerError().body(e.to_string())
    }
  }
}

async fn status<S: CacheStorage, N: Network>(agent: web::Data<Agent<S, N>>) -> HttpResponse {
  match agent.status() {
    Ok(status) => HttpResponse::Ok().json(status),
    Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
  }
}

/// Build the agent's view of an incoming request.
fn to_agent_request(req: &HttpRequest, body: &[u8], scope: &Url) -> Result<Request> {
  let method = Method::from_bytes(req.method().as_str().as_bytes())
    .map_err(|e| eyre!("Unsupported method {}: {}", req.method(), e))?;

  let url = resolve_target(&req.uri().to_string(), scope)?;

  let headers: Vec<(String, String)> = req
    .headers()
    .iter()
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect();

  let mut request = Request::new(method, url).with_body(body.to_vec());
  request.headers = headers;
  request.mode = RequestMode::from_fetch_mode(request.header("sec-fetch-mode"));
  Ok(request)
}

/// Absolute-form targets are kept as-is; origin-form paths are resolved
/// inside the scope.
fn resolve_target(target: &str, scope: &Url) -> Result<Url> {
  if let Ok(url) = Url::parse(target) {
    if matches!(url.scheme(), "http" | "https") {
      return Ok(url);
    }
  }
  // "./" keeps a colon in the first segment from reading as a scheme
  let relative = format!("./{}", target.trim_start_matches('/'));
  scope
    .join(&relative)
    .map_err(|e| eyre!("Invalid request target {}: {}", target, e))
}

fn to_http_response(result: CacheResult<Response>) -> HttpResponse {
  let CacheResult { data, source, .. } = result;
  let status = StatusCode::from_u16(data.status).unwrap_or(StatusCode::BAD_GATEWAY);

  let mut builder = HttpResponse::build(status);
  for (name, value) in &data.headers {
    if is_hop_by_hop(name) {
      continue;
    }
    builder.append_header((name.as_str(), value.as_str()));
  }
  builder.insert_header((SOURCE_HEADER, source.as_str()));
  builder.body(data.body)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::agent::testing::{options, ScriptedNetwork};
  use crate::agent::LifecycleState;
  use crate::cache::{CacheSource, MemoryStorage};
  use actix_web::body::to_bytes;
  use actix_web::test::{call_and_read_body_json, call_service, init_service, TestRequest};
  use serde_json::{json, Value};

  type TestAgent = Agent<MemoryStorage, ScriptedNetwork>;

  async fn installed_agent(network: &Arc<ScriptedNetwork>, skip_waiting: bool) -> Arc<TestAgent> {
    let mut opts = options("v1");
    opts.skip_waiting_on_install = skip_waiting;
    let agent = Arc::new(Agent::new(opts, MemoryStorage::new(), Arc::clone(network)));
    agent.install().await.unwrap();
    agent
  }

  fn app_for(
    agent: Arc<TestAgent>,
  ) -> App<
    impl actix_web::dev::ServiceFactory<
      actix_web::dev::ServiceRequest,
      Config = (),
      Response = actix_web::dev::ServiceResponse,
      Error = actix_web::Error,
      InitError = (),
    >,
  > {
    App::new()
      .app_data(web::Data::from(agent))
      .configure(routes::<MemoryStorage, ScriptedNetwork>)
  }

  fn scope() -> Url {
    Url::parse("https://example.github.io/downtime-tracker/").unwrap()
  }

  #[test]
  fn test_resolve_origin_form() {
    let url = resolve_target("/icons/icon-192.png?v=1", &scope()).unwrap();
    assert_eq!(
      url.as_str(),
      "https://example.github.io/downtime-tracker/icons/icon-192.png?v=1"
    );
    assert_eq!(resolve_target("/", &scope()).unwrap(), scope());
  }

  #[test]
  fn test_resolve_colon_in_first_segment() {
    for target in ["/user:42", "/c:photo.png", "/mailto:someone"] {
      let url = resolve_target(target, &scope()).unwrap();
      assert_eq!(url.origin(), scope().origin(), "{target}");
      assert_eq!(
        url.as_str(),
        format!("https://example.github.io/downtime-tracker{target}")
      );
    }
  }

  #[test]
  fn test_resolve_absolute_form() {
    let url = resolve_target("https://cdn.example.com/lib.js", &scope()).unwrap();
    assert_eq!(url.as_str(), "https://cdn.example.com/lib.js");
  }

  #[test]
  fn test_resolve_protocol_relative_stays_in_scope() {
    let url = resolve_target("//evil.example.com/x.js", &scope()).unwrap();
    assert_eq!(url.origin(), scope().origin());
  }

  #[test]
  fn test_to_agent_request_reads_fetch_mode() {
    let req = TestRequest::get()
      .uri("/dashboard")
      .insert_header(("Sec-Fetch-Mode", "navigate"))
      .insert_header(("Accept", "text/html"))
      .to_http_request();

    let request = to_agent_request(&req, b"", &scope()).unwrap();
    assert_eq!(request.method, Method::GET);
    assert_eq!(request.mode, RequestMode::Navigate);
    assert!(request.accepts_html());
    assert_eq!(
      request.url.as_str(),
      "https://example.github.io/downtime-tracker/dashboard"
    );
  }

  #[test]
  fn test_to_agent_request_keeps_body() {
    let req = TestRequest::post().uri("/api/report").to_http_request();
    let request = to_agent_request(&req, b"{\"ok\":true}", &scope()).unwrap();
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.body, b"{\"ok\":true}");
  }

  #[actix_web::test]
  async fn test_to_http_response() {
    let response = Response::new(200)
      .with_header("Content-Type", "image/png")
      .with_header("Transfer-Encoding", "chunked")
      .with_header("Set-Cookie", "a=1")
      .with_header("Set-Cookie", "b=2")
      .with_body("png");

    let http = to_http_response(CacheResult::from_cache(response, chrono::Utc::now()));
    assert_eq!(http.status(), StatusCode::OK);
    assert_eq!(http.headers().get(SOURCE_HEADER).unwrap(), "cache");
    assert_eq!(http.headers().get("content-type").unwrap(), "image/png");
    assert!(http.headers().get("transfer-encoding").is_none());
    assert_eq!(http.headers().get_all("set-cookie").count(), 2);

    let body = to_bytes(http.into_body()).await.unwrap();
    assert_eq!(&body[..], b"png");
  }

  #[actix_web::test]
  async fn test_service_serves_and_caches_script() {
    let network = ScriptedNetwork::new();
    let agent = installed_agent(&network, true).await;
    network.serve(&options("v1").scope.join("app.js").unwrap(), "code");
    let app = init_service(app_for(Arc::clone(&agent))).await;

    let resp = call_service(&app, TestRequest::get().uri("/app.js").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get(SOURCE_HEADER).unwrap(), "network");

    network.set_online(false);
    let resp = call_service(&app, TestRequest::get().uri("/app.js").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get(SOURCE_HEADER).unwrap(), "cache");
  }

  #[actix_web::test]
  async fn test_service_offline_script_without_cache_is_bad_gateway() {
    let network = ScriptedNetwork::new();
    network.set_online(false);
    let agent = installed_agent(&network, true).await;
    let app = init_service(app_for(agent)).await;

    let resp = call_service(&app, TestRequest::get().uri("/app.js").to_request()).await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
  }

  #[actix_web::test]
  async fn test_service_skip_waiting_message_activates() {
    let network = ScriptedNetwork::new();
    let agent = installed_agent(&network, false).await;
    let app = init_service(app_for(Arc::clone(&agent))).await;

    let status: Value =
      call_and_read_body_json(&app, TestRequest::get().uri(STATUS_PATH).to_request()).await;
    assert_eq!(status["state"], "installed");
    assert_eq!(status["controlling"], false);

    let resp = call_service(
      &app,
      TestRequest::post()
        .uri(MESSAGE_PATH)
        .set_json(json!({ "type": "SKIP_WAITING" }))
        .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let status: Value =
      call_and_read_body_json(&app, TestRequest::get().uri(STATUS_PATH).to_request()).await;
    assert_eq!(status["state"], "activated");
    assert_eq!(status["controlling"], true);
    assert_eq!(status["generation"], "downtime-tracker-v1");
    assert_eq!(agent.status().unwrap().state, LifecycleState::Activated);
  }

  #[actix_web::test]
  async fn test_service_rejects_malformed_message() {
    let network = ScriptedNetwork::new();
    let agent = installed_agent(&network, false).await;
    let app = init_service(app_for(Arc::clone(&agent))).await;

    let resp = call_service(
      &app,
      TestRequest::post()
        .uri(MESSAGE_PATH)
        .insert_header(("Content-Type", "application/json"))
        .set_payload("{not json")
        .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(agent.status().unwrap().state, LifecycleState::Installed);
  }

  #[test]
  fn test_offline_status_passes_through() {
    let http = to_http_response(CacheResult::offline(Response::new(503)));
    assert_eq!(http.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
      http.headers().get(SOURCE_HEADER).unwrap(),
      CacheSource::Offline.as_str()
    );
  }
}
