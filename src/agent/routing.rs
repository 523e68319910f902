//! Request classification.

use reqwest::Method;
use url::Url;

use crate::http::{Request, RequestMode};

/// Style sheets, scripts and modules.
const CODE_SUFFIXES: &[&str] = &["css", "js", "mjs"];

/// Images, fonts, icons and data files.
const STATIC_SUFFIXES: &[&str] = &[
  "png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "json", "woff", "woff2", "ttf", "eot",
];

/// Which strategy handles a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Document load: network first, never fails
  Navigation,
  /// Script or style: network first
  NetworkFirst,
  /// Static asset: stale-while-revalidate
  StaleWhileRevalidate,
  /// Straight to the network, no caching
  Passthrough,
}

impl Route {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Navigation => "navigation",
      Self::NetworkFirst => "network-first",
      Self::StaleWhileRevalidate => "stale-while-revalidate",
      Self::Passthrough => "passthrough",
    }
  }
}

/// Classify a request against the agent's scope.
///
/// Only same-origin GET requests are cached.
pub fn classify(request: &Request, scope: &Url) -> Route {
  if request.method != Method::GET {
    return Route::Passthrough;
  }
  if request.url.origin() != scope.origin() {
    return Route::Passthrough;
  }
  if request.mode == RequestMode::Navigate || request.accepts_html() {
    return Route::Navigation;
  }

  match suffix(request.url.path()) {
    Some(ext) if CODE_SUFFIXES.contains(&ext.as_str()) => Route::NetworkFirst,
    Some(ext) if STATIC_SUFFIXES.contains(&ext.as_str()) => Route::StaleWhileRevalidate,
    _ => Route::Passthrough,
  }
}

/// Lowercased extension of the last path segment.
fn suffix(path: &str) -> Option<String> {
  let segment = path.rsplit('/').next()?;
  let (stem, ext) = segment.rsplit_once('.')?;
  if stem.is_empty() && ext.is_empty() {
    return None;
  }
  Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn scope() -> Url {
    Url::parse("https://example.github.io/downtime-tracker/").unwrap()
  }

  fn get(path: &str) -> Request {
    Request::get(scope().join(path).unwrap())
  }

  #[test]
  fn test_navigation_by_mode_or_accept() {
    assert_eq!(
      classify(&get("./").with_mode(RequestMode::Navigate), &scope()),
      Route::Navigation
    );
    assert_eq!(
      classify(&get("./about").with_header("Accept", "text/html"), &scope()),
      Route::Navigation
    );
    // HTML accept wins over a static suffix
    assert_eq!(
      classify(&get("./page.json").with_header("accept", "text/html,*/*"), &scope()),
      Route::Navigation
    );
  }

  #[test]
  fn test_code_assets_are_network_first() {
    for path in ["app.js", "styles/site.css", "mod.mjs", "APP.JS"] {
      assert_eq!(classify(&get(path), &scope()), Route::NetworkFirst, "{path}");
    }
  }

  #[test]
  fn test_static_assets_are_stale_while_revalidate() {
    for path in [
      "icons/icon-192.png",
      "photo.JPG",
      "favicon.ico",
      "manifest.json",
      "fonts/inter.woff2",
      "fonts/old.eot",
      "logo.svg",
    ] {
      assert_eq!(
        classify(&get(path), &scope()),
        Route::StaleWhileRevalidate,
        "{path}"
      );
    }
  }

  #[test]
  fn test_unclassified_same_origin_is_passthrough() {
    for path in ["api/status", "manifest.webmanifest", "archive.tar.gz", "dir.png/"] {
      assert_eq!(classify(&get(path), &scope()), Route::Passthrough, "{path}");
    }
  }

  #[test]
  fn test_query_string_does_not_affect_suffix() {
    assert_eq!(classify(&get("app.js?v=3"), &scope()), Route::NetworkFirst);
  }

  #[test]
  fn test_non_get_is_passthrough() {
    let url = scope().join("logo.png").unwrap();
    for method in [Method::POST, Method::PUT, Method::DELETE, Method::HEAD] {
      let req = Request::new(method.clone(), url.clone()).with_mode(RequestMode::Navigate);
      assert_eq!(classify(&req, &scope()), Route::Passthrough, "{method}");
    }
  }

  #[test]
  fn test_cross_origin_is_passthrough() {
    let cdn = Url::parse("https://cdn.example.com/lib.js").unwrap();
    assert_eq!(classify(&Request::get(cdn), &scope()), Route::Passthrough);

    let font = Url::parse("https://fonts.example.com/a.woff2").unwrap();
    assert_eq!(classify(&Request::get(font), &scope()), Route::Passthrough);

    let page = Url::parse("https://other.example.com/").unwrap();
    let nav = Request::get(page).with_mode(RequestMode::Navigate);
    assert_eq!(classify(&nav, &scope()), Route::Passthrough);

    // Same host, different scheme is a different origin
    let http = Url::parse("http://example.github.io/downtime-tracker/app.js").unwrap();
    assert_eq!(classify(&Request::get(http), &scope()), Route::Passthrough);
  }

  #[test]
  fn test_suffix() {
    assert_eq!(suffix("/a/b.CSS"), Some("css".to_string()));
    assert_eq!(suffix("/a/b"), None);
    assert_eq!(suffix("/a.png/"), None);
    assert_eq!(suffix("/"), None);
  }
}
