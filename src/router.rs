//! Per-request strategy selection.

use reqwest::header::ACCEPT;
use reqwest::Method;
use url::{Origin, Url};

use crate::net::{Request, RequestMode};

/// Path suffixes treated as static assets.
const ASSET_EXTENSIONS: &[&str] = &[
  ".css", ".js", ".png", ".jpg", ".jpeg", ".svg", ".webp", ".ico", ".json", ".html", ".woff2",
];

/// Strategy selected for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Not intercepted; the host handles it as if the agent did not exist
  Passthrough(PassReason),
  NetworkFirst,
  StaleWhileRevalidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
  /// Only GET is intercepted
  Method,
  /// Third-party resources keep their own caching semantics
  CrossOrigin,
  /// The worker does not control any client yet
  NotControlling,
}

/// Classifies requests against the application's own origin.
#[derive(Debug, Clone)]
pub struct Router {
  origin: Origin,
}

impl Router {
  pub fn new(scope: &Url) -> Self {
    Self {
      origin: scope.origin(),
    }
  }

  pub fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin
  }

  /// First matching rule wins.
  pub fn classify(&self, request: &Request) -> Route {
    if request.method != Method::GET {
      return Route::Passthrough(PassReason::Method);
    }
    if !self.is_same_origin(&request.url) {
      return Route::Passthrough(PassReason::CrossOrigin);
    }
    if is_navigation(request) {
      return Route::NetworkFirst;
    }
    if is_static_asset(&request.url) {
      return Route::StaleWhileRevalidate;
    }
    Route::NetworkFirst
  }
}

/// A document load, or a GET that prefers HTML.
pub fn is_navigation(request: &Request) -> bool {
  if request.mode == RequestMode::Navigate {
    return true;
  }

  request.method == Method::GET
    && request
      .headers
      .get_all(ACCEPT)
      .iter()
      .filter_map(|v| v.to_str().ok())
      .any(|v| v.contains("text/html"))
}

pub fn is_static_asset(url: &Url) -> bool {
  let path = url.path();
  ASSET_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}
