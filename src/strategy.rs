//! Fetch strategies.
//!
//! Both strategies read and write the runtime partition. Only network-first
//! falls back to the static partition, and only for navigations.

use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::cache::{CacheResult, CacheStorage, Partition, RequestKey};
use crate::net::{Network, Request, Response};
use crate::router::is_navigation;

/// What the strategies need from the worker.
pub struct Strategies<S: CacheStorage, N: Network> {
  network: Arc<N>,
  runtime: Partition<S>,
  static_partition: Partition<S>,
  offline_fallback: RequestKey,
}

impl<S, N> Strategies<S, N>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  pub fn new(
    network: Arc<N>,
    runtime: Partition<S>,
    static_partition: Partition<S>,
    offline_fallback: RequestKey,
  ) -> Self {
    Self {
      network,
      runtime,
      static_partition,
      offline_fallback,
    }
  }

  /// Prefer live data; fall back to the runtime copy, then to the offline
  /// document for navigations.
  ///
  /// A network failure with nothing to fall back on is returned as the error.
  pub async fn network_first(&self, request: &Request) -> Result<CacheResult<Response>> {
    let err = match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_cacheable() {
          store(&self.runtime, request, &response);
        }
        return Ok(CacheResult::from_network(response));
      }
      Err(err) => err,
    };

    tracing::debug!(url = %request.url, error = %err, "network unavailable");

    if let Some(entry) = self.runtime.match_request(request)? {
      tracing::debug!(key = %entry.key.url, cached_at = %entry.cached_at, "serving runtime copy");
      return Ok(CacheResult::offline(entry.response, entry.cached_at));
    }

    if is_navigation(request) {
      if let Some(entry) = self.static_partition.match_key(&self.offline_fallback)? {
        return Ok(CacheResult::offline_fallback(entry.response, entry.cached_at));
      }
      tracing::warn!(
        partition = self.static_partition.name(),
        fallback = %self.offline_fallback.url,
        "offline fallback document missing"
      );
    }

    Err(err.into())
  }

  /// Answer from the runtime copy when there is one, while refreshing it in
  /// the background.
  ///
  /// Without a cached copy the fresh response is awaited. `None` means neither
  /// existed. The returned task is the pending refresh; it has already
  /// finished when no cached copy was returned.
  pub async fn stale_while_revalidate(
    &self,
    request: &Request,
  ) -> Result<(Option<CacheResult<Response>>, JoinHandle<()>)> {
    let cached = self.runtime.match_request(request)?;

    let (tx, rx) = oneshot::channel();
    let network = Arc::clone(&self.network);
    let runtime = self.runtime.clone();
    let request = request.clone();
    let revalidation = tokio::spawn(async move {
      let fresh = match network.fetch(&request).await {
        Ok(response) => {
          if response.is_cacheable() {
            store(&runtime, &request, &response);
          }
          Some(response)
        }
        Err(err) => {
          tracing::debug!(url = %request.url, error = %err, "revalidation failed");
          None
        }
      };
      // Receiver is gone when the cached copy was already returned
      let _ = tx.send(fresh);
    });

    if let Some(entry) = cached {
      return Ok((
        Some(CacheResult::from_cache(entry.response, entry.cached_at)),
        revalidation,
      ));
    }

    let fresh = rx.await.ok().flatten();
    Ok((fresh.map(CacheResult::from_network), revalidation))
  }
}

/// Best-effort write; the live response is returned either way.
fn store<S: CacheStorage>(partition: &Partition<S>, request: &Request, response: &Response) {
  match partition.put(request, response) {
    Ok(()) => tracing::debug!(url = %request.url, partition = partition.name(), "cached"),
    Err(e) => tracing::warn!(url = %request.url, error = %e, "failed to cache response"),
  }
}
