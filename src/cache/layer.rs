//! Cache layer that orchestrates caching strategies with network fetching.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::storage::{CacheStorage, CachedResponse};
use super::traits::{request_key, CachePolicy, CacheResult};
use crate::error::{AgentError, NetworkError};
use crate::net::{HttpRequest, HttpResponse, Network};

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the agent and the network, providing the
/// cache-first and network-first read strategies with offline fallback.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Check cache - if present and not expired, return immediately
  /// 2. Otherwise fetch from network and store a cacheable response
  pub async fn cache_first<F, Fut>(
    &self,
    policy: &CachePolicy,
    request: &HttpRequest,
    fetcher: F,
  ) -> Result<CacheResult<HttpResponse>, AgentError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<HttpResponse, NetworkError>>,
  {
    let key = request_key(request);

    if let Some(cached) = lookup(&*self.storage, policy, &key) {
      debug!(url = %request.url, partition = %policy.partition, "Cache hit");
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    let response = fetcher().await?;
    store(&*self.storage, policy, &key, request.url.as_str(), &response);
    Ok(CacheResult::from_network(response))
  }

  /// Fetch with network-first strategy.
  ///
  /// The network attempt runs on its own task. When `timeout` elapses first
  /// the cached copy is served; the attempt keeps running and still updates
  /// the cache if it eventually succeeds. With nothing cached the caller
  /// waits for the network regardless of the timeout.
  pub async fn network_first<F, Fut>(
    &self,
    policy: &CachePolicy,
    request: &HttpRequest,
    timeout: Option<Duration>,
    fetcher: F,
  ) -> Result<CacheResult<HttpResponse>, AgentError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<HttpResponse, NetworkError>> + Send + 'static,
  {
    let key = request_key(request);
    let url = request.url.to_string();

    let fetch = fetcher();
    let mut task = {
      let storage = Arc::clone(&self.storage);
      let policy = policy.clone();
      let key = key.clone();
      let url = url.clone();
      tokio::spawn(async move {
        let response = fetch.await?;
        store(&*storage, &policy, &key, &url, &response);
        Ok::<_, NetworkError>(response)
      })
    };

    let outcome = match timeout {
      Some(limit) => match tokio::time::timeout(limit, &mut task).await {
        Ok(joined) => Some(joined),
        Err(_) => None,
      },
      None => Some((&mut task).await),
    };

    let failure = match outcome {
      Some(Ok(Ok(response))) => return Ok(CacheResult::from_network(response)),
      Some(Ok(Err(e))) => Some(e),
      Some(Err(join)) => Some(NetworkError::Connectivity(join.to_string())),
      None => None,
    };

    if let Some(cached) = lookup(&*self.storage, policy, &key) {
      match &failure {
        Some(e) => warn!(url = %url, error = %e, "Network failed, serving cached response"),
        None => warn!(url = %url, "Network too slow, serving cached response"),
      }
      return Ok(CacheResult::offline(cached.response, cached.cached_at));
    }

    match failure {
      Some(e) => Err(e.into()),
      // Timed out with nothing cached: keep waiting for the network.
      None => match task.await {
        Ok(result) => Ok(CacheResult::from_network(result?)),
        Err(join) => Err(NetworkError::Connectivity(join.to_string()).into()),
      },
    }
  }

  /// Network-first for whole-page loads, falling back to the cached shell page.
  pub async fn navigation<F, Fut>(
    &self,
    pages: &CachePolicy,
    shell: (&CachePolicy, &HttpRequest),
    request: &HttpRequest,
    fetcher: F,
  ) -> Result<CacheResult<HttpResponse>, AgentError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<HttpResponse, NetworkError>> + Send + 'static,
  {
    match self.network_first(pages, request, None, fetcher).await {
      Ok(result) => Ok(result),
      Err(err) => {
        let (shell_policy, shell_request) = shell;
        match lookup(&*self.storage, shell_policy, &request_key(shell_request)) {
          Some(cached) => {
            warn!(url = %request.url, "Navigation offline, serving app shell");
            Ok(CacheResult::offline(cached.response, cached.cached_at))
          }
          None => Err(err),
        }
      }
    }
  }

  /// Seed a partition with a fixed list of requests.
  ///
  /// All-or-nothing: if any fetch fails nothing is stored.
  pub async fn precache(
    &self,
    policy: &CachePolicy,
    requests: Vec<HttpRequest>,
    network: &dyn Network,
  ) -> Result<usize, AgentError> {
    let mut fetched = Vec::with_capacity(requests.len());
    for request in requests {
      let key = request_key(&request);
      let url = request.url.to_string();
      let response = network.send(request).await.map_err(|e| AgentError::Install {
        url: url.clone(),
        reason: e.to_string(),
      })?;
      if response.status != 200 {
        return Err(AgentError::Install {
          url,
          reason: format!("HTTP {}", response.status),
        });
      }
      fetched.push((key, url, response));
    }

    for (key, url, response) in &fetched {
      self.storage.put(&policy.partition, key, url, response)?;
    }
    if let Some(max) = policy.max_entries {
      self.storage.enforce_max_entries(&policy.partition, max)?;
    }

    Ok(fetched.len())
  }

  /// Delete every partition whose name is not in `keep`.
  pub fn retain_partitions(&self, keep: &[String]) -> Result<Vec<String>, AgentError> {
    let mut deleted = Vec::new();
    for name in self.storage.partitions()? {
      if !keep.contains(&name) {
        let entries = self.storage.delete_partition(&name)?;
        info!(partition = %name, entries, "Deleted outdated cache partition");
        deleted.push(name);
      }
    }
    Ok(deleted)
  }

  /// Cached response for a request, if present and fresh.
  pub fn cached(&self, policy: &CachePolicy, request: &HttpRequest) -> Option<CachedResponse> {
    lookup(&*self.storage, policy, &request_key(request))
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}

/// Read an entry, dropping it if it has expired. Storage failures count as a miss.
fn lookup<S: CacheStorage + ?Sized>(
  storage: &S,
  policy: &CachePolicy,
  key: &str,
) -> Option<CachedResponse> {
  let cached = match storage.get(&policy.partition, key) {
    Ok(cached) => cached?,
    Err(e) => {
      warn!(partition = %policy.partition, error = %e, "Cache read failed");
      return None;
    }
  };

  if policy.is_expired(cached.cached_at) {
    if let Err(e) = storage.remove(&policy.partition, key) {
      warn!(partition = %policy.partition, error = %e, "Failed to drop expired entry");
    }
    return None;
  }

  Some(cached)
}

/// Write a cacheable response and apply the partition limits.
///
/// Only status 200 is cached. Write failures are logged, never surfaced:
/// the caller already has its response.
fn store<S: CacheStorage + ?Sized>(
  storage: &S,
  policy: &CachePolicy,
  key: &str,
  url: &str,
  response: &HttpResponse,
) {
  if response.status != 200 {
    return;
  }

  let result = storage.put(&policy.partition, key, url, response).and_then(|_| {
    if let Some(max_age) = policy.max_age {
      let cutoff: DateTime<Utc> = Utc::now() - max_age;
      storage.purge_older_than(&policy.partition, cutoff)?;
    }
    if let Some(max) = policy.max_entries {
      storage.enforce_max_entries(&policy.partition, max)?;
    }
    Ok(())
  });

  if let Err(e) = result {
    warn!(partition = %policy.partition, url, error = %e, "Failed to update cache");
  }
}
