use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use super::replay::DeferredSync;
use crate::cache::{CacheLayer, CacheResult, CacheSource, SqliteStorage};
use crate::config::AgentConfig;
use crate::error::{AgentError, NetworkError, StorageError};
use crate::net::{HttpRequest, HttpResponse, Method, Network, RequestMode};
use crate::order::QueuedAck;
use crate::queue::{QueueStore, StoredRequest};

/// How an outgoing request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Order submission: send live, queue on connectivity failure
  CriticalMutation,
  /// Application shell asset: cache-first
  StaticAsset,
  /// Remote read API: network-first with a bounded wait
  ApiRead,
  /// Whole-page load: network-first, falling back to the shell page
  Navigation,
  /// Untouched
  PassThrough,
}

/// Classify a request against the configured origins and routes.
pub fn classify(config: &AgentConfig, request: &HttpRequest) -> Route {
  let url = &request.url;
  let on_api = same_origin(url, &config.api_origin);

  if request.method == Method::POST && url.path() == config.order_path {
    return Route::CriticalMutation;
  }
  if request.method != Method::GET {
    return Route::PassThrough;
  }
  if request.mode == RequestMode::Navigate {
    return Route::Navigation;
  }
  if on_api && url.path().starts_with(&config.api_prefix) && url.path() != config.order_path {
    return Route::ApiRead;
  }
  if same_origin(url, &config.app_origin) {
    return Route::StaticAsset;
  }
  Route::PassThrough
}

fn same_origin(a: &Url, b: &Url) -> bool {
  a.origin() == b.origin()
}

/// Where the response handed back to the application came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Network,
  Cache,
  /// Network unavailable, last cached copy served
  Offline,
  /// Order accepted for later delivery
  Queued,
}

impl From<CacheSource> for ResponseSource {
  fn from(source: CacheSource) -> Self {
    match source {
      CacheSource::Network => ResponseSource::Network,
      CacheSource::Cache => ResponseSource::Cache,
      CacheSource::Offline => ResponseSource::Offline,
    }
  }
}

#[derive(Debug, Clone)]
pub struct Intercepted {
  pub response: HttpResponse,
  pub source: ResponseSource,
}

impl Intercepted {
  pub fn network(response: HttpResponse) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
    }
  }
}

impl From<CacheResult<HttpResponse>> for Intercepted {
  fn from(result: CacheResult<HttpResponse>) -> Self {
    Self {
      response: result.data,
      source: result.source.into(),
    }
  }
}

/// Sits between application instances and the network.
#[derive(Clone)]
pub struct Interceptor {
  config: Arc<AgentConfig>,
  network: Arc<dyn Network>,
  store: Arc<dyn QueueStore>,
  cache: CacheLayer<SqliteStorage>,
  deferred: DeferredSync,
}

impl Interceptor {
  pub fn new(
    config: Arc<AgentConfig>,
    network: Arc<dyn Network>,
    store: Arc<dyn QueueStore>,
    cache: CacheLayer<SqliteStorage>,
    deferred: DeferredSync,
  ) -> Self {
    Self {
      config,
      network,
      store,
      cache,
      deferred,
    }
  }

  /// Handle one intercepted request according to its route.
  pub async fn handle(&self, request: HttpRequest) -> Result<Intercepted, AgentError> {
    let route = classify(&self.config, &request);
    debug!(method = %request.method, url = %request.url, ?route, "Intercepted request");

    match route {
      Route::CriticalMutation => self.submit_order(request).await,
      Route::StaticAsset => {
        let policy = self.config.cache.static_policy();
        let fetch = self.fetcher(replayable(&request)?);
        let result = self.cache.cache_first(&policy, &request, fetch).await?;
        Ok(result.into())
      }
      Route::ApiRead => {
        let policy = self.config.cache.api_policy();
        let timeout = Some(self.config.cache.network_timeout());
        let fetch = self.fetcher(replayable(&request)?);
        let result = self
          .cache
          .network_first(&policy, &request, timeout, fetch)
          .await?;
        Ok(result.into())
      }
      Route::Navigation => {
        let shell = HttpRequest::get(self.config.shell_url()?);
        let fetch = self.fetcher(replayable(&request)?);
        let result = self
          .cache
          .navigation(
            &self.config.cache.pages_policy(),
            (&self.config.cache.static_policy(), &shell),
            &request,
            fetch,
          )
          .await?;
        Ok(result.into())
      }
      Route::PassThrough => Ok(Intercepted::network(self.network.send(request).await?)),
    }
  }

  /// Offline fallback protocol for order submission.
  ///
  /// A response of any status is returned as is; only a failure to reach
  /// the server queues the order. The 202 acknowledgement is returned only
  /// once the order is persisted.
  pub async fn submit_order(&self, request: HttpRequest) -> Result<Intercepted, AgentError> {
    let copy = replayable(&request)?;

    let err = match self.network.send(request).await {
      Ok(response) => {
        if !response.is_success() {
          warn!(status = response.status, "Order rejected by server");
        }
        return Ok(Intercepted::network(response));
      }
      Err(err) => err,
    };

    warn!(url = %copy.url, error = %err, "Could not send order, queueing it for replay");
    let stored = StoredRequest::capture(&copy);
    let id = self.store.enqueue(&stored).map_err(|e| {
      error!(url = %copy.url, error = %e, "Failed to persist offline order");
      e
    })?;
    self.deferred.register();
    info!(id, "Order queued offline");

    let response = QueuedAck::new()
      .into_response()
      .map_err(StorageError::from)?;
    Ok(Intercepted {
      response,
      source: ResponseSource::Queued,
    })
  }

  /// A `'static` network attempt, so network-first reads can outlive the
  /// caller's wait.
  fn fetcher(
    &self,
    request: HttpRequest,
  ) -> impl FnOnce() -> BoxFuture<'static, Result<HttpResponse, NetworkError>> {
    let network = Arc::clone(&self.network);
    move || async move { network.send(request).await }.boxed()
  }
}

fn replayable(request: &HttpRequest) -> Result<HttpRequest, AgentError> {
  request
    .try_clone()
    .ok_or_else(|| AgentError::NonReplayableBody(request.url.to_string()))
}
