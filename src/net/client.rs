use futures::future::{BoxFuture, FutureExt};
use std::time::Duration;
use tracing::warn;
use url::Url;

use super::types::{Headers, HttpRequest, HttpResponse, RequestBody};
use crate::error::NetworkError;

/// The network channel the agent sends requests over.
///
/// A response with any status is `Ok`; only a failure to get a response at
/// all is an error.
pub trait Network: Send + Sync {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, NetworkError>>;

  /// Whether `url` answers at all. Any status counts as reachable.
  fn probe(&self, url: Url) -> BoxFuture<'_, bool> {
    async move { self.send(HttpRequest::head(url)).await.is_ok() }.boxed()
  }
}

/// Network backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self, NetworkError> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("storefront-sync/", env!("CARGO_PKG_VERSION")))
      .connect_timeout(Duration::from_secs(10))
      .build()
      .map_err(|e| NetworkError::Connectivity(format!("failed to build http client: {}", e)))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, NetworkError>> {
    async move {
      let mut builder = self.client.request(request.method, request.url);
      for (name, value) in request.headers.iter() {
        builder = builder.header(name, value);
      }
      if let RequestBody::Buffered(bytes) = request.body {
        builder = builder.body(bytes);
      }

      let response = builder
        .send()
        .await
        .map_err(|e| NetworkError::Connectivity(e.to_string()))?;

      let status = response.status().as_u16();
      let headers: Headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v.to_string())))
        .collect();
      // The status is already known here. A body that breaks off is still a
      // response: the server has seen the request.
      let body = match response.bytes().await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => {
          warn!(status, error = %e, "Response body could not be read");
          Vec::new()
        }
      };

      Ok(HttpResponse {
        status,
        headers,
        body,
      })
    }
    .boxed()
  }
}
