use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use url::Url;

use crate::error::{StorageError, StorageResult};
use crate::net::{Headers, HttpRequest, Method, RequestBody};

/// Headers carried over from an intercepted order into the queue.
pub const QUEUED_HEADERS: &[&str] = &["content-type", "authorization"];

/// What is needed to rebuild a request later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRequest {
  pub url: String,
  pub method: String,
  pub headers: Headers,
  /// Decoded JSON body; an empty object when the original could not be read
  pub body: Value,
}

impl StoredRequest {
  /// Snapshot an intercepted request for queueing.
  ///
  /// Only allow-listed headers are kept. A body that is not valid JSON is
  /// stored as an empty object rather than failing the whole fallback.
  pub fn capture(request: &HttpRequest) -> Self {
    let mut headers = request.headers.allow_listed(QUEUED_HEADERS);
    if headers.get("content-type").is_none() {
      headers.insert("content-type", "application/json");
    }

    let raw = request.body.as_bytes();
    let body = if raw.is_empty() {
      empty_body()
    } else {
      match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(e) => {
          warn!(
            url = %request.url,
            error = %e,
            "Order body is not valid JSON, queueing empty body"
          );
          empty_body()
        }
      }
    };

    Self {
      url: request.url.to_string(),
      method: request.method.as_str().to_string(),
      headers,
      body,
    }
  }

  /// Rebuild a live request from the stored fields.
  pub fn to_request(&self) -> StorageResult<HttpRequest> {
    let url = Url::parse(&self.url).map_err(|_| StorageError::InvalidField {
      field: "url",
      value: self.url.clone(),
    })?;
    let method =
      Method::from_bytes(self.method.as_bytes()).map_err(|_| StorageError::InvalidField {
        field: "method",
        value: self.method.clone(),
      })?;
    let body = match &self.body {
      Value::Null => empty_body(),
      other => other.clone(),
    };
    let bytes = serde_json::to_vec(&body)?;

    let mut headers = self.headers.clone();
    if headers.is_empty() {
      headers.insert("content-type", "application/json");
    }

    Ok(HttpRequest {
      headers,
      body: RequestBody::Buffered(bytes),
      ..HttpRequest::new(method, url)
    })
  }
}

fn empty_body() -> Value {
  Value::Object(serde_json::Map::new())
}

/// A persisted unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
  /// Assigned by the store, strictly increasing
  pub id: i64,
  pub created_at: DateTime<Utc>,
  /// Failed replay attempts so far
  pub attempts: u32,
  pub request: StoredRequest,
}

/// An entry that was given up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
  pub entry: QueuedRequest,
  pub reason: String,
  pub failed_at: DateTime<Utc>,
}
