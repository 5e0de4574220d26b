//! Core types for the caching system.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::net::HttpRequest;

/// Freshness and size rules for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
  /// Partition name, including its version tag
  pub partition: String,
  /// Oldest entries are evicted beyond this count
  pub max_entries: Option<usize>,
  /// Entries older than this are treated as absent
  pub max_age: Option<chrono::Duration>,
}

impl CachePolicy {
  pub fn unbounded(partition: impl Into<String>) -> Self {
    Self {
      partition: partition.into(),
      max_entries: None,
      max_age: None,
    }
  }

  /// Check if an entry cached at `cached_at` has outlived the policy.
  pub fn is_expired(&self, cached_at: DateTime<Utc>) -> bool {
    match self.max_age {
      Some(max_age) => Utc::now() - cached_at > max_age,
      None => false,
    }
  }
}

/// Stable lookup key for a request: method plus full URL, query included.
pub fn request_key(request: &HttpRequest) -> String {
  let input = format!("{} {}", request.method.as_str(), request.url.as_str());

  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from a cache hit.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from cache without touching the network
  Cache,
  /// Network unavailable or too slow, serving the last cached copy
  Offline,
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  #[test]
  fn test_request_key_includes_query() {
    let a = HttpRequest::get(Url::parse("http://api.test/api/products/?page=1").unwrap());
    let b = HttpRequest::get(Url::parse("http://api.test/api/products/?page=2").unwrap());
    let a2 = HttpRequest::get(Url::parse("http://api.test/api/products/?page=1").unwrap());

    assert_ne!(request_key(&a), request_key(&b));
    assert_eq!(request_key(&a), request_key(&a2));
    assert_eq!(request_key(&a).len(), 64);
  }

  #[test]
  fn test_policy_expiry() {
    let policy = CachePolicy {
      partition: "api-cache-v3".to_string(),
      max_entries: None,
      max_age: Some(chrono::Duration::minutes(5)),
    };

    assert!(!policy.is_expired(Utc::now()));
    assert!(policy.is_expired(Utc::now() - chrono::Duration::minutes(6)));
    assert!(!CachePolicy::unbounded("pages").is_expired(Utc::now() - chrono::Duration::days(365)));
  }
}
