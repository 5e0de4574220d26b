//! Request and response values exchanged between applications, the agent and
//! the network.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

pub use reqwest::Method;

/// Header map with case-insensitive, unique names.
///
/// Names are stored lower-cased so a lookup for `Authorization` and
/// `authorization` hits the same entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
  pub fn new() -> Self {
    Self::default()
  }

  /// Insert a header, replacing any previous value with the same name.
  pub fn insert(&mut self, name: &str, value: impl Into<String>) {
    self.0.insert(name.to_ascii_lowercase(), value.into());
  }

  pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
    self.insert(name, value);
    self
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Keep only the listed header names.
  pub fn allow_listed(&self, names: &[&str]) -> Headers {
    let mut kept = Headers::new();
    for name in names {
      if let Some(value) = self.get(name) {
        kept.insert(name, value);
      }
    }
    kept
  }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    let mut headers = Headers::new();
    for (name, value) in iter {
      headers.insert(name.as_ref(), value);
    }
    headers
  }
}

/// Body of an outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
  Empty,
  Buffered(Vec<u8>),
  /// A one-shot body stream that has already been read. It can still be sent
  /// once but cannot be copied.
  Consumed,
}

impl RequestBody {
  pub fn as_bytes(&self) -> &[u8] {
    match self {
      RequestBody::Buffered(bytes) => bytes,
      RequestBody::Empty | RequestBody::Consumed => &[],
    }
  }
}

/// How the request was issued by the application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  #[default]
  Default,
  /// A whole-page load.
  Navigate,
}

#[derive(Debug, PartialEq, Eq)]
pub struct HttpRequest {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: RequestBody,
  pub mode: RequestMode,
}

impl HttpRequest {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Headers::new(),
      body: RequestBody::Empty,
      mode: RequestMode::Default,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn head(url: Url) -> Self {
    Self::new(Method::HEAD, url)
  }

  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  /// Build a request carrying a JSON body.
  pub fn json<T: Serialize>(method: Method, url: Url, payload: &T) -> serde_json::Result<Self> {
    let body = serde_json::to_vec(payload)?;
    Ok(Self {
      headers: Headers::new().with("content-type", "application/json"),
      body: RequestBody::Buffered(body),
      ..Self::new(method, url)
    })
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name, value);
    self
  }

  /// Copy the request so its body can be read twice.
  ///
  /// Returns `None` when the body has already been consumed.
  pub fn try_clone(&self) -> Option<HttpRequest> {
    if self.body == RequestBody::Consumed {
      return None;
    }
    Some(HttpRequest {
      method: self.method.clone(),
      url: self.url.clone(),
      headers: self.headers.clone(),
      body: self.body.clone(),
      mode: self.mode,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl HttpResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Headers::new(),
      body: body.into(),
    }
  }

  /// Build a response with a serialized JSON body.
  pub fn json<T: Serialize>(status: u16, payload: &T) -> serde_json::Result<Self> {
    Ok(Self {
      status,
      headers: Headers::new().with("content-type", "application/json"),
      body: serde_json::to_vec(payload)?,
    })
  }

  /// Whether the status is in the 2xx range.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn parse_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
    serde_json::from_slice(&self.body)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}
