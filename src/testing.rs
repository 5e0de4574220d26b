//! Test doubles shared by the unit tests.

use futures::future::{BoxFuture, FutureExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{NetworkError, StorageError, StorageResult};
use crate::net::{HttpRequest, HttpResponse, Network};
use crate::queue::{DeadLetter, QueueStore, QueuedRequest, StoredRequest};

/// Scripted network: per-URL responses, an online switch and a call log.
///
/// Unknown URLs answer 404. One-shot responses are used before the
/// persistent one for the same URL.
#[derive(Default)]
pub struct FakeNetwork {
  online: AtomicBool,
  responses: Mutex<HashMap<String, HttpResponse>>,
  one_shot: Mutex<HashMap<String, VecDeque<HttpResponse>>>,
  calls: Mutex<Vec<String>>,
  bodies: Mutex<Vec<Vec<u8>>>,
  delay: Mutex<Option<Duration>>,
}

impl FakeNetwork {
  pub fn new() -> Arc<Self> {
    let network = Self::default();
    network.online.store(true, Ordering::SeqCst);
    Arc::new(network)
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn respond(&self, url: &str, response: HttpResponse) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn respond_once(&self, url: &str, response: HttpResponse) {
    self
      .one_shot
      .lock()
      .unwrap()
      .entry(url.to_string())
      .or_default()
      .push_back(response);
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn call_count(&self, url: &str) -> usize {
    self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
  }

  pub fn total_calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  /// Bodies of every request sent, in order.
  pub fn sent_bodies(&self) -> Vec<Vec<u8>> {
    self.bodies.lock().unwrap().clone()
  }
}

impl Network for FakeNetwork {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, NetworkError>> {
    async move {
      let url = request.url.to_string();
      self.calls.lock().unwrap().push(url.clone());
      self
        .bodies
        .lock()
        .unwrap()
        .push(request.body.as_bytes().to_vec());

      let delay = *self.delay.lock().unwrap();
      if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
      }

      if !self.online.load(Ordering::SeqCst) {
        return Err(NetworkError::Connectivity("offline".to_string()));
      }

      let once = self
        .one_shot
        .lock()
        .unwrap()
        .get_mut(&url)
        .and_then(VecDeque::pop_front);
      if let Some(response) = once {
        return Ok(response);
      }

      Ok(
        self
          .responses
          .lock()
          .unwrap()
          .get(&url)
          .cloned()
          .unwrap_or_else(|| HttpResponse::new(404, "")),
      )
    }
    .boxed()
  }
}

/// Queue store whose every operation fails, as a full or locked disk would.
pub struct BrokenStore;

fn broken<T>() -> StorageResult<T> {
  Err(StorageError::Io(std::io::Error::other("disk full")))
}

impl QueueStore for BrokenStore {
  fn enqueue(&self, _request: &StoredRequest) -> StorageResult<i64> {
    broken()
  }

  fn requeue(&self, _entry: &QueuedRequest) -> StorageResult<i64> {
    broken()
  }

  fn drain_all(&self) -> StorageResult<Vec<QueuedRequest>> {
    broken()
  }

  fn count(&self) -> StorageResult<usize> {
    broken()
  }

  fn peek_all(&self) -> StorageResult<Vec<QueuedRequest>> {
    broken()
  }

  fn dead_letter(&self, _entry: &QueuedRequest, _reason: &str) -> StorageResult<()> {
    broken()
  }

  fn dead_letters(&self) -> StorageResult<Vec<DeadLetter>> {
    broken()
  }
}
