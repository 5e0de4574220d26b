//! Drain cycles: resend every queued order, requeue the failures, report
//! the successes.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::notifier::ClientNotifier;
use crate::error::StorageError;
use crate::net::Network;
use crate::queue::{QueueStore, QueuedRequest};

/// What started a drain cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayTrigger {
  ConnectivityRegained,
  /// SYNC_ORDERS_NOW from an application instance
  Explicit,
  Timer,
  /// Agent activation found a non-empty queue
  Startup,
}

/// Counters for one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
  pub attempted: usize,
  pub sent: usize,
  pub requeued: usize,
  pub dead_lettered: usize,
  /// Application instances that received the sync notification
  pub notified: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
  Completed(CycleReport),
  /// Another cycle was already running; this trigger was dropped.
  Coalesced,
}

/// Flag recording that a background retry was asked for. Advisory only: the
/// timer and connectivity triggers drain the queue whether or not it is set.
#[derive(Debug, Clone, Default)]
pub struct DeferredSync(Arc<AtomicBool>);

impl DeferredSync {
  pub fn register(&self) {
    if !self.0.swap(true, Ordering::SeqCst) {
      debug!("Deferred order sync registered");
    }
  }

  pub fn is_registered(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }

  fn clear(&self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

/// Resets the draining flag when a cycle ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

/// Outcome of resending one entry.
enum Delivery {
  Sent,
  Failed(String),
  /// The stored entry cannot be turned back into a request.
  Invalid(String),
}

#[derive(Clone)]
pub struct ReplayEngine {
  store: Arc<dyn QueueStore>,
  network: Arc<dyn Network>,
  notifier: ClientNotifier,
  deferred: DeferredSync,
  max_attempts: Option<u32>,
  draining: Arc<AtomicBool>,
}

impl ReplayEngine {
  pub fn new(
    store: Arc<dyn QueueStore>,
    network: Arc<dyn Network>,
    notifier: ClientNotifier,
    deferred: DeferredSync,
    max_attempts: Option<u32>,
  ) -> Self {
    Self {
      store,
      network,
      notifier,
      deferred,
      max_attempts,
      draining: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn is_draining(&self) -> bool {
    self.draining.load(Ordering::SeqCst)
  }

  /// Run one drain cycle.
  ///
  /// Entries are sent in store order from a single snapshot; orders queued
  /// while the cycle runs wait for the next trigger. A storage error from the
  /// initial drain leaves the queue untouched. A failed requeue is logged and
  /// reported after the rest of the cycle has finished.
  pub async fn run_cycle(&self, trigger: ReplayTrigger) -> Result<CycleOutcome, StorageError> {
    if self
      .draining
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      debug!(?trigger, "Drain already in progress, coalescing trigger");
      return Ok(CycleOutcome::Coalesced);
    }
    let _guard = DrainGuard(&self.draining);

    self.deferred.clear();
    let entries = self.store.drain_all()?;
    if entries.is_empty() {
      debug!(?trigger, "No queued orders");
      return Ok(CycleOutcome::Completed(CycleReport::default()));
    }

    info!(?trigger, count = entries.len(), "Sending queued orders");

    let mut report = CycleReport {
      attempted: entries.len(),
      ..CycleReport::default()
    };
    let mut lost: Option<StorageError> = None;

    for entry in entries {
      let reason = match self.deliver(&entry).await {
        Delivery::Sent => {
          report.sent += 1;
          continue;
        }
        Delivery::Invalid(reason) => {
          if let Err(e) = self.store.dead_letter(&entry, &reason) {
            error!(id = entry.id, error = %e, "Failed to park invalid order");
            lost.get_or_insert(e);
          } else {
            report.dead_lettered += 1;
          }
          continue;
        }
        Delivery::Failed(reason) => reason,
      };

      match self.settle_failure(&entry, &reason) {
        Ok(true) => report.dead_lettered += 1,
        Ok(false) => report.requeued += 1,
        Err(e) => {
          error!(id = entry.id, error = %e, "Failed to requeue order, it is lost");
          lost.get_or_insert(e);
        }
      }
    }

    if report.sent > 0 {
      report.notified = self.notifier.notify_synced(report.sent);
      info!("{} offline order(s) sent to server", report.sent);
    }
    info!(
      sent = report.sent,
      requeued = report.requeued,
      dead_lettered = report.dead_lettered,
      "Drain cycle finished"
    );

    match lost {
      Some(e) => Err(e),
      None => Ok(CycleOutcome::Completed(report)),
    }
  }

  async fn deliver(&self, entry: &QueuedRequest) -> Delivery {
    let request = match entry.request.to_request() {
      Ok(request) => request,
      Err(e) => {
        warn!(id = entry.id, error = %e, "Queued order cannot be rebuilt");
        return Delivery::Invalid(e.to_string());
      }
    };

    debug!(id = entry.id, url = %request.url, "Resending queued order");
    match self.network.send(request).await {
      Ok(response) if response.is_success() => {
        debug!(id = entry.id, status = response.status, "Queued order delivered");
        Delivery::Sent
      }
      Ok(response) => {
        warn!(
          id = entry.id,
          status = response.status,
          body = %response.text(),
          "Queued order rejected"
        );
        Delivery::Failed(format!("HTTP {}", response.status))
      }
      Err(e) => {
        warn!(id = entry.id, error = %e, "Queued order send failed");
        Delivery::Failed(e.to_string())
      }
    }
  }

  /// Requeue a failed entry, or park it once it has used up its attempts.
  /// Returns whether it was parked.
  fn settle_failure(&self, entry: &QueuedRequest, reason: &str) -> Result<bool, StorageError> {
    let attempts = entry.attempts.saturating_add(1);
    if let Some(max) = self.max_attempts {
      if attempts >= max {
        warn!(id = entry.id, attempts, %reason, "Giving up on queued order");
        self.store.dead_letter(entry, reason)?;
        return Ok(true);
      }
    }
    self.store.requeue(entry)?;
    Ok(false)
  }
}
