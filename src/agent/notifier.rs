use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Message broadcast to application instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncNotification {
  /// Queued orders were delivered during a replay cycle
  OrdersSynced { count: usize },
}

/// Fans sync notifications out to every live application instance.
///
/// Delivery is best-effort: an instance that is not subscribed when a cycle
/// reports misses that notification.
#[derive(Clone)]
pub struct ClientNotifier {
  tx: broadcast::Sender<SyncNotification>,
}

impl ClientNotifier {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity);
    Self { tx }
  }

  /// Register an application instance.
  pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
    self.tx.subscribe()
  }

  /// Tell every instance that `count` orders were sent. Returns how many
  /// instances were reached.
  pub fn notify_synced(&self, count: usize) -> usize {
    match self.tx.send(SyncNotification::OrdersSynced { count }) {
      Ok(reached) => reached,
      Err(_) => {
        debug!(count, "No application instance listening for sync notifications");
        0
      }
    }
  }
}

impl Default for ClientNotifier {
  fn default() -> Self {
    Self::new(16)
  }
}
