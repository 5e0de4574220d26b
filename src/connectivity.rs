//! Reachability probing for the remote API.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use crate::agent::{AgentEvent, AgentHandle};
use crate::net::Network;

/// Probes the API origin and reports online/offline transitions.
pub struct ConnectivityMonitor {
  network: Arc<dyn Network>,
  probe_url: Url,
  interval: Duration,
  online: bool,
}

impl ConnectivityMonitor {
  /// `online` is the belief before the first probe; only changes from it
  /// produce events.
  pub fn new(network: Arc<dyn Network>, probe_url: Url, interval: Duration, online: bool) -> Self {
    Self {
      network,
      probe_url,
      interval,
      online,
    }
  }

  /// Probe once. Returns an event when reachability changed.
  pub async fn check(&mut self) -> Option<AgentEvent> {
    let reachable = self.network.probe(self.probe_url.clone()).await;
    debug!(url = %self.probe_url, reachable, "Connectivity probe");
    if reachable == self.online {
      return None;
    }
    self.online = reachable;
    Some(if reachable {
      AgentEvent::ConnectivityRegained
    } else {
      AgentEvent::ConnectivityLost
    })
  }

  /// Probe every interval until the agent stops.
  pub fn spawn(mut self, handle: AgentHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(self.interval);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

      loop {
        interval.tick().await;
        if let Some(event) = self.check().await {
          if handle.send(event).is_err() {
            break;
          }
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::FakeNetwork;

  fn monitor(network: Arc<FakeNetwork>, online: bool) -> ConnectivityMonitor {
    ConnectivityMonitor::new(
      network,
      Url::parse("http://127.0.0.1:8000/api/").unwrap(),
      Duration::from_secs(10),
      online,
    )
  }

  #[tokio::test]
  async fn test_reports_only_transitions() {
    let network = FakeNetwork::new();
    let mut monitor = monitor(network.clone(), true);

    assert!(monitor.check().await.is_none());

    network.set_online(false);
    assert!(matches!(
      monitor.check().await,
      Some(AgentEvent::ConnectivityLost)
    ));
    assert!(monitor.check().await.is_none());

    network.set_online(true);
    assert!(matches!(
      monitor.check().await,
      Some(AgentEvent::ConnectivityRegained)
    ));
  }

  #[tokio::test]
  async fn test_any_status_counts_as_reachable() {
    // FakeNetwork answers unknown URLs with 404
    let network = FakeNetwork::new();
    let mut monitor = monitor(network, false);

    assert!(matches!(
      monitor.check().await,
      Some(AgentEvent::ConnectivityRegained)
    ));
  }
}
