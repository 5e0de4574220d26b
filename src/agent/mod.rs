//! The order-resilience agent.
//!
//! Every request from an application instance passes through the agent once
//! it is active. Order submissions that cannot reach the server are queued
//! and replayed later; reads are served from a versioned cache when the
//! network is slow or gone.

mod control;
mod event;
mod intercept;
mod notifier;
mod replay;

pub use control::{ControlAck, ControlMessage};
pub use event::{spawn_timer, AgentEvent, AgentHandle};
pub use intercept::{Intercepted, Interceptor, ResponseSource};
pub use notifier::{ClientNotifier, SyncNotification};
pub use replay::{CycleOutcome, CycleReport, DeferredSync, ReplayEngine, ReplayTrigger};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheLayer, SqliteStorage};
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::net::{HttpRequest, Network};
use crate::queue::QueueStore;

/// Where the agent is in its install/activate lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
  Parsed,
  Installing,
  /// Installed and waiting to take over
  Installed,
  Activating,
  /// Intercepting requests
  Active,
}

#[derive(Clone)]
pub struct Agent {
  config: Arc<AgentConfig>,
  network: Arc<dyn Network>,
  store: Arc<dyn QueueStore>,
  cache: CacheLayer<SqliteStorage>,
  interceptor: Interceptor,
  replay: ReplayEngine,
  notifier: ClientNotifier,
  deferred: DeferredSync,
  lifecycle: Arc<Mutex<Lifecycle>>,
  online: Arc<AtomicBool>,
}

impl Agent {
  pub fn new(
    config: Arc<AgentConfig>,
    network: Arc<dyn Network>,
    store: Arc<dyn QueueStore>,
    cache: SqliteStorage,
  ) -> Self {
    let cache = CacheLayer::new(cache);
    let notifier = ClientNotifier::default();
    let deferred = DeferredSync::default();
    let interceptor = Interceptor::new(
      Arc::clone(&config),
      Arc::clone(&network),
      Arc::clone(&store),
      cache.clone(),
      deferred.clone(),
    );
    let replay = ReplayEngine::new(
      Arc::clone(&store),
      Arc::clone(&network),
      notifier.clone(),
      deferred.clone(),
      config.replay.max_attempts,
    );
    let online = Arc::new(AtomicBool::new(config.assume_online));

    Self {
      config,
      network,
      store,
      cache,
      interceptor,
      replay,
      notifier,
      deferred,
      lifecycle: Arc::new(Mutex::new(Lifecycle::Parsed)),
      online,
    }
  }

  pub fn lifecycle(&self) -> Lifecycle {
    *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn set_lifecycle(&self, state: Lifecycle) {
    *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) = state;
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Record the connectivity belief. Returns whether it changed.
  pub fn set_online(&self, online: bool) -> bool {
    self.online.swap(online, Ordering::SeqCst) != online
  }

  pub fn notifier(&self) -> &ClientNotifier {
    &self.notifier
  }

  /// Whether an order was queued since the last drain.
  pub fn has_deferred_sync(&self) -> bool {
    self.deferred.is_registered()
  }

  /// Seed the static partition with the application shell.
  ///
  /// A failed precache leaves a fresh agent uninstalled. On an agent that is
  /// already active this only re-seeds the partition; interception carries on
  /// whatever the outcome.
  pub async fn install(&self) -> Result<usize, AgentError> {
    let requests: Vec<HttpRequest> = self
      .config
      .precache_urls()?
      .into_iter()
      .map(HttpRequest::get)
      .collect();

    let reseed = {
      let mut state = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
      match *state {
        Lifecycle::Active | Lifecycle::Activating => true,
        _ => {
          *state = Lifecycle::Installing;
          false
        }
      }
    };

    let policy = self.config.cache.static_policy();
    match self.cache.precache(&policy, requests, &*self.network).await {
      Ok(count) if reseed => {
        info!(assets = count, partition = %policy.partition, "App shell re-seeded");
        Ok(count)
      }
      Ok(count) => {
        self.set_lifecycle(Lifecycle::Installed);
        info!(assets = count, partition = %policy.partition, "Agent installed");
        Ok(count)
      }
      Err(e) if reseed => {
        warn!(error = %e, "App shell re-seed failed, keeping the current cache");
        Err(e)
      }
      Err(e) => {
        self.set_lifecycle(Lifecycle::Parsed);
        error!(error = %e, "Agent install failed");
        Err(e)
      }
    }
  }

  /// Mark the agent installed without seeding the shell, for one-shot
  /// commands that never serve navigations.
  pub fn install_without_precache(&self) {
    let mut state = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
    if *state == Lifecycle::Parsed {
      *state = Lifecycle::Installed;
    }
  }

  /// Take over: drop outdated cache partitions, then drain the queue if it
  /// holds anything and the network is believed reachable.
  ///
  /// Returns the startup drain outcome, if one ran.
  pub async fn activate(&self) -> Result<Option<CycleOutcome>, AgentError> {
    {
      let mut state = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
      match *state {
        Lifecycle::Active | Lifecycle::Activating => return Ok(None),
        Lifecycle::Parsed | Lifecycle::Installing => return Err(AgentError::NotInstalled),
        Lifecycle::Installed => *state = Lifecycle::Activating,
      }
    }

    match self
      .cache
      .retain_partitions(&self.config.cache.partition_names())
    {
      Ok(deleted) if !deleted.is_empty() => {
        info!(count = deleted.len(), "Removed outdated cache partitions")
      }
      Ok(_) => {}
      Err(e) => warn!(error = %e, "Cache cleanup failed"),
    }
    self.set_lifecycle(Lifecycle::Active);
    info!("Agent active");

    let pending = match self.store.count() {
      Ok(pending) => pending,
      Err(e) => {
        error!(error = %e, "Could not read the order queue at startup");
        return Ok(None);
      }
    };
    if pending == 0 {
      return Ok(None);
    }
    if !self.is_online() {
      info!(pending, "Offline at startup, queued orders wait for connectivity");
      return Ok(None);
    }

    info!(pending, "Found queued orders at startup, sending");
    Ok(Some(self.replay.run_cycle(ReplayTrigger::Startup).await?))
  }

  /// Handle a request from an application instance.
  ///
  /// Until the agent is active requests go straight to the network.
  pub async fn fetch(&self, request: HttpRequest) -> Result<Intercepted, AgentError> {
    if self.lifecycle() != Lifecycle::Active {
      debug!(url = %request.url, "Agent not active, bypassing");
      return Ok(Intercepted::network(self.network.send(request).await?));
    }
    self.interceptor.handle(request).await
  }

  pub async fn handle_message(&self, message: ControlMessage) -> ControlAck {
    debug!(kind = message.kind(), "Control message received");
    match message {
      ControlMessage::SkipWaiting => match self.lifecycle() {
        Lifecycle::Active | Lifecycle::Activating => ControlAck::ok(message),
        Lifecycle::Installed => match self.activate().await {
          Ok(_) => ControlAck::ok(message),
          Err(e) => ControlAck::failed(message, e),
        },
        _ => ControlAck::failed(message, AgentError::NotInstalled),
      },
      ControlMessage::SyncOrdersNow => match self.replay.run_cycle(ReplayTrigger::Explicit).await {
        Ok(CycleOutcome::Completed(report)) => ControlAck::ok(message).with_report(report),
        Ok(CycleOutcome::Coalesced) => ControlAck::ok(message),
        Err(e) => {
          error!(error = %e, "Requested sync failed");
          ControlAck::failed(message, e)
        }
      },
    }
  }

  /// Route one event. Fetches, messages and drain cycles run on their own
  /// tasks so a slow network never blocks the loop.
  pub async fn dispatch(&self, event: AgentEvent) {
    match event {
      AgentEvent::Install => {
        // Already logged by install()
        let _ = self.install().await;
      }
      AgentEvent::Activate => {
        if let Err(e) = self.activate().await {
          error!(error = %e, "Activation failed");
        }
      }
      AgentEvent::FetchIntercepted { request, reply } => {
        let agent = self.clone();
        tokio::spawn(async move {
          let result = agent.fetch(request).await;
          let _ = reply.send(result);
        });
      }
      AgentEvent::MessageReceived { message, reply } => {
        let agent = self.clone();
        tokio::spawn(async move {
          let ack = agent.handle_message(message).await;
          if let Some(reply) = reply {
            let _ = reply.send(ack);
          }
        });
      }
      AgentEvent::ConnectivityRegained => {
        if self.set_online(true) {
          info!("Connectivity regained");
        }
        self.spawn_replay(ReplayTrigger::ConnectivityRegained);
      }
      AgentEvent::ConnectivityLost => {
        if self.set_online(false) {
          warn!("Connectivity lost");
        }
      }
      AgentEvent::TimerTick => {
        if self.is_online() {
          self.spawn_replay(ReplayTrigger::Timer);
        }
      }
    }
  }

  fn spawn_replay(&self, trigger: ReplayTrigger) {
    if self.lifecycle() != Lifecycle::Active {
      return;
    }
    if self.deferred.is_registered() {
      info!(?trigger, "Retrying orders deferred while offline");
    }
    let replay = self.replay.clone();
    tokio::spawn(async move {
      if let Err(e) = replay.run_cycle(trigger).await {
        error!(?trigger, error = %e, "Drain cycle failed");
      }
    });
  }

  /// Process events until every handle is dropped.
  pub async fn run(self, mut events: mpsc::UnboundedReceiver<AgentEvent>) {
    while let Some(event) = events.recv().await {
      self.dispatch(event).await;
    }
    debug!("Agent event loop stopped");
  }

  /// Start the event loop on its own task.
  pub fn spawn(self) -> AgentHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(self.run(rx));
    AgentHandle::new(tx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheStorage;
  use crate::config::StoreConfig;
  use crate::net::HttpResponse;
  use crate::order::{CreateOrder, OrderItem};
  use crate::queue::{SqliteQueueStore, StoredRequest};
  use crate::testing::FakeNetwork;
  use std::time::Duration;
  use url::Url;

  const ORDER_URL: &str = "http://127.0.0.1:8000/api/orders/create/";

  fn agent(network: Arc<FakeNetwork>) -> (Agent, Arc<SqliteQueueStore>) {
    let store = Arc::new(SqliteQueueStore::open_in_memory(&StoreConfig::default()).unwrap());
    let agent = Agent::new(
      Arc::new(AgentConfig::default()),
      network,
      store.clone(),
      SqliteStorage::open_in_memory().unwrap(),
    );
    (agent, store)
  }

  fn order(product_id: u64) -> HttpRequest {
    CreateOrder::new(vec![OrderItem {
      product_id,
      quantity: 1,
    }])
    .into_request(Url::parse(ORDER_URL).unwrap(), None)
    .unwrap()
  }

  fn respond_to_shell(network: &FakeNetwork) {
    for url in AgentConfig::default().precache_urls().unwrap() {
      network.respond(url.as_str(), HttpResponse::new(200, "asset"));
    }
  }

  async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
      if condition() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
  }

  #[tokio::test]
  async fn test_install_then_activate() {
    let network = FakeNetwork::new();
    respond_to_shell(&network);
    let (agent, _) = agent(network);

    assert_eq!(agent.install().await.unwrap(), 5);
    assert_eq!(agent.lifecycle(), Lifecycle::Installed);

    assert_eq!(agent.activate().await.unwrap(), None);
    assert_eq!(agent.lifecycle(), Lifecycle::Active);
  }

  #[tokio::test]
  async fn test_failed_install_cannot_activate() {
    let network = FakeNetwork::new();
    network.set_online(false);
    let (agent, _) = agent(network);

    assert!(matches!(agent.install().await, Err(AgentError::Install { .. })));
    assert_eq!(agent.lifecycle(), Lifecycle::Parsed);
    assert!(matches!(agent.activate().await, Err(AgentError::NotInstalled)));
  }

  #[tokio::test]
  async fn test_activation_drains_orders_left_by_previous_run() {
    let network = FakeNetwork::new();
    network.respond(ORDER_URL, HttpResponse::new(201, "{}"));
    let (agent, store) = agent(network.clone());
    for id in 1..=3 {
      store.enqueue(&StoredRequest::capture(&order(id))).unwrap();
    }

    agent.install_without_precache();
    let outcome = agent.activate().await.unwrap();

    match outcome {
      Some(CycleOutcome::Completed(report)) => {
        assert_eq!(report.attempted, 3);
        assert_eq!(report.sent, 3);
      }
      other => panic!("expected a startup drain, got {:?}", other),
    }
    assert_eq!(network.call_count(ORDER_URL), 3);
    assert_eq!(store.count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_activation_offline_leaves_queue_alone() {
    let network = FakeNetwork::new();
    let (agent, store) = agent(network.clone());
    store.enqueue(&StoredRequest::capture(&order(1))).unwrap();
    agent.set_online(false);

    agent.install_without_precache();
    assert_eq!(agent.activate().await.unwrap(), None);
    assert_eq!(network.total_calls(), 0);
    assert_eq!(store.count().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_activation_drops_outdated_partitions() {
    let (agent, _) = agent(FakeNetwork::new());
    let ok = HttpResponse::new(200, "x");
    agent.cache.storage().put("api-cache-v2", "k", "u", &ok).unwrap();

    agent.install_without_precache();
    agent.activate().await.unwrap();

    assert!(agent.cache.storage().partitions().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_fetch_bypasses_agent_until_active() {
    let network = FakeNetwork::new();
    network.set_online(false);
    let (agent, store) = agent(network);

    let result = agent.fetch(order(1)).await;

    assert!(matches!(result, Err(AgentError::Network(_))));
    assert_eq!(store.count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_skip_waiting_activates_installed_agent() {
    let (agent, _) = agent(FakeNetwork::new());

    let refused = agent.handle_message(ControlMessage::SkipWaiting).await;
    assert!(!refused.success);

    agent.install_without_precache();
    let ack = agent.handle_message(ControlMessage::SkipWaiting).await;
    assert!(ack.success);
    assert_eq!(ack.kind, "SKIP_WAITING");
    assert_eq!(agent.lifecycle(), Lifecycle::Active);
  }

  #[tokio::test]
  async fn test_sync_orders_now_reports_cycle() {
    let network = FakeNetwork::new();
    network.respond(ORDER_URL, HttpResponse::new(201, "{}"));
    let (agent, store) = agent(network);
    store.enqueue(&StoredRequest::capture(&order(7))).unwrap();

    let ack = agent.handle_message(ControlMessage::SyncOrdersNow).await;

    assert!(ack.success);
    assert_eq!(ack.report.unwrap().sent, 1);
    assert_eq!(store.count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_offline_order_then_reconnect_notifies_clients() {
    let network = FakeNetwork::new();
    network.respond(ORDER_URL, HttpResponse::new(201, "{}"));
    network.set_online(false);
    let (agent, store) = agent(network.clone());
    let mut app = agent.notifier().subscribe();
    agent.install_without_precache();
    agent.set_online(false);
    let handle = agent.clone().spawn();
    handle.send(AgentEvent::Activate).unwrap();

    let queued = handle.fetch(order(3)).await.unwrap();
    assert_eq!(queued.source, ResponseSource::Queued);
    assert_eq!(queued.response.status, 202);
    assert_eq!(store.count().unwrap(), 1);
    assert!(agent.has_deferred_sync());

    network.set_online(true);
    handle.send(AgentEvent::ConnectivityRegained).unwrap();

    let notification = tokio::time::timeout(Duration::from_secs(1), app.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(notification, SyncNotification::OrdersSynced { count: 1 });
    assert_eq!(store.count().unwrap(), 0);
    assert!(!agent.has_deferred_sync());
  }

  #[tokio::test]
  async fn test_install_event_on_active_agent_keeps_intercepting() {
    let network = FakeNetwork::new();
    let (agent, store) = agent(network.clone());
    agent.install_without_precache();
    agent.activate().await.unwrap();
    network.set_online(false);

    agent.dispatch(AgentEvent::Install).await;
    assert_eq!(agent.lifecycle(), Lifecycle::Active);

    let result = agent.fetch(order(4)).await.unwrap();
    assert_eq!(result.source, ResponseSource::Queued);
    assert_eq!(store.count().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_install_event_on_active_agent_reseeds_shell() {
    let network = FakeNetwork::new();
    respond_to_shell(&network);
    let (agent, _) = agent(network.clone());
    agent.install_without_precache();
    agent.activate().await.unwrap();

    agent.dispatch(AgentEvent::Install).await;

    assert_eq!(agent.lifecycle(), Lifecycle::Active);
    let static_partition = AgentConfig::default().cache.static_partition();
    assert_eq!(agent.cache.storage().count(&static_partition).unwrap(), 5);
  }

  #[tokio::test]
  async fn test_install_event_on_fresh_agent_installs() {
    let network = FakeNetwork::new();
    respond_to_shell(&network);
    let (agent, _) = agent(network);

    agent.dispatch(AgentEvent::Install).await;

    assert_eq!(agent.lifecycle(), Lifecycle::Installed);
  }

  #[tokio::test]
  async fn test_timer_tick_ignored_while_offline() {
    let network = FakeNetwork::new();
    network.respond(ORDER_URL, HttpResponse::new(201, "{}"));
    let (agent, store) = agent(network.clone());
    store.enqueue(&StoredRequest::capture(&order(1))).unwrap();
    agent.set_online(false);
    agent.install_without_precache();
    agent.activate().await.unwrap();

    agent.dispatch(AgentEvent::TimerTick).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(network.total_calls(), 0);

    agent.set_online(true);
    agent.dispatch(AgentEvent::TimerTick).await;
    wait_for(|| store.count().unwrap() == 0).await;
    assert_eq!(network.call_count(ORDER_URL), 1);
  }

  #[tokio::test]
  async fn test_post_message_through_handle() {
    let (agent, _) = agent(FakeNetwork::new());
    agent.install_without_precache();
    let handle = agent.spawn();

    let ack = handle
      .post_message(ControlMessage::SyncOrdersNow)
      .await
      .unwrap();

    assert!(ack.success);
    assert_eq!(ack.report, Some(CycleReport::default()));
  }
}
