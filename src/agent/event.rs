use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::control::{ControlAck, ControlMessage};
use super::intercept::Intercepted;
use crate::error::AgentError;
use crate::net::HttpRequest;

/// Inbound agent events
#[derive(Debug)]
pub enum AgentEvent {
  /// Seed the static partition for a new agent version
  Install,
  /// Take over from the previous version and check the queue
  Activate,
  /// A request issued by an application instance
  FetchIntercepted {
    request: HttpRequest,
    reply: oneshot::Sender<Result<Intercepted, AgentError>>,
  },
  /// A control message from an application instance
  MessageReceived {
    message: ControlMessage,
    reply: Option<oneshot::Sender<ControlAck>>,
  },
  ConnectivityRegained,
  ConnectivityLost,
  /// Periodic replay tick
  TimerTick,
}

/// Sending side of the agent's event loop.
#[derive(Clone)]
pub struct AgentHandle {
  tx: mpsc::UnboundedSender<AgentEvent>,
}

impl AgentHandle {
  pub(super) fn new(tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
    Self { tx }
  }

  /// Queue an event for the agent.
  pub fn send(&self, event: AgentEvent) -> Result<(), AgentError> {
    self.tx.send(event).map_err(|_| AgentError::Closed)
  }

  /// Issue a request through the agent and wait for its response.
  pub async fn fetch(&self, request: HttpRequest) -> Result<Intercepted, AgentError> {
    let (reply, rx) = oneshot::channel();
    self.send(AgentEvent::FetchIntercepted { request, reply })?;
    rx.await.map_err(|_| AgentError::Closed)?
  }

  /// Send a control message and wait for the acknowledgement.
  pub async fn post_message(&self, message: ControlMessage) -> Result<ControlAck, AgentError> {
    let (reply, rx) = oneshot::channel();
    self.send(AgentEvent::MessageReceived {
      message,
      reply: Some(reply),
    })?;
    rx.await.map_err(|_| AgentError::Closed)
  }
}

/// Spawn a timer that sends a tick every `period` until the agent stops.
pub fn spawn_timer(handle: AgentHandle, period: Duration) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    interval.tick().await;

    loop {
      interval.tick().await;
      if handle.send(AgentEvent::TimerTick).is_err() {
        break;
      }
    }
  })
}
