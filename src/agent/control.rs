//! Control messages sent to the agent by application instances.

use serde::{Deserialize, Serialize};

use super::replay::CycleReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate a waiting agent version immediately
  SkipWaiting,
  /// Run a drain cycle now
  SyncOrdersNow,
}

impl ControlMessage {
  pub fn kind(&self) -> &'static str {
    match self {
      ControlMessage::SkipWaiting => "SKIP_WAITING",
      ControlMessage::SyncOrdersNow => "SYNC_ORDERS_NOW",
    }
  }
}

/// Acknowledgement for a control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlAck {
  pub success: bool,
  #[serde(rename = "type")]
  pub kind: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  /// Result of the drain cycle for SYNC_ORDERS_NOW, when one ran
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub report: Option<CycleReport>,
}

impl ControlAck {
  pub fn ok(message: ControlMessage) -> Self {
    Self {
      success: true,
      kind: message.kind().to_string(),
      error: None,
      report: None,
    }
  }

  pub fn failed(message: ControlMessage, error: impl ToString) -> Self {
    Self {
      success: false,
      error: Some(error.to_string()),
      ..Self::ok(message)
    }
  }

  pub fn with_report(mut self, report: CycleReport) -> Self {
    self.report = Some(report);
    self
  }
}
