//! Error taxonomy shared by the queue, cache and agent.
//!
//! A server that answers with a non-success status is not an error here: the
//! response is handed back to the caller untouched.

/// The request never produced a response (DNS, refused connection, offline).
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkError {
  #[error("network unreachable: {0}")]
  Connectivity(String),
}

/// The persistence layer could not complete an operation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),

  #[error("lock poisoned: {0}")]
  Poisoned(String),

  #[error("queued request is missing its {0}")]
  MissingField(&'static str),

  #[error("queued request has an invalid {field} '{value}'")]
  InvalidField { field: &'static str, value: String },
}

/// Errors surfaced by agent operations.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
  /// The request body was already consumed and cannot be read a second time
  /// for queueing, so the order would be lost if the send failed.
  #[error("request body for {0} cannot be replayed")]
  NonReplayableBody(String),

  #[error(transparent)]
  Storage(#[from] StorageError),

  #[error(transparent)]
  Network(#[from] NetworkError),

  #[error("install failed: could not precache {url}: {reason}")]
  Install { url: String, reason: String },

  #[error("invalid url: {0}")]
  InvalidUrl(#[from] url::ParseError),

  #[error("no installed agent version is waiting to activate")]
  NotInstalled,

  #[error("agent has shut down")]
  Closed,
}

pub type StorageResult<T> = Result<T, StorageError>;
