use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::CachePolicy;

/// Agent configuration.
///
/// Loaded once at startup and shared read-only afterwards.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
  /// Origin of the remote storefront API
  pub api_origin: Url,
  /// Path prefix of read API routes
  pub api_prefix: String,
  /// Path of the order submission route
  pub order_path: String,
  /// Origin the application shell is served from
  pub app_origin: Url,
  /// Where the queue and cache databases live
  pub data_dir: Option<PathBuf>,
  /// Connectivity belief before the first probe completes
  pub assume_online: bool,
  pub store: StoreConfig,
  pub cache: CacheConfig,
  pub replay: ReplayConfig,
  pub connectivity: ConnectivityConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  pub name: String,
  /// Bumping this re-runs schema creation on open
  pub version: u32,
  pub table: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Version tag appended to every partition name
  pub version: String,
  /// How long network-first reads wait before using the cache
  pub network_timeout_secs: u64,
  /// Cached page served for navigations while offline
  pub shell_page: String,
  /// Static shell assets seeded at install time
  pub precache: Vec<String>,
  pub static_assets: PartitionLimits,
  pub api: PartitionLimits,
  pub pages: PartitionLimits,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PartitionLimits {
  pub max_entries: Option<usize>,
  pub max_age_secs: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
  /// Period of the replay timer while online
  pub interval_secs: u64,
  /// Move an entry to the dead-letter table after this many failed sends.
  /// Unset means retry forever.
  pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub probe_interval_secs: u64,
  /// Path on the API origin used to probe reachability
  pub probe_path: String,
}

fn default_url(s: &str) -> Url {
  Url::parse(s).expect("built-in default URL is valid")
}

impl Default for AgentConfig {
  fn default() -> Self {
    Self {
      api_origin: default_url("http://127.0.0.1:8000"),
      api_prefix: "/api/".to_string(),
      order_path: "/api/orders/create/".to_string(),
      app_origin: default_url("http://localhost:5173"),
      data_dir: None,
      assume_online: true,
      store: StoreConfig::default(),
      cache: CacheConfig::default(),
      replay: ReplayConfig::default(),
      connectivity: ConnectivityConfig::default(),
    }
  }
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      name: "gm-store-sync".to_string(),
      version: 1,
      table: "pending_orders".to_string(),
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: "v3".to_string(),
      network_timeout_secs: 3,
      shell_page: "/index.html".to_string(),
      precache: [
        "/",
        "/index.html",
        "/manifest.webmanifest",
        "/icone/icone_192x192.png",
        "/icone/icone_512x512.png",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      static_assets: PartitionLimits {
        max_entries: Some(100),
        max_age_secs: Some(60 * 60 * 24 * 30),
      },
      api: PartitionLimits {
        max_entries: Some(50),
        max_age_secs: Some(60 * 5),
      },
      pages: PartitionLimits::default(),
    }
  }
}

impl Default for ReplayConfig {
  fn default() -> Self {
    Self {
      interval_secs: 30,
      max_attempts: None,
    }
  }
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 10,
      probe_path: "/api/".to_string(),
    }
  }
}

impl CacheConfig {
  pub fn static_partition(&self) -> String {
    format!("static-assets-{}", self.version)
  }

  pub fn api_partition(&self) -> String {
    format!("api-cache-{}", self.version)
  }

  pub fn pages_partition(&self) -> String {
    format!("pages-cache-{}", self.version)
  }

  /// Every partition name belonging to the current version.
  pub fn partition_names(&self) -> Vec<String> {
    vec![
      self.static_partition(),
      self.api_partition(),
      self.pages_partition(),
    ]
  }

  pub fn static_policy(&self) -> CachePolicy {
    self.static_assets.policy(self.static_partition())
  }

  pub fn api_policy(&self) -> CachePolicy {
    self.api.policy(self.api_partition())
  }

  pub fn pages_policy(&self) -> CachePolicy {
    self.pages.policy(self.pages_partition())
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_secs(self.network_timeout_secs)
  }
}

impl PartitionLimits {
  fn policy(&self, partition: String) -> CachePolicy {
    CachePolicy {
      partition,
      max_entries: self.max_entries,
      max_age: self.max_age_secs.map(chrono::Duration::seconds),
    }
  }
}

impl AgentConfig {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./storefront-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/storefront-sync/config.yaml
  ///
  /// Built-in defaults apply when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("storefront-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("storefront-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  fn validate(&self) -> Result<()> {
    if !self.order_path.starts_with('/') {
      return Err(eyre!("order_path must start with '/': {}", self.order_path));
    }
    if self.store.name.is_empty() || self.store.table.is_empty() {
      return Err(eyre!("store name and table must not be empty"));
    }
    self
      .shell_url()
      .map_err(|e| eyre!("Invalid shell page {}: {}", self.cache.shell_page, e))?;
    self
      .precache_urls()
      .map_err(|e| eyre!("Invalid precache entry: {}", e))?;
    if self.replay.interval_secs == 0 || self.connectivity.probe_interval_secs == 0 {
      return Err(eyre!("replay and probe intervals must be at least one second"));
    }
    Ok(())
  }

  /// Full URL of the order submission route.
  pub fn order_url(&self) -> Result<Url> {
    self
      .api_origin
      .join(&self.order_path)
      .map_err(|e| eyre!("Invalid order path {}: {}", self.order_path, e))
  }

  pub fn probe_url(&self) -> Result<Url> {
    self
      .api_origin
      .join(&self.connectivity.probe_path)
      .map_err(|e| eyre!("Invalid probe path {}: {}", self.connectivity.probe_path, e))
  }

  /// URL of the cached page served to offline navigations.
  pub fn shell_url(&self) -> Result<Url, url::ParseError> {
    self.app_origin.join(&self.cache.shell_page)
  }

  /// Absolute URLs of the static assets seeded at install time.
  pub fn precache_urls(&self) -> Result<Vec<Url>, url::ParseError> {
    self
      .cache
      .precache
      .iter()
      .map(|path| self.app_origin.join(path))
      .collect()
  }

  pub fn replay_interval(&self) -> Duration {
    Duration::from_secs(self.replay.interval_secs)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.connectivity.probe_interval_secs)
  }

  /// Resolve the data directory, falling back to the platform data dir.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("storefront-sync"))
  }

  pub fn queue_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join(format!("{}.db", self.store.name)))
  }

  pub fn cache_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("cache.db"))
  }

  /// Bearer token for the order route, if one is configured.
  ///
  /// Checks STOREFRONT_TOKEN.
  pub fn get_token() -> Option<String> {
    std::env::var("STOREFRONT_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
