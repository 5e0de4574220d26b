mod agent;
mod cache;
mod config;
mod connectivity;
mod error;
mod logging;
mod net;
mod order;
mod queue;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use url::Url;

use agent::{spawn_timer, Agent, ControlMessage, CycleOutcome, Intercepted};
use cache::SqliteStorage;
use config::AgentConfig;
use connectivity::ConnectivityMonitor;
use net::{HttpNetwork, HttpRequest, Network};
use order::{CreateOrder, OrderItem};
use queue::{QueueStore, SqliteQueueStore};

#[derive(Parser, Debug)]
#[command(name = "storefront-sync")]
#[command(about = "Offline order queue and read cache for the storefront")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/storefront-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also write logs to a daily rolling file in this directory
  #[arg(long)]
  log_dir: Option<PathBuf>,

  /// Log at debug level
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the agent until Ctrl-C, printing sync notifications as JSON lines
  Run {
    /// Activate without seeding the app shell
    #[arg(long)]
    skip_precache: bool,
  },
  /// Submit an order, queueing it if the server is unreachable
  Submit {
    /// Line item as PRODUCT_ID[:QUANTITY]
    #[arg(short, long = "item", required = true)]
    items: Vec<OrderItem>,
  },
  /// Replay queued orders now
  Sync,
  /// Show queued orders and dead letters
  Status,
  /// Read a URL through the cache
  Fetch {
    url: Url,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.verbose, args.log_dir.as_deref())?;

  let config = Arc::new(AgentConfig::load(args.config.as_deref())?);

  match args.command {
    Command::Run { skip_precache } => run(config, skip_precache).await,
    Command::Submit { items } => submit(config, items).await,
    Command::Sync => sync(config).await,
    Command::Status => status(&config),
    Command::Fetch { url, navigate } => fetch(config, url, navigate).await,
  }
}

fn open_store(config: &AgentConfig) -> Result<Arc<SqliteQueueStore>> {
  let path = config.queue_path()?;
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  Ok(Arc::new(SqliteQueueStore::open(&path, &config.store)?))
}

fn open_agent(config: &Arc<AgentConfig>, network: Arc<dyn Network>) -> Result<Agent> {
  let store = open_store(config)?;
  let cache = SqliteStorage::open(&config.cache_path()?)?;
  Ok(Agent::new(Arc::clone(config), network, store, cache))
}

async fn run(config: Arc<AgentConfig>, skip_precache: bool) -> Result<()> {
  let network: Arc<dyn Network> = Arc::new(HttpNetwork::new()?);
  let agent = open_agent(&config, Arc::clone(&network))?;
  let mut notifications = agent.notifier().subscribe();

  if skip_precache {
    agent.install_without_precache();
  } else {
    agent.install().await?;
  }
  if let Some(CycleOutcome::Completed(report)) = agent.activate().await? {
    info!(sent = report.sent, requeued = report.requeued, "Startup sync finished");
  }

  let handle = agent.spawn();
  let _timer = spawn_timer(handle.clone(), config.replay_interval());
  let _monitor = ConnectivityMonitor::new(
    network,
    config.probe_url()?,
    config.probe_interval(),
    config.assume_online,
  )
  .spawn(handle.clone());
  info!(api = %config.api_origin, "Agent running, Ctrl-C to stop");

  let shutdown = tokio::signal::ctrl_c();
  tokio::pin!(shutdown);

  loop {
    tokio::select! {
      _ = &mut shutdown => {
        info!("Shutting down");
        break;
      }
      received = notifications.recv() => match received {
        Ok(notification) => println!("{}", serde_json::to_string(&notification)?),
        Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed sync notifications"),
        Err(RecvError::Closed) => break,
      },
    }
  }

  Ok(())
}

async fn submit(config: Arc<AgentConfig>, items: Vec<OrderItem>) -> Result<()> {
  let agent = open_agent(&config, Arc::new(HttpNetwork::new()?))?;
  agent.install_without_precache();
  agent.activate().await?;

  let token = AgentConfig::get_token();
  let request = CreateOrder::new(items).into_request(config.order_url()?, token.as_deref())?;
  let result = agent.fetch(request).await?;
  print_response(&result);

  Ok(())
}

async fn sync(config: Arc<AgentConfig>) -> Result<()> {
  let agent = open_agent(&config, Arc::new(HttpNetwork::new()?))?;

  let ack = agent.handle_message(ControlMessage::SyncOrdersNow).await;
  println!("{}", serde_json::to_string_pretty(&ack)?);

  if !ack.success {
    return Err(eyre!(ack.error.unwrap_or_else(|| "sync failed".to_string())));
  }
  Ok(())
}

fn status(config: &AgentConfig) -> Result<()> {
  let store = open_store(config)?;

  let pending = store.peek_all()?;
  println!("{} queued order(s)", pending.len());
  for entry in &pending {
    println!(
      "  #{} {} {} {} (attempts: {})",
      entry.id,
      entry.created_at.format("%Y-%m-%d %H:%M:%S"),
      entry.request.method,
      entry.request.url,
      entry.attempts
    );
  }

  let dead = store.dead_letters()?;
  if !dead.is_empty() {
    println!("{} dead letter(s)", dead.len());
    for letter in &dead {
      println!(
        "  #{} {} {}: {}",
        letter.entry.id,
        letter.failed_at.format("%Y-%m-%d %H:%M:%S"),
        letter.entry.request.url,
        letter.reason
      );
    }
  }

  Ok(())
}

async fn fetch(config: Arc<AgentConfig>, url: Url, navigate: bool) -> Result<()> {
  let agent = open_agent(&config, Arc::new(HttpNetwork::new()?))?;
  agent.install_without_precache();
  agent.activate().await?;

  let request = if navigate {
    HttpRequest::navigate(url)
  } else {
    HttpRequest::get(url)
  };
  let result = agent.fetch(request).await?;
  print_response(&result);

  Ok(())
}

fn print_response(result: &Intercepted) {
  eprintln!("{} ({:?})", result.response.status, result.source);
  println!("{}", result.response.text());
}
