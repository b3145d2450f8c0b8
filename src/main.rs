mod cache;
mod config;
mod error;
mod logging;
mod net;
mod router;
mod strategy;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::Method;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use cache::{CacheSource, CacheStorage, MemoryStorage, SqliteStorage};
use config::Config;
use net::{HttpNetwork, Network, OfflineNetwork, Request, Response};
use worker::{Event, EventOutcome, FetchOutcome, ServiceWorker};

#[derive(Parser, Debug)]
#[command(name = "swcache")]
#[command(about = "Offline caching agent for single-page web apps")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./swcache.yaml, then $XDG_CONFIG_HOME/swcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Version tag to use instead of the one in the config file
  #[arg(long, global = true)]
  cache_version: Option<String>,

  /// Debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the manifest for the current version, then activate unless
  /// skip_waiting is off
  Install {
    /// Fetch the manifest without writing anything to disk
    #[arg(long)]
    dry_run: bool,
  },
  /// Delete partitions of other versions and take control
  Activate,
  /// Route one request through the agent and write the body to stdout
  Fetch(FetchArgs),
  /// List cache partitions
  Caches {
    /// Also list the keys in each partition
    #[arg(long)]
    entries: bool,
  },
}

#[derive(clap::Args, Debug)]
struct FetchArgs {
  /// Path relative to the scope, or an absolute URL
  target: String,

  #[arg(short = 'X', long, default_value = "GET")]
  method: String,

  /// Treat as a top-level document load
  #[arg(long)]
  navigate: bool,

  /// Accept header to send
  #[arg(long)]
  accept: Option<String>,

  /// Pretend the network is unreachable
  #[arg(long)]
  offline: bool,

  /// Print response status and headers before the body
  #[arg(short = 'i', long)]
  headers: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Override version if specified on command line
  if let Some(version) = args.cache_version {
    config.version = version;
    config.validate()?;
  }

  let _guard = logging::init(&config.logging, args.verbose)?;

  match args.command {
    Command::Install { dry_run } => install(&config, dry_run).await,
    Command::Activate => activate(&config).await,
    Command::Fetch(fetch_args) => {
      let storage = Arc::new(SqliteStorage::open(config.storage.path.as_deref())?);
      if fetch_args.offline {
        fetch(&config, storage, Arc::new(OfflineNetwork), &fetch_args).await
      } else {
        let network = Arc::new(HttpNetwork::new(&config.network)?);
        fetch(&config, storage, network, &fetch_args).await
      }
    }
    Command::Caches { entries } => caches(&config, entries),
  }
}

async fn install(config: &Config, dry_run: bool) -> Result<()> {
  let network = Arc::new(HttpNetwork::new(&config.network)?);

  if dry_run {
    let mut worker = ServiceWorker::new(config, Arc::new(MemoryStorage::new()), network)?;
    print_outcome(&worker.handle(Event::Install).await?);
    println!("dry run: nothing was written");
    return Ok(());
  }

  let storage = Arc::new(SqliteStorage::open(config.storage.path.as_deref())?);
  let mut worker = ServiceWorker::new(config, storage, network)?;
  print_outcome(&worker.handle(Event::Install).await?);

  if worker.skip_waiting() {
    print_outcome(&worker.handle(Event::Activate).await?);
  } else {
    println!(
      "{:?}: run `swcache activate` to take control",
      worker.state()
    );
  }

  Ok(())
}

async fn activate(config: &Config) -> Result<()> {
  let storage = Arc::new(SqliteStorage::open(config.storage.path.as_deref())?);
  let network = Arc::new(OfflineNetwork);
  let mut worker = ServiceWorker::new(config, storage, network)?;

  if !worker.resume_installed()? {
    return Err(eyre!(
      "Version {} is not installed. Run `swcache install` first.",
      config.version
    ));
  }

  print_outcome(&worker.handle(Event::Activate).await?);
  Ok(())
}

fn print_outcome(outcome: &EventOutcome) {
  match outcome {
    EventOutcome::Installed(report) => println!(
      "installed {} entries ({} bytes) into {}",
      report.entries, report.bytes, report.partition
    ),
    EventOutcome::Activated(report) => {
      for name in &report.gc.deleted {
        println!("deleted {}", name);
      }
      for (name, reason) in &report.gc.failed {
        println!("could not delete {}: {}", name, reason);
      }
      if report.claimed {
        println!("activated; controlling open clients");
      }
    }
    EventOutcome::Fetch(_) => {}
  }
}

async fn fetch<S, N>(
  config: &Config,
  storage: Arc<S>,
  network: Arc<N>,
  args: &FetchArgs,
) -> Result<()>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  let url = config.resolve(&args.target)?;
  let method = Method::from_bytes(args.method.to_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method '{}': {}", args.method, e))?;

  let request = if args.navigate {
    Request::navigate(url)
  } else {
    Request::get(url)
  };
  let mut request = request.with_method(method);
  if let Some(accept) = &args.accept {
    let value = HeaderValue::from_str(accept)
      .map_err(|e| eyre!("Invalid Accept header '{}': {}", accept, e))?;
    request = request.with_header(ACCEPT, value);
  }

  let mut worker = ServiceWorker::new(config, storage, Arc::clone(&network))?;
  if !worker.resume_active()? {
    tracing::warn!(
      version = %config.version,
      "version not installed; requests go straight to the network"
    );
  }

  let url = request.url.clone();
  let mut outcome = match worker.handle(Event::Fetch(request)).await? {
    EventOutcome::Fetch(outcome) => outcome,
    other => return Err(eyre!("Unexpected outcome for a fetch: {:?}", other)),
  };
  let (response, source) = match &outcome {
    FetchOutcome::Passthrough(request, reason) => {
      let response = network.fetch(request).await?;
      (Some(response), format!("passthrough ({:?})", reason))
    }
    FetchOutcome::Responded { result, .. } => match result {
      Some(result) => {
        if result.source == CacheSource::OfflineFallback {
          tracing::warn!(%url, "network unavailable; serving the offline fallback document");
        }
        let source = match result.cached_at {
          Some(at) => format!("{}, cached {}", result.source, at.to_rfc3339()),
          None => result.source.to_string(),
        };
        (Some(result.data.clone()), source)
      }
      None => (None, "none".to_string()),
    },
  };

  // Let the background refresh land before the process exits
  outcome.wait_until().await?;

  let response =
    response.ok_or_else(|| eyre!("No response for {}: not cached and network unavailable", url))?;
  eprintln!(
    "{} {} [{}] {}",
    response.status,
    url,
    source,
    response.header("content-type").unwrap_or("")
  );
  write_response(&response, args.headers)
}

fn write_response(response: &Response, headers: bool) -> Result<()> {
  let mut stdout = std::io::stdout().lock();
  if headers {
    writeln!(stdout, "status: {}", response.status)?;
    for (name, value) in &response.headers {
      writeln!(stdout, "{}: {}", name, value)?;
    }
    writeln!(stdout)?;
  }
  stdout.write_all(&response.body)?;
  stdout.flush()?;
  Ok(())
}

fn caches(config: &Config, entries: bool) -> Result<()> {
  let storage = SqliteStorage::open(config.storage.path.as_deref())?;
  let names = config.partition_names();

  let partitions = storage.list_names()?;
  if partitions.is_empty() {
    println!("no partitions");
    return Ok(());
  }

  for name in partitions {
    let keys = storage.keys(&name)?;
    let status = if names.is_current(&name) {
      "current"
    } else {
      "obsolete"
    };
    println!("{:<40} {:>6} entries  {}", name, keys.len(), status);

    if entries {
      for key in keys {
        println!("  {} {}", key.method, key.url);
      }
    }
  }

  Ok(())
}
