//! Event dispatch and lifecycle of the caching agent.

use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use url::Url;

use crate::cache::{
  CacheManager, CacheResult, CacheStorage, GcReport, InstallReport, RequestKey,
};
use crate::config::Config;
use crate::net::{Network, Request, Response};
use crate::router::{PassReason, Route, Router};
use crate::strategy::Strategies;

/// Events delivered by the host.
#[derive(Debug)]
pub enum Event {
  Install,
  Activate,
  Fetch(Request),
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  /// Waiting for activation (skipped when `skip_waiting` is set)
  Installed,
  Activating,
  Activated,
  /// Installation failed; this worker will never control anything
  Redundant,
}

#[derive(Debug)]
pub enum EventOutcome {
  Installed(InstallReport),
  Activated(ActivationReport),
  Fetch(FetchOutcome),
}

#[derive(Debug, Clone)]
pub struct ActivationReport {
  pub gc: GcReport,
  pub claimed: bool,
}

/// Answer to a fetch event.
#[derive(Debug)]
pub enum FetchOutcome {
  /// Not intercepted; the host should go to the network itself
  Passthrough(Request, PassReason),
  Responded {
    /// `None` when nothing was cached and the network gave nothing
    result: Option<CacheResult<Response>>,
    /// Work the host must let finish before the event is complete
    pending: Option<JoinHandle<()>>,
  },
}

impl FetchOutcome {
  /// Wait for any pending background work.
  pub async fn wait_until(&mut self) -> Result<()> {
    if let FetchOutcome::Responded { pending, .. } = self {
      if let Some(task) = pending.take() {
        task
          .await
          .map_err(|e| eyre!("Background revalidation failed: {}", e))?;
      }
    }
    Ok(())
  }
}

/// The set of application pages open on this origin.
#[derive(Debug, Default)]
pub struct Clients {
  controlled: AtomicBool,
}

impl Clients {
  /// Take control of every open page without waiting for a reload.
  pub fn claim(&self) {
    self.controlled.store(true, Ordering::SeqCst);
  }

  pub fn is_controlled(&self) -> bool {
    self.controlled.load(Ordering::SeqCst)
  }
}

pub struct ServiceWorker<S: CacheStorage, N: Network> {
  manager: CacheManager<S>,
  network: Arc<N>,
  router: Router,
  manifest: Vec<Url>,
  offline_fallback: Url,
  skip_waiting: bool,
  state: WorkerState,
  clients: Clients,
  /// Present once the worker controls its clients
  strategies: Option<Strategies<S, N>>,
}

impl<S, N> ServiceWorker<S, N>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  pub fn new(config: &Config, storage: Arc<S>, network: Arc<N>) -> Result<Self> {
    Ok(Self {
      manager: CacheManager::new(storage, config.partition_names()),
      network,
      router: Router::new(&config.scope),
      manifest: config.manifest()?,
      offline_fallback: config.offline_fallback_url()?,
      skip_waiting: config.skip_waiting,
      state: WorkerState::Parsed,
      clients: Clients::default(),
      strategies: None,
    })
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  pub fn skip_waiting(&self) -> bool {
    self.skip_waiting
  }

  pub async fn handle(&mut self, event: Event) -> Result<EventOutcome> {
    match event {
      Event::Install => self.install().await.map(EventOutcome::Installed),
      Event::Activate => self.activate().await.map(EventOutcome::Activated),
      Event::Fetch(request) => self.fetch(request).await.map(EventOutcome::Fetch),
    }
  }

  /// Precache the manifest. A failure makes the worker redundant.
  pub async fn install(&mut self) -> Result<InstallReport> {
    if self.state != WorkerState::Parsed {
      return Err(eyre!("Cannot install a worker in state {:?}", self.state));
    }

    self.state = WorkerState::Installing;
    let outcome = self
      .manager
      .precache(self.network.as_ref(), &self.manifest)
      .await;

    match outcome {
      Ok(report) => {
        self.state = WorkerState::Installed;
        tracing::info!(
          partition = %report.partition,
          entries = report.entries,
          bytes = report.bytes,
          skip_waiting = self.skip_waiting,
          "installed"
        );
        Ok(report)
      }
      Err(e) => {
        self.state = WorkerState::Redundant;
        tracing::warn!(error = %e, "install failed");
        Err(e)
      }
    }
  }

  /// Drop obsolete partitions, then claim clients.
  pub async fn activate(&mut self) -> Result<ActivationReport> {
    if self.state != WorkerState::Installed {
      return Err(eyre!("Cannot activate a worker in state {:?}", self.state));
    }

    self.state = WorkerState::Activating;
    let outcome = self.manager.collect_garbage().await;
    let gc = match outcome.and_then(|gc| self.take_control().map(|()| gc)) {
      Ok(gc) => gc,
      Err(e) => {
        // Still installed; activation can be retried
        self.state = WorkerState::Installed;
        tracing::warn!(error = %e, "activation failed");
        return Err(e);
      }
    };
    self.state = WorkerState::Activated;

    tracing::info!(
      deleted = gc.deleted.len(),
      failed = gc.failed.len(),
      "activated and claimed clients"
    );
    Ok(ActivationReport {
      gc,
      claimed: self.clients.is_controlled(),
    })
  }

  /// Pick up an installed version from persistent storage.
  ///
  /// Returns false when the current version was never installed.
  pub fn resume_installed(&mut self) -> Result<bool> {
    if self.state == WorkerState::Parsed && self.manager.is_installed()? {
      self.state = WorkerState::Installed;
    }
    Ok(self.state == WorkerState::Installed)
  }

  /// Pick up an installed version as the active, controlling worker.
  pub fn resume_active(&mut self) -> Result<bool> {
    if self.resume_installed()? {
      self.take_control()?;
      self.state = WorkerState::Activated;
    }
    Ok(self.state == WorkerState::Activated)
  }

  fn take_control(&mut self) -> Result<()> {
    self.strategies = Some(Strategies::new(
      Arc::clone(&self.network),
      self.manager.runtime_partition()?,
      self.manager.static_partition()?,
      RequestKey::get(&self.offline_fallback),
    ));
    self.clients.claim();
    Ok(())
  }

  /// Route one intercepted request.
  pub async fn fetch(&self, request: Request) -> Result<FetchOutcome> {
    let route = self.router.classify(&request);
    tracing::debug!(url = %request.url, method = %request.method, ?route, "fetch");

    let strategies = match (route, &self.strategies) {
      (Route::Passthrough(reason), _) => return Ok(FetchOutcome::Passthrough(request, reason)),
      (_, None) => {
        return Ok(FetchOutcome::Passthrough(
          request,
          PassReason::NotControlling,
        ))
      }
      (_, Some(strategies)) => strategies,
    };

    match route {
      Route::StaleWhileRevalidate => {
        let (result, pending) = strategies.stale_while_revalidate(&request).await?;
        Ok(FetchOutcome::Responded {
          result,
          pending: Some(pending),
        })
      }
      _ => {
        let result = strategies.network_first(&request).await?;
        Ok(FetchOutcome::Responded {
          result: Some(result),
          pending: None,
        })
      }
    }
  }
}
