//! Lifecycle of the versioned cache partitions.

use color_eyre::Result;
use futures::future::join_all;
use std::sync::Arc;
use url::Url;

use super::storage::{CacheStorage, Partition};
use super::traits::RequestKey;
use crate::error::InstallError;
use crate::net::{Network, Request};

/// Names of the two partitions that belong to one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNames {
  pub static_name: String,
  pub runtime_name: String,
}

impl PartitionNames {
  pub fn new(prefix: &str, version: &str) -> Self {
    let name = |kind: &str| {
      if prefix.is_empty() {
        format!("{}-{}", kind, version)
      } else {
        format!("{}-{}-{}", prefix, kind, version)
      }
    };

    Self {
      static_name: name("static"),
      runtime_name: name("runtime"),
    }
  }

  /// Whether `name` is one of the live partitions.
  pub fn is_current(&self, name: &str) -> bool {
    name == self.static_name || name == self.runtime_name
  }
}

/// Outcome of a successful precache.
#[derive(Debug, Clone)]
pub struct InstallReport {
  pub partition: String,
  pub entries: usize,
  pub bytes: usize,
}

/// Outcome of garbage collection.
#[derive(Debug, Clone, Default)]
pub struct GcReport {
  pub deleted: Vec<String>,
  /// Partitions that could not be deleted, with the reason
  pub failed: Vec<(String, String)>,
}

/// Owns creation and deletion of partitions for the current version.
pub struct CacheManager<S: CacheStorage> {
  storage: Arc<S>,
  names: PartitionNames,
}

impl<S: CacheStorage> CacheManager<S> {
  pub fn new(storage: Arc<S>, names: PartitionNames) -> Self {
    Self { storage, names }
  }

  pub fn static_partition(&self) -> Result<Partition<S>> {
    Partition::open(Arc::clone(&self.storage), &self.names.static_name)
  }

  pub fn runtime_partition(&self) -> Result<Partition<S>> {
    Partition::open(Arc::clone(&self.storage), &self.names.runtime_name)
  }

  /// Whether this version has been installed.
  pub fn is_installed(&self) -> Result<bool> {
    self.storage.has(&self.names.static_name)
  }

  /// Fetch every manifest entry and store them all in the static partition.
  ///
  /// All fetches are attempted. If any of them fails or does not return 200,
  /// nothing is written and the first failure in manifest order is returned.
  pub async fn precache<N: Network + ?Sized>(
    &self,
    network: &N,
    manifest: &[Url],
  ) -> Result<InstallReport> {
    tracing::info!(
      partition = %self.names.static_name,
      entries = manifest.len(),
      "precaching"
    );

    let fetches = manifest.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let outcome = network.fetch(&request).await;
      (url, outcome)
    });

    let mut entries = Vec::with_capacity(manifest.len());
    for (url, outcome) in join_all(fetches).await {
      let response = outcome.map_err(|source| InstallError::Fetch {
        url: url.to_string(),
        source,
      })?;
      if !response.is_cacheable() {
        return Err(
          InstallError::Status {
            url: url.to_string(),
            status: response.status,
          }
          .into(),
        );
      }
      entries.push((RequestKey::get(url), response));
    }

    // put_all creates the partition in the same write, so a failure leaves
    // no empty partition behind
    let bytes: usize = entries.iter().map(|(_, r)| r.body.len()).sum();
    self.storage.put_all(&self.names.static_name, &entries)?;

    Ok(InstallReport {
      partition: self.names.static_name.clone(),
      entries: entries.len(),
      bytes,
    })
  }

  /// Delete every partition that does not belong to the current version.
  ///
  /// Each deletion is independent; failures are collected, not propagated.
  pub async fn collect_garbage(&self) -> Result<GcReport> {
    let stale: Vec<String> = self
      .storage
      .list_names()?
      .into_iter()
      .filter(|name| !self.names.is_current(name))
      .collect();

    let deletions = stale.into_iter().map(|name| async move {
      let outcome = self.storage.delete(&name);
      (name, outcome)
    });

    let mut report = GcReport::default();
    for (name, outcome) in join_all(deletions).await {
      match outcome {
        Ok(_) => {
          tracing::info!(partition = %name, "deleted obsolete partition");
          report.deleted.push(name);
        }
        Err(e) => {
          tracing::warn!(partition = %name, error = %e, "failed to delete obsolete partition");
          report.failed.push((name, e.to_string()));
        }
      }
    }

    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::net::Response;
  use crate::testing::{url, RecordingStorage, ScriptedNetwork};

  fn manager(storage: Arc<MemoryStorage>, version: &str) -> CacheManager<MemoryStorage> {
    CacheManager::new(storage, PartitionNames::new("", version))
  }

  #[test]
  fn test_partition_names() {
    let names = PartitionNames::new("viadecide", "v1.0.0");
    assert_eq!(names.static_name, "viadecide-static-v1.0.0");
    assert_eq!(names.runtime_name, "viadecide-runtime-v1.0.0");

    let bare = PartitionNames::new("", "v2");
    assert_eq!(bare.static_name, "static-v2");
    assert!(bare.is_current("runtime-v2"));
    assert!(!bare.is_current("runtime-v1"));
  }

  #[tokio::test]
  async fn test_precache_stores_every_manifest_entry() {
    let network = ScriptedNetwork::new();
    network.respond("https://app.test/", Response::new(200, "<html>A</html>"));
    network.respond("https://app.test/index.html", Response::new(200, "<html>A</html>"));

    let storage = Arc::new(MemoryStorage::new());
    let manager = manager(storage.clone(), "v1");
    let manifest = vec![url("/"), url("/index.html")];

    let report = manager.precache(&network, &manifest).await.unwrap();
    assert_eq!(report.partition, "static-v1");
    assert_eq!(report.entries, 2);
    assert_eq!(report.bytes, 28);

    let partition = manager.static_partition().unwrap();
    for u in &manifest {
      let entry = partition.match_key(&RequestKey::get(u)).unwrap().unwrap();
      assert_eq!(entry.response.body, b"<html>A</html>");
    }
  }

  #[tokio::test]
  async fn test_precache_failure_writes_nothing() {
    let network = ScriptedNetwork::new();
    network.respond("https://app.test/", Response::new(200, "root"));
    network.fail("https://app.test/icons/icon-192.png");

    let storage = Arc::new(MemoryStorage::new());
    let manager = manager(storage.clone(), "v1");

    let err = manager
      .precache(&network, &[url("/"), url("/icons/icon-192.png")])
      .await
      .unwrap_err();

    assert!(matches!(
      err.downcast_ref::<InstallError>(),
      Some(InstallError::Fetch { url, .. }) if url == "https://app.test/icons/icon-192.png"
    ));
    assert!(!manager.is_installed().unwrap());
    // Every entry was still attempted
    assert_eq!(network.calls(), 2);
  }

  #[tokio::test]
  async fn test_precache_rejects_non_200() {
    let network = ScriptedNetwork::new();
    network.respond("https://app.test/", Response::new(200, "root"));
    network.respond("https://app.test/manifest.json", Response::new(404, "nope"));

    let manager = manager(Arc::new(MemoryStorage::new()), "v1");
    let err = manager
      .precache(&network, &[url("/"), url("/manifest.json")])
      .await
      .unwrap_err();

    assert!(matches!(
      err.downcast_ref::<InstallError>(),
      Some(InstallError::Status { status: 404, .. })
    ));
    assert!(!manager.is_installed().unwrap());
  }

  #[tokio::test]
  async fn test_precache_write_failure_leaves_version_uninstalled() {
    let network = ScriptedNetwork::new();
    network.respond("https://app.test/", Response::new(200, "root"));

    let storage = Arc::new(RecordingStorage::new());
    storage.fail_put_all();
    let manager = CacheManager::new(storage.clone(), PartitionNames::new("", "v1"));

    assert!(manager.precache(&network, &[url("/")]).await.is_err());
    assert!(!manager.is_installed().unwrap());
    assert!(storage.list_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_gc_keeps_only_current_partitions() {
    let storage = Arc::new(MemoryStorage::new());
    for name in ["static-v1", "runtime-v1", "other-app", "static-v2", "runtime-v2"] {
      storage.open(name).unwrap();
    }

    let manager = manager(storage.clone(), "v2");
    let report = manager.collect_garbage().await.unwrap();

    assert_eq!(report.deleted, vec!["static-v1", "runtime-v1", "other-app"]);
    assert!(report.failed.is_empty());
    assert_eq!(storage.list_names().unwrap(), vec!["static-v2", "runtime-v2"]);

    // Nothing left to do the second time
    let again = manager.collect_garbage().await.unwrap();
    assert!(again.deleted.is_empty());
    assert_eq!(storage.list_names().unwrap(), vec!["static-v2", "runtime-v2"]);
  }

  #[tokio::test]
  async fn test_gc_deletion_failure_does_not_block_others() {
    let storage = Arc::new(RecordingStorage::new());
    for name in ["static-v1", "runtime-v1", "static-v2"] {
      storage.open(name).unwrap();
    }
    storage.fail_delete("static-v1");

    let manager = CacheManager::new(storage.clone(), PartitionNames::new("", "v2"));
    let report = manager.collect_garbage().await.unwrap();

    assert_eq!(report.deleted, vec!["runtime-v1"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "static-v1");
    assert_eq!(storage.list_names().unwrap(), vec!["static-v1", "static-v2"]);
  }

  #[tokio::test]
  async fn test_version_change_removes_old_partitions() {
    let network = ScriptedNetwork::new();
    network.respond("https://app.test/", Response::new(200, "<html>A</html>"));
    network.respond("https://app.test/index.html", Response::new(200, "<html>A</html>"));
    let manifest = vec![url("/"), url("/index.html")];

    let storage = Arc::new(MemoryStorage::new());
    let v1 = manager(storage.clone(), "v1");
    v1.precache(&network, &manifest).await.unwrap();
    v1.runtime_partition().unwrap();
    v1.collect_garbage().await.unwrap();

    let v2 = manager(storage.clone(), "v2");
    v2.precache(&network, &manifest).await.unwrap();
    v2.collect_garbage().await.unwrap();

    assert_eq!(storage.list_names().unwrap(), vec!["static-v2"]);
    assert!(storage.keys("static-v1").unwrap().is_empty());
  }
}
