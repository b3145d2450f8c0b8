//! Fakes shared by unit tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

use crate::cache::{CacheStorage, CachedEntry, MemoryStorage, RequestKey};
use crate::error::NetworkError;
use crate::net::{Network, Request, Response};

/// Absolute URL on the test origin.
pub fn url(path: &str) -> Url {
  Url::parse("https://app.test/").unwrap().join(path).unwrap()
}

#[derive(Clone)]
enum Script {
  Respond(Option<Duration>, Response),
  Fail,
}

/// Network with per-URL canned outcomes. Unscripted URLs are offline.
#[derive(Default)]
pub struct ScriptedNetwork {
  scripts: Mutex<HashMap<String, Script>>,
  calls: AtomicUsize,
}

impl ScriptedNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, response: Response) {
    self.set(url, Script::Respond(None, response));
  }

  pub fn respond_after(&self, url: &str, delay: Duration, response: Response) {
    self.set(url, Script::Respond(Some(delay), response));
  }

  pub fn fail(&self, url: &str) {
    self.set(url, Script::Fail);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  fn set(&self, url: &str, script: Script) {
    self.scripts.lock().unwrap().insert(url.to_string(), script);
  }
}

#[async_trait]
impl Network for ScriptedNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let url = request.url.to_string();
    let script = self.scripts.lock().unwrap().get(&url).cloned();

    match script {
      Some(Script::Respond(delay, response)) => {
        if let Some(delay) = delay {
          tokio::time::sleep(delay).await;
        }
        Ok(response)
      }
      Some(Script::Fail) | None => Err(NetworkError::Offline { url }),
    }
  }
}

/// Memory storage that counts every call and can be told to fail.
#[derive(Default)]
pub struct RecordingStorage {
  inner: MemoryStorage,
  calls: AtomicUsize,
  fail_delete: Mutex<HashSet<String>>,
  fail_put_all: AtomicBool,
  fail_list_names: AtomicBool,
}

impl RecordingStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn fail_delete(&self, partition: &str) {
    self.fail_delete.lock().unwrap().insert(partition.to_string());
  }

  /// Every batch write fails before anything is stored.
  pub fn fail_put_all(&self) {
    self.fail_put_all.store(true, Ordering::SeqCst);
  }

  pub fn set_fail_list_names(&self, fail: bool) {
    self.fail_list_names.store(fail, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  fn record(&self) {
    self.calls.fetch_add(1, Ordering::SeqCst);
  }
}

impl CacheStorage for RecordingStorage {
  fn open(&self, partition: &str) -> Result<()> {
    self.record();
    self.inner.open(partition)
  }

  fn has(&self, partition: &str) -> Result<bool> {
    self.record();
    self.inner.has(partition)
  }

  fn list_names(&self) -> Result<Vec<String>> {
    self.record();
    if self.fail_list_names.load(Ordering::SeqCst) {
      return Err(eyre!("database is locked"));
    }
    self.inner.list_names()
  }

  fn delete(&self, partition: &str) -> Result<bool> {
    self.record();
    if self.fail_delete.lock().unwrap().contains(partition) {
      return Err(eyre!("disk full while deleting {}", partition));
    }
    self.inner.delete(partition)
  }

  fn match_entry(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    self.record();
    self.inner.match_entry(partition, key)
  }

  fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()> {
    self.record();
    self.inner.put(partition, key, response)
  }

  fn put_all(&self, partition: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    self.record();
    if self.fail_put_all.load(Ordering::SeqCst) {
      return Err(eyre!("disk full while writing {}", partition));
    }
    self.inner.put_all(partition, entries)
  }

  fn keys(&self, partition: &str) -> Result<Vec<RequestKey>> {
    self.record();
    self.inner.keys(partition)
  }
}
