//! In-memory storage, used for dry runs and tests.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::storage::CacheStorage;
use super::traits::{CachedEntry, RequestKey};
use crate::net::Response;

#[derive(Default)]
pub struct MemoryStorage {
  // Vec keeps creation order for list_names
  partitions: Mutex<Vec<(String, BTreeMap<RequestKey, CachedEntry>)>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_partitions<R>(
    &self,
    f: impl FnOnce(&mut Vec<(String, BTreeMap<RequestKey, CachedEntry>)>) -> R,
  ) -> Result<R> {
    let mut partitions = self
      .partitions
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(f(&mut partitions))
  }
}

fn entries_mut<'a>(
  partitions: &'a mut Vec<(String, BTreeMap<RequestKey, CachedEntry>)>,
  name: &str,
) -> &'a mut BTreeMap<RequestKey, CachedEntry> {
  let index = match partitions.iter().position(|(n, _)| n == name) {
    Some(index) => index,
    None => {
      partitions.push((name.to_string(), BTreeMap::new()));
      partitions.len() - 1
    }
  };
  &mut partitions[index].1
}

fn entry(key: &RequestKey, response: &Response) -> CachedEntry {
  CachedEntry {
    key: key.clone(),
    response: response.clone(),
    cached_at: Utc::now(),
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, partition: &str) -> Result<()> {
    self.with_partitions(|p| {
      entries_mut(p, partition);
    })
  }

  fn has(&self, partition: &str) -> Result<bool> {
    self.with_partitions(|p| p.iter().any(|(n, _)| n == partition))
  }

  fn list_names(&self) -> Result<Vec<String>> {
    self.with_partitions(|p| p.iter().map(|(n, _)| n.clone()).collect())
  }

  fn delete(&self, partition: &str) -> Result<bool> {
    self.with_partitions(|p| {
      let before = p.len();
      p.retain(|(n, _)| n != partition);
      p.len() != before
    })
  }

  fn match_entry(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    self.with_partitions(|p| {
      p.iter()
        .find(|(n, _)| n == partition)
        .and_then(|(_, entries)| entries.get(key).cloned())
    })
  }

  fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()> {
    self.with_partitions(|p| {
      entries_mut(p, partition).insert(key.clone(), entry(key, response));
    })
  }

  fn put_all(&self, partition: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    self.with_partitions(|p| {
      let target = entries_mut(p, partition);
      for (key, response) in entries {
        target.insert(key.clone(), entry(key, response));
      }
    })
  }

  fn keys(&self, partition: &str) -> Result<Vec<RequestKey>> {
    self.with_partitions(|p| {
      p.iter()
        .find(|(n, _)| n == partition)
        .map(|(_, entries)| entries.keys().cloned().collect())
        .unwrap_or_default()
    })
  }
}
