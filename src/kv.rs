//! Persisted key-value state with per-entry TTL.
//!
//! Endpoint health and the last good snapshot survive restarts through this
//! interface. `MemoryKv` backs tests and ephemeral runs, `FileKv` keeps one
//! JSON envelope per key on disk.

use std::{
   collections::HashMap,
   fs,
   path::{Path, PathBuf},
   time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
   Result,
   clock::SharedClock,
   error::StoreError,
};

pub const KEY_SNAPSHOT: &str = "status_snapshot_v1";
pub const KEY_EDGE_PERF: &str = "edge_perf_v1";
pub const KEY_ROUTE_OVERRIDE: &str = "edge_route_override_v1";
pub const KEY_ROUTE_FAILCOUNT: &str = "edge_route_failcount_v1";
pub const KEY_COOLDOWN: &str = "edge_cooldown_v1";

pub trait KvStore: Send + Sync {
   fn get(&self, key: &str) -> Option<Vec<u8>>;

   fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

   fn remove(&self, key: &str);
}

/// Reads and decodes a JSON value, treating undecodable data as absent.
pub fn get_json<T: for<'de> Deserialize<'de>>(kv: &dyn KvStore, key: &str) -> Option<T> {
   let raw = kv.get(key)?;
   match serde_json::from_slice(&raw) {
      Ok(v) => Some(v),
      Err(e) => {
         tracing::debug!("discarding undecodable {key}: {e}");
         None
      },
   }
}

pub fn set_json<T: Serialize>(
   kv: &dyn KvStore,
   key: &str,
   value: &T,
   ttl: Option<Duration>,
) -> Result<()> {
   let raw = serde_json::to_vec(value)?;
   kv.set(key, raw, ttl)
}

fn expiry(now_ms: i64, ttl: Option<Duration>) -> Option<i64> {
   ttl.map(|t| now_ms.saturating_add(t.as_millis() as i64))
}

struct MemoryEntry {
   data:       Vec<u8>,
   expires_at: Option<i64>,
}

pub struct MemoryKv {
   clock:   SharedClock,
   entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryKv {
   pub fn new(clock: SharedClock) -> Self {
      Self { clock, entries: Mutex::new(HashMap::new()) }
   }
}

impl KvStore for MemoryKv {
   fn get(&self, key: &str) -> Option<Vec<u8>> {
      let now = self.clock.now_ms();
      let mut entries = self.entries.lock();
      let expired = entries
         .get(key)
         .is_some_and(|e| e.expires_at.is_some_and(|exp| exp <= now));
      if expired {
         entries.remove(key);
         return None;
      }
      entries.get(key).map(|e| e.data.clone())
   }

   fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
      let expires_at = expiry(self.clock.now_ms(), ttl);
      self
         .entries
         .lock()
         .insert(key.to_string(), MemoryEntry { data: value, expires_at });
      Ok(())
   }

   fn remove(&self, key: &str) {
      self.entries.lock().remove(key);
   }
}

#[derive(Serialize, Deserialize)]
struct FileEnvelope {
   expires_at_ms: Option<i64>,
   data:          String,
}

/// One file per key under `dir`, replaced atomically on every write.
pub struct FileKv {
   dir:   PathBuf,
   clock: SharedClock,
   lock:  Mutex<()>,
}

impl FileKv {
   pub fn open(dir: impl Into<PathBuf>, clock: SharedClock) -> Result<Self> {
      let dir = dir.into();
      fs::create_dir_all(&dir).map_err(StoreError::CreateDir)?;
      Ok(Self { dir, clock, lock: Mutex::new(()) })
   }

   pub fn dir(&self) -> &Path {
      &self.dir
   }

   fn entry_path(&self, key: &str) -> Result<PathBuf> {
      let valid = !key.is_empty()
         && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
      if !valid || key.starts_with('.') {
         return Err(StoreError::InvalidKey(key.to_string()).into());
      }
      Ok(self.dir.join(format!("{key}.json")))
   }
}

impl KvStore for FileKv {
   fn get(&self, key: &str) -> Option<Vec<u8>> {
      let path = self.entry_path(key).ok()?;
      let _guard = self.lock.lock();
      let raw = fs::read_to_string(&path).ok()?;
      let envelope: FileEnvelope = match serde_json::from_str(&raw) {
         Ok(e) => e,
         Err(e) => {
            tracing::warn!("corrupt state entry {}: {e}", path.display());
            let _ = fs::remove_file(&path);
            return None;
         },
      };
      if envelope
         .expires_at_ms
         .is_some_and(|exp| exp <= self.clock.now_ms())
      {
         let _ = fs::remove_file(&path);
         return None;
      }
      hex::decode(envelope.data).ok()
   }

   fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
      let path = self.entry_path(key)?;
      let envelope = FileEnvelope {
         expires_at_ms: expiry(self.clock.now_ms(), ttl),
         data:          hex::encode(value),
      };
      let data = serde_json::to_string(&envelope)?;
      let tmp_path = path.with_extension("json.tmp");

      let _guard = self.lock.lock();
      fs::write(&tmp_path, data)
         .and_then(|()| fs::rename(&tmp_path, &path))
         .map_err(|reason| StoreError::Write { key: key.to_string(), reason })?;
      Ok(())
   }

   fn remove(&self, key: &str) {
      if let Ok(path) = self.entry_path(key) {
         let _guard = self.lock.lock();
         let _ = fs::remove_file(path);
      }
   }
}
