//! Last good table, persisted for an immediate repaint on cold start.

use std::sync::Arc;

use crate::{
   Result,
   clock::SharedClock,
   kv::{self, KvStore},
   types::Snapshot,
};

pub struct SnapshotCache {
   kv:    Arc<dyn KvStore>,
   clock: SharedClock,
}

impl SnapshotCache {
   pub fn new(kv: Arc<dyn KvStore>, clock: SharedClock) -> Self {
      Self { kv, clock }
   }

   /// Overwrites the previous snapshot.
   pub fn store(&self, snapshot: &Snapshot) -> Result<()> {
      kv::set_json(self.kv.as_ref(), kv::KEY_SNAPSHOT, snapshot, None)
   }

   /// Returns the snapshot only if it is at most `max_age_ms` old.
   pub fn load(&self, max_age_ms: i64) -> Option<Snapshot> {
      let snapshot = self.latest()?;
      let age = self.clock.now_ms() - snapshot.taken_at;
      if age > max_age_ms {
         tracing::debug!("ignoring snapshot that is {}s old", age / 1000);
         return None;
      }
      Some(snapshot)
   }

   /// Returns the snapshot regardless of age.
   pub fn latest(&self) -> Option<Snapshot> {
      kv::get_json(self.kv.as_ref(), kv::KEY_SNAPSHOT)
   }

   pub fn age_ms(&self, snapshot: &Snapshot) -> i64 {
      self.clock.now_ms() - snapshot.taken_at
   }
}
