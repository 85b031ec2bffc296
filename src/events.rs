//! Notifications published by the engine for observers (CLI, UI bridges).

use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::SyncSource;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
   Synced {
      source:             SyncSource,
      edge_index:         Option<usize>,
      changed:            bool,
      status_set_changed: bool,
   },
   SyncFailed {
      reason: String,
   },
   Rerouted {
      from:       usize,
      to:         usize,
      expires_at: i64,
   },
   StaleRaised {
      latest_data_at: i64,
      age_ms:         i64,
   },
   StaleCleared {
      latest_data_at: i64,
   },
   SnapshotRestored {
      age_ms: i64,
      rows:   usize,
   },
}

pub type EventSender = broadcast::Sender<EngineEvent>;

pub fn channel() -> EventSender {
   broadcast::channel(EVENT_CAPACITY).0
}

/// Publishes without caring whether anyone is listening.
pub fn publish(tx: &EventSender, event: EngineEvent) {
   let _ = tx.send(event);
}
