//! Keeps a status table fresh against a fleet of redundant, flaky HTTP
//! backends: health-aware edge routing, hedged fetches with origin
//! fallback, diff reconciliation with an empty-result guard, staleness
//! alerting and adaptive polling.

pub mod clock;
pub mod cmd;
pub mod config;
pub mod edge;
pub mod engine;
pub mod error;
pub mod events;
pub mod fetch;
pub mod kv;
pub mod reconcile;
pub mod scheduler;
pub mod snapshot;
pub mod staleness;
pub mod timestamp;
pub mod types;

pub use engine::{CycleOutcome, StatusEngine, SyncMode};
pub use error::{Error, Result};
pub use events::EngineEvent;
