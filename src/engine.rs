//! One sync cycle end to end: fetch, reconcile, re-evaluate staleness,
//! persist the snapshot, publish events.
//!
//! At most one cycle runs at a time. A scheduled trigger that arrives while
//! a cycle is in flight is dropped (`Busy`); a manual trigger is remembered
//! once (`Queued`) and run by the in-flight cycle before it lets go.

use std::sync::{
   Arc,
   atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::{
   Error, Result,
   clock::SharedClock,
   config::Config,
   edge::{EdgeRouter, EndpointHealth, EndpointHealthStore, HealthPolicy},
   events::{self, EngineEvent, EventSender},
   fetch::{FetchExecutor, FetchOptions, Transport},
   kv::KvStore,
   reconcile::ReconciliationEngine,
   snapshot::SnapshotCache,
   staleness::{StaleTransition, StalenessMonitor, StalenessState},
   types::{CanonicalTable, FetchedBatch, Snapshot, SyncSource},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
   Scheduled,
   Manual,
}

#[derive(Debug)]
pub enum CycleOutcome {
   Synced {
      source:             SyncSource,
      edge_index:         Option<usize>,
      changed:            bool,
      status_set_changed: bool,
      rows:               usize,
   },
   Failed(Error),
   /// Another cycle was running; this trigger was dropped.
   Busy,
   /// Another cycle was running; it will run one manual cycle after itself.
   Queued,
}

struct FlightGuard<'a> {
   flag: &'a AtomicBool,
   held: bool,
}

impl<'a> FlightGuard<'a> {
   fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
      flag
         .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
         .ok()
         .map(|_| Self { flag, held: true })
   }

   fn release(&mut self) {
      self.flag.store(false, Ordering::Release);
      self.held = false;
   }

   fn reacquire(&mut self) -> bool {
      self.held = self
         .flag
         .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
         .is_ok();
      self.held
   }
}

impl Drop for FlightGuard<'_> {
   fn drop(&mut self) {
      if self.held {
         self.flag.store(false, Ordering::Release);
      }
   }
}

pub struct StatusEngine {
   fetch:               FetchExecutor,
   reconcile:           Mutex<ReconciliationEngine>,
   staleness:           Mutex<StalenessMonitor>,
   snapshots:           SnapshotCache,
   clock:               SharedClock,
   events:              EventSender,
   snapshot_max_age_ms: i64,
   in_flight:           AtomicBool,
   manual_queued:       AtomicBool,
   synced_once:         AtomicBool,
}

impl StatusEngine {
   pub fn new(
      cfg: &Config,
      transport: Arc<dyn Transport>,
      kv: Arc<dyn KvStore>,
      clock: SharedClock,
   ) -> Result<Self> {
      Self::build(cfg, transport, kv, clock, None)
   }

   /// Same as [`Self::new`] with deterministic random endpoint picks.
   pub fn with_seed(
      cfg: &Config,
      transport: Arc<dyn Transport>,
      kv: Arc<dyn KvStore>,
      clock: SharedClock,
      seed: u64,
   ) -> Result<Self> {
      Self::build(cfg, transport, kv, clock, Some(seed))
   }

   fn build(
      cfg: &Config,
      transport: Arc<dyn Transport>,
      kv: Arc<dyn KvStore>,
      clock: SharedClock,
      seed: Option<u64>,
   ) -> Result<Self> {
      cfg.validate()?;

      let health = EndpointHealthStore::load(
         cfg.edges.clone(),
         HealthPolicy::from_config(cfg),
         Arc::clone(&kv),
         Arc::clone(&clock),
      );
      let health = Arc::new(Mutex::new(health));
      let max_attempts = cfg.effective_max_attempts();
      let router = match seed {
         Some(seed) => EdgeRouter::with_seed(health, max_attempts, seed),
         None => EdgeRouter::new(health, max_attempts),
      };

      let events = events::channel();
      let fetch = FetchExecutor::new(
         transport,
         router,
         cfg.origin.clone(),
         FetchOptions::from_config(cfg),
         Arc::clone(&clock),
         events.clone(),
      );

      Ok(Self {
         fetch,
         reconcile: Mutex::new(ReconciliationEngine::new(
            cfg.empty_streak_threshold,
            cfg.status_field.clone(),
         )),
         staleness: Mutex::new(StalenessMonitor::new(
            cfg.stale_max_age_ms,
            cfg.utc_offset_minutes,
            Arc::clone(&clock),
         )),
         snapshots: SnapshotCache::new(kv, Arc::clone(&clock)),
         clock,
         events,
         snapshot_max_age_ms: cfg.snapshot_max_age_ms as i64,
         in_flight: AtomicBool::new(false),
         manual_queued: AtomicBool::new(false),
         synced_once: AtomicBool::new(false),
      })
   }

   pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
      self.events.subscribe()
   }

   pub fn table(&self) -> CanonicalTable {
      self.reconcile.lock().table().clone()
   }

   pub fn staleness(&self) -> StalenessState {
      self.staleness.lock().state()
   }

   pub fn endpoints(&self) -> Vec<EndpointHealth> {
      self.fetch.health().lock().endpoints()
   }

   pub const fn fetch(&self) -> &FetchExecutor {
      &self.fetch
   }

   /// Paints the table from the cached snapshot if it is young enough and
   /// no live sync has landed yet.
   pub fn restore_snapshot(&self) -> Option<Snapshot> {
      if self.synced_once.load(Ordering::Acquire) {
         return None;
      }
      let snapshot = self.snapshots.load(self.snapshot_max_age_ms)?;
      let age_ms = self.snapshots.age_ms(&snapshot);

      let mut reconcile = self.reconcile.lock();
      reconcile.restore(snapshot.partitions.clone());
      let rows = reconcile.table().all_rows().count();
      let report = {
         let mut staleness = self.staleness.lock();
         if let Some(ts) = snapshot.data_timestamp {
            staleness.observe_payload_ms(ts);
         }
         staleness.evaluate(reconcile.table())
      };
      drop(reconcile);

      tracing::info!("restored snapshot with {rows} rows, {}s old", age_ms / 1000);
      events::publish(&self.events, EngineEvent::SnapshotRestored { age_ms, rows });
      self.publish_staleness(report.transition);
      Some(snapshot)
   }

   pub async fn run_cycle(&self, mode: SyncMode) -> CycleOutcome {
      let Some(mut guard) = FlightGuard::try_acquire(&self.in_flight) else {
         return if mode == SyncMode::Manual {
            self.manual_queued.store(true, Ordering::Release);
            tracing::debug!("manual refresh queued behind the running cycle");
            CycleOutcome::Queued
         } else {
            tracing::debug!("cycle skipped: another is in flight");
            CycleOutcome::Busy
         };
      };

      let mut outcome = self.cycle(mode).await;
      loop {
         while self.manual_queued.swap(false, Ordering::AcqRel) {
            outcome = self.cycle(SyncMode::Manual).await;
         }
         guard.release();
         // A manual request may land between the last swap and the release.
         if !self.manual_queued.load(Ordering::Acquire) || !guard.reacquire() {
            break;
         }
      }
      outcome
   }

   async fn cycle(&self, mode: SyncMode) -> CycleOutcome {
      let is_manual = mode == SyncMode::Manual;
      match self.fetch.sync(is_manual).await {
         Ok(batch) => self.commit(batch, is_manual),
         Err(err) => {
            tracing::warn!("sync failed: {err}");
            events::publish(&self.events, EngineEvent::SyncFailed { reason: err.to_string() });

            let reconcile = self.reconcile.lock();
            let report = self.staleness.lock().evaluate(reconcile.table());
            drop(reconcile);
            self.publish_staleness(report.transition);
            CycleOutcome::Failed(err)
         },
      }
   }

   fn commit(&self, batch: FetchedBatch, is_manual: bool) -> CycleOutcome {
      self.synced_once.store(true, Ordering::Release);
      let FetchedBatch { source, edge_index, partitions, data_timestamp } = batch;

      let mut reconcile = self.reconcile.lock();
      let merge = reconcile.merge_batch(partitions, is_manual);
      let (payload_ts, report) = {
         let mut staleness = self.staleness.lock();
         let payload_ts = data_timestamp.as_ref().and_then(|v| staleness.observe_payload(v));
         (payload_ts, staleness.evaluate(reconcile.table()))
      };
      let table = reconcile.table();
      let rows = table.all_rows().count();
      let snapshot = Snapshot {
         taken_at: self.clock.now_ms(),
         source,
         edge_index,
         data_timestamp: payload_ts,
         partitions: table
            .partitions()
            .map(|(name, part)| (name.to_string(), part.to_vec()))
            .collect(),
      };
      drop(reconcile);

      if let Err(err) = self.snapshots.store(&snapshot) {
         tracing::warn!("failed to persist snapshot: {err}");
      }

      if merge.changed {
         tracing::info!("synced {rows} rows from {} (changed)", source.as_str());
      } else {
         tracing::debug!("synced {rows} rows from {} (unchanged)", source.as_str());
      }

      events::publish(&self.events, EngineEvent::Synced {
         source,
         edge_index,
         changed: merge.changed,
         status_set_changed: merge.status_set_changed,
      });
      self.publish_staleness(report.transition);

      CycleOutcome::Synced {
         source,
         edge_index,
         changed: merge.changed,
         status_set_changed: merge.status_set_changed,
         rows,
      }
   }

   fn publish_staleness(&self, transition: Option<StaleTransition>) {
      let event = match transition {
         Some(StaleTransition::Raised { latest_data_at, age_ms }) => {
            EngineEvent::StaleRaised { latest_data_at, age_ms }
         },
         Some(StaleTransition::Cleared { latest_data_at }) => {
            EngineEvent::StaleCleared { latest_data_at }
         },
         None => return,
      };
      events::publish(&self.events, event);
   }
}
