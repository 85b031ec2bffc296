//! Fetching one status payload per cycle.
//!
//! Edges are tried in the order chosen by [`EdgeRouter`]. Latency-sensitive
//! cycles (manual refresh or the first sync of the process) race a second
//! edge after a short delay; the first success wins and the losers keep
//! running detached so their outcome still feeds endpoint health. When every
//! edge fails the origin is asked once with a longer timeout.

pub mod http;
pub mod payload;

use std::{
   collections::VecDeque,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
   sync::mpsc,
   time::{self, Instant},
};

pub use self::{
   http::HttpTransport,
   payload::{DecodedPayload, PayloadOptions},
};
use crate::{
   clock::SharedClock,
   config::Config,
   edge::{EdgeRouter, EndpointHealthStore},
   error::{AttemptFailure, Error, FetchError, Result},
   events::{self, EngineEvent, EventSender},
   types::{FetchedBatch, SyncSource},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
   pub status: u16,
   pub body:   Vec<u8>,
}

/// Minimal HTTP GET seam so tests can script endpoint behavior.
#[async_trait]
pub trait Transport: Send + Sync {
   async fn get(&self, url: &str, timeout: Duration) -> Result<TransportResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
   pub request_timeout:       Duration,
   pub origin_timeout:        Duration,
   pub hedge_delay:           Duration,
   pub hedge_fanout:          usize,
   pub edge_empty_is_failure: bool,
   pub query_mode:            String,
   pub payload:               PayloadOptions,
}

impl FetchOptions {
   pub fn from_config(cfg: &Config) -> Self {
      Self {
         request_timeout:       cfg.request_timeout(),
         origin_timeout:        cfg.origin_timeout(),
         hedge_delay:           cfg.hedge_delay(),
         hedge_fanout:          cfg.effective_hedge_fanout(),
         edge_empty_is_failure: cfg.edge_empty_is_failure,
         query_mode:            cfg.query_mode.clone(),
         payload:               PayloadOptions {
            partitions: cfg.partitions.clone(),
            id_fields:  cfg.id_fields.clone(),
         },
      }
   }
}

type AttemptResult = (usize, Result<FetchedBatch, FetchError>);

/// State shared with detached attempt tasks.
struct Shared {
   transport: Arc<dyn Transport>,
   health:    Arc<Mutex<EndpointHealthStore>>,
   opts:      FetchOptions,
   clock:     SharedClock,
   events:    EventSender,
}

impl Shared {
   async fn request(
      &self,
      base: &str,
      timeout: Duration,
      source: SyncSource,
      edge_index: Option<usize>,
   ) -> Result<FetchedBatch, FetchError> {
      let url = request_url(base, &self.opts.query_mode, self.clock.now_ms());
      let response = time::timeout(timeout, self.transport.get(&url, timeout))
         .await
         .map_err(|_| FetchError::Timeout)??;

      if !(200..300).contains(&response.status) {
         return Err(FetchError::Status(response.status));
      }

      let decoded = payload::decode(&response.body, &self.opts.payload)?;
      if source == SyncSource::Edge && self.opts.edge_empty_is_failure && decoded.row_count() == 0 {
         return Err(FetchError::EmptyPayload);
      }

      Ok(FetchedBatch {
         source,
         edge_index,
         partitions: decoded.partitions,
         data_timestamp: decoded.timestamp,
      })
   }

   /// One edge attempt, including its health bookkeeping.
   async fn attempt_edge(&self, idx: usize, preferred: bool) -> Result<FetchedBatch, FetchError> {
      let Some(url) = self.health.lock().url(idx).map(str::to_owned) else {
         return Err(FetchError::Transport(format!("no edge at index {idx}")));
      };

      let started = Instant::now();
      let result = self
         .request(&url, self.opts.request_timeout, SyncSource::Edge, Some(idx))
         .await;

      match &result {
         Ok(batch) => {
            let rtt_ms = started.elapsed().as_secs_f64() * 1000.0;
            tracing::debug!("edge#{idx} ok in {rtt_ms:.0}ms, {} rows", batch.row_count());
            self.health.lock().record_success(idx, rtt_ms);
         },
         Err(err) => {
            tracing::debug!("edge#{idx} failed: {err}");
            let reroute = self.health.lock().record_failure(idx, err, preferred);
            if let Some(r) = reroute {
               tracing::info!("rerouting edge#{} -> edge#{} until {}", r.from, r.to, r.expires_at);
               events::publish(&self.events, EngineEvent::Rerouted {
                  from:       r.from,
                  to:         r.to,
                  expires_at: r.expires_at,
               });
            }
         },
      }
      result
   }
}

pub struct FetchExecutor {
   shared:     Arc<Shared>,
   router:     EdgeRouter,
   origin:     Option<String>,
   first_sync: AtomicBool,
}

impl FetchExecutor {
   pub fn new(
      transport: Arc<dyn Transport>,
      router: EdgeRouter,
      origin: Option<String>,
      opts: FetchOptions,
      clock: SharedClock,
      events: EventSender,
   ) -> Self {
      let shared = Arc::new(Shared {
         transport,
         health: Arc::clone(router.health()),
         opts,
         clock,
         events,
      });
      Self { shared, router, origin, first_sync: AtomicBool::new(true) }
   }

   pub const fn router(&self) -> &EdgeRouter {
      &self.router
   }

   pub fn health(&self) -> &Arc<Mutex<EndpointHealthStore>> {
      &self.shared.health
   }

   /// Fetches one payload, failing only when every edge and the origin
   /// failed.
   pub async fn sync(&self, is_manual: bool) -> Result<FetchedBatch> {
      let plan = self.router.select_attempt_order();
      let preferred = plan.preferred();
      let first = self.first_sync.swap(false, Ordering::AcqRel);
      let mut remaining: VecDeque<usize> = plan.order.into();
      let mut failures = Vec::new();

      let hedge = (is_manual || first) && remaining.len() >= 2 && self.shared.opts.hedge_fanout >= 2;
      if hedge {
         if let Some(batch) = self.hedged(&mut remaining, preferred, &mut failures).await {
            return Ok(batch);
         }
      }

      while let Some(idx) = remaining.pop_front() {
         match self.shared.attempt_edge(idx, Some(idx) == preferred).await {
            Ok(batch) => return Ok(batch),
            Err(error) => failures.push(edge_failure(idx, error)),
         }
      }

      if let Some(origin) = &self.origin {
         let result = self
            .shared
            .request(origin, self.shared.opts.origin_timeout, SyncSource::Origin, None)
            .await;
         match result {
            Ok(batch) => {
               tracing::info!("served from origin after {} edge failures", failures.len());
               return Ok(batch);
            },
            Err(error) => {
               tracing::debug!("origin failed: {error}");
               failures.push(AttemptFailure { endpoint: "origin".to_string(), error });
            },
         }
      }

      tracing::debug!("sync exhausted all {} sources", failures.len());
      Err(Error::AllEndpointsFailed { attempts: failures })
   }

   /// Races edges with at most `hedge_fanout` in flight. A new attempt starts
   /// when a slot is free and the hedge delay has elapsed, or at once when
   /// nothing is in flight any more. Returns `None` once every launched
   /// attempt failed; unlaunched indices stay in `remaining`.
   async fn hedged(
      &self,
      remaining: &mut VecDeque<usize>,
      preferred: Option<usize>,
      failures: &mut Vec<AttemptFailure>,
   ) -> Option<FetchedBatch> {
      let fanout = self.shared.opts.hedge_fanout;
      let delay = self.shared.opts.hedge_delay;
      let (tx, mut rx) = mpsc::unbounded_channel::<AttemptResult>();
      let mut launched = 0usize;
      let mut in_flight = 0usize;
      let mut next_hedge = Instant::now();

      loop {
         if in_flight < fanout && (in_flight == 0 || Instant::now() >= next_hedge) {
            if let Some(idx) = remaining.pop_front() {
               self.spawn_attempt(idx, Some(idx) == preferred, tx.clone());
               launched += 1;
               in_flight += 1;
               next_hedge = Instant::now() + delay;
               continue;
            }
         }
         if in_flight == 0 {
            return None;
         }

         let can_hedge = in_flight < fanout && !remaining.is_empty();
         tokio::select! {
            Some((idx, result)) = rx.recv() => {
               in_flight -= 1;
               match result {
                  Ok(batch) => {
                     tracing::debug!("hedged fetch won by edge#{idx} ({launched} launched)");
                     return Some(batch);
                  },
                  Err(error) => failures.push(edge_failure(idx, error)),
               }
            },
            () = time::sleep_until(next_hedge), if can_hedge => {},
         }
      }
   }

   fn spawn_attempt(&self, idx: usize, preferred: bool, tx: mpsc::UnboundedSender<AttemptResult>) {
      let shared = Arc::clone(&self.shared);
      tokio::spawn(async move {
         let result = shared.attempt_edge(idx, preferred).await;
         // The receiver is gone once a winner was returned.
         let _ = tx.send((idx, result));
      });
   }
}

fn edge_failure(idx: usize, error: FetchError) -> AttemptFailure {
   AttemptFailure { endpoint: format!("edge#{idx}"), error }
}

fn request_url(base: &str, mode: &str, cache_buster: i64) -> String {
   let sep = if base.contains('?') { '&' } else { '?' };
   format!("{base}{sep}mode={mode}&v={cache_buster}")
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn request_url_appends_mode_and_cache_buster() {
      assert_eq!(
         request_url("https://e0.test/exec", "sheet_all", 42),
         "https://e0.test/exec?mode=sheet_all&v=42"
      );
      assert_eq!(
         request_url("https://e0.test/exec?key=k", "sheet_all", 42),
         "https://e0.test/exec?key=k&mode=sheet_all&v=42"
      );
   }
}
