#![allow(dead_code)]

use std::{
   collections::{HashMap, VecDeque},
   sync::Arc,
   time::Duration,
};

use parking_lot::Mutex;
use serde_json::{Value, json};
use status_sync::{
   clock::{ManualClock, SharedClock},
   config::Config,
   edge::{EdgeRouter, EndpointHealthStore, HealthPolicy},
   error::FetchError,
   events::EventSender,
   fetch::{FetchExecutor, FetchOptions, Transport, TransportResponse},
   kv::{KvStore, MemoryKv},
};

pub const E0: &str = "https://e0.test/exec";
pub const E1: &str = "https://e1.test/exec";
pub const E2: &str = "https://e2.test/exec";
pub const ORIGIN: &str = "https://origin.test/exec";

/// 2024-05-01T02:00:00Z
pub const T0: i64 = 1_714_528_800_000;

#[derive(Debug, Clone)]
pub enum Reply {
   Json { delay: Duration, body: Value },
   Status { delay: Duration, code: u16 },
   /// Never answers; the caller's timeout fires first.
   Hang,
}

impl Reply {
   pub fn json(body: Value) -> Self {
      Self::Json { delay: Duration::ZERO, body }
   }

   pub fn json_after(ms: u64, body: Value) -> Self {
      Self::Json { delay: Duration::from_millis(ms), body }
   }

   pub const fn status(code: u16) -> Self {
      Self::Status { delay: Duration::ZERO, code }
   }
}

/// Transport answering from per-endpoint scripts. Queued replies are used
/// first, then the endpoint's standing reply, else 404.
#[derive(Default)]
pub struct ScriptedTransport {
   queued:   Mutex<HashMap<String, VecDeque<Reply>>>,
   standing: Mutex<HashMap<String, Reply>>,
   calls:    Mutex<Vec<String>>,
}

impl ScriptedTransport {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn always(&self, endpoint: &str, reply: Reply) {
      self.standing.lock().insert(endpoint.to_string(), reply);
   }

   pub fn then(&self, endpoint: &str, reply: Reply) {
      self
         .queued
         .lock()
         .entry(endpoint.to_string())
         .or_default()
         .push_back(reply);
   }

   /// Endpoints hit so far, in call order, without query strings.
   pub fn calls(&self) -> Vec<String> {
      self.calls.lock().clone()
   }

   pub fn calls_to(&self, endpoint: &str) -> usize {
      self.calls.lock().iter().filter(|c| *c == endpoint).count()
   }

   fn next_reply(&self, endpoint: &str) -> Reply {
      if let Some(reply) = self
         .queued
         .lock()
         .get_mut(endpoint)
         .and_then(VecDeque::pop_front)
      {
         return reply;
      }
      self
         .standing
         .lock()
         .get(endpoint)
         .cloned()
         .unwrap_or(Reply::status(404))
   }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
   async fn get(&self, url: &str, _timeout: Duration) -> Result<TransportResponse, FetchError> {
      let endpoint = url.split('?').next().unwrap_or(url).to_string();
      assert!(url.contains("mode=sheet_all&v="), "missing query: {url}");
      self.calls.lock().push(endpoint.clone());

      match self.next_reply(&endpoint) {
         Reply::Json { delay, body } => {
            tokio::time::sleep(delay).await;
            Ok(TransportResponse { status: 200, body: body.to_string().into_bytes() })
         },
         Reply::Status { delay, code } => {
            tokio::time::sleep(delay).await;
            Ok(TransportResponse { status: code, body: Vec::new() })
         },
         Reply::Hang => {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(FetchError::Timeout)
         },
      }
   }
}

pub fn config(edges: &[&str], origin: Option<&str>) -> Config {
   Config {
      edges: edges.iter().map(|e| (*e).to_string()).collect(),
      origin: origin.map(str::to_string),
      ..Config::default()
   }
}

pub fn payload(body: Value, foot: Value) -> Value {
   json!({ "ok": true, "body": body, "foot": foot })
}

pub fn tech(id: &str, status: &str) -> Value {
   json!({ "id": id, "status": status })
}

pub fn shared(clock: &ManualClock) -> SharedClock {
   Arc::new(clock.clone())
}

pub fn memory_kv(clock: &ManualClock) -> Arc<dyn KvStore> {
   Arc::new(MemoryKv::new(shared(clock)))
}

pub fn executor(
   cfg: &Config,
   transport: Arc<ScriptedTransport>,
   clock: &ManualClock,
   events: EventSender,
) -> FetchExecutor {
   let health = EndpointHealthStore::load(
      cfg.edges.clone(),
      HealthPolicy::from_config(cfg),
      memory_kv(clock),
      shared(clock),
   );
   let router =
      EdgeRouter::with_seed(Arc::new(Mutex::new(health)), cfg.effective_max_attempts(), 11);
   FetchExecutor::new(
      transport,
      router,
      cfg.origin.clone(),
      FetchOptions::from_config(cfg),
      shared(clock),
      events,
   )
}
