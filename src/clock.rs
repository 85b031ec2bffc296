//! Wall-clock abstraction so TTLs, cooldowns and staleness can be tested
//! deterministically.

use std::sync::{
   Arc,
   atomic::{AtomicI64, Ordering},
};

use chrono::Utc;

pub trait Clock: Send + Sync {
   /// Milliseconds since the Unix epoch.
   fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
   fn now_ms(&self) -> i64 {
      Utc::now().timestamp_millis()
   }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
   now: Arc<AtomicI64>,
}

impl ManualClock {
   pub fn new(start_ms: i64) -> Self {
      Self { now: Arc::new(AtomicI64::new(start_ms)) }
   }

   pub fn advance_ms(&self, delta: i64) {
      self.now.fetch_add(delta, Ordering::SeqCst);
   }

   pub fn set_ms(&self, now: i64) {
      self.now.store(now, Ordering::SeqCst);
   }
}

impl Clock for ManualClock {
   fn now_ms(&self) -> i64 {
      self.now.load(Ordering::SeqCst)
   }
}

pub type SharedClock = Arc<dyn Clock>;
