//! Attempt ordering over edge endpoints.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::health::EndpointHealthStore;

/// Endpoints to try this cycle, in order. `order[0]` is the preferred start
/// that the reroute counter is tied to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttemptPlan {
   pub order: Vec<usize>,
}

impl AttemptPlan {
   pub fn preferred(&self) -> Option<usize> {
      self.order.first().copied()
   }

   pub fn is_empty(&self) -> bool {
      self.order.is_empty()
   }
}

/// Picks the start endpoint: active override, else lowest fresh RTT, else
/// uniformly at random.
pub fn choose_start(health: &EndpointHealthStore, rng: &mut impl Rng) -> Option<usize> {
   if health.is_empty() {
      return None;
   }
   if let Some(pin) = health.active_override() {
      return Some(pin.index);
   }
   health
      .fastest()
      .or_else(|| Some(rng.random_range(0..health.len())))
}

/// Round-robin from `start`, skipping endpoints in cooldown unless that would
/// leave nothing to try.
pub fn select_attempt_order(
   health: &EndpointHealthStore,
   max_attempts: usize,
   rng: &mut impl Rng,
) -> AttemptPlan {
   let Some(start) = choose_start(health, rng) else {
      return AttemptPlan::default();
   };
   let n = health.len();
   let limit = max_attempts.min(n).max(1);
   let ring = (0..n).map(|k| (start + k) % n);

   let mut order: Vec<usize> = ring
      .clone()
      .filter(|&idx| !health.in_cooldown(idx))
      .take(limit)
      .collect();
   if order.is_empty() {
      tracing::debug!("every edge is cooling down; ignoring cooldown");
      order = ring.take(limit).collect();
   }
   AttemptPlan { order }
}

pub struct EdgeRouter {
   health:       Arc<Mutex<EndpointHealthStore>>,
   max_attempts: usize,
   rng:          Mutex<StdRng>,
}

impl EdgeRouter {
   pub fn new(health: Arc<Mutex<EndpointHealthStore>>, max_attempts: usize) -> Self {
      Self { health, max_attempts, rng: Mutex::new(StdRng::from_os_rng()) }
   }

   pub fn with_seed(
      health: Arc<Mutex<EndpointHealthStore>>,
      max_attempts: usize,
      seed: u64,
   ) -> Self {
      Self { health, max_attempts, rng: Mutex::new(StdRng::seed_from_u64(seed)) }
   }

   pub fn health(&self) -> &Arc<Mutex<EndpointHealthStore>> {
      &self.health
   }

   pub fn select_attempt_order(&self) -> AttemptPlan {
      let health = self.health.lock();
      let mut rng = self.rng.lock();
      select_attempt_order(&health, self.max_attempts, &mut *rng)
   }
}
