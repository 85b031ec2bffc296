//! Per-endpoint health: RTT estimates, cooldowns, reroute counter and the
//! sticky route override.
//!
//! All state is persisted through [`KvStore`] after every mutation so a
//! restarted client keeps routing away from endpoints that were failing.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
   clock::SharedClock,
   config::Config,
   error::FetchError,
   kv::{self, KvStore},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthPolicy {
   pub rtt_alpha:         f64,
   pub rtt_ttl_ms:        i64,
   pub cooldown_ms:       i64,
   pub reroute_threshold: u32,
   pub override_ttl_ms:   i64,
}

impl HealthPolicy {
   pub fn from_config(cfg: &Config) -> Self {
      Self {
         rtt_alpha:         cfg.rtt_alpha,
         rtt_ttl_ms:        cfg.rtt_ttl_ms as i64,
         cooldown_ms:       cfg.cooldown_ms as i64,
         reroute_threshold: cfg.reroute_threshold.max(1),
         override_ttl_ms:   cfg.override_ttl_ms as i64,
      }
   }
}

impl Default for HealthPolicy {
   fn default() -> Self {
      Self::from_config(&Config::default())
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct RttEntry {
   rtt: f64,
   t:   i64,
}

/// Sticky pin to one endpoint index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteOverride {
   #[serde(rename = "idx")]
   pub index:      usize,
   #[serde(rename = "exp")]
   pub expires_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct FailCount {
   idx: usize,
   n:   u32,
   t:   i64,
}

/// Emitted when repeated failures of the preferred endpoint move the pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reroute {
   pub from:       usize,
   pub to:         usize,
   pub expires_at: i64,
}

/// Read-only view of one endpoint for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointHealth {
   pub index:          usize,
   pub url:            String,
   pub rtt_ewma:       Option<f64>,
   pub last_seen_at:   Option<i64>,
   pub fail_count:     u32,
   pub cooldown_until: Option<i64>,
   pub pinned:         bool,
}

pub struct EndpointHealthStore {
   urls:           Vec<String>,
   policy:         HealthPolicy,
   kv:             Arc<dyn KvStore>,
   clock:          SharedClock,
   perf:           HashMap<String, RttEntry>,
   cooldown:       HashMap<String, i64>,
   route_override: Option<RouteOverride>,
   failcount:      Option<FailCount>,
}

impl EndpointHealthStore {
   pub fn load(
      urls: Vec<String>,
      policy: HealthPolicy,
      kv: Arc<dyn KvStore>,
      clock: SharedClock,
   ) -> Self {
      let perf = kv::get_json(kv.as_ref(), kv::KEY_EDGE_PERF).unwrap_or_default();
      let cooldown = kv::get_json(kv.as_ref(), kv::KEY_COOLDOWN).unwrap_or_default();
      let route_override = kv::get_json(kv.as_ref(), kv::KEY_ROUTE_OVERRIDE);
      let failcount = kv::get_json(kv.as_ref(), kv::KEY_ROUTE_FAILCOUNT);
      Self { urls, policy, kv, clock, perf, cooldown, route_override, failcount }
   }

   pub fn len(&self) -> usize {
      self.urls.len()
   }

   pub fn is_empty(&self) -> bool {
      self.urls.is_empty()
   }

   pub fn url(&self, idx: usize) -> Option<&str> {
      self.urls.get(idx).map(String::as_str)
   }

   pub fn now_ms(&self) -> i64 {
      self.clock.now_ms()
   }

   /// RTT estimate, only if measured within the TTL.
   pub fn rtt(&self, idx: usize) -> Option<f64> {
      let entry = self.perf.get(self.urls.get(idx)?)?;
      let fresh = self.clock.now_ms() - entry.t <= self.policy.rtt_ttl_ms;
      fresh.then_some(entry.rtt)
   }

   pub fn cooldown_until(&self, idx: usize) -> Option<i64> {
      let until = *self.cooldown.get(self.urls.get(idx)?)?;
      (until > self.clock.now_ms()).then_some(until)
   }

   pub fn in_cooldown(&self, idx: usize) -> bool {
      self.cooldown_until(idx).is_some()
   }

   pub fn active_override(&self) -> Option<RouteOverride> {
      let pin = self.route_override?;
      (pin.expires_at > self.clock.now_ms() && pin.index < self.urls.len()).then_some(pin)
   }

   pub fn fail_count(&self, idx: usize) -> u32 {
      self
         .failcount
         .filter(|fc| fc.idx == idx)
         .map_or(0, |fc| fc.n)
   }

   /// Index with the lowest fresh RTT, ties broken by lower index.
   pub fn fastest(&self) -> Option<usize> {
      (0..self.urls.len())
         .filter_map(|idx| self.rtt(idx).map(|rtt| (idx, rtt)))
         .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
         .map(|(idx, _)| idx)
   }

   pub fn record_success(&mut self, idx: usize, rtt_ms: f64) {
      let Some(url) = self.urls.get(idx).cloned() else {
         return;
      };
      let now = self.clock.now_ms();
      let rtt = match self.rtt(idx) {
         Some(prev) => prev + self.policy.rtt_alpha * (rtt_ms - prev),
         None => rtt_ms,
      };
      self.perf.insert(url.clone(), RttEntry { rtt, t: now });
      self.persist_perf();

      if self.cooldown.remove(&url).is_some() {
         self.persist_cooldown();
      }

      if self.failcount.is_some_and(|fc| fc.idx == idx) {
         self.failcount = None;
         self.kv.remove(kv::KEY_ROUTE_FAILCOUNT);
      }

      // A pin only stays while its own target keeps serving.
      if self.active_override().is_some_and(|pin| pin.index != idx) {
         tracing::debug!("clearing route override after success on edge#{idx}");
         self.route_override = None;
         self.kv.remove(kv::KEY_ROUTE_OVERRIDE);
      }
   }

   /// Applies cooldown for transient failures and advances the reroute
   /// counter when `idx` was the cycle's preferred start.
   pub fn record_failure(
      &mut self,
      idx: usize,
      error: &FetchError,
      was_preferred: bool,
   ) -> Option<Reroute> {
      let url = self.urls.get(idx).cloned()?;
      let now = self.clock.now_ms();

      if error.is_transient_infra() {
         self.cooldown.insert(url, now + self.policy.cooldown_ms);
         self.persist_cooldown();
      }

      if !was_preferred {
         return None;
      }

      let n = match self.failcount {
         Some(fc) if fc.idx == idx => fc.n + 1,
         _ => 1,
      };

      if n < self.policy.reroute_threshold || self.urls.len() < 2 {
         let fc = FailCount { idx, n, t: now };
         self.failcount = Some(fc);
         self.persist(kv::KEY_ROUTE_FAILCOUNT, &fc, self.policy.override_ttl_ms);
         return None;
      }

      let to = (idx + 1) % self.urls.len();
      let pin = RouteOverride { index: to, expires_at: now + self.policy.override_ttl_ms };
      self.route_override = Some(pin);
      self.persist(kv::KEY_ROUTE_OVERRIDE, &pin, self.policy.override_ttl_ms);
      self.failcount = None;
      self.kv.remove(kv::KEY_ROUTE_FAILCOUNT);

      Some(Reroute { from: idx, to, expires_at: pin.expires_at })
   }

   pub fn endpoints(&self) -> Vec<EndpointHealth> {
      let pin = self.active_override();
      self
         .urls
         .iter()
         .enumerate()
         .map(|(index, url)| EndpointHealth {
            index,
            url: url.clone(),
            rtt_ewma: self.rtt(index),
            last_seen_at: self.perf.get(url).map(|e| e.t),
            fail_count: self.fail_count(index),
            cooldown_until: self.cooldown_until(index),
            pinned: pin.is_some_and(|p| p.index == index),
         })
         .collect()
   }

   fn persist_perf(&self) {
      let ttl = self.policy.rtt_ttl_ms;
      let now = self.clock.now_ms();
      let fresh: HashMap<&String, &RttEntry> = self
         .perf
         .iter()
         .filter(|(_, e)| now - e.t <= ttl)
         .collect();
      self.persist(kv::KEY_EDGE_PERF, &fresh, ttl);
   }

   fn persist_cooldown(&self) {
      let now = self.clock.now_ms();
      let live: HashMap<&String, &i64> = self
         .cooldown
         .iter()
         .filter(|(_, until)| **until > now)
         .collect();
      self.persist(kv::KEY_COOLDOWN, &live, self.policy.cooldown_ms);
   }

   fn persist<T: Serialize>(&self, key: &str, value: &T, ttl_ms: i64) {
      let ttl = Duration::from_millis(ttl_ms.max(0) as u64);
      if let Err(e) = kv::set_json(self.kv.as_ref(), key, value, Some(ttl)) {
         tracing::warn!("failed to persist {key}: {e}");
      }
   }
}
