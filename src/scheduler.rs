//! Adaptive poll timing.
//!
//! [`PollState::record`] is the pure interval controller: exponential
//! backoff on failure, a short boost after changed data, and a stepwise
//! calm-down once nothing has changed for a while. [`PollScheduler::run`]
//! drives cycles off that interval on tokio, suspends while the host is
//! hidden or offline, and wakes immediately (throttled) on host signals.

use async_trait::async_trait;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::{
   sync::mpsc,
   time::{self, Duration, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
   config::Config,
   engine::{CycleOutcome, StatusEngine, SyncMode},
};

#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
   pub base_ms:          u64,
   pub max_ms:           u64,
   pub fail_max_ms:      u64,
   pub changed_boost_ms: u64,
   pub stable_threshold: u32,
   pub calm_steps_ms:    Vec<u64>,
   pub jitter_ratio:     f64,
   pub wake_throttle_ms: u64,
   pub allow_background: bool,
}

impl PollPolicy {
   pub fn from_config(cfg: &Config) -> Self {
      Self {
         base_ms:          cfg.poll_base_ms.max(1),
         max_ms:           cfg.poll_max_ms,
         fail_max_ms:      cfg.poll_fail_max_ms,
         changed_boost_ms: cfg.changed_boost_ms,
         stable_threshold: cfg.stable_threshold,
         calm_steps_ms:    cfg.calm_steps_ms.clone(),
         jitter_ratio:     cfg.jitter_ratio,
         wake_throttle_ms: cfg.wake_throttle_ms,
         allow_background: cfg.allow_background,
      }
   }

   fn calm_step(&self, index: usize) -> u64 {
      self
         .calm_steps_ms
         .get(index)
         .or_else(|| self.calm_steps_ms.last())
         .copied()
         .unwrap_or(self.max_ms)
   }
}

impl Default for PollPolicy {
   fn default() -> Self {
      Self::from_config(&Config::default())
   }
}

/// What a finished cycle means for the interval controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
   Failure,
   Changed,
   Unchanged,
}

impl PollOutcome {
   /// `None` for cycles that never ran (busy or queued).
   pub fn from_cycle(outcome: &CycleOutcome) -> Option<Self> {
      match outcome {
         CycleOutcome::Synced { changed: true, .. } => Some(Self::Changed),
         CycleOutcome::Synced { changed: false, .. } => Some(Self::Unchanged),
         CycleOutcome::Failed(_) => Some(Self::Failure),
         CycleOutcome::Busy | CycleOutcome::Queued => None,
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollState {
   pub success_streak:   u32,
   pub fail_streak:      u32,
   pub next_interval_ms: u64,
}

impl PollState {
   pub const fn new(policy: &PollPolicy) -> Self {
      Self { success_streak: 0, fail_streak: 0, next_interval_ms: policy.base_ms }
   }

   pub const fn reset(&mut self, policy: &PollPolicy) {
      *self = Self::new(policy);
   }

   /// Applies one cycle outcome and returns the un-jittered next interval.
   pub fn record(&mut self, outcome: PollOutcome, policy: &PollPolicy) -> u64 {
      self.next_interval_ms = match outcome {
         PollOutcome::Failure => {
            self.fail_streak = self.fail_streak.saturating_add(1);
            self.success_streak = 0;
            let factor = 2u64.saturating_pow(self.fail_streak);
            policy
               .base_ms
               .saturating_mul(factor)
               .min(policy.fail_max_ms)
               .max(policy.base_ms)
         },
         PollOutcome::Changed => {
            self.success_streak = self.success_streak.saturating_add(1);
            self.fail_streak = 0;
            policy.base_ms.max(policy.changed_boost_ms)
         },
         PollOutcome::Unchanged => {
            self.success_streak = self.success_streak.saturating_add(1);
            self.fail_streak = 0;
            let current = self.next_interval_ms.clamp(policy.base_ms, policy.max_ms.max(policy.base_ms));
            if self.success_streak < policy.stable_threshold {
               current
            } else {
               let step = (self.success_streak - policy.stable_threshold) as usize;
               policy.calm_step(step).max(current).min(policy.max_ms.max(policy.base_ms))
            }
         },
      };
      self.next_interval_ms
   }
}

/// Spreads `interval_ms` uniformly over `±ratio`.
pub fn jittered(interval_ms: u64, ratio: f64, rng: &mut impl Rng) -> u64 {
   if ratio <= 0.0 || interval_ms == 0 {
      return interval_ms;
   }
   let base = interval_ms as f64;
   let range = base * ratio;
   let jitter = rng.random_range(-range..=range);
   (base + jitter).max(1.0).round() as u64
}

/// Host lifecycle transitions fed into the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
   Visibility(bool),
   Focus,
   Online(bool),
   ManualRefresh,
}

/// Anything the scheduler can drive one sync cycle on.
#[async_trait]
pub trait CycleRunner: Send + Sync {
   async fn run_cycle(&self, mode: SyncMode) -> CycleOutcome;
}

#[async_trait]
impl CycleRunner for StatusEngine {
   async fn run_cycle(&self, mode: SyncMode) -> CycleOutcome {
      Self::run_cycle(self, mode).await
   }
}

#[derive(Debug, Clone, Copy)]
struct HostState {
   visible: bool,
   online:  bool,
}

pub struct PollScheduler {
   policy:    PollPolicy,
   state:     PollState,
   rng:       StdRng,
   last_wake: Option<Instant>,
}

impl PollScheduler {
   pub fn new(policy: PollPolicy) -> Self {
      Self::with_rng(policy, StdRng::from_os_rng())
   }

   pub fn with_seed(policy: PollPolicy, seed: u64) -> Self {
      Self::with_rng(policy, StdRng::seed_from_u64(seed))
   }

   fn with_rng(policy: PollPolicy, rng: StdRng) -> Self {
      let state = PollState::new(&policy);
      Self { policy, state, rng, last_wake: None }
   }

   pub const fn state(&self) -> PollState {
      self.state
   }

   /// Runs cycles until `cancel` fires. The first cycle starts immediately.
   /// A closed `signals` channel leaves the loop running on its timer.
   pub async fn run<R: CycleRunner + ?Sized>(
      &mut self,
      runner: &R,
      mut signals: mpsc::Receiver<HostSignal>,
      cancel: CancellationToken,
   ) -> PollState {
      let mut host = HostState { visible: true, online: true };
      let mut pending = Some(SyncMode::Scheduled);
      let mut deadline = Instant::now();

      loop {
         let suspended = !host.online || (!host.visible && !self.policy.allow_background);

         if !suspended || pending == Some(SyncMode::Manual) {
            if let Some(mode) = pending.take() {
               let outcome = tokio::select! {
                  () = cancel.cancelled() => break,
                  outcome = runner.run_cycle(mode) => outcome,
               };
               let wait = self.after_cycle(&outcome);
               deadline = Instant::now() + Duration::from_millis(wait);

               // Signals that piled up during the cycle collapse into one.
               while let Ok(signal) = signals.try_recv() {
                  self.on_signal(signal, &mut host, &mut pending);
               }
               continue;
            }
         }

         tokio::select! {
            () = cancel.cancelled() => break,
            Some(signal) = signals.recv() => self.on_signal(signal, &mut host, &mut pending),
            () = time::sleep_until(deadline), if !suspended => pending = Some(SyncMode::Scheduled),
         }
      }

      tracing::debug!("poll scheduler stopped");
      self.state
   }

   fn after_cycle(&mut self, outcome: &CycleOutcome) -> u64 {
      if let Some(poll) = PollOutcome::from_cycle(outcome) {
         self.state.record(poll, &self.policy);
      }
      let wait = jittered(self.state.next_interval_ms, self.policy.jitter_ratio, &mut self.rng);
      tracing::debug!(
         "next poll in {wait}ms (streak ok={} fail={})",
         self.state.success_streak,
         self.state.fail_streak
      );
      wait
   }

   fn on_signal(&mut self, signal: HostSignal, host: &mut HostState, pending: &mut Option<SyncMode>) {
      match signal {
         HostSignal::ManualRefresh => {
            self.state.reset(&self.policy);
            *pending = Some(SyncMode::Manual);
         },
         HostSignal::Visibility(visible) => {
            host.visible = visible;
            if visible {
               self.wake(pending);
            } else if !self.policy.allow_background {
               tracing::debug!("host hidden; polling suspended");
            }
         },
         HostSignal::Focus => self.wake(pending),
         HostSignal::Online(online) => {
            host.online = online;
            if online {
               self.wake(pending);
            } else {
               tracing::debug!("host offline; polling suspended");
            }
         },
      }
   }

   /// Resets the controller and asks for an immediate cycle, at most once
   /// per wake throttle window.
   fn wake(&mut self, pending: &mut Option<SyncMode>) {
      let now = Instant::now();
      let throttle = Duration::from_millis(self.policy.wake_throttle_ms);
      if self.last_wake.is_some_and(|last| now.duration_since(last) < throttle) {
         tracing::debug!("wake throttled");
         return;
      }
      self.last_wake = Some(now);
      self.state.reset(&self.policy);
      if *pending != Some(SyncMode::Manual) {
         *pending = Some(SyncMode::Scheduled);
      }
   }
}
