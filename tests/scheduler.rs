use std::{collections::VecDeque, sync::Arc, time::Duration};

use parking_lot::Mutex;
use proptest::prelude::*;
use status_sync::{
   CycleOutcome, Error, SyncMode,
   scheduler::{CycleRunner, HostSignal, PollOutcome, PollPolicy, PollScheduler, PollState},
   types::SyncSource,
};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
enum Scripted {
   Fail,
   Changed,
   Unchanged,
}

/// Records when cycles run and answers from a script (last entry repeats).
struct FakeRunner {
   started: Instant,
   script:  Mutex<VecDeque<Scripted>>,
   runs:    Mutex<Vec<(u64, SyncMode)>>,
}

impl FakeRunner {
   fn new(script: &[Scripted]) -> Arc<Self> {
      Arc::new(Self {
         started: Instant::now(),
         script:  Mutex::new(script.iter().copied().collect()),
         runs:    Mutex::new(Vec::new()),
      })
   }

   fn times(&self) -> Vec<u64> {
      self.runs.lock().iter().map(|(t, _)| *t).collect()
   }

   fn modes(&self) -> Vec<SyncMode> {
      self.runs.lock().iter().map(|(_, m)| *m).collect()
   }
}

#[async_trait::async_trait]
impl CycleRunner for FakeRunner {
   async fn run_cycle(&self, mode: SyncMode) -> CycleOutcome {
      let at = self.started.elapsed().as_millis() as u64;
      self.runs.lock().push((at, mode));
      let next = {
         let mut script = self.script.lock();
         if script.len() > 1 { script.pop_front() } else { script.front().copied() }
      };
      match next.unwrap_or(Scripted::Unchanged) {
         Scripted::Fail => CycleOutcome::Failed(Error::AllEndpointsFailed { attempts: Vec::new() }),
         Scripted::Changed | Scripted::Unchanged => CycleOutcome::Synced {
            source:             SyncSource::Edge,
            edge_index:         Some(0),
            changed:            matches!(next, Some(Scripted::Changed)),
            status_set_changed: false,
            rows:               1,
         },
      }
   }
}

fn policy() -> PollPolicy {
   PollPolicy { jitter_ratio: 0.0, ..PollPolicy::default() }
}

/// Runs the scheduler until `stop_ms`, delivering `signals` at their times.
async fn drive(
   runner: &Arc<FakeRunner>,
   policy: PollPolicy,
   signals: Vec<(u64, HostSignal)>,
   stop_ms: u64,
) -> PollState {
   let (tx, rx) = mpsc::channel(16);
   let cancel = CancellationToken::new();
   let start = Instant::now();

   tokio::spawn(async move {
      for (at, signal) in signals {
         tokio::time::sleep_until(start + Duration::from_millis(at)).await;
         if tx.send(signal).await.is_err() {
            break;
         }
      }
   });
   {
      let cancel = cancel.clone();
      tokio::spawn(async move {
         tokio::time::sleep_until(start + Duration::from_millis(stop_ms)).await;
         cancel.cancel();
      });
   }

   let mut scheduler = PollScheduler::with_seed(policy, 1);
   scheduler.run(runner.as_ref(), rx, cancel).await
}

#[tokio::test(start_paused = true)]
async fn failures_back_off_between_cycles() {
   let runner = FakeRunner::new(&[Scripted::Fail]);
   let state = drive(&runner, policy(), Vec::new(), 50_000).await;
   assert_eq!(runner.times(), [0, 6_000, 18_000, 42_000]);
   assert_eq!(state.fail_streak, 4);
}

#[tokio::test(start_paused = true)]
async fn quiet_data_slows_polling_down() {
   let runner = FakeRunner::new(&[Scripted::Changed, Scripted::Unchanged]);
   drive(&runner, policy(), Vec::new(), 40_000).await;
   // 4.5s boost, hold at streak 2, then 5s, 8s, 12s.
   assert_eq!(runner.times(), [0, 4_500, 9_000, 14_000, 22_000, 34_000]);
}

#[tokio::test(start_paused = true)]
async fn hidden_host_suspends_and_visibility_wakes_once() {
   let runner = FakeRunner::new(&[Scripted::Unchanged]);
   let signals = vec![
      (1_000, HostSignal::Visibility(false)),
      (30_000, HostSignal::Visibility(true)),
      (30_500, HostSignal::Focus),
   ];
   drive(&runner, policy(), signals, 32_000).await;
   assert_eq!(runner.times(), [0, 30_000]);
}

#[tokio::test(start_paused = true)]
async fn background_polling_can_be_allowed() {
   let runner = FakeRunner::new(&[Scripted::Unchanged]);
   let policy = PollPolicy { allow_background: true, ..policy() };
   drive(&runner, policy, vec![(1_000, HostSignal::Visibility(false))], 7_000).await;
   assert_eq!(runner.times(), [0, 3_000, 6_000]);
}

#[tokio::test(start_paused = true)]
async fn offline_suspends_until_back_online() {
   let runner = FakeRunner::new(&[Scripted::Fail]);
   let signals = vec![(500, HostSignal::Online(false)), (20_000, HostSignal::Online(true))];
   let state = drive(&runner, policy(), signals, 21_000).await;
   assert_eq!(runner.times(), [0, 20_000]);
   // The wake reset the backoff before the next failure.
   assert_eq!(state.fail_streak, 1);
}

#[tokio::test(start_paused = true)]
async fn manual_refresh_runs_immediately_even_when_hidden() {
   let runner = FakeRunner::new(&[Scripted::Unchanged]);
   let signals = vec![(1_000, HostSignal::Visibility(false)), (2_000, HostSignal::ManualRefresh)];
   drive(&runner, policy(), signals, 10_000).await;
   assert_eq!(runner.times(), [0, 2_000]);
   assert_eq!(runner.modes(), [SyncMode::Scheduled, SyncMode::Manual]);
}

#[tokio::test(start_paused = true)]
async fn manual_refresh_resets_the_backoff() {
   let runner = FakeRunner::new(&[Scripted::Fail, Scripted::Fail, Scripted::Unchanged]);
   drive(&runner, policy(), vec![(7_000, HostSignal::ManualRefresh)], 11_000).await;
   // Fail at 0 (next 6s), fail at 6s (next 12s), manual at 7s, then base 3s.
   assert_eq!(runner.times(), [0, 6_000, 7_000, 10_000]);
}

fn outcome() -> impl Strategy<Value = PollOutcome> {
   prop_oneof![Just(PollOutcome::Failure), Just(PollOutcome::Changed), Just(PollOutcome::Unchanged),]
}

fn any_policy() -> impl Strategy<Value = PollPolicy> {
   (500u64..5_000, 1u64..10, 1u64..20, 1u32..6).prop_map(|(base, max_mul, fail_mul, threshold)| {
      PollPolicy {
         base_ms: base,
         max_ms: base * max_mul,
         fail_max_ms: base * fail_mul,
         stable_threshold: threshold,
         ..policy()
      }
   })
}

proptest! {
   #[test]
   fn consecutive_failures_never_shrink_the_interval(
      policy in any_policy(),
      prefix in prop::collection::vec(outcome(), 0..12),
      n in 1usize..20,
   ) {
      let mut state = PollState::new(&policy);
      for o in prefix {
         state.record(o, &policy);
      }
      let mut prev = 0;
      for _ in 0..n {
         let next = state.record(PollOutcome::Failure, &policy);
         prop_assert!(next >= prev);
         prop_assert!(next <= policy.fail_max_ms.max(policy.base_ms));
         prop_assert!(next >= policy.base_ms);
         prev = next;
      }
   }

   #[test]
   fn calm_streak_never_shrinks_the_interval(
      policy in any_policy(),
      prefix in prop::collection::vec(outcome(), 0..12),
      n in 1usize..20,
   ) {
      let mut state = PollState::new(&policy);
      for o in prefix {
         state.record(o, &policy);
      }
      let mut prev: Option<u64> = None;
      for _ in 0..n {
         let next = state.record(PollOutcome::Unchanged, &policy);
         prop_assert!(next <= policy.max_ms.max(policy.base_ms));
         if state.success_streak > policy.stable_threshold {
            if let Some(prev) = prev {
               prop_assert!(next >= prev);
            }
         }
         if state.success_streak >= policy.stable_threshold {
            prev = Some(next);
         }
      }
   }
}
