mod support;

use std::time::Duration;

use serde_json::json;
use status_sync::{
   Error,
   clock::ManualClock,
   error::FetchError,
   events::{self, EngineEvent},
   types::SyncSource,
};
use support::*;

fn ids(rows: &[status_sync::types::Row]) -> Vec<&str> {
   rows.iter().map(|r| r.id.as_str()).collect()
}

#[tokio::test(start_paused = true)]
async fn first_success_wins_the_hedge() {
   let clock = ManualClock::new(T0);
   let transport = ScriptedTransport::new();
   transport.always(E0, Reply::json_after(2_000, payload(json!([tech("A", "x")]), json!([]))));
   transport.always(E1, Reply::json_after(100, payload(json!([tech("B", "x")]), json!([]))));

   let cfg = config(&[E0, E1], Some(ORIGIN));
   let exec = executor(&cfg, transport.clone(), &clock, events::channel());
   exec.health().lock().record_success(0, 10.0);
   exec.health().lock().record_success(1, 20.0);

   let batch = exec.sync(true).await.unwrap();
   assert_eq!(batch.source, SyncSource::Edge);
   assert_eq!(batch.edge_index, Some(1));
   assert_eq!(ids(batch.partition("body")), ["B"]);
   assert_eq!(transport.calls(), [E0, E1]);

   // The loser still finishes in the background and feeds health.
   tokio::time::sleep(Duration::from_secs(3)).await;
   let rtt0 = exec.health().lock().rtt(0).unwrap();
   assert!(rtt0 > 10.0, "loser rtt not recorded: {rtt0}");
}

#[tokio::test(start_paused = true)]
async fn fast_first_attempt_needs_no_hedge() {
   let clock = ManualClock::new(T0);
   let transport = ScriptedTransport::new();
   transport.always(E0, Reply::json_after(100, payload(json!([tech("A", "x")]), json!([]))));
   transport.always(E1, Reply::json(payload(json!([tech("B", "x")]), json!([]))));

   let cfg = config(&[E0, E1], None);
   let exec = executor(&cfg, transport.clone(), &clock, events::channel());
   exec.health().lock().record_success(0, 10.0);

   let batch = exec.sync(true).await.unwrap();
   assert_eq!(batch.edge_index, Some(0));
   assert_eq!(transport.calls(), [E0]);
}

#[tokio::test(start_paused = true)]
async fn background_polls_are_sequential() {
   let clock = ManualClock::new(T0);
   let transport = ScriptedTransport::new();
   transport.then(E0, Reply::json(payload(json!([tech("A", "x")]), json!([]))));
   transport.always(E0, Reply::json_after(2_000, payload(json!([tech("A", "y")]), json!([]))));
   transport.always(E1, Reply::json(payload(json!([tech("B", "x")]), json!([]))));

   let cfg = config(&[E0, E1], None);
   let exec = executor(&cfg, transport.clone(), &clock, events::channel());
   exec.health().lock().record_success(0, 1.0);
   exec.health().lock().record_success(1, 500.0);

   // The first sync of the process hedges; E0 answers at once.
   exec.sync(false).await.unwrap();
   let batch = exec.sync(false).await.unwrap();
   assert_eq!(batch.edge_index, Some(0));
   assert_eq!(batch.partition("body")[0].status("status"), Some("y"));
   assert_eq!(transport.calls(), [E0, E0]);
}

#[tokio::test(start_paused = true)]
async fn empty_edge_payload_falls_back_to_origin() {
   let clock = ManualClock::new(T0);
   let transport = ScriptedTransport::new();
   transport.always(E0, Reply::json(json!({ "ok": true, "body": [], "foot": [] })));
   transport.always(E1, Reply::status(503));
   transport.always(ORIGIN, Reply::json(payload(json!([tech("07", "排班")]), json!([]))));

   let cfg = config(&[E0, E1], Some(ORIGIN));
   let exec = executor(&cfg, transport.clone(), &clock, events::channel());

   let batch = exec.sync(false).await.unwrap();
   assert_eq!(batch.source, SyncSource::Origin);
   assert_eq!(batch.edge_index, None);
   assert_eq!(ids(batch.partition("body")), ["07"]);

   let health = exec.health().lock();
   assert!(!health.in_cooldown(0), "empty payloads do not cool down");
   assert!(health.in_cooldown(1), "5xx cools down");
}

#[tokio::test(start_paused = true)]
async fn empty_edge_payload_is_data_when_configured() {
   let clock = ManualClock::new(T0);
   let transport = ScriptedTransport::new();
   transport.always(E0, Reply::json(json!({ "ok": true, "body": [], "foot": [] })));

   let cfg = config(&[E0], Some(ORIGIN));
   let cfg = status_sync::config::Config { edge_empty_is_failure: false, ..cfg };
   let exec = executor(&cfg, transport.clone(), &clock, events::channel());

   let batch = exec.sync(false).await.unwrap();
   assert_eq!(batch.edge_index, Some(0));
   assert_eq!(batch.row_count(), 0);
   assert_eq!(transport.calls_to(ORIGIN), 0);
}

#[tokio::test(start_paused = true)]
async fn origin_may_answer_empty() {
   let clock = ManualClock::new(T0);
   let transport = ScriptedTransport::new();
   transport.always(E0, Reply::status(500));
   transport.always(ORIGIN, Reply::json(payload(json!([]), json!([]))));

   let cfg = config(&[E0], Some(ORIGIN));
   let exec = executor(&cfg, transport, &clock, events::channel());

   let batch = exec.sync(false).await.unwrap();
   assert_eq!(batch.source, SyncSource::Origin);
   assert_eq!(batch.row_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn ok_false_moves_on_to_the_next_edge() {
   let clock = ManualClock::new(T0);
   let transport = ScriptedTransport::new();
   transport.always(E0, Reply::json(json!({ "ok": false, "body": [tech("A", "x")] })));
   transport.always(E1, Reply::json(payload(json!([tech("B", "x")]), json!([]))));

   let cfg = config(&[E0, E1], None);
   let exec = executor(&cfg, transport, &clock, events::channel());
   exec.health().lock().record_success(0, 10.0);

   let batch = exec.sync(false).await.unwrap();
   assert_eq!(batch.edge_index, Some(1));
}

#[tokio::test(start_paused = true)]
async fn exhausted_chain_reports_every_attempt() {
   let clock = ManualClock::new(T0);
   let transport = ScriptedTransport::new();
   transport.always(E0, Reply::status(404));
   transport.always(E1, Reply::Hang);
   transport.always(ORIGIN, Reply::status(500));

   let cfg = config(&[E0, E1], Some(ORIGIN));
   let exec = executor(&cfg, transport.clone(), &clock, events::channel());
   exec.health().lock().record_success(0, 10.0);

   let started = tokio::time::Instant::now();
   let err = exec.sync(false).await.unwrap_err();
   let Error::AllEndpointsFailed { attempts } = &err else {
      panic!("unexpected error: {err}");
   };
   let summary: Vec<(&str, &FetchError)> =
      attempts.iter().map(|a| (a.endpoint.as_str(), &a.error)).collect();
   assert_eq!(summary, [
      ("edge#0", &FetchError::Status(404)),
      ("edge#1", &FetchError::Timeout),
      ("origin", &FetchError::Status(500)),
   ]);
   assert_eq!(err.exit_code(), 10);
   assert!(started.elapsed() >= Duration::from_secs(8));
   assert_eq!(transport.calls(), [E0, E1, ORIGIN]);
}

#[tokio::test(start_paused = true)]
async fn origin_gets_the_longer_timeout() {
   let clock = ManualClock::new(T0);
   let transport = ScriptedTransport::new();
   transport.always(E0, Reply::status(502));
   transport.always(ORIGIN, Reply::json_after(10_000, payload(json!([tech("07", "x")]), json!([]))));

   let cfg = config(&[E0], Some(ORIGIN));
   let exec = executor(&cfg, transport, &clock, events::channel());

   let batch = exec.sync(false).await.unwrap();
   assert_eq!(batch.source, SyncSource::Origin);
}

#[tokio::test(start_paused = true)]
async fn repeated_preferred_failures_pin_the_next_edge() {
   let clock = ManualClock::new(T0);
   let transport = ScriptedTransport::new();
   transport.always(E0, Reply::status(404));
   transport.always(E1, Reply::json_after(50, payload(json!([tech("07", "x")]), json!([]))));

   let cfg = config(&[E0, E1, E2], None);
   let events = events::channel();
   let mut rx = events.subscribe();
   let exec = executor(&cfg, transport.clone(), &clock, events);
   exec.health().lock().record_success(0, 10.0);

   exec.sync(false).await.unwrap();
   assert_eq!(exec.health().lock().fail_count(0), 1);
   assert!(rx.try_recv().is_err());

   exec.sync(false).await.unwrap();
   let pin = exec.health().lock().active_override().unwrap();
   assert_eq!(pin.index, 1);
   assert_eq!(pin.expires_at, T0 + 30 * 60 * 1000);
   assert_eq!(rx.try_recv().unwrap(), EngineEvent::Rerouted {
      from:       0,
      to:         1,
      expires_at: T0 + 30 * 60 * 1000,
   });

   let before = transport.calls().len();
   exec.sync(false).await.unwrap();
   assert_eq!(&transport.calls()[before..], [E1]);
}

#[tokio::test(start_paused = true)]
async fn freed_hedge_slot_is_refilled_after_the_delay() {
   let clock = ManualClock::new(T0);
   let transport = ScriptedTransport::new();
   transport.always(E0, Reply::status(503));
   transport.always(E1, Reply::Hang);
   transport.always(E2, Reply::json(payload(json!([tech("07", "x")]), json!([]))));

   let cfg = config(&[E0, E1, E2], None);
   let exec = executor(&cfg, transport.clone(), &clock, events::channel());
   exec.health().lock().record_success(0, 10.0);

   let started = tokio::time::Instant::now();
   let batch = exec.sync(true).await.unwrap();
   assert_eq!(batch.edge_index, Some(2));
   assert_eq!(transport.calls(), [E0, E1, E2]);
   // E0 fails at once so E1 starts immediately; E2 takes the freed slot one
   // hedge delay later instead of waiting out E1's timeout.
   assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
}
