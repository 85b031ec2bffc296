//! Continuous polling with live table and alert output.
//!
//! A line on stdin requests a manual refresh; Ctrl+C stops the loop.

use std::{
   io::{self, BufRead, BufReader},
   sync::Arc,
   thread,
};

use console::style;
use serde_json::json;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio_util::sync::CancellationToken;

use super::{open_engine, print_json, print_table, table_json};
use crate::{
   EngineEvent, Result, StatusEngine,
   config::Config,
   scheduler::{HostSignal, PollPolicy, PollScheduler},
};

pub async fn execute(cfg: &Config, json: bool, allow_background: bool) -> Result<()> {
   let mut cfg = cfg.clone();
   cfg.allow_background |= allow_background;

   let engine = Arc::new(open_engine(&cfg)?);
   let cancel = CancellationToken::new();
   let (signals_tx, signals_rx) = mpsc::channel(16);

   let mut events = engine.subscribe();
   let printer = {
      let engine = Arc::clone(&engine);
      let status_field = cfg.status_field.clone();
      tokio::spawn(async move {
         loop {
            match events.recv().await {
               Ok(event) => {
                  if let Err(err) = render(&engine, &event, &status_field, json) {
                     tracing::warn!("failed to render event: {err}");
                  }
               },
               Err(RecvError::Lagged(n)) => tracing::warn!("dropped {n} events"),
               Err(RecvError::Closed) => break,
            }
         }
      })
   };

   spawn_refresh_reader(BufReader::new(io::stdin()), signals_tx);

   {
      let cancel = cancel.clone();
      tokio::spawn(async move {
         if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
         }
      });
   }

   engine.restore_snapshot();

   let mut scheduler = PollScheduler::new(PollPolicy::from_config(&cfg));
   scheduler.run(engine.as_ref(), signals_rx, cancel).await;

   printer.abort();
   Ok(())
}

/// Turns every input line into a manual refresh. Runs on its own OS thread:
/// a blocked stdin read must not keep the runtime from shutting down.
fn spawn_refresh_reader<R>(reader: R, signals: mpsc::Sender<HostSignal>) -> thread::JoinHandle<()>
where
   R: BufRead + Send + 'static,
{
   thread::spawn(move || {
      for line in reader.lines() {
         if line.is_err() || signals.blocking_send(HostSignal::ManualRefresh).is_err() {
            break;
         }
      }
   })
}

fn render(engine: &StatusEngine, event: &EngineEvent, status_field: &str, json: bool) -> Result<()> {
   let repaint = matches!(
      event,
      EngineEvent::Synced { changed: true, .. } | EngineEvent::SnapshotRestored { .. }
   );

   if json {
      print_json(event)?;
      if repaint {
         print_json(&json!({ "event": "table", "table": table_json(&engine.table()) }))?;
      }
      return Ok(());
   }

   match event {
      EngineEvent::Synced { source, edge_index, changed, .. } => {
         let via = edge_index.map_or_else(|| source.as_str().to_string(), |i| format!("edge#{i}"));
         if *changed {
            println!("{} updated via {via}", style("↻").green());
         } else {
            tracing::debug!("no change via {via}");
         }
      },
      EngineEvent::SyncFailed { reason } => {
         println!("{} sync failed: {}", style("✗").red(), style(reason).dim());
      },
      EngineEvent::Rerouted { from, to, .. } => {
         println!("{} rerouted edge#{from} -> edge#{to}", style("⇢").yellow());
      },
      EngineEvent::StaleRaised { age_ms, .. } => {
         println!("{}", style(format!("DATA STALE: newest data is {}s old", age_ms / 1000)).red().bold());
      },
      EngineEvent::StaleCleared { .. } => {
         println!("{}", style("data is fresh again").green());
      },
      EngineEvent::SnapshotRestored { age_ms, rows } => {
         println!("{}", style(format!("restored {rows} cached rows ({}s old)", age_ms / 1000)).dim());
      },
   }

   if repaint {
      print_table(&engine.table(), status_field);
   }
   Ok(())
}
