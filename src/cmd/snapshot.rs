//! Cached snapshot summary.

use std::sync::Arc;

use console::style;
use serde_json::json;

use super::{open_state, print_json, system_clock};
use crate::{Result, config::Config, snapshot::SnapshotCache};

pub fn execute(cfg: &Config, json: bool) -> Result<()> {
   let clock = system_clock();
   let cache = SnapshotCache::new(open_state(Arc::clone(&clock))?, clock);
   let max_age_ms = cfg.snapshot_max_age_ms as i64;

   let Some(snapshot) = cache.latest() else {
      if json {
         return print_json(&json!({ "snapshot": null }));
      }
      println!("{}", style("No snapshot cached").dim());
      return Ok(());
   };
   let age_ms = cache.age_ms(&snapshot);
   let usable = age_ms <= max_age_ms;

   if json {
      return print_json(&json!({
         "age_ms": age_ms,
         "usable": usable,
         "snapshot": snapshot,
      }));
   }

   let state = if usable {
      style("usable for repaint").green()
   } else {
      style("too old for repaint").yellow()
   };
   let via = match snapshot.edge_index {
      Some(idx) => format!("edge#{idx}"),
      None => snapshot.source.as_str().to_string(),
   };
   println!("Snapshot from {via}, {}s old ({state})", age_ms / 1000);
   for (name, rows) in &snapshot.partitions {
      println!("  {} {}", style(name).bold(), style(format!("{} rows", rows.len())).dim());
   }
   Ok(())
}
