//! One manual sync cycle.

use console::style;
use serde_json::json;

use super::{open_engine, print_json, print_table, table_json};
use crate::{CycleOutcome, Result, SyncMode, config::Config};

pub async fn execute(cfg: &Config, json: bool) -> Result<()> {
   let engine = open_engine(cfg)?;

   match engine.run_cycle(SyncMode::Manual).await {
      CycleOutcome::Synced { source, edge_index, changed, status_set_changed, rows } => {
         let table = engine.table();
         let staleness = engine.staleness();
         if json {
            return print_json(&json!({
               "source": source,
               "edge_index": edge_index,
               "changed": changed,
               "status_set_changed": status_set_changed,
               "rows": rows,
               "staleness": staleness,
               "table": table_json(&table),
            }));
         }

         let via = match edge_index {
            Some(idx) => format!("edge#{idx}"),
            None => source.as_str().to_string(),
         };
         println!("{} {rows} rows via {via}", style("✓").green());
         if staleness.is_stale {
            println!("{}", style("data is stale").red().bold());
         }
         print_table(&table, &cfg.status_field);
         Ok(())
      },
      CycleOutcome::Failed(err) => Err(err),
      CycleOutcome::Busy | CycleOutcome::Queued => {
         println!("{}", style("another sync is in flight").dim());
         Ok(())
      },
   }
}
