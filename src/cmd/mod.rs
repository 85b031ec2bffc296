//! CLI command implementations for status-sync.
//!
//! Each module corresponds to one subcommand; the helpers here open the
//! persisted state and render tables the same way for all of them.

pub mod endpoints;
pub mod snapshot;
pub mod sync;
pub mod watch;

use std::sync::Arc;

use console::style;
use serde_json::{Map, Value};

use crate::{
   Result, StatusEngine,
   clock::{SharedClock, SystemClock},
   config::{self, Config},
   fetch::HttpTransport,
   kv::{FileKv, KvStore},
   types::CanonicalTable,
};

pub(crate) fn system_clock() -> SharedClock {
   Arc::new(SystemClock)
}

pub(crate) fn open_state(clock: SharedClock) -> Result<Arc<dyn KvStore>> {
   Ok(Arc::new(FileKv::open(config::state_dir(), clock)?))
}

pub(crate) fn open_engine(cfg: &Config) -> Result<StatusEngine> {
   let clock = system_clock();
   let kv = open_state(Arc::clone(&clock))?;
   let transport = Arc::new(HttpTransport::new()?);
   StatusEngine::new(cfg, transport, kv, clock)
}

pub(crate) fn table_json(table: &CanonicalTable) -> Value {
   let partitions: Map<String, Value> = table
      .partitions()
      .map(|(name, rows)| {
         let rows = rows.iter().map(|row| Value::Object(row.fields.clone())).collect();
         (name.to_string(), Value::Array(rows))
      })
      .collect();
   Value::Object(partitions)
}

pub(crate) fn print_table(table: &CanonicalTable, status_field: &str) {
   for (name, rows) in table.partitions() {
      println!("{} {}", style(name).bold(), style(format!("({} rows)", rows.len())).dim());
      if rows.is_empty() {
         println!("  {}", style("(empty)").dim());
      }
      for row in rows {
         let status = row.status(status_field).unwrap_or("-");
         println!("  {:>6}  {}", style(&row.id).cyan(), status);
      }
   }
}

pub(crate) fn print_json(value: &impl serde::Serialize) -> Result<()> {
   println!("{}", serde_json::to_string(value)?);
   Ok(())
}
