//! Persisted endpoint health.

use std::sync::Arc;

use console::style;
use serde_json::json;

use super::{open_state, print_json, system_clock};
use crate::{
   Result,
   config::Config,
   edge::{EndpointHealthStore, HealthPolicy},
};

pub fn execute(cfg: &Config, json: bool) -> Result<()> {
   let clock = system_clock();
   let kv = open_state(Arc::clone(&clock))?;
   let health =
      EndpointHealthStore::load(cfg.edges.clone(), HealthPolicy::from_config(cfg), kv, clock);
   let now = health.now_ms();
   let endpoints = health.endpoints();

   if json {
      return print_json(&json!({
         "edges": endpoints,
         "origin": cfg.origin,
         "override": health.active_override(),
      }));
   }

   if endpoints.is_empty() {
      println!("{}", style("No edge endpoints configured").dim());
   }

   for ep in &endpoints {
      let dot = if ep.cooldown_until.is_some() {
         style("●").red()
      } else if ep.rtt_ewma.is_some() {
         style("●").green()
      } else {
         style("●").dim()
      };

      let mut notes = Vec::new();
      match ep.rtt_ewma {
         Some(rtt) => notes.push(format!("rtt {rtt:.0}ms")),
         None => notes.push("rtt unknown".to_string()),
      }
      if let Some(until) = ep.cooldown_until {
         notes.push(format!("cooldown {}s", (until - now).max(0) / 1000));
      }
      if ep.fail_count > 0 {
         notes.push(format!("failures {}", ep.fail_count));
      }

      let pin = if ep.pinned { style(" pinned").yellow().to_string() } else { String::new() };
      println!(
         "  {dot} edge#{} {}{pin} {}",
         ep.index,
         ep.url,
         style(format!("({})", notes.join(", "))).dim()
      );
   }

   if let Some(pin) = health.active_override() {
      println!(
         "{}",
         style(format!("override to edge#{} for {}s", pin.index, (pin.expires_at - now) / 1000))
            .yellow()
      );
   }
   match &cfg.origin {
      Some(origin) => println!("  {} origin {origin}", style("○").dim()),
      None => println!("  {}", style("no origin fallback").dim()),
   }
   Ok(())
}
