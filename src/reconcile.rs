//! Diff reconciliation of fetched rows into the canonical table.
//!
//! Change detection compares per-row content signatures in order, so a new
//! id, a dropped id, any edited field (freshness marker included) and a
//! reordering all count as `changed`. The empty-snapshot guard holds back a
//! non-manual empty result for a previously populated partition until it
//! has been seen `empty_streak_threshold` times in a row.

use std::collections::{BTreeSet, HashMap};

use crate::types::{CanonicalTable, Row};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
   pub changed:            bool,
   pub status_set_changed: bool,
   /// An empty update was held back by the guard.
   pub deferred:           bool,
}

impl MergeOutcome {
   fn absorb(&mut self, other: Self) {
      self.changed |= other.changed;
      self.deferred |= other.deferred;
   }
}

pub struct ReconciliationEngine {
   table:           CanonicalTable,
   empty_streaks:   HashMap<String, u32>,
   empty_threshold: u32,
   status_field:    String,
}

impl ReconciliationEngine {
   pub fn new(empty_threshold: u32, status_field: impl Into<String>) -> Self {
      Self {
         table:           CanonicalTable::new(),
         empty_streaks:   HashMap::new(),
         empty_threshold: empty_threshold.max(1),
         status_field:    status_field.into(),
      }
   }

   pub const fn table(&self) -> &CanonicalTable {
      &self.table
   }

   pub fn empty_streak(&self, partition: &str) -> u32 {
      self.empty_streaks.get(partition).copied().unwrap_or(0)
   }

   /// Merges one partition's incoming rows.
   pub fn merge(&mut self, partition: &str, incoming: Vec<Row>, is_manual: bool) -> MergeOutcome {
      let before = self.status_set();
      let mut outcome = self.merge_partition(partition, incoming, is_manual);
      outcome.status_set_changed = outcome.changed && before != self.status_set();
      outcome
   }

   /// Merges every partition of one fetch; the status set is compared once
   /// across the whole table.
   pub fn merge_batch(
      &mut self,
      partitions: Vec<(String, Vec<Row>)>,
      is_manual: bool,
   ) -> MergeOutcome {
      let before = self.status_set();
      let mut outcome = MergeOutcome::default();
      for (partition, rows) in partitions {
         outcome.absorb(self.merge_partition(&partition, rows, is_manual));
      }
      outcome.status_set_changed = outcome.changed && before != self.status_set();
      outcome
   }

   /// Replaces the table wholesale from a cached snapshot.
   pub fn restore(&mut self, partitions: Vec<(String, Vec<Row>)>) {
      self.table = CanonicalTable::new();
      for (partition, rows) in partitions {
         self.table.replace(&partition, dedup(rows));
      }
      self.empty_streaks.clear();
   }

   fn merge_partition(&mut self, partition: &str, incoming: Vec<Row>, is_manual: bool) -> MergeOutcome {
      let previous = self.table.rows(partition);

      if incoming.is_empty() && !previous.is_empty() && !is_manual {
         let streak = self.empty_streaks.entry(partition.to_string()).or_insert(0);
         *streak += 1;
         if *streak < self.empty_threshold {
            tracing::debug!(
               "holding back empty {partition} ({}/{} empty results)",
               streak,
               self.empty_threshold
            );
            return MergeOutcome { deferred: true, ..MergeOutcome::default() };
         }
         tracing::info!("accepting empty {partition} after {streak} consecutive empty results");
      }
      self.empty_streaks.remove(partition);

      let incoming = dedup(incoming);
      let changed = previous.len() != incoming.len()
         || previous
            .iter()
            .zip(&incoming)
            .any(|(old, new)| old.id != new.id || old.signature() != new.signature());

      if changed {
         self.table.replace(partition, incoming);
      } else if !self.table.partitions().any(|(p, _)| p == partition) {
         // First sight of an empty partition still reserves its slot.
         self.table.replace(partition, incoming);
      }
      MergeOutcome { changed, ..MergeOutcome::default() }
   }

   fn status_set(&self) -> BTreeSet<String> {
      self
         .table
         .all_rows()
         .filter_map(|row| row.status(&self.status_field))
         .map(str::to_owned)
         .collect()
   }
}

/// Later duplicates replace earlier ones but keep the earlier position.
fn dedup(rows: Vec<Row>) -> Vec<Row> {
   let mut out: Vec<Row> = Vec::with_capacity(rows.len());
   let mut seen: HashMap<String, usize> = HashMap::with_capacity(rows.len());
   for row in rows {
      if let Some(&pos) = seen.get(&row.id) {
         out[pos] = row;
      } else {
         seen.insert(row.id.clone(), out.len());
         out.push(row);
      }
   }
   out
}
