use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// One entity's current status, keyed by its business id.
///
/// Everything except `id` and `source_ts` is opaque to the engine and passes
/// through to consumers untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
   pub id:        String,
   pub fields:    Map<String, Value>,
   #[serde(default)]
   pub source_ts: Option<Value>,
}

impl Row {
   pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
      Self { id: id.into(), fields, source_ts: None }
   }

   /// Content signature over every observable field plus the freshness
   /// marker. `Map` is key-ordered, so the encoding is canonical.
   pub fn signature(&self) -> String {
      let mut hasher = Sha256::new();
      hasher.update(self.id.as_bytes());
      hasher.update([0u8]);
      hasher.update(Value::Object(self.fields.clone()).to_string().as_bytes());
      hasher.update([0u8]);
      if let Some(ts) = &self.source_ts {
         hasher.update(ts.to_string().as_bytes());
      }
      hex::encode(hasher.finalize())
   }

   pub fn status<'a>(&'a self, status_field: &str) -> Option<&'a str> {
      self.fields.get(status_field).and_then(Value::as_str)
   }
}

/// Where a cycle's data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncSource {
   Edge,
   Origin,
}

impl SyncSource {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Edge => "edge",
         Self::Origin => "origin",
      }
   }
}

/// Raw result of one successful fetch, before reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedBatch {
   pub source:         SyncSource,
   pub edge_index:     Option<usize>,
   pub partitions:     Vec<(String, Vec<Row>)>,
   pub data_timestamp: Option<Value>,
}

impl FetchedBatch {
   pub fn partition(&self, name: &str) -> &[Row] {
      self
         .partitions
         .iter()
         .find(|(p, _)| p == name)
         .map(|(_, rows)| rows.as_slice())
         .unwrap_or_default()
   }

   pub fn row_count(&self) -> usize {
      self.partitions.iter().map(|(_, rows)| rows.len()).sum()
   }
}

/// Partition name to rows, in first-insertion order of partitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalTable {
   partitions: Vec<(String, Vec<Row>)>,
}

impl CanonicalTable {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn rows(&self, partition: &str) -> &[Row] {
      self
         .partitions
         .iter()
         .find(|(p, _)| p == partition)
         .map(|(_, rows)| rows.as_slice())
         .unwrap_or_default()
   }

   pub fn partitions(&self) -> impl Iterator<Item = (&str, &[Row])> {
      self
         .partitions
         .iter()
         .map(|(p, rows)| (p.as_str(), rows.as_slice()))
   }

   pub fn all_rows(&self) -> impl Iterator<Item = &Row> {
      self.partitions.iter().flat_map(|(_, rows)| rows.iter())
   }

   pub fn is_empty(&self) -> bool {
      self.partitions.iter().all(|(_, rows)| rows.is_empty())
   }

   pub(crate) fn replace(&mut self, partition: &str, rows: Vec<Row>) {
      if let Some((_, slot)) = self.partitions.iter_mut().find(|(p, _)| p == partition) {
         *slot = rows;
      } else {
         self.partitions.push((partition.to_string(), rows));
      }
   }
}

/// Last successfully reconciled state, persisted for fast repaint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
   pub taken_at:       i64,
   pub source:         SyncSource,
   pub edge_index:     Option<usize>,
   pub data_timestamp: Option<i64>,
   pub partitions:     Vec<(String, Vec<Row>)>,
}
