//! Decoding of the `sheet_all` status payload into rows.

use serde_json::{Map, Value};

use crate::{config::FRESHNESS_FIELDS, error::FetchError, types::Row};

#[derive(Debug, Clone)]
pub struct PayloadOptions {
   pub partitions: Vec<String>,
   pub id_fields:  Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
   pub partitions: Vec<(String, Vec<Row>)>,
   pub timestamp:  Option<Value>,
}

impl DecodedPayload {
   pub fn row_count(&self) -> usize {
      self.partitions.iter().map(|(_, rows)| rows.len()).sum()
   }
}

pub fn decode(body: &[u8], opts: &PayloadOptions) -> Result<DecodedPayload, FetchError> {
   let value: Value =
      serde_json::from_slice(body).map_err(|e| FetchError::Decode(e.to_string()))?;
   let Value::Object(obj) = value else {
      return Err(FetchError::Decode("payload is not a JSON object".to_string()));
   };

   if obj.get("ok") == Some(&Value::Bool(false)) {
      return Err(FetchError::NotOk);
   }

   let timestamp = obj.get("timestamp").filter(|v| !v.is_null()).cloned();

   let mut partitions = Vec::with_capacity(opts.partitions.len());
   for name in &opts.partitions {
      let rows = match obj.get(name) {
         None | Some(Value::Null) => Vec::new(),
         Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| decode_row(item, &opts.id_fields, timestamp.as_ref()))
            .collect(),
         Some(_) => {
            return Err(FetchError::Decode(format!("partition {name} is not an array")));
         },
      };
      partitions.push((name.clone(), rows));
   }

   Ok(DecodedPayload { partitions, timestamp })
}

fn decode_row(item: &Value, id_fields: &[String], payload_ts: Option<&Value>) -> Option<Row> {
   let Value::Object(fields) = item else {
      tracing::debug!("skipping non-object row");
      return None;
   };
   let Some(id) = row_id(fields, id_fields) else {
      tracing::debug!("skipping row without identity");
      return None;
   };
   let source_ts = FRESHNESS_FIELDS
      .iter()
      .find_map(|f| fields.get(*f).filter(|v| !v.is_null()))
      .or(payload_ts)
      .cloned();
   Some(Row { id, fields: fields.clone(), source_ts })
}

fn row_id(fields: &Map<String, Value>, id_fields: &[String]) -> Option<String> {
   id_fields.iter().find_map(|key| match fields.get(key)? {
      Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
      Value::Number(n) => Some(n.to_string()),
      _ => None,
   })
}
