//! Best-effort parsing of backend freshness markers into epoch milliseconds.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use serde_json::Value;

const NAIVE_FORMATS: &[&str] = &[
   "%Y-%m-%d %H:%M:%S",
   "%Y-%m-%d %H:%M",
   "%Y/%m/%d %H:%M:%S",
   "%Y/%m/%d %H:%M",
   "%Y-%m-%dT%H:%M:%S%.f",
   "%Y-%m-%dT%H:%M:%S",
];

/// Numbers at or above this are epoch milliseconds, below it epoch seconds.
const MILLIS_THRESHOLD: f64 = 1e11;

/// Parses a JSON freshness value; zone-less strings are read in
/// `utc_offset_minutes`.
pub fn parse_value(value: &Value, utc_offset_minutes: i32) -> Option<i64> {
   match value {
      Value::Number(n) => n.as_f64().and_then(from_number),
      Value::String(s) => parse_str(s, utc_offset_minutes),
      _ => None,
   }
}

pub fn parse_str(raw: &str, utc_offset_minutes: i32) -> Option<i64> {
   let raw = raw.trim();
   if raw.is_empty() {
      return None;
   }

   if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
      return Some(dt.timestamp_millis());
   }
   if let Ok(num) = raw.parse::<f64>() {
      return from_number(num);
   }

   let offset = FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60))?;
   NAIVE_FORMATS.iter().find_map(|fmt| {
      let naive = NaiveDateTime::parse_from_str(raw, fmt).ok()?;
      offset
         .from_local_datetime(&naive)
         .single()
         .map(|dt| dt.timestamp_millis())
   })
}

fn from_number(num: f64) -> Option<i64> {
   if !num.is_finite() || num <= 0.0 {
      return None;
   }
   if num >= MILLIS_THRESHOLD {
      Some(num as i64)
   } else {
      Some((num * 1000.0) as i64)
   }
}
