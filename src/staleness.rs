//! "Data too old" alerting with one-shot transitions.

use serde::Serialize;
use serde_json::Value;

use crate::{clock::SharedClock, timestamp, types::CanonicalTable};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StalenessState {
   pub last_data_timestamp: Option<i64>,
   pub is_stale:            bool,
   pub stale_since:         Option<i64>,
}

/// Edge event produced by an evaluation; `None` while nothing flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleTransition {
   Raised { latest_data_at: i64, age_ms: i64 },
   Cleared { latest_data_at: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessReport {
   pub state:      StalenessState,
   pub transition: Option<StaleTransition>,
}

pub struct StalenessMonitor {
   max_age_ms:         i64,
   utc_offset_minutes: i32,
   clock:              SharedClock,
   payload_ts:         Option<i64>,
   state:              StalenessState,
}

impl StalenessMonitor {
   /// `max_age_ms <= 0` disables alerting; timestamps are still tracked.
   pub fn new(max_age_ms: i64, utc_offset_minutes: i32, clock: SharedClock) -> Self {
      Self {
         max_age_ms,
         utc_offset_minutes,
         clock,
         payload_ts: None,
         state: StalenessState::default(),
      }
   }

   pub const fn state(&self) -> StalenessState {
      self.state
   }

   /// Remembers the payload-level fetch timestamp, if it parses.
   pub fn observe_payload(&mut self, value: &Value) -> Option<i64> {
      let ms = timestamp::parse_value(value, self.utc_offset_minutes)?;
      self.payload_ts = Some(ms);
      Some(ms)
   }

   pub const fn observe_payload_ms(&mut self, ms: i64) {
      self.payload_ts = Some(ms);
   }

   pub fn evaluate(&mut self, table: &CanonicalTable) -> StalenessReport {
      let newest_row = table
         .all_rows()
         .filter_map(|row| row.source_ts.as_ref())
         .filter_map(|v| timestamp::parse_value(v, self.utc_offset_minutes))
         .max();

      // No parseable timestamp anywhere: leave the alert as it is.
      let Some(latest) = newest_row.max(self.payload_ts) else {
         return StalenessReport { state: self.state, transition: None };
      };
      self.state.last_data_timestamp = Some(latest);

      if self.max_age_ms <= 0 {
         return StalenessReport { state: self.state, transition: None };
      }

      let now = self.clock.now_ms();
      let age_ms = now - latest;
      let stale = age_ms > self.max_age_ms;

      let transition = match (self.state.is_stale, stale) {
         (false, true) => {
            self.state.is_stale = true;
            self.state.stale_since = Some(now);
            tracing::info!("data is stale: newest timestamp is {}s old", age_ms / 1000);
            Some(StaleTransition::Raised { latest_data_at: latest, age_ms })
         },
         (true, false) => {
            self.state.is_stale = false;
            self.state.stale_since = None;
            tracing::info!("data is fresh again");
            Some(StaleTransition::Cleared { latest_data_at: latest })
         },
         _ => None,
      };

      StalenessReport { state: self.state, transition }
   }
}
