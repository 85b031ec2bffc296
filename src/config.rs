//! Configuration for endpoints, polling cadence, hedging and staleness.

use std::{
   fs,
   path::{Path, PathBuf},
   sync::OnceLock,
   time::Duration,
};

use directories::BaseDirs;
use figment::{
   Figment,
   providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

pub const MAX_ATTEMPTS_CAP: usize = 3;
pub const HEDGE_FANOUT_CAP: usize = 4;
pub const FRESHNESS_FIELDS: &[&str] = &["timestamp", "sourceTs", "updatedAt"];

/// Engine configuration loaded from config file and environment variables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
   pub edges:      Vec<String>,
   pub origin:     Option<String>,
   pub query_mode: String,

   pub poll_base_ms:      u64,
   pub poll_max_ms:       u64,
   pub poll_fail_max_ms:  u64,
   pub changed_boost_ms:  u64,
   pub stable_threshold:  u32,
   pub calm_steps_ms:     Vec<u64>,
   pub jitter_ratio:      f64,
   pub wake_throttle_ms:  u64,
   pub allow_background:  bool,

   pub request_timeout_ms: u64,
   pub origin_grace_ms:    u64,
   pub hedge_delay_ms:     u64,
   pub hedge_fanout:       usize,
   pub max_attempts:       usize,

   pub rtt_alpha:          f64,
   pub rtt_ttl_ms:         u64,
   pub cooldown_ms:        u64,
   pub reroute_threshold:  u32,
   pub override_ttl_ms:    u64,

   pub empty_streak_threshold: u32,
   pub edge_empty_is_failure:  bool,
   pub partitions:             Vec<String>,
   pub id_fields:              Vec<String>,
   pub status_field:           String,

   pub stale_max_age_ms:    i64,
   pub utc_offset_minutes:  i32,
   pub snapshot_max_age_ms: u64,
}

impl Default for Config {
   fn default() -> Self {
      Self {
         edges: Vec::new(),
         origin: None,
         query_mode: "sheet_all".to_string(),
         poll_base_ms: 3_000,
         poll_max_ms: 20_000,
         poll_fail_max_ms: 60_000,
         changed_boost_ms: 4_500,
         stable_threshold: 3,
         calm_steps_ms: vec![5_000, 8_000, 12_000, 20_000],
         jitter_ratio: 0.2,
         wake_throttle_ms: 1_200,
         allow_background: false,
         request_timeout_ms: 8_000,
         origin_grace_ms: 4_000,
         hedge_delay_ms: 450,
         hedge_fanout: 2,
         max_attempts: MAX_ATTEMPTS_CAP,
         rtt_alpha: 0.25,
         rtt_ttl_ms: 12 * 60 * 60 * 1000,
         cooldown_ms: 2 * 60 * 1000,
         reroute_threshold: 2,
         override_ttl_ms: 30 * 60 * 1000,
         empty_streak_threshold: 2,
         edge_empty_is_failure: true,
         partitions: vec!["body".to_string(), "foot".to_string()],
         id_fields: vec!["id".to_string(), "masterId".to_string()],
         status_field: "status".to_string(),
         stale_max_age_ms: 10 * 60 * 1000,
         utc_offset_minutes: 8 * 60,
         snapshot_max_age_ms: 2 * 60 * 1000,
      }
   }
}

impl Config {
   /// Loads defaults, then the global config file, then `extra` (if any),
   /// then `STATUS_SYNC_*` environment variables.
   pub fn load(extra: Option<&Path>) -> Self {
      let mut figment = Figment::from(Serialized::defaults(Self::default()));

      if let Some(global) = ensure_global_config() {
         figment = figment.merge(Toml::file(global));
      }
      if let Some(path) = extra {
         figment = figment.merge(Toml::file(path));
      }

      figment
         .merge(Env::prefixed("STATUS_SYNC_").lowercase(true))
         .extract()
         .inspect_err(|e| tracing::warn!("failed to parse config: {e}"))
         .unwrap_or_default()
   }

   fn create_default_config(path: &Path) {
      if let Some(parent) = path.parent() {
         let _ = fs::create_dir_all(parent);
      }
      if let Ok(toml) = toml::to_string_pretty(&Self::default()) {
         let _ = fs::write(path, toml);
      }
   }

   pub fn validate(&self) -> Result<()> {
      if self.edges.is_empty() && self.origin.is_none() {
         return Err(invalid("no edge endpoints and no origin configured"));
      }
      if self.poll_base_ms == 0 {
         return Err(invalid("poll_base_ms must be positive"));
      }
      if self.poll_max_ms < self.poll_base_ms {
         return Err(invalid(format!(
            "poll_max_ms {} is below poll_base_ms {}",
            self.poll_max_ms, self.poll_base_ms
         )));
      }
      if self.poll_fail_max_ms < self.poll_base_ms {
         return Err(invalid(format!(
            "poll_fail_max_ms {} is below poll_base_ms {}",
            self.poll_fail_max_ms, self.poll_base_ms
         )));
      }
      if !(0.0..=1.0).contains(&self.rtt_alpha) || self.rtt_alpha == 0.0 {
         return Err(invalid(format!("rtt_alpha {} must be in (0, 1]", self.rtt_alpha)));
      }
      if !(0.0..1.0).contains(&self.jitter_ratio) {
         return Err(invalid(format!("jitter_ratio {} must be in [0, 1)", self.jitter_ratio)));
      }
      if self.partitions.is_empty() {
         return Err(invalid("at least one partition is required"));
      }
      if self.id_fields.is_empty() {
         return Err(invalid("at least one id field is required"));
      }
      Ok(())
   }

   pub fn effective_max_attempts(&self) -> usize {
      self.max_attempts.clamp(1, MAX_ATTEMPTS_CAP)
   }

   pub fn effective_hedge_fanout(&self) -> usize {
      self.hedge_fanout.clamp(1, HEDGE_FANOUT_CAP)
   }

   pub const fn request_timeout(&self) -> Duration {
      Duration::from_millis(self.request_timeout_ms)
   }

   pub const fn origin_timeout(&self) -> Duration {
      Duration::from_millis(self.request_timeout_ms + self.origin_grace_ms)
   }

   pub const fn hedge_delay(&self) -> Duration {
      Duration::from_millis(self.hedge_delay_ms)
   }
}

fn invalid(reason: impl Into<String>) -> crate::Error {
   ConfigError::Invalid(reason.into()).into()
}

/// Returns the base directory for status-sync state and configuration
pub fn base_dir() -> &'static PathBuf {
   static ONCE: OnceLock<PathBuf> = OnceLock::new();
   ONCE.get_or_init(|| resolve_base_dir(".status-sync"))
}

pub fn config_file_path() -> PathBuf {
   base_dir().join("config.toml")
}

pub fn state_dir() -> PathBuf {
   base_dir().join("state")
}

fn ensure_global_config() -> Option<PathBuf> {
   let path = config_file_path();
   if !path.exists() {
      Config::create_default_config(&path);
   }
   path.exists().then_some(path)
}

fn resolve_base_dir(dir_name: &str) -> PathBuf {
   BaseDirs::new()
      .map(|d| d.home_dir().join(dir_name))
      .or_else(|| {
         std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(dir_name))
      })
      .unwrap_or_else(|| {
         std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(dir_name)
      })
}
