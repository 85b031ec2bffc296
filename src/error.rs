use std::{fmt, io};

use thiserror::Error;

/// Main error type for the status-sync engine.
///
/// Fetch-layer failures are absorbed inside the attempt chain and only
/// surface here once every source of a cycle has been exhausted.
#[derive(Debug, Error)]
pub enum Error {
   /// I/O error occurred during file operations.
   #[error("io error: {0}")]
   Io(#[from] io::Error),

   /// JSON serialization or deserialization error occurred.
   #[error("json error: {0}")]
   Json(#[from] serde_json::Error),

   /// Configuration-related error occurred.
   #[error("config error: {0}")]
   Config(#[from] ConfigError),

   /// Persisted key-value store error occurred.
   #[error("store error: {0}")]
   Store(#[from] StoreError),

   /// Every edge endpoint and the origin fallback failed in one cycle.
   #[error("all endpoints failed: {}", DisplayAttempts(.attempts))]
   AllEndpointsFailed { attempts: Vec<AttemptFailure> },
}

impl Error {
   pub fn exit_code(&self) -> i32 {
      match self {
         Self::AllEndpointsFailed { attempts } => {
            if !attempts.is_empty() && attempts.iter().all(|a| a.error == FetchError::Timeout) {
               11
            } else {
               10
            }
         },
         Self::Config(_) => 2,
         _ => 1,
      }
   }
}

/// Classification of one failed HTTP attempt against an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
   /// The attempt exceeded its per-request timeout.
   #[error("request timed out")]
   Timeout,

   /// The endpoint answered with a non-success HTTP status.
   #[error("http status {0}")]
   Status(u16),

   /// Connection-level failure (DNS, refused, reset, TLS).
   #[error("transport failure: {0}")]
   Transport(String),

   /// Body was not valid JSON or did not have the expected shape.
   #[error("malformed body: {0}")]
   Decode(String),

   /// Payload carried an explicit `ok: false`.
   #[error("payload reported ok=false")]
   NotOk,

   /// Every partition of the payload was empty.
   #[error("payload has no rows")]
   EmptyPayload,
}

impl FetchError {
   /// Timeouts, HTTP 429 and HTTP 5xx put the endpoint into cooldown.
   pub const fn is_transient_infra(&self) -> bool {
      match self {
         Self::Timeout => true,
         Self::Status(code) => *code == 429 || *code >= 500,
         _ => false,
      }
   }
}

/// One failed attempt of a sync cycle, kept for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
   pub endpoint: String,
   pub error:    FetchError,
}

struct DisplayAttempts<'a>(&'a [AttemptFailure]);

impl fmt::Display for DisplayAttempts<'_> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      if self.0.is_empty() {
         return write!(f, "no endpoints configured");
      }
      for (i, attempt) in self.0.iter().enumerate() {
         if i > 0 {
            write!(f, "; ")?;
         }
         write!(f, "{}: {}", attempt.endpoint, attempt.error)?;
      }
      Ok(())
   }
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
   /// Config values are inconsistent or out of range.
   #[error("invalid config: {0}")]
   Invalid(String),

   /// Failed to build the HTTP client.
   #[error("failed to build http client: {0}")]
   HttpClient(#[source] reqwest::Error),
}

/// Errors raised by persisted key-value stores.
#[derive(Debug, Error)]
pub enum StoreError {
   /// Failed to create the state directory.
   #[error("failed to create state directory: {0}")]
   CreateDir(#[source] io::Error),

   /// Failed to write an entry to disk.
   #[error("failed to write {key}: {reason}")]
   Write {
      key:    String,
      #[source]
      reason: io::Error,
   },

   /// Key contains characters that cannot be used as a file name.
   #[error("invalid key: {0}")]
   InvalidKey(String),
}

/// Standard result type using [`enum@Error`] as the default error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
