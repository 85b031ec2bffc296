use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CACHE_CONTROL;

use super::{Transport, TransportResponse};
use crate::error::{ConfigError, FetchError, Result};

/// `reqwest`-backed transport shared by every edge and the origin.
pub struct HttpTransport {
   client: reqwest::Client,
}

impl HttpTransport {
   pub fn new() -> Result<Self> {
      let client = reqwest::Client::builder()
         .user_agent(concat!("status-sync/", env!("CARGO_PKG_VERSION")))
         .build()
         .map_err(ConfigError::HttpClient)?;
      Ok(Self { client })
   }
}

#[async_trait]
impl Transport for HttpTransport {
   async fn get(&self, url: &str, timeout: Duration) -> Result<TransportResponse, FetchError> {
      let response = self
         .client
         .get(url)
         .timeout(timeout)
         .header(CACHE_CONTROL, "no-store")
         .send()
         .await
         .map_err(classify)?;

      let status = response.status().as_u16();
      let body = response.bytes().await.map_err(classify)?;
      Ok(TransportResponse { status, body: body.to_vec() })
   }
}

fn classify(err: reqwest::Error) -> FetchError {
   if err.is_timeout() {
      FetchError::Timeout
   } else {
      FetchError::Transport(err.to_string())
   }
}
