use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::HeaderMap;
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::error::NetworkError;

use super::types::{Request, Response};
use super::Network;

/// reqwest-backed network.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_secs));
    if let Some(agent) = &config.user_agent {
      builder = builder.user_agent(agent.clone());
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let url = request.url.to_string();
    let classify = |source: reqwest::Error| {
      if source.is_timeout() {
        NetworkError::Timeout { url: url.clone() }
      } else {
        NetworkError::Transport {
          url: url.clone(),
          source,
        }
      }
    };

    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .headers(request.headers.clone())
      .send()
      .await
      .map_err(classify)?;

    let status = response.status().as_u16();
    let headers = header_pairs(response.headers());
    let body = response.bytes().await.map_err(classify)?.to_vec();

    tracing::debug!(%url, status, bytes = body.len(), "network response");

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

/// Flatten response headers for storage. Values that are not valid UTF-8 are
/// kept with the offending bytes replaced.
fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .map(|(name, value)| {
      let value = match value.to_str() {
        Ok(v) => v.to_string(),
        Err(_) => {
          tracing::debug!(header = name.as_str(), "header value is not valid UTF-8");
          String::from_utf8_lossy(value.as_bytes()).into_owned()
        }
      };
      (name.as_str().to_string(), value)
    })
    .collect()
}
