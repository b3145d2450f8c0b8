//! Network boundary.
//!
//! The agent only ever talks to the network through [`Network`], so the
//! strategies can be driven by a real HTTP client or a scripted fake.

mod http;
mod types;

use async_trait::async_trait;

use crate::error::NetworkError;

pub use http::HttpNetwork;
pub use types::{Request, RequestMode, Response};

/// One network attempt per call. No retries.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// Network that is never reachable.
pub struct OfflineNetwork;

#[async_trait]
impl Network for OfflineNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    Err(NetworkError::Offline {
      url: request.url.to_string(),
    })
  }
}
