//! Error kinds that callers branch on.
//!
//! Everything else flows through `color_eyre::Result`.

use thiserror::Error;

/// Failure to obtain any response from the network.
///
/// Non-200 statuses are responses, not errors.
#[derive(Error, Debug)]
pub enum NetworkError {
  #[error("request to {url} failed: {source}")]
  Transport {
    url: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("request to {url} timed out")]
  Timeout { url: String },

  #[error("network unavailable for {url}")]
  Offline { url: String },
}

/// Precache failure. Any one of these fails the whole install.
#[derive(Error, Debug)]
pub enum InstallError {
  #[error("precache fetch for {url} failed")]
  Fetch {
    url: String,
    #[source]
    source: NetworkError,
  },

  #[error("precache fetch for {url} returned status {status}")]
  Status { url: String, status: u16 },
}
