use std::time::Duration;

use thiserror::Error;

/// Terminal outcome of a fetch retry sequence.
///
/// Transport failures, 5xx responses and 401/403 are retried inside the
/// fetch loop and never show up here.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch cancelled by shutdown")]
    Cancelled,

    #[error("gave up after {elapsed:?} of retries")]
    DeadlineExceeded { elapsed: Duration },

    /// The request could not be built (bad URL, bad header); retrying cannot help.
    #[error("invalid request: {0}")]
    Request(#[source] reqwest::Error),
}

/// Application-level failure talking to the PBX REST API.
#[derive(Debug, Error)]
pub enum PbxError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: u16,
        body: String,
    },

    #[error("{endpoint} response could not be decoded: {source}")]
    Decode {
        endpoint: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{endpoint} request body could not be encoded: {source}")]
    Encode {
        endpoint: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{endpoint} refused the request (result=false)")]
    Rejected { endpoint: &'static str },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl PbxError {
    /// True when the failure came from shutdown rather than the PBX.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PbxError::Fetch(FetchError::Cancelled))
    }
}
