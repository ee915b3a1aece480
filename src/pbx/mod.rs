//! MikoPBX REST access
//!
//! The watcher only needs the `StatusSource` view; `PbxClient` is the
//! HTTP implementation built on the retrying `Fetcher`.

pub mod client;
pub mod error;
pub mod fetch;

pub use client::PbxClient;
pub use error::{FetchError, PbxError};
pub use fetch::{Fetcher, RetryPolicy};

use crate::watch::Snapshot;

/// Where entity states and display names come from.
#[allow(async_fn_in_trait)]
pub trait StatusSource {
    async fn peer_statuses(&self) -> Result<Snapshot, PbxError>;

    async fn provider_statuses(&self) -> Result<Snapshot, PbxError>;

    /// Display name for a peer; empty when the PBX has none.
    async fn peer_name(&self, id: &str) -> Result<String, PbxError>;
}
