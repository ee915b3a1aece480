/// MikoPBX REST client
/// Session login, peer statuses, provider registry and peer display names

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::PbxError;
use super::fetch::{Authenticator, FetchRequest, FetchResponse, Fetcher, RetryPolicy};
use super::StatusSource;
use crate::config::Config;
use crate::redact;
use crate::watch::Snapshot;

const SESSION_PATH: &str = "/admin-cabinet/session/start";
const PEERS_PATH: &str = "/pbxcore/api/sip/getPeersStatuses";
const REGISTRY_PATH: &str = "/pbxcore/api/sip/getRegistry";
const SIP_PEER_PATH: &str = "/pbxcore/api/sip/getSipPeer";

/// Longest error body carried in `PbxError::Status`
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Deserialize)]
struct Listing<T> {
    #[serde(default)]
    result: bool,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct EntityState {
    id: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct SipPeerResponse {
    #[serde(default)]
    result: bool,
    #[serde(default)]
    data: Option<SipPeerData>,
}

#[derive(Debug, Default, Deserialize)]
struct SipPeerData {
    #[serde(rename = "EndpointName", default)]
    endpoint_name: String,
}

pub struct PbxClient {
    base_url: String,
    login: String,
    password: String,
    fetcher: Fetcher,
}

impl PbxClient {
    pub fn new(
        base_url: &str,
        login: &str,
        password: &str,
        http_timeout: Duration,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Result<Self, PbxError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(http_timeout)
            .build()
            .map_err(PbxError::Client)?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            login: login.to_string(),
            password: password.to_string(),
            fetcher: Fetcher::new(http, policy, cancel),
        })
    }

    pub fn from_config(config: &Config, cancel: CancellationToken) -> Result<Self, PbxError> {
        let mut client = Self::new(
            &config.pbx_base_url,
            &config.pbx_login,
            &config.pbx_password,
            config.http_timeout(),
            config.retry_policy(),
            cancel,
        )?;
        client.set_debug(config.debug);
        Ok(client)
    }

    /// Toggle verbose HTTP logging
    pub fn set_debug(&mut self, debug: bool) {
        self.fetcher.set_debug(debug);
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn has_credentials(&self) -> bool {
        !self.login.is_empty() && !self.password.is_empty()
    }

    /// Obtain a session cookie. Without credentials this is a no-op,
    /// which is how a PBX reached over localhost is normally configured.
    pub async fn authenticate(&self) -> Result<(), PbxError> {
        if !self.has_credentials() {
            return Ok(());
        }

        let url = format!("{}{}", self.base_url, SESSION_PATH);
        let form = [("login", self.login.as_str()), ("password", self.password.as_str())];

        if self.fetcher.debug() {
            debug!(
                "[PBX][REQ] POST {} Headers: {{X-Requested-With: XMLHttpRequest}} Body: {}",
                url,
                redact::form_preview(&form, 2000)
            );
        }

        let response = self
            .fetcher
            .http()
            .post(&url)
            .header("X-Requested-With", "XMLHttpRequest")
            .form(&form)
            .send()
            .await
            .map_err(|e| PbxError::Auth(e.to_string()))?;

        let status = response.status();
        if self.fetcher.debug() {
            debug!("[PBX][RES] {} {}", status, url);
        }

        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(PbxError::Auth(format!(
                "{} ({})",
                status,
                redact::body_preview(&body, ERROR_BODY_LIMIT)
            )));
        }

        info!("PBX session established");
        Ok(())
    }

    async fn get_listing(&self, endpoint: &'static str) -> Result<Snapshot, PbxError> {
        let request = FetchRequest::get(format!("{}{}", self.base_url, endpoint));
        let response = self.fetcher.fetch(&request, self).await?;
        let listing: Listing<EntityState> = decode(endpoint, &response)?;
        if !listing.result {
            return Err(PbxError::Rejected { endpoint });
        }
        Ok(listing
            .data
            .into_iter()
            .map(|entry| (entry.id, entry.state))
            .collect())
    }
}

/// Check for 200 and parse the body.
fn decode<T: DeserializeOwned>(endpoint: &'static str, response: &FetchResponse) -> Result<T, PbxError> {
    if response.status != StatusCode::OK {
        return Err(PbxError::Status {
            endpoint,
            status: response.status.as_u16(),
            body: redact::body_preview(&response.body, ERROR_BODY_LIMIT),
        });
    }
    serde_json::from_str(&response.body).map_err(|source| PbxError::Decode { endpoint, source })
}

impl Authenticator for PbxClient {
    async fn authenticate(&self) -> Result<(), PbxError> {
        PbxClient::authenticate(self).await
    }
}

impl StatusSource for PbxClient {
    async fn peer_statuses(&self) -> Result<Snapshot, PbxError> {
        self.get_listing(PEERS_PATH).await
    }

    async fn provider_statuses(&self) -> Result<Snapshot, PbxError> {
        self.get_listing(REGISTRY_PATH).await
    }

    async fn peer_name(&self, id: &str) -> Result<String, PbxError> {
        if id.is_empty() {
            return Ok(String::new());
        }

        let url = format!("{}{}", self.base_url, SIP_PEER_PATH);
        let request = FetchRequest::post_json(url, &serde_json::json!({ "peer": id }))
            .map_err(|source| PbxError::Encode {
                endpoint: SIP_PEER_PATH,
                source,
            })?;
        let response = self.fetcher.fetch(&request, self).await?;
        let peer: SipPeerResponse = decode(SIP_PEER_PATH, &response)?;

        if !peer.result {
            return Ok(String::new());
        }
        Ok(peer.data.unwrap_or_default().endpoint_name)
    }
}
