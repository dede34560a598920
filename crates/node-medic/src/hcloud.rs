//! Hetzner Cloud API client for server power actions.
//!
//! The remediation policy only needs two fire-and-forget operations, soft
//! reboot and hard reset, exposed through the [`PowerControl`] trait. The
//! concrete client also carries a cheap startup probe so a bad token fails
//! fast instead of surfacing on the first unhealthy node.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Hetzner Cloud API base URL.
const DEFAULT_BASE_URL: &str = "https://api.hetzner.cloud/v1";

/// Scheme prefix Kubernetes puts on `spec.providerID` for hcloud instances.
pub const PROVIDER_ID_PREFIX: &str = "hcloud://";

/// Errors from the Hetzner Cloud API.
#[derive(Debug, Error)]
pub enum HcloudError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Server not found.
    #[error("server not found: {0}")]
    NotFound(String),

    /// Response body did not match the expected shape.
    #[error("unexpected response body: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors turning a node's `spec.providerID` into a server id.
#[derive(Debug, Error)]
pub enum ProviderIdError {
    /// The node has no provider id at all.
    #[error("node has no provider id")]
    Missing,

    /// The provider id does not carry the `hcloud://` scheme.
    #[error("provider id {0:?} is missing the hcloud:// prefix")]
    MissingPrefix(String),

    /// The part after the scheme is not a decimal server id.
    #[error("provider id {value:?} has a non-numeric server id")]
    InvalidId {
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// Parse a `hcloud://<id>` provider id into the numeric server id.
pub fn parse_server_id(provider_id: &str) -> Result<i64, ProviderIdError> {
    let digits = provider_id
        .strip_prefix(PROVIDER_ID_PREFIX)
        .ok_or_else(|| ProviderIdError::MissingPrefix(provider_id.to_string()))?;

    digits
        .parse::<i64>()
        .map_err(|e| ProviderIdError::InvalidId {
            value: provider_id.to_string(),
            source: e,
        })
}

/// Power actions against a compute instance.
#[async_trait]
pub trait PowerControl: Send + Sync {
    /// Request a graceful reboot of the server.
    async fn soft_reboot(&self, server_id: i64) -> Result<(), HcloudError>;

    /// Force a power cycle of the server.
    async fn hard_reset(&self, server_id: i64) -> Result<(), HcloudError>;
}

#[derive(Debug, Deserialize)]
struct ActionResponse {
    action: HcloudAction,
}

/// Subset of the action object returned by the actions endpoints.
#[derive(Debug, Deserialize)]
struct HcloudAction {
    id: i64,
    status: String,
}

#[derive(Debug, Deserialize)]
struct DatacenterListResponse {
    datacenters: Vec<Datacenter>,
}

#[derive(Debug, Deserialize)]
struct Datacenter {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Hetzner Cloud provider client.
#[derive(Clone)]
pub struct HcloudClient {
    client: Client,
    base_url: String,
    token: String,
}

impl HcloudClient {
    /// Create a new client for the public Hetzner Cloud API.
    pub fn new(token: impl Into<String>) -> Result<Self, HcloudError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(HcloudError::Http)?;

        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            token: token.into(),
        })
    }

    /// Override the API base URL (for tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Cheap read to confirm the token works before the poll loop starts.
    pub async fn verify_access(&self) -> Result<(), HcloudError> {
        let url = format!("{}/datacenters", self.base_url);
        debug!(url = %url, "GET datacenters");

        let response = self.client.get(&url).bearer_auth(&self.token).send().await?;
        let list: DatacenterListResponse = Self::handle_response(response).await?;

        debug!(
            datacenters = ?list.datacenters.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            "Hetzner Cloud API reachable"
        );
        Ok(())
    }

    /// POST a power action for a server.
    async fn server_action(&self, server_id: i64, action: &str) -> Result<(), HcloudError> {
        let url = format!("{}/servers/{}/actions/{}", self.base_url, server_id, action);
        debug!(url = %url, "POST server action");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let body: ActionResponse = Self::handle_response(response).await?;

        debug!(
            action_id = body.action.id,
            status = %body.action.status,
            "server action accepted"
        );
        Ok(())
    }

    /// Map an API response to a typed result.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, HcloudError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "failed to parse response");
                HcloudError::Serialization(e)
            })
        } else if status == StatusCode::NOT_FOUND {
            Err(HcloudError::NotFound(api_message(&text)))
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(HcloudError::Auth(api_message(&text)))
        } else {
            Err(HcloudError::Api {
                status: status.as_u16(),
                message: api_message(&text),
            })
        }
    }
}

/// Pull the human-readable message out of an hcloud error body, falling back
/// to the raw body.
fn api_message(body: &str) -> String {
    serde_json::from_str::<ErrorResponse>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string())
}

#[async_trait]
impl PowerControl for HcloudClient {
    async fn soft_reboot(&self, server_id: i64) -> Result<(), HcloudError> {
        self.server_action(server_id, "reboot").await
    }

    async fn hard_reset(&self, server_id: i64) -> Result<(), HcloudError> {
        self.server_action(server_id, "reset").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{bearer_token, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn action_body(command: &str) -> serde_json::Value {
        json!({
            "action": {
                "id": 4711,
                "command": command,
                "status": "running",
                "progress": 0
            }
        })
    }

    fn client_for(server: &MockServer) -> HcloudClient {
        HcloudClient::new("test-token")
            .unwrap()
            .with_base_url(server.uri())
    }

    #[test]
    fn test_parse_server_id() {
        assert_eq!(parse_server_id("hcloud://12345").unwrap(), 12345);
    }

    #[test]
    fn test_parse_server_id_missing_prefix() {
        assert!(matches!(
            parse_server_id("12345"),
            Err(ProviderIdError::MissingPrefix(_))
        ));
        assert!(matches!(
            parse_server_id("aws:///i-abc123"),
            Err(ProviderIdError::MissingPrefix(_))
        ));
    }

    #[test]
    fn test_parse_server_id_non_numeric() {
        assert!(matches!(
            parse_server_id("hcloud://abc"),
            Err(ProviderIdError::InvalidId { .. })
        ));
        assert!(matches!(
            parse_server_id("hcloud://"),
            Err(ProviderIdError::InvalidId { .. })
        ));
    }

    #[tokio::test]
    async fn test_soft_reboot_posts_reboot_action() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/servers/42/actions/reboot"))
            .and(bearer_token("test-token"))
            .respond_with(ResponseTemplate::new(201).set_body_json(action_body("reboot_server")))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.soft_reboot(42).await.unwrap();
    }

    #[tokio::test]
    async fn test_hard_reset_posts_reset_action() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/servers/42/actions/reset"))
            .and(bearer_token("test-token"))
            .respond_with(ResponseTemplate::new(201).set_body_json(action_body("reset_server")))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.hard_reset(42).await.unwrap();
    }

    #[tokio::test]
    async fn test_not_found_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/servers/42/actions/reboot"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": { "code": "not_found", "message": "server not found" }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.soft_reboot(42).await.unwrap_err();
        assert!(matches!(err, HcloudError::NotFound(msg) if msg == "server not found"));
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/datacenters"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": { "code": "unauthorized", "message": "unable to authenticate" }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.verify_access().await.unwrap_err();
        assert!(matches!(err, HcloudError::Auth(msg) if msg == "unable to authenticate"));
    }

    #[tokio::test]
    async fn test_api_error_carries_status_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/servers/42/actions/reset"))
            .respond_with(ResponseTemplate::new(423).set_body_json(json!({
                "error": { "code": "locked", "message": "server is locked" }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.hard_reset(42).await.unwrap_err();
        match err {
            HcloudError::Api { status, message } => {
                assert_eq!(status, 423);
                assert_eq!(message, "server is locked");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_verify_access_lists_datacenters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/datacenters"))
            .and(bearer_token("test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "datacenters": [{ "id": 1, "name": "fsn1-dc14" }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.verify_access().await.unwrap();
    }
}
