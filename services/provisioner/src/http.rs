//! HTTP compute provider.
//!
//! Talks JSON to a compute endpoint. Every request carries the access key
//! pair as basic auth, plus a session token header when one is configured.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::params::CreateParams;
use crate::provider::{
    ComputeProvider, InstanceId, InstanceStatus, ProviderError, TerminateOutcome,
    DEFAULT_DESCRIBE_PAGE_SIZE,
};

/// Header carrying a temporary session token.
pub const SESSION_TOKEN_HEADER: &str = "x-session-token";

/// Default request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Access credentials. Held by the provider for its lifetime.
#[derive(Clone, Default)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// HTTP provider configuration.
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    /// Base URL. A `{region}` placeholder is replaced with the region.
    pub endpoint: String,
    pub region: String,
    pub credentials: Credentials,
    pub timeout: Duration,
    pub creation_tags: bool,
    pub page_size: usize,
}

impl HttpProviderConfig {
    pub fn new(endpoint: impl Into<String>, region: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            endpoint: endpoint.into(),
            region: region.into(),
            credentials,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            creation_tags: true,
            page_size: DEFAULT_DESCRIBE_PAGE_SIZE,
        }
    }

    /// Endpoint with the region substituted and no trailing slash.
    pub fn base_url(&self) -> String {
        self.endpoint
            .replace("{region}", &self.region)
            .trim_end_matches('/')
            .to_string()
    }
}

/// Compute provider backed by an HTTP API.
pub struct HttpComputeProvider {
    client: reqwest::Client,
    base_url: String,
    credentials: Credentials,
    creation_tags: bool,
    page_size: usize,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize)]
struct InstanceIdsRequest<'a> {
    instance_ids: &'a [InstanceId],
}

#[derive(Debug, Deserialize)]
struct InstancesResponse {
    instances: Vec<InstanceStatus>,
}

#[derive(Debug, Deserialize)]
struct TerminateResponse {
    results: Vec<TerminateResult>,
}

#[derive(Debug, Deserialize)]
struct TerminateResult {
    instance_id: InstanceId,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Serialize)]
struct SecurityGroupsRequest<'a> {
    vpc_id: &'a str,
    names: &'a [String],
}

#[derive(Debug, Deserialize)]
struct SecurityGroupsResponse {
    security_groups: Vec<SecurityGroup>,
}

#[derive(Debug, Deserialize)]
struct SecurityGroup {
    name: String,
    id: String,
}

#[derive(Debug, Serialize)]
struct TagsRequest<'a> {
    tags: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ClassicLinkRequest<'a> {
    vpc_id: &'a str,
    security_group_ids: &'a [String],
}

#[derive(Debug, Serialize)]
struct TerminationProtectionRequest {
    enabled: bool,
}

impl HttpComputeProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            base_url: config.base_url(),
            credentials: config.credentials,
            creation_tags: config.creation_tags,
            page_size: config.page_size,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, "Calling compute API");

        let builder = self
            .client
            .request(method, url)
            .basic_auth(&self.credentials.access_key, Some(&self.credentials.secret_key));
        match &self.credentials.session_token {
            Some(token) => builder.header(SESSION_TOKEN_HEADER, token),
            None => builder,
        }
    }

    async fn send<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &T,
    ) -> Result<Response, ProviderError> {
        let response = self.request(method, path).json(body).send().await?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, path, "Compute API request failed");
        Err(error_from_response(status, &body))
    }

    async fn call<T, R>(&self, method: Method, path: &str, body: &T) -> Result<R, ProviderError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self.send(method, path, body).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

fn error_from_response(status: StatusCode, body: &str) -> ProviderError {
    let parsed: Option<ApiErrorBody> = serde_json::from_str(body).ok();
    let (code, message) = match parsed {
        Some(err) => (err.code, err.message),
        None => (
            status.canonical_reason().unwrap_or("Unknown").to_string(),
            body.to_string(),
        ),
    };
    api_error(status.as_u16(), code, message)
}

fn api_error(status: u16, code: String, message: String) -> ProviderError {
    if status == StatusCode::NOT_FOUND.as_u16() || code.contains("NotFound") {
        let subject = if message.is_empty() { code } else { message };
        ProviderError::NotFound(subject)
    } else {
        ProviderError::api(status, code, message)
    }
}

#[async_trait]
impl ComputeProvider for HttpComputeProvider {
    async fn create(&self, params: &CreateParams) -> Result<Vec<InstanceStatus>, ProviderError> {
        let response: InstancesResponse = self.call(Method::POST, "/v1/instances", params).await?;
        debug!(count = response.instances.len(), "Created instances");
        Ok(response.instances)
    }

    async fn terminate(&self, ids: &[InstanceId]) -> Result<Vec<TerminateOutcome>, ProviderError> {
        let response: TerminateResponse = self
            .call(
                Method::POST,
                "/v1/instances/terminate",
                &InstanceIdsRequest { instance_ids: ids },
            )
            .await?;

        Ok(response
            .results
            .into_iter()
            .map(|result| TerminateOutcome {
                result: match result.error {
                    None => Ok(()),
                    Some(err) => Err(api_error(200, err.code, err.message)),
                },
                instance_id: result.instance_id,
            })
            .collect())
    }

    async fn describe_status(
        &self,
        ids: &[InstanceId],
    ) -> Result<Vec<InstanceStatus>, ProviderError> {
        let response: InstancesResponse = self
            .call(
                Method::POST,
                "/v1/instances/describe",
                &InstanceIdsRequest { instance_ids: ids },
            )
            .await?;
        Ok(response.instances)
    }

    async fn describe_security_groups(
        &self,
        vpc_id: &str,
        names: &[String],
    ) -> Result<BTreeMap<String, String>, ProviderError> {
        let response: SecurityGroupsResponse = self
            .call(
                Method::POST,
                "/v1/security-groups/describe",
                &SecurityGroupsRequest { vpc_id, names },
            )
            .await?;

        Ok(response
            .security_groups
            .into_iter()
            .map(|group| (group.name, group.id))
            .collect())
    }

    async fn tag(
        &self,
        id: &InstanceId,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError> {
        let path = format!("/v1/instances/{}/tags", id);
        self.send(Method::POST, &path, &TagsRequest { tags }).await?;
        Ok(())
    }

    async fn link(
        &self,
        id: &InstanceId,
        vpc_id: &str,
        groups: &[String],
    ) -> Result<(), ProviderError> {
        let path = format!("/v1/instances/{}/classic-link", id);
        let body = ClassicLinkRequest {
            vpc_id,
            security_group_ids: groups,
        };
        self.send(Method::POST, &path, &body).await?;
        Ok(())
    }

    async fn set_termination_protection(
        &self,
        id: &InstanceId,
        enabled: bool,
    ) -> Result<(), ProviderError> {
        let path = format!("/v1/instances/{}/termination-protection", id);
        self.send(Method::PUT, &path, &TerminationProtectionRequest { enabled })
            .await?;
        Ok(())
    }

    fn supports_creation_tags(&self) -> bool {
        self.creation_tags
    }

    fn describe_page_size(&self) -> usize {
        self.page_size
    }
}
