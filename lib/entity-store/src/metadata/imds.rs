use std::{
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use entity_common::sync::MutexExt as _;
use entity_error::{ErrorContext as _, GenericError};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use snafu::ResultExt as _;
use tokio::time::Instant;
use tracing::debug;

use super::{Decode, InstanceIdentityDocument, MetadataProvider, ProviderError, Service, Status, Transport};

const DEFAULT_ENDPOINT: &str = "http://169.254.169.254";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(21600);
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

const TOKEN_PATH: &str = "/latest/api/token";
const IDENTITY_DOCUMENT_PATH: &str = "/latest/dynamic/instance-identity/document";
const INSTANCE_TAGS_PATH: &str = "/latest/meta-data/tags/instance";
const IAM_INFO_PATH: &str = "/latest/meta-data/iam/info";

const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";

/// IMDS client configuration.
#[derive(Clone, Debug)]
pub struct ImdsConfiguration {
    endpoint: String,
    timeout: Duration,
    token_ttl: Duration,
}

impl ImdsConfiguration {
    /// Sets the base URL of the metadata service.
    ///
    /// Defaults to `http://169.254.169.254`.
    pub fn with_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// Sets the per-request timeout.
    ///
    /// Defaults to 5 seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the lifetime requested for session tokens.
    ///
    /// Defaults to 6 hours, the maximum allowed by IMDS.
    pub fn with_token_ttl(mut self, token_ttl: Duration) -> Self {
        self.token_ttl = token_ttl;
        self
    }

    /// Returns the base URL of the metadata service.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns the per-request timeout.
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the lifetime requested for session tokens.
    pub const fn token_ttl(&self) -> Duration {
        self.token_ttl
    }
}

impl Default for ImdsConfiguration {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: DEFAULT_TIMEOUT,
            token_ttl: DEFAULT_TOKEN_TTL,
        }
    }
}

#[derive(Deserialize)]
struct IamInfo {
    #[serde(rename = "Code", default)]
    code: String,

    #[serde(rename = "Message", default)]
    message: String,

    #[serde(rename = "InstanceProfileArn", default)]
    instance_profile_arn: String,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// A [`MetadataProvider`] backed by the EC2 instance metadata service.
///
/// Requests use session tokens (IMDSv2) when the service hands them out. If a token cannot be acquired, for example
/// because the hop limit is too low for a containerized agent, requests are sent without one (IMDSv1) instead.
pub struct ImdsMetadataProvider {
    client: Client,
    config: ImdsConfiguration,
    token: Mutex<Option<CachedToken>>,
    fallback_used: AtomicBool,
}

impl ImdsMetadataProvider {
    /// Creates a new `ImdsMetadataProvider` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the HTTP client cannot be built, an error is returned.
    pub fn from_configuration(config: &ImdsConfiguration) -> Result<Self, GenericError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .no_proxy()
            .build()
            .error_context("Failed to build IMDS HTTP client.")?;

        Ok(Self {
            client,
            config: config.clone(),
            token: Mutex::new(None),
            fallback_used: AtomicBool::new(false),
        })
    }

    /// Returns `true` if a request has been sent without a session token.
    pub fn fallback_used(&self) -> bool {
        self.fallback_used.load(Relaxed)
    }

    async fn token(&self) -> Option<String> {
        let now = Instant::now();
        let cached = self
            .token
            .lock_unpoisoned()
            .as_ref()
            .filter(|cached| cached.refresh_at > now)
            .map(|cached| cached.value.clone());
        if cached.is_some() {
            return cached;
        }

        match self.fetch_token().await {
            Ok(value) => {
                let refresh_at = now + self.config.token_ttl.saturating_sub(TOKEN_REFRESH_MARGIN);
                *self.token.lock_unpoisoned() = Some(CachedToken {
                    value: value.clone(),
                    refresh_at,
                });
                Some(value)
            }
            Err(e) => {
                if !self.fallback_used.swap(true, Relaxed) {
                    debug!(error = %e, "Failed to acquire IMDSv2 session token. Falling back to IMDSv1.");
                }
                None
            }
        }
    }

    async fn fetch_token(&self) -> Result<String, ProviderError> {
        let operation = "session token";
        let response = self
            .client
            .request(Method::PUT, format!("{}{}", self.config.endpoint, TOKEN_PATH))
            .header(TOKEN_TTL_HEADER, self.config.token_ttl.as_secs().to_string())
            .send()
            .await
            .context(Transport { operation })?;

        read_body(operation, response).await
    }

    async fn send(&self, operation: &'static str, path: &str, token: Option<&str>) -> Result<Response, ProviderError> {
        let mut request = self.client.get(format!("{}{}", self.config.endpoint, path));
        if let Some(token) = token {
            request = request.header(TOKEN_HEADER, token);
        }
        request.send().await.context(Transport { operation })
    }

    async fn get_text(&self, operation: &'static str, path: &str) -> Result<String, ProviderError> {
        let token = self.token().await;
        let mut response = self.send(operation, path, token.as_deref()).await?;

        // An expired or revoked token is rejected outright. Get a fresh one and try once more.
        if response.status() == StatusCode::UNAUTHORIZED && token.is_some() {
            *self.token.lock_unpoisoned() = None;
            let token = self.token().await;
            response = self.send(operation, path, token.as_deref()).await?;
        }

        read_body(operation, response).await
    }
}

async fn read_body(operation: &'static str, response: Response) -> Result<String, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        return Status {
            operation,
            status: status.as_u16(),
        }
        .fail();
    }

    response.text().await.context(Transport { operation })
}

fn decode<'a, T: Deserialize<'a>>(operation: &'static str, body: &'a str) -> Result<T, ProviderError> {
    serde_json::from_str(body)
        .map_err(GenericError::from)
        .context(Decode { operation })
}

#[async_trait]
impl MetadataProvider for ImdsMetadataProvider {
    async fn get(&self) -> Result<InstanceIdentityDocument, GenericError> {
        let operation = "instance identity document";
        let body = self.get_text(operation, IDENTITY_DOCUMENT_PATH).await?;
        Ok(decode(operation, &body)?)
    }

    async fn instance_tags(&self) -> Result<Vec<String>, GenericError> {
        let body = self.get_text("instance tags", INSTANCE_TAGS_PATH).await?;
        Ok(body
            .lines()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(String::from)
            .collect())
    }

    async fn instance_tag_value(&self, key: &str) -> Result<String, GenericError> {
        let path = format!("{}/{}", INSTANCE_TAGS_PATH, key);
        Ok(self.get_text("instance tag value", &path).await?)
    }

    async fn client_iam_role(&self) -> Result<String, GenericError> {
        let operation = "IAM info";
        let body = self.get_text(operation, IAM_INFO_PATH).await?;
        let info: IamInfo = decode(operation, &body)?;
        if !info.code.is_empty() && info.code != "Success" {
            return Service {
                operation,
                code: info.code,
                message: info.message,
            }
            .fail()
            .map_err(Into::into);
        }

        Ok(info.instance_profile_arn)
    }
}
