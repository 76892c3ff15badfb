//! Rate-limited HTTP client for the upstream commerce API.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info_span, warn, Instrument};

pub mod credentials;

pub use credentials::{
    CredentialProvider, IssuedToken, RefreshGrantIssuer, RefreshingCredentials, StaticToken,
    TokenIssuer,
};

pub const CRATE_NAME: &str = "shopwh-client";

pub const DEFAULT_BASE_URL: &str = "https://api.tiny.com.br/api2";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transient failure calling {endpoint} after {attempts} attempt(s): {message}")]
    Transient {
        endpoint: String,
        attempts: u32,
        message: String,
    },
    #[error("http status {status} from {endpoint}")]
    HttpStatus { endpoint: String, status: u16 },
    #[error("request to {endpoint} failed: {message}")]
    Request { endpoint: String, message: String },
    #[error("undecodable response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
    #[error("upstream rejected {endpoint}: {message}")]
    Business { endpoint: String, message: String },
    #[error("upstream rate limit on {endpoint}: {message}")]
    RateLimited { endpoint: String, message: String },
    #[error("credential error: {0}")]
    Credential(String),
    #[error("api client is shut down")]
    Closed,
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ApiError::RateLimited { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Network-level failures (timeouts, refused or reset connections, aborted bodies) are
/// retryable; everything else is final.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

fn api_error_from_reqwest(endpoint: &str, err: reqwest::Error) -> ApiError {
    match classify_reqwest_error(&err) {
        RetryDisposition::Retryable => ApiError::Transient {
            endpoint: endpoint.to_string(),
            attempts: 1,
            message: err.to_string(),
        },
        RetryDisposition::NonRetryable => ApiError::Request {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        },
    }
}

/// Linear backoff: the wait before attempt `n + 1` is `base_delay × n`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// `attempt` is the 1-based number of the attempt that just failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.max(1))
            .min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails permanently, or the attempt budget is spent.
///
/// `op` receives the 1-based attempt number. Only [`ApiError::Transient`] is retried; the
/// error returned after exhaustion reports the total attempt count.
pub async fn retry_transient<T, F, Fut>(
    policy: &BackoffPolicy,
    endpoint: &str,
    mut op: F,
) -> Result<T, ApiError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(ApiError::Transient { message, .. }) if attempt < max_attempts => {
                let wait = policy.delay_for_attempt(attempt);
                warn!(
                    endpoint,
                    attempt,
                    max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %message,
                    "transient upstream failure; retrying"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(ApiError::Transient { message, .. }) => {
                return Err(ApiError::Transient {
                    endpoint: endpoint.to_string(),
                    attempts: attempt,
                    message,
                });
            }
            Err(err) => return Err(err),
        }
    }
}

/// Seam between the sync engine and the upstream API.
#[async_trait]
pub trait SourceApi: Send + Sync {
    /// Calls `endpoint` with `params` and returns the decoded JSON body.
    async fn call(&self, endpoint: &str, params: &[(&str, String)]) -> Result<JsonValue, ApiError>;
}

/// Where the access credential travels on each request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthPlacement {
    QueryParam(String),
    Bearer,
}

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub auth: AuthPlacement,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(45),
            user_agent: None,
            max_concurrency: 4,
            backoff: BackoffPolicy::default(),
            auth: AuthPlacement::QueryParam("token".to_string()),
        }
    }
}

pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
    auth: AuthPlacement,
    credentials: Arc<dyn CredentialProvider>,
}

impl ApiClient {
    pub fn new(
        config: ApiClientConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ApiError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_concurrency.max(1));

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(|err| ApiError::Request {
            endpoint: config.base_url.clone(),
            message: format!("building http client: {err}"),
        })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            backoff: config.backoff,
            auth: config.auth,
            credentials,
        })
    }

    pub fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    async fn send_once(
        &self,
        url: &str,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<JsonValue, ApiError> {
        // The permit covers one request only, never the backoff sleep between attempts.
        let _permit = self.limit.acquire().await.map_err(|_| ApiError::Closed)?;
        let token = self.credentials.access_token().await?;

        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[("formato", "json")])
            .query(params);
        request = match &self.auth {
            AuthPlacement::QueryParam(name) => request.query(&[(name.as_str(), token.as_str())]),
            AuthPlacement::Bearer => request.bearer_auth(&token),
        };

        let response = request
            .send()
            .await
            .map_err(|err| api_error_from_reqwest(endpoint, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| api_error_from_reqwest(endpoint, err))?;
        serde_json::from_slice(&body).map_err(|err| ApiError::Decode {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        })
    }
}

#[async_trait]
impl SourceApi for ApiClient {
    async fn call(&self, endpoint: &str, params: &[(&str, String)]) -> Result<JsonValue, ApiError> {
        let url = self.endpoint_url(endpoint);
        let span = info_span!("api_call", endpoint);
        retry_transient(&self.backoff, endpoint, |_attempt| {
            self.send_once(&url, endpoint, params)
        })
        .instrument(span)
        .await
    }
}
