//! Access-credential providers injected into [`ApiClient`](crate::ApiClient).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::ApiError;

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, ApiError>;
}

/// Long-lived API token.
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn access_token(&self) -> Result<String, ApiError> {
        if self.token.trim().is_empty() {
            return Err(ApiError::Credential("api token is empty".to_string()));
        }
        Ok(self.token.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub access_token: String,
    /// Present when the issuer rotates refresh tokens.
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Exchanges a refresh token for a fresh access token.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<IssuedToken, ApiError>;
}

#[derive(Debug)]
struct CredentialState {
    refresh_token: String,
    current: Option<IssuedToken>,
}

/// Caches an access token and refreshes it once it is within `margin` of expiry.
pub struct RefreshingCredentials<I> {
    issuer: I,
    margin: chrono::Duration,
    state: Mutex<CredentialState>,
}

impl<I: TokenIssuer> RefreshingCredentials<I> {
    pub fn new(issuer: I, refresh_token: impl Into<String>, margin: Duration) -> Self {
        Self {
            issuer,
            margin: chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero()),
            state: Mutex::new(CredentialState {
                refresh_token: refresh_token.into(),
                current: None,
            }),
        }
    }

    /// Returns a token valid at `now + margin`, refreshing first when needed.
    ///
    /// The state lock is held across a refresh so concurrent callers share one exchange.
    pub async fn token_at(&self, now: DateTime<Utc>) -> Result<String, ApiError> {
        let mut state = self.state.lock().await;
        if let Some(current) = &state.current {
            if current.expires_at - self.margin > now {
                return Ok(current.access_token.clone());
            }
        }

        let issued = self.issuer.refresh(&state.refresh_token).await?;
        info!(expires_at = %issued.expires_at, "access token refreshed");
        if let Some(rotated) = &issued.refresh_token {
            state.refresh_token = rotated.clone();
        }
        let token = issued.access_token.clone();
        state.current = Some(issued);
        Ok(token)
    }
}

#[async_trait]
impl<I: TokenIssuer> CredentialProvider for RefreshingCredentials<I> {
    async fn access_token(&self) -> Result<String, ApiError> {
        self.token_at(Utc::now()).await
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// OAuth `refresh_token` grant against a token endpoint using HTTP basic client auth.
pub struct RefreshGrantIssuer {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl RefreshGrantIssuer {
    const DEFAULT_EXPIRES_IN_SECS: i64 = 300;

    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ApiError::Credential(format!("building token client: {err}")))?;
        Ok(Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }
}

#[async_trait]
impl TokenIssuer for RefreshGrantIssuer {
    async fn refresh(&self, refresh_token: &str) -> Result<IssuedToken, ApiError> {
        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|err| ApiError::Credential(format!("token request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Credential(format!(
                "token endpoint returned http {}",
                status.as_u16()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|err| ApiError::Credential(format!("invalid token response: {err}")))?;
        let expires_in = body.expires_in.unwrap_or(Self::DEFAULT_EXPIRES_IN_SECS);
        Ok(IssuedToken {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    struct CountingIssuer {
        calls: AtomicU32,
        base: DateTime<Utc>,
        seen_refresh_tokens: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl TokenIssuer for CountingIssuer {
        async fn refresh(&self, refresh_token: &str) -> Result<IssuedToken, ApiError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen_refresh_tokens
                .lock()
                .unwrap()
                .push(refresh_token.to_string());
            Ok(IssuedToken {
                access_token: format!("access-{n}"),
                refresh_token: Some(format!("refresh-{n}")),
                expires_at: self.base + chrono::Duration::minutes(10 * n as i64),
            })
        }
    }

    fn issuer(base: DateTime<Utc>) -> CountingIssuer {
        CountingIssuer {
            calls: AtomicU32::new(0),
            base,
            seen_refresh_tokens: StdMutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn refreshes_only_inside_expiry_margin() {
        let base = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).single().unwrap();
        let creds =
            RefreshingCredentials::new(issuer(base), "refresh-0", Duration::from_secs(60));

        assert_eq!(creds.token_at(base).await.unwrap(), "access-1");
        // First token expires at base + 10min; still outside the 60s margin.
        assert_eq!(
            creds
                .token_at(base + chrono::Duration::minutes(8))
                .await
                .unwrap(),
            "access-1"
        );
        assert_eq!(creds.issuer.calls.load(Ordering::SeqCst), 1);

        let inside_margin = base + chrono::Duration::minutes(9) + chrono::Duration::seconds(30);
        assert_eq!(creds.token_at(inside_margin).await.unwrap(), "access-2");
        assert_eq!(creds.issuer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rotated_refresh_token_is_used_next_time() {
        let base = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).single().unwrap();
        let creds = RefreshingCredentials::new(issuer(base), "initial", Duration::from_secs(0));

        creds.token_at(base).await.unwrap();
        creds
            .token_at(base + chrono::Duration::hours(1))
            .await
            .unwrap();

        let seen = creds.issuer.seen_refresh_tokens.lock().unwrap().clone();
        assert_eq!(seen, vec!["initial".to_string(), "refresh-1".to_string()]);
    }

    #[tokio::test]
    async fn empty_static_token_is_rejected() {
        let err = StaticToken::new("  ").access_token().await.expect_err("empty");
        assert!(matches!(err, ApiError::Credential(_)));
        assert_eq!(StaticToken::new("abc").access_token().await.unwrap(), "abc");
    }
}
