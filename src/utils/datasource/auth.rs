use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{EngineError, Result};

const METADATA_ENDPOINT: &str = "http://metadata.google.internal";
const TOKENINFO_ENDPOINT: &str = "https://oauth2.googleapis.com/tokeninfo";
const SERVICE_ACCOUNT_SUFFIX: &str = ".gserviceaccount.com";

/// Tokens this close to expiry are treated as expired.
const EXPIRY_MARGIN: Duration = Duration::from_secs(240);

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Option<Instant>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_in: Option<Duration>) -> Self {
        Self {
            token: token.into(),
            expires_at: expires_in.map(|ttl| Instant::now() + ttl),
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Instant::now() + EXPIRY_MARGIN >= expires_at,
            None => false,
        }
    }

    /// Time left before the token should be replaced, if it expires at all.
    pub fn refresh_in(&self) -> Option<Duration> {
        self.expires_at.map(|expires_at| {
            expires_at
                .saturating_duration_since(Instant::now())
                .saturating_sub(EXPIRY_MARGIN)
        })
    }
}

/// Source of OAuth2 access tokens for the ambient identity.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<AccessToken>;

    /// Email of the principal the tokens belong to.
    async fn principal_email(&self) -> Result<String> {
        let token = self.token().await?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        tokeninfo_email(&client, TOKENINFO_ENDPOINT, &token.token).await
    }
}

/// A token the caller already holds, e.g. from `gcloud auth print-access-token`.
pub struct StaticTokenSource {
    token: AccessToken,
    email: Option<String>,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: AccessToken::new(token, None),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<AccessToken> {
        Ok(self.token.clone())
    }

    async fn principal_email(&self) -> Result<String> {
        match &self.email {
            Some(email) => Ok(email.clone()),
            None => {
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(30))
                    .build()?;
                tokeninfo_email(&client, TOKENINFO_ENDPOINT, &self.token.token).await
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct MetadataTokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

/// Default service account of the GCE/GKE/Cloud Run environment, read from
/// the metadata server. Tokens are cached until close to expiry.
pub struct MetadataTokenSource {
    client: reqwest::Client,
    endpoint: String,
    cached: RwLock<Option<AccessToken>>,
}

impl MetadataTokenSource {
    pub fn new() -> Result<Self> {
        Self::with_endpoint(METADATA_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            cached: RwLock::new(None),
        })
    }

    async fn get_metadata(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!(
            "{}/computeMetadata/v1/instance/service-accounts/default/{}",
            self.endpoint, path
        );
        let response = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| EngineError::Auth(format!("Failed to reach metadata server: {}", e)))?;

        if !response.status().is_success() {
            return Err(EngineError::Auth(format!(
                "Metadata server returned {} for {}",
                response.status(),
                path
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl TokenSource for MetadataTokenSource {
    async fn token(&self) -> Result<AccessToken> {
        {
            let cached = self.cached.read().await;
            if let Some(token) = cached.as_ref() {
                if !token.is_expired() {
                    return Ok(token.clone());
                }
            }
        }

        let mut cached = self.cached.write().await;
        if let Some(token) = cached.as_ref() {
            if !token.is_expired() {
                return Ok(token.clone());
            }
        }

        debug!("Fetching access token from metadata server");
        let body: MetadataTokenResponse = self.get_metadata("token").await?.json().await?;
        let token = AccessToken::new(body.access_token, body.expires_in.map(Duration::from_secs));
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn principal_email(&self) -> Result<String> {
        let email = self.get_metadata("email").await?.text().await?;
        Ok(email.trim().to_string())
    }
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    email: Option<String>,
}

pub(crate) async fn tokeninfo_email(
    client: &reqwest::Client,
    endpoint: &str,
    token: &str,
) -> Result<String> {
    let response = client
        .get(endpoint)
        .query(&[("access_token", token)])
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(EngineError::Auth(format!(
            "Token info lookup failed with status: {}",
            response.status()
        )));
    }

    let info: TokenInfo = response.json().await?;
    info.email.ok_or_else(|| {
        EngineError::Auth(
            "Failed to automatically obtain authenticated IAM principal's email address \
             using environment's ADC credentials; pass iam_account_email explicitly"
                .to_string(),
        )
    })
}

/// Database user name Cloud SQL assigns to an IAM principal.
pub fn iam_database_user(email: &str) -> String {
    let email = email.trim();
    email
        .strip_suffix(SERVICE_ACCOUNT_SUFFIX)
        .unwrap_or(email)
        .to_string()
}
