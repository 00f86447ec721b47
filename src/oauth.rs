use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::repository::{self, Member};
use crate::storage::Database;

/// Tokens expiring within this many seconds are refreshed before use.
pub const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credentials {
    /// Expiry is kept to whole seconds, the precision it is stored at.
    pub fn new(access_token: &str, refresh_token: &str, expires_in_secs: i64, now: DateTime<Utc>) -> Self {
        let expires_at = now + Duration::seconds(expires_in_secs);
        Self {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            expires_at: DateTime::from_timestamp(expires_at.timestamp(), 0).unwrap_or(expires_at),
        }
    }

    /// Placeholder credentials that force a refresh on first use.
    pub fn expired(refresh_token: &str) -> Self {
        Self {
            access_token: String::new(),
            refresh_token: refresh_token.to_string(),
            expires_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now <= Duration::seconds(REFRESH_MARGIN_SECS)
    }
}

/// Which of a member's two credential sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Vendor,
    OpenHumans,
}

/// Successful reply from an OAuth2 token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchange a refresh token. Non-200 replies map to [`Error::TokenRefresh`].
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse>;
}

/// `grant_type=refresh_token` against a real token URL, with HTTP basic
/// client credentials.
pub struct HttpTokenEndpoint {
    http: reqwest::Client,
    provider: String,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl HttpTokenEndpoint {
    pub fn new(provider: &str, token_url: &str, client_id: &str, client_secret: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            provider: provider.to_string(),
            token_url: token_url.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let form = [("grant_type", "refresh_token"), ("refresh_token", refresh_token)];
        let resp = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&form)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            log::debug!("{} token refresh rejected: {body}", self.provider);
            return Err(Error::TokenRefresh {
                provider: self.provider.clone(),
                status: status.as_u16(),
            });
        }
        Ok(resp.json().await?)
    }
}

/// Hands out valid access tokens, refreshing and persisting them as needed.
#[derive(Clone)]
pub struct TokenRefresher {
    db: Database,
    vendor: Arc<dyn TokenEndpoint>,
    open_humans: Arc<dyn TokenEndpoint>,
}

impl TokenRefresher {
    pub fn new(db: Database, vendor: Arc<dyn TokenEndpoint>, open_humans: Arc<dyn TokenEndpoint>) -> Self {
        Self {
            db,
            vendor,
            open_humans,
        }
    }

    /// The member's current access token for `provider`, refreshed first when
    /// it is expired or about to expire. On refresh failure the stored tokens
    /// are left as they were.
    pub async fn get_valid_access_token(&self, member: &mut Member, provider: Provider) -> Result<String> {
        let now = Utc::now();
        if member.credentials(provider).needs_refresh(now) {
            self.refresh(member, provider).await?;
        }
        Ok(member.credentials(provider).access_token.clone())
    }

    /// Refresh unconditionally and persist the new tokens.
    pub async fn refresh(&self, member: &mut Member, provider: Provider) -> Result<()> {
        let endpoint = match provider {
            Provider::Vendor => &self.vendor,
            Provider::OpenHumans => &self.open_humans,
        };
        let refresh_token = member.credentials(provider).refresh_token.clone();
        let token = endpoint.refresh(&refresh_token).await?;

        let creds = Credentials::new(
            &token.access_token,
            token.refresh_token.as_deref().unwrap_or(&refresh_token),
            token.expires_in,
            Utc::now(),
        );

        match provider {
            Provider::Vendor => {
                if let Some(user_id) = token.user_id {
                    member.vendor_user_id = Some(user_id);
                }
                if let Some(scope) = token.scope {
                    member.vendor_scope = Some(scope);
                }
                member.vendor_credentials = creds;
            }
            Provider::OpenHumans => member.oh_credentials = creds,
        }

        log::info!("Refreshed {provider:?} token for member {}", member.oh_id);
        let updated = member.clone();
        self.db
            .writer()
            .call(move |conn| repository::update_credentials(conn, &updated))
            .await?;
        Ok(())
    }
}
