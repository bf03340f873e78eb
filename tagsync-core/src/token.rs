use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::RemoteError;
use crate::oauth::{OAuthClient, OAuthToken, generate_pkce_pair};
use crate::retry::RetryPolicy;

const REFRESH_SKEW_SECS: i64 = 60;

/// Remote credentials as persisted by the host. `expires_at` is a unix
/// timestamp in seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkce_verifier: Option<String>,
}

impl Credentials {
    pub fn static_token(token: impl Into<String>) -> Self {
        Self {
            access_token: Some(token.into()),
            ..Self::default()
        }
    }

    pub fn is_refreshable(&self) -> bool {
        non_empty(&self.app_key) && non_empty(&self.refresh_token)
    }

    pub fn is_usable(&self) -> bool {
        non_empty(&self.access_token) || self.is_refreshable()
    }

    fn apply_token(&mut self, token: &OAuthToken, now: i64) {
        self.access_token = Some(token.access_token.clone());
        if let Some(refresh_token) = &token.refresh_token {
            self.refresh_token = Some(refresh_token.clone());
        }
        self.expires_at = token
            .expires_in
            .map(|secs| now.saturating_add(i64::try_from(secs).unwrap_or(i64::MAX)));
    }
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

pub struct TokenProvider {
    credentials: Credentials,
    oauth: OAuthClient,
    refresh_skew_secs: i64,
}

impl TokenProvider {
    pub fn new(credentials: Credentials, oauth: OAuthClient) -> Self {
        Self {
            credentials,
            oauth,
            refresh_skew_secs: REFRESH_SKEW_SECS,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn set_retry_policy(&mut self, policy: RetryPolicy) {
        self.oauth = self.oauth.clone().with_retry_policy(policy);
    }

    pub async fn valid_access_token(&mut self) -> Result<String, RemoteError> {
        if self.should_refresh() {
            self.refresh().await?;
        }
        self.credentials
            .access_token
            .clone()
            .filter(|token| !token.is_empty())
            .ok_or(RemoteError::MissingCredentials)
    }

    pub async fn refresh_now(&mut self) -> Result<String, RemoteError> {
        self.refresh().await?;
        self.credentials
            .access_token
            .clone()
            .ok_or(RemoteError::MissingCredentials)
    }

    pub fn begin_authorization(
        &mut self,
        app_key: &str,
        redirect_uri: Option<&str>,
    ) -> Result<Url, RemoteError> {
        let pair = generate_pkce_pair();
        let url = self
            .oauth
            .authorize_url(app_key, &pair.challenge, redirect_uri)?;
        self.credentials.app_key = Some(app_key.to_string());
        self.credentials.pkce_verifier = Some(pair.verifier);
        Ok(url)
    }

    pub async fn complete_authorization(
        &mut self,
        code: &str,
        redirect_uri: Option<&str>,
    ) -> Result<(), RemoteError> {
        let verifier = self
            .credentials
            .pkce_verifier
            .clone()
            .ok_or(RemoteError::MissingVerifier)?;
        let app_key = self
            .credentials
            .app_key
            .clone()
            .ok_or(RemoteError::MissingAppKey)?;
        let token = self
            .oauth
            .exchange_code(&app_key, code.trim(), &verifier, redirect_uri)
            .await?;
        self.credentials.apply_token(&token, now_unix());
        self.credentials.pkce_verifier = None;
        Ok(())
    }

    fn should_refresh(&self) -> bool {
        if !self.credentials.is_refreshable() {
            return false;
        }
        if !non_empty(&self.credentials.access_token) {
            return true;
        }
        let Some(expires_at) = self.credentials.expires_at else {
            return false;
        };
        expires_at <= now_unix().saturating_add(self.refresh_skew_secs)
    }

    async fn refresh(&mut self) -> Result<(), RemoteError> {
        let app_key = self
            .credentials
            .app_key
            .clone()
            .ok_or(RemoteError::MissingAppKey)?;
        let refresh_token = self
            .credentials
            .refresh_token
            .clone()
            .ok_or(RemoteError::MissingCredentials)?;
        let token = self.oauth.refresh_token(&app_key, &refresh_token).await?;
        self.credentials.apply_token(&token, now_unix());
        debug!(expires_at = ?self.credentials.expires_at, "access token refreshed");
        Ok(())
    }
}

pub(crate) fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
