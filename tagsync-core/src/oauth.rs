use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::client::{read_json, send_with_retry};
use crate::error::RemoteError;
use crate::retry::RetryPolicy;

const DEFAULT_AUTHORIZE_BASE_URL: &str = "https://www.dropbox.com";
const DEFAULT_TOKEN_BASE_URL: &str = "https://api.dropboxapi.com";
const VERIFIER_BYTES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

pub fn generate_pkce_pair() -> PkcePair {
    let mut random_bytes = [0u8; VERIFIER_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut random_bytes);
    let verifier = URL_SAFE_NO_PAD.encode(random_bytes);
    let challenge = code_challenge(&verifier);
    PkcePair {
        verifier,
        challenge,
    }
}

pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

#[derive(Clone)]
pub struct OAuthClient {
    http: Client,
    authorize_base: Url,
    token_base: Url,
    policy: RetryPolicy,
}

impl OAuthClient {
    pub fn new() -> Result<Self, RemoteError> {
        Self::with_base_urls(DEFAULT_AUTHORIZE_BASE_URL, DEFAULT_TOKEN_BASE_URL)
    }

    pub fn with_base_urls(authorize_base: &str, token_base: &str) -> Result<Self, RemoteError> {
        Ok(Self {
            http: Client::new(),
            authorize_base: Url::parse(authorize_base)?,
            token_base: Url::parse(token_base)?,
            policy: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn authorize_url(
        &self,
        client_id: &str,
        code_challenge: &str,
        redirect_uri: Option<&str>,
    ) -> Result<Url, RemoteError> {
        let mut url = self.authorize_base.join("/oauth2/authorize")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", client_id);
            query.append_pair("response_type", "code");
            query.append_pair("code_challenge", code_challenge);
            query.append_pair("code_challenge_method", "S256");
            query.append_pair("token_access_type", "offline");
            if let Some(redirect_uri) = redirect_uri {
                query.append_pair("redirect_uri", redirect_uri);
            }
        }
        Ok(url)
    }

    pub async fn exchange_code(
        &self,
        client_id: &str,
        code: &str,
        code_verifier: &str,
        redirect_uri: Option<&str>,
    ) -> Result<OAuthToken, RemoteError> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", client_id),
            ("code_verifier", code_verifier),
        ];
        if let Some(redirect_uri) = redirect_uri {
            form.push(("redirect_uri", redirect_uri));
        }
        self.post_token_form(&form).await
    }

    pub async fn refresh_token(
        &self,
        client_id: &str,
        refresh_token: &str,
    ) -> Result<OAuthToken, RemoteError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
        ];
        self.post_token_form(&form).await
    }

    async fn post_token_form(&self, form: &[(&str, &str)]) -> Result<OAuthToken, RemoteError> {
        let url = self.token_base.join("/oauth2/token")?;
        let response =
            send_with_retry(&self.policy, || self.http.post(url.clone()).form(form)).await?;
        read_json(response).await
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}
