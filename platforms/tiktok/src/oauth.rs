//! OAuth 2.0 against TikTok's Login Kit.
//!
//! TikTok deviates from plain OAuth in two ways that rule out a generic client: the client id
//! is sent as `client_key`, and the token endpoint may answer `200 OK` with an `error` field in
//! the body. [`OAuthManager`] therefore builds the authorization URL and the token requests
//! itself and only borrows the `oauth2` crate's newtypes so secrets never end up in logs.
//!
//! The manager is stateless. Whoever calls [`OAuthManager::authorization_url`] is responsible
//! for remembering which subject the returned state belongs to, usually in an
//! [`OAuthStateStore`].

pub mod state;

pub use state::{OAuthStateStore, PendingAuthorization};

use crate::config::TikTokConfig;
use crate::error::TikTokError;
use eyre::Context;
use oauth2::url::Url;
use oauth2::{AccessToken, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RefreshToken};
use serde::Deserialize;
use tracing::instrument;

/// Token endpoint path, relative to the API base.
const TOKEN_PATH: &str = "/v2/oauth/token/";

/// Bytes of randomness in each CSRF state token.
const STATE_ENTROPY_BYTES: u32 = 32;

/// What TikTok hands back from a successful code exchange or refresh.
#[derive(Debug, Clone)]
pub struct TokenBundle {
    pub access_token: AccessToken,
    pub refresh_token: Option<RefreshToken>,
    /// Seconds until the access token expires.
    pub expires_in: Option<u64>,
    /// Seconds until the refresh token expires.
    pub refresh_expires_in: Option<u64>,
    pub token_type: Option<String>,
    /// TikTok's stable identifier for the authorizing user.
    pub open_id: Option<String>,
    pub scope: Option<String>,
}

/// Everything the token endpoint might send, success or not.
#[derive(Debug, Default, Deserialize)]
struct RawTokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
    refresh_expires_in: Option<u64>,
    token_type: Option<String>,
    open_id: Option<String>,
    scope: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Builds authorization URLs and talks to TikTok's token endpoint.
#[derive(Debug, Clone)]
pub struct OAuthManager {
    config: TikTokConfig,
    http: reqwest::Client,
}

impl OAuthManager {
    pub fn new(config: TikTokConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    pub fn config(&self) -> &TikTokConfig {
        &self.config
    }

    fn client_key(&self) -> Result<&ClientId, TikTokError> {
        self.config
            .client_key
            .as_ref()
            .ok_or(TikTokError::Config("TIKTOK_CLIENT_KEY"))
    }

    fn client_secret(&self) -> Result<&ClientSecret, TikTokError> {
        self.config
            .client_secret
            .as_ref()
            .ok_or(TikTokError::Config("TIKTOK_CLIENT_SECRET"))
    }

    fn redirect_uri(&self) -> Result<&str, TikTokError> {
        self.config
            .redirect_uri
            .as_ref()
            .map(|uri| uri.as_str())
            .ok_or(TikTokError::Config("TIKTOK_REDIRECT_URI"))
    }

    /// Returns the URL to send the user to, along with the fresh CSRF state embedded in it.
    ///
    /// Requires the client key and redirect URI to be configured.
    pub fn authorization_url(&self) -> Result<(Url, CsrfToken), TikTokError> {
        let client_key = self.client_key()?;
        let redirect_uri = self.redirect_uri()?;

        let state = CsrfToken::new_random_len(STATE_ENTROPY_BYTES);
        let mut url = self.config.authorize_url.url().clone();
        url.query_pairs_mut()
            .append_pair("client_key", client_key.as_str())
            .append_pair("scope", &self.config.scopes.join(","))
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("state", state.secret());

        Ok((url, state))
    }

    /// Trades an authorization code from the redirect for an access token.
    ///
    /// Requires the client key, client secret, and redirect URI to be configured.
    #[instrument(skip_all)]
    pub async fn exchange_code(
        &self,
        code: &AuthorizationCode,
    ) -> Result<TokenBundle, TikTokError> {
        let client_key = self.client_key()?;
        let client_secret = self.client_secret()?;
        let redirect_uri = self.redirect_uri()?;

        let bundle = self
            .request_token(&[
                ("client_key", client_key.as_str()),
                ("client_secret", client_secret.secret().as_str()),
                ("code", code.secret().as_str()),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri),
            ])
            .await?;

        tracing::debug!(open_id = ?bundle.open_id, "exchanged authorization code for token");
        Ok(bundle)
    }

    /// Uses a refresh token to obtain a new access token.
    ///
    /// TikTok may or may not rotate the refresh token; callers should keep the old one if the
    /// bundle does not carry a new one.
    #[instrument(skip_all)]
    pub async fn refresh_token(
        &self,
        refresh_token: &RefreshToken,
    ) -> Result<TokenBundle, TikTokError> {
        let client_key = self.client_key()?;
        let client_secret = self.client_secret()?;

        tracing::debug!("attempting to refresh OAuth token");
        self.request_token(&[
            ("client_key", client_key.as_str()),
            ("client_secret", client_secret.secret().as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.secret().as_str()),
        ])
        .await
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<TokenBundle, TikTokError> {
        let url = self.config.endpoint(TOKEN_PATH)?;
        let response = self
            .http
            .post(url)
            .header("Cache-Control", "no-cache")
            .form(form)
            .send()
            .await
            .context("send request to TikTok token endpoint")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("read TikTok token endpoint response")?;
        let raw: RawTokenResponse = if status.is_success() {
            serde_json::from_str(&body).context("parse TikTok token endpoint response as JSON")?
        } else {
            // error bodies are not guaranteed to be JSON
            serde_json::from_str(&body).unwrap_or_default()
        };

        if !status.is_success() || raw.error.is_some() {
            tracing::warn!(%status, error = ?raw.error, "TikTok token endpoint rejected request");
            return Err(TikTokError::api(
                raw.error.unwrap_or_else(|| "unknown".to_string()),
                raw.error_description
                    .filter(|d| !d.is_empty())
                    .unwrap_or_else(|| format!("token request failed with status {status}")),
            ));
        }

        let Some(access_token) = raw.access_token else {
            return Err(TikTokError::api(
                "unknown",
                "token response did not include an access token",
            ));
        };

        Ok(TokenBundle {
            access_token: AccessToken::new(access_token),
            refresh_token: raw.refresh_token.map(RefreshToken::new),
            expires_in: raw.expires_in,
            refresh_expires_in: raw.refresh_expires_in,
            token_type: raw.token_type,
            open_id: raw.open_id,
            scope: raw.scope,
        })
    }
}
