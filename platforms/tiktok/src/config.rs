//! Configuration shared by the OAuth client and the publishing pipeline.

use crate::error::TikTokError;
use eyre::Context;
use oauth2::url::Url;
use oauth2::{AccessToken, AuthUrl, ClientId, ClientSecret, RedirectUrl};
use std::time::Duration;

/// Production host of the TikTok Open API.
pub const DEFAULT_API_BASE: &str = "https://open.tiktokapis.com";

/// TikTok's user-facing authorization page.
pub const DEFAULT_AUTHORIZE_URL: &str = "https://www.tiktok.com/v2/auth/authorize/";

/// Scopes needed to read the basic profile and post videos.
pub const DEFAULT_SCOPES: &[&str] = &["user.info.basic", "video.publish", "video.upload"];

/// Everything the TikTok integration needs to know about its environment.
///
/// The OAuth fields are optional so that a process which only publishes with a pre-issued
/// token can still be constructed; operations that need a missing field fail with
/// [`TikTokError::Config`] when they are invoked.
#[derive(Debug, Clone)]
pub struct TikTokConfig {
    /// TikTok calls the OAuth client id a "client key".
    pub client_key: Option<ClientId>,
    pub client_secret: Option<ClientSecret>,
    pub redirect_uri: Option<RedirectUrl>,
    /// Token used when a publish is requested without an explicit one (single-tenant mode).
    pub fallback_access_token: Option<AccessToken>,
    pub scopes: Vec<String>,
    pub api_base: Url,
    pub authorize_url: AuthUrl,
    /// Per-request timeout; the only cancellation mechanism for the protocol steps.
    pub http_timeout: Duration,
    /// How long an issued OAuth state stays redeemable.
    pub state_ttl: Duration,
}

impl Default for TikTokConfig {
    /// # Panics
    ///
    /// Panics if the hardcoded endpoint URLs are malformed, which they are not.
    fn default() -> Self {
        Self {
            client_key: None,
            client_secret: None,
            redirect_uri: None,
            fallback_access_token: None,
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            api_base: Url::parse(DEFAULT_API_BASE).expect("Invalid TikTok API base URL"),
            authorize_url: AuthUrl::new(DEFAULT_AUTHORIZE_URL.to_string())
                .expect("Invalid authorization endpoint URL"),
            http_timeout: Duration::from_secs(60),
            state_ttl: Duration::from_secs(600),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl TikTokConfig {
    /// Builds a configuration from `TIKTOK_*` environment variables.
    ///
    /// Empty variables are treated as unset. Only malformed URLs are an error here.
    pub fn from_env() -> Result<Self, TikTokError> {
        let mut config = Self {
            client_key: non_empty_var("TIKTOK_CLIENT_KEY").map(ClientId::new),
            client_secret: non_empty_var("TIKTOK_CLIENT_SECRET").map(ClientSecret::new),
            fallback_access_token: non_empty_var("TIKTOK_ACCESS_TOKEN").map(AccessToken::new),
            ..Self::default()
        };
        if let Some(uri) = non_empty_var("TIKTOK_REDIRECT_URI") {
            config.redirect_uri =
                Some(RedirectUrl::new(uri).context("parse TIKTOK_REDIRECT_URI")?);
        }
        if let Some(base) = non_empty_var("TIKTOK_API_BASE") {
            config.api_base = Url::parse(&base).context("parse TIKTOK_API_BASE")?;
        }
        Ok(config)
    }

    /// Resolves a path such as `/v2/oauth/token/` against the configured API host.
    pub fn endpoint(&self, path: &str) -> Result<Url, TikTokError> {
        Ok(self
            .api_base
            .join(path)
            .with_context(|| format!("construct TikTok endpoint URL for {path}"))?)
    }

    /// Builds the HTTP client shared by every TikTok request.
    pub fn http_client(&self) -> Result<reqwest::Client, TikTokError> {
        Ok(reqwest::ClientBuilder::new()
            // SSRF no thank you.
            .redirect(reqwest::redirect::Policy::none())
            .timeout(self.http_timeout)
            .build()
            .context("build HTTP client")?)
    }
}
