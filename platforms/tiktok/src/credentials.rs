//! Per-subject TikTok credentials and the rules for picking the token a publish uses.

use crate::error::TikTokError;
use crate::oauth::{OAuthManager, TokenBundle};
use eyre::Context;
use jiff::{SignedDuration, Timestamp};
use oauth2::{AccessToken, RefreshToken};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tokio::sync::Mutex;

/// Tokens are refreshed this long before TikTok would reject them.
const REFRESH_BUFFER: SignedDuration = SignedDuration::from_secs(300);

/// Identifies the account (user) of this system that owns a linked TikTok credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(pub i64);

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The current TikTok credential for one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub subject: SubjectId,
    pub access_token: AccessToken,
    pub refresh_token: Option<RefreshToken>,
    /// When the access token stops working, if TikTok told us.
    pub expires_at: Option<Timestamp>,
}

impl Credential {
    /// Builds the credential to store after a successful code exchange or refresh.
    pub fn from_token_bundle(subject: SubjectId, bundle: TokenBundle, now: Timestamp) -> Self {
        let expires_at = bundle
            .expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| now.checked_add(SignedDuration::from_secs(secs)).ok());
        Self {
            subject,
            access_token: bundle.access_token,
            refresh_token: bundle.refresh_token,
            expires_at,
        }
    }

    /// Whether the access token expires within the safety buffer of `now`.
    ///
    /// A credential without a known expiry is assumed to be valid.
    pub fn needs_refresh(&self, now: Timestamp) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at.duration_since(now) <= REFRESH_BUFFER)
    }
}

/// Durable storage for at most one credential per subject.
///
/// `save` replaces whatever was stored for the subject; it never merges. Implementations must
/// make the replacement atomic with respect to concurrent `load`/`exists` for the same subject.
pub trait CredentialStore: Send + Sync {
    fn save(&self, credential: Credential) -> impl Future<Output = Result<(), TikTokError>> + Send;

    fn load(
        &self,
        subject: SubjectId,
    ) -> impl Future<Output = Result<Option<Credential>, TikTokError>> + Send;

    fn exists(&self, subject: SubjectId) -> impl Future<Output = Result<bool, TikTokError>> + Send;
}

/// Process-local credential store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    credentials: RwLock<HashMap<SubjectId, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CredentialStore for MemoryCredentialStore {
    async fn save(&self, credential: Credential) -> Result<(), TikTokError> {
        // a single insert under the write lock, so readers never observe the subject as unlinked
        self.credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(credential.subject, credential);
        Ok(())
    }

    async fn load(&self, subject: SubjectId) -> Result<Option<Credential>, TikTokError> {
        Ok(self
            .credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&subject)
            .cloned())
    }

    async fn exists(&self, subject: SubjectId) -> Result<bool, TikTokError> {
        Ok(self
            .credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&subject))
    }
}

/// Credential store backed by a JSON array on disk.
///
/// Every operation holds one async lock for its whole read-modify-write, and writes go to a
/// temporary file that is renamed over the original.
#[derive(Debug)]
pub struct JsonFileCredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<Credential>, TikTokError> {
        if !tokio::fs::try_exists(&self.path)
            .await
            .with_context(|| format!("check for credential file {}", self.path.display()))?
        {
            return Ok(Vec::new());
        }
        let json = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("read credential file {}", self.path.display()))?;
        if json.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&json)
            .with_context(|| format!("parse credential file {}", self.path.display()))?)
    }

    async fn write_all(&self, credentials: &[Credential]) -> Result<(), TikTokError> {
        let json = serde_json::to_string_pretty(credentials).context("serialize credentials")?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, json)
            .await
            .context("write temporary credential file")?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replace credential file {}", self.path.display()))?;
        Ok(())
    }
}

impl CredentialStore for JsonFileCredentialStore {
    async fn save(&self, credential: Credential) -> Result<(), TikTokError> {
        let _guard = self.lock.lock().await;
        let mut all = self.read_all().await?;
        all.retain(|c| c.subject != credential.subject);
        all.push(credential);
        self.write_all(&all).await
    }

    async fn load(&self, subject: SubjectId) -> Result<Option<Credential>, TikTokError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .find(|c| c.subject == subject))
    }

    async fn exists(&self, subject: SubjectId) -> Result<bool, TikTokError> {
        Ok(self.load(subject).await?.is_some())
    }
}

/// Decides which access token a publish attempt uses.
///
/// An explicitly supplied token always wins; otherwise the process-wide fallback from the
/// configuration is used, if there is one.
#[derive(Debug, Clone, Default)]
pub struct CredentialProvider {
    fallback: Option<AccessToken>,
}

impl CredentialProvider {
    pub fn new(fallback: Option<AccessToken>) -> Self {
        Self { fallback }
    }

    /// Returns the token to publish with.
    ///
    /// The explicit token is returned as-is without any validation.
    pub fn resolve(&self, explicit: Option<&str>) -> Result<String, TikTokError> {
        if let Some(token) = explicit {
            return Ok(token.to_string());
        }
        self.fallback
            .as_ref()
            .map(|token| token.secret().clone())
            .ok_or(TikTokError::MissingCredential)
    }
}

/// Loads the subject's credential, refreshing and re-saving it first if it is about to expire.
///
/// Fails with [`TikTokError::MissingCredential`] when the subject never linked an account, or
/// when the stored token is stale and there is no refresh token to renew it with.
#[tracing::instrument(skip(store, oauth))]
pub async fn load_fresh_credential<S: CredentialStore>(
    store: &S,
    oauth: &OAuthManager,
    subject: SubjectId,
) -> Result<Credential, TikTokError> {
    let credential = store
        .load(subject)
        .await?
        .ok_or(TikTokError::MissingCredential)?;

    let now = Timestamp::now();
    if !credential.needs_refresh(now) {
        return Ok(credential);
    }

    let Some(refresh_token) = credential.refresh_token.as_ref() else {
        tracing::warn!(%subject, "access token expired and no refresh token available");
        return Err(TikTokError::MissingCredential);
    };

    tracing::debug!(%subject, "access token about to expire, refreshing");
    refresh_credential(store, oauth, credential.clone(), refresh_token.clone()).await
}

/// Exchanges the credential's refresh token for a new access token and stores the result.
///
/// If TikTok does not hand out a new refresh token, the previous one is kept.
pub async fn refresh_credential<S: CredentialStore>(
    store: &S,
    oauth: &OAuthManager,
    credential: Credential,
    refresh_token: RefreshToken,
) -> Result<Credential, TikTokError> {
    let bundle = oauth.refresh_token(&refresh_token).await?;
    let mut refreshed = Credential::from_token_bundle(credential.subject, bundle, Timestamp::now());
    if refreshed.refresh_token.is_none() {
        tracing::trace!("new token lacks refresh token, preserving original");
        refreshed.refresh_token = Some(refresh_token);
    }
    store.save(refreshed.clone()).await?;
    tracing::info!(subject = %refreshed.subject, "refreshed TikTok credential");
    Ok(refreshed)
}
