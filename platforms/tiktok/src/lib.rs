//! Publishes videos to TikTok on behalf of linked accounts.
//!
//! The pieces, bottom up:
//!
//! - [`oauth::OAuthManager`] links a TikTok account (authorization URL, code exchange, refresh),
//!   with [`oauth::OAuthStateStore`] guarding the redirect against CSRF and
//!   [`callback::CallbackServer`] receiving it on a loopback port.
//! - [`credentials`] stores one credential per subject and keeps it fresh.
//! - [`tiktok_api::TikTokClient`] speaks the Content Posting API, including the chunked upload.
//! - [`publisher::Publisher`] runs one file through init, upload, and status.
//! - [`publish_for_subject`] ties these together and records every attempt in a
//!   [`publish_log::PublishLog`].

pub mod callback;
pub mod config;
pub mod credentials;
pub mod error;
pub mod oauth;
pub mod publish_log;
pub mod publisher;
pub mod tiktok_api;

pub use config::TikTokConfig;
pub use credentials::{Credential, CredentialStore, SubjectId};
pub use error::TikTokError;
pub use oauth::{OAuthManager, OAuthStateStore};
pub use publish_log::{PostStatus, PublishLog, PublishRecord};
pub use publisher::{PublishOutcome, Publisher};

use std::path::Path;
use tracing::instrument;

/// Publishes `file_path` and records the attempt, successful or not, in `log`.
///
/// A failure to write the record is logged and otherwise ignored so that it never masks the
/// publish result.
#[instrument(skip(publisher, log, access_token))]
pub async fn publish_and_record<L: PublishLog>(
    publisher: &Publisher,
    log: &L,
    subject: Option<SubjectId>,
    file_path: &Path,
    access_token: Option<&str>,
) -> Result<PublishOutcome, TikTokError> {
    let filename = file_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_path.display().to_string());

    let result = publisher.publish_video(file_path, access_token).await;
    let record = match &result {
        Ok(outcome) => PublishRecord::new(
            filename,
            PostStatus::Posted,
            serde_json::to_string(outcome).unwrap_or_default(),
            subject,
        ),
        Err(e) => PublishRecord::new(filename, PostStatus::Failed, e.to_string(), subject),
    };

    if let Err(e) = log.record(record).await {
        tracing::error!(error = %e, "failed to record publish attempt");
    }
    result
}

/// Publishes on behalf of a subject using their stored TikTok credential.
///
/// The credential is refreshed first if it is about to expire. A subject without a usable
/// credential fails with [`TikTokError::MissingCredential`] and nothing is recorded, since no
/// upload was attempted.
#[instrument(skip(publisher, oauth, store, log))]
pub async fn publish_for_subject<S: CredentialStore, L: PublishLog>(
    publisher: &Publisher,
    oauth: &OAuthManager,
    store: &S,
    log: &L,
    subject: SubjectId,
    file_path: &Path,
) -> Result<PublishOutcome, TikTokError> {
    let credential = credentials::load_fresh_credential(store, oauth, subject).await?;
    publish_and_record(
        publisher,
        log,
        Some(subject),
        file_path,
        Some(credential.access_token.secret()),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::publish_log::MemoryPublishLog;
    use jiff::{SignedDuration, Timestamp};
    use oauth2::url::Url;
    use oauth2::{AccessToken, ClientId, ClientSecret, RefreshToken};
    use std::io::Write;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> TikTokConfig {
        TikTokConfig {
            client_key: Some(ClientId::new("test_key".into())),
            client_secret: Some(ClientSecret::new("test_secret".into())),
            api_base: Url::parse(&server.uri()).unwrap(),
            ..TikTokConfig::default()
        }
    }

    fn video_file(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".mp4").tempfile().unwrap();
        file.write_all(&vec![1u8; len]).unwrap();
        file.flush().unwrap();
        file
    }

    async fn mount_happy_publish(server: &MockServer, token: &str) {
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/video/init/"))
            .and(header("authorization", format!("Bearer {token}").as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "publish_id": "pub-1",
                    "upload_url": format!("{}/upload", server.uri()),
                },
                "error": { "code": "ok", "message": "" },
            })))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(201))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/status/fetch/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "status": "PROCESSING_UPLOAD" },
                "error": { "code": "ok", "message": "" },
            })))
            .mount(server)
            .await;
    }

    fn credential(subject: i64, token: &str, expires_at: Option<Timestamp>) -> Credential {
        Credential {
            subject: SubjectId(subject),
            access_token: AccessToken::new(token.into()),
            refresh_token: Some(RefreshToken::new("refresh-1".into())),
            expires_at,
        }
    }

    #[tokio::test]
    async fn success_is_recorded_as_posted() {
        let server = MockServer::start().await;
        mount_happy_publish(&server, "stored-token").await;
        let config = config_for(&server);
        let publisher = Publisher::new(&config, reqwest::Client::new());
        let oauth = OAuthManager::new(config, reqwest::Client::new());
        let store = MemoryCredentialStore::new();
        store
            .save(credential(5, "stored-token", None))
            .await
            .unwrap();
        let log = MemoryPublishLog::new();
        let file = video_file(100);

        let outcome =
            publish_for_subject(&publisher, &oauth, &store, &log, SubjectId(5), file.path())
                .await
                .unwrap();
        assert_eq!(outcome.publish_id, "pub-1");

        let records = log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, PostStatus::Posted);
        assert_eq!(records[0].platform, "tiktok");
        assert_eq!(records[0].subject, Some(SubjectId(5)));
        let logged: PublishOutcome = serde_json::from_str(&records[0].response).unwrap();
        assert_eq!(logged, outcome);
    }

    #[tokio::test]
    async fn failure_is_recorded_with_error_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/video/init/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": { "code": "access_token_invalid", "message": "bad token" },
            })))
            .mount(&server)
            .await;
        let config = config_for(&server);
        let publisher = Publisher::new(&config, reqwest::Client::new());
        let oauth = OAuthManager::new(config, reqwest::Client::new());
        let store = MemoryCredentialStore::new();
        store.save(credential(5, "stale", None)).await.unwrap();
        let log = MemoryPublishLog::new();
        let file = video_file(100);

        let err = publish_for_subject(&publisher, &oauth, &store, &log, SubjectId(5), file.path())
            .await
            .unwrap_err();
        assert_eq!(err.api_code(), Some("access_token_invalid"));

        let records = log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, PostStatus::Failed);
        assert_eq!(records[0].response, "TikTok API error [access_token_invalid]: bad token");
    }

    #[tokio::test]
    async fn unlinked_subject_fails_without_record() {
        let server = MockServer::start().await;
        let config = config_for(&server);
        let publisher = Publisher::new(&config, reqwest::Client::new());
        let oauth = OAuthManager::new(config, reqwest::Client::new());
        let store = MemoryCredentialStore::new();
        let log = MemoryPublishLog::new();
        let file = video_file(100);

        let err = publish_for_subject(&publisher, &oauth, &store, &log, SubjectId(9), file.path())
            .await
            .unwrap_err();
        assert!(matches!(err, TikTokError::MissingCredential));
        assert!(log.records().is_empty());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expiring_credential_is_refreshed_before_publishing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/oauth/token/"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh-token",
                "expires_in": 86400,
                "open_id": "open-1",
            })))
            .expect(1)
            .mount(&server)
            .await;
        mount_happy_publish(&server, "fresh-token").await;

        let config = config_for(&server);
        let publisher = Publisher::new(&config, reqwest::Client::new());
        let oauth = OAuthManager::new(config, reqwest::Client::new());
        let store = MemoryCredentialStore::new();
        let soon = Timestamp::now() + SignedDuration::from_secs(60);
        store
            .save(credential(5, "old-token", Some(soon)))
            .await
            .unwrap();
        let log = MemoryPublishLog::new();
        let file = video_file(100);

        publish_for_subject(&publisher, &oauth, &store, &log, SubjectId(5), file.path())
            .await
            .unwrap();

        let saved = store.load(SubjectId(5)).await.unwrap().unwrap();
        assert_eq!(saved.access_token.secret(), "fresh-token");
        // TikTok did not rotate it
        assert_eq!(saved.refresh_token.unwrap().secret(), "refresh-1");
    }

    #[tokio::test]
    async fn missing_file_is_recorded_as_failed() {
        let server = MockServer::start().await;
        let publisher = Publisher::new(&config_for(&server), reqwest::Client::new());
        let log = MemoryPublishLog::new();

        let err = publish_and_record(
            &publisher,
            &log,
            None,
            Path::new("/nonexistent/clip.mp4"),
            Some("tok"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TikTokError::FileNotFound(_)));

        let records = log.records();
        assert_eq!(records[0].filename, "clip.mp4");
        assert_eq!(records[0].status, PostStatus::Failed);
        assert_eq!(records[0].subject, None);
    }
}
