//! End-to-end publishing of one video file.

use crate::config::TikTokConfig;
use crate::credentials::CredentialProvider;
use crate::error::TikTokError;
use crate::tiktok_api::client::TikTokClient;
use crate::tiktok_api::types::{PostInfo, StatusData};
use crate::tiktok_api::upload::{CHUNK_SIZE, ChunkPlan};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::instrument;

/// Reported when the status check succeeds but carries no status.
const UNKNOWN_STATUS: &str = "UNKNOWN";

/// Result of a publish attempt that made it through every step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOutcome {
    pub success: bool,
    pub publish_id: String,
    /// Status reported by TikTok right after the upload, e.g. `PROCESSING_UPLOAD` or
    /// `PUBLISH_COMPLETE`. Processing continues asynchronously on TikTok's side.
    pub status: String,
}

/// Runs the credential → init → upload → status sequence against TikTok.
#[derive(Debug, Clone)]
pub struct Publisher {
    client: TikTokClient,
    credentials: CredentialProvider,
    post_info: PostInfo,
}

impl Publisher {
    pub fn new(config: &TikTokConfig, http: reqwest::Client) -> Self {
        Self {
            client: TikTokClient::new(config, http),
            credentials: CredentialProvider::new(config.fallback_access_token.clone()),
            post_info: PostInfo::default(),
        }
    }

    /// Overrides the title, privacy level, and interaction flags sent with every post.
    pub fn with_post_info(mut self, post_info: PostInfo) -> Self {
        self.post_info = post_info;
        self
    }

    pub fn client(&self) -> &TikTokClient {
        &self.client
    }

    /// Uploads `file_path` to TikTok and reports the resulting publish status.
    ///
    /// `access_token` takes precedence over the configured fallback token. The steps run strictly
    /// in sequence and none is retried:
    ///
    /// 1. resolve the access token ([`TikTokError::MissingCredential`] if there is none),
    /// 2. check the file exists ([`TikTokError::FileNotFound`]) and is non-empty
    ///    ([`TikTokError::EmptyFile`]),
    /// 3. initialize the publish job,
    /// 4. upload every chunk,
    /// 5. fetch the publish status once.
    ///
    /// The status is returned as-is even if TikTok is still processing; following up on it is
    /// the caller's business.
    #[instrument(skip(self, access_token))]
    pub async fn publish_video(
        &self,
        file_path: &Path,
        access_token: Option<&str>,
    ) -> Result<PublishOutcome, TikTokError> {
        let token = self.credentials.resolve(access_token)?;

        let metadata = match tokio::fs::metadata(file_path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(TikTokError::FileNotFound(file_path.to_path_buf())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TikTokError::FileNotFound(file_path.to_path_buf()));
            }
            Err(e) => {
                return Err(eyre::Report::new(e)
                    .wrap_err(format!("inspect video file {}", file_path.display()))
                    .into());
            }
        };
        if metadata.len() == 0 {
            return Err(TikTokError::EmptyFile(file_path.to_path_buf()));
        }

        let plan = ChunkPlan::new(metadata.len(), CHUNK_SIZE);
        let job = self
            .client
            .init_video_upload(&token, &self.post_info, &plan)
            .await?;

        self.client
            .upload_video_chunks(&job.upload_url, file_path, &plan)
            .await?;

        let status = self
            .client
            .fetch_publish_status(&token, &job.publish_id)
            .await?;

        let outcome = PublishOutcome {
            success: true,
            publish_id: job.publish_id,
            status: status.status.unwrap_or_else(|| UNKNOWN_STATUS.to_string()),
        };
        tracing::info!(
            publish_id = outcome.publish_id,
            status = outcome.status,
            "published video to TikTok"
        );
        Ok(outcome)
    }

    /// One status check for a publish job started earlier.
    pub async fn fetch_status(
        &self,
        publish_id: &str,
        access_token: Option<&str>,
    ) -> Result<StatusData, TikTokError> {
        let token = self.credentials.resolve(access_token)?;
        self.client.fetch_publish_status(&token, publish_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oauth2::AccessToken;
    use oauth2::url::Url;
    use std::io::Write;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn publisher_for(server: &MockServer, fallback: Option<&str>) -> Publisher {
        let config = TikTokConfig {
            api_base: Url::parse(&server.uri()).unwrap(),
            fallback_access_token: fallback.map(|t| AccessToken::new(t.to_string())),
            ..TikTokConfig::default()
        };
        Publisher::new(&config, reqwest::Client::new())
    }

    fn video_file(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".mp4").tempfile().unwrap();
        file.write_all(&vec![7u8; len]).unwrap();
        file.flush().unwrap();
        file
    }

    async fn mount_init(server: &MockServer, token: &str, total_chunk_count: u64) {
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/video/init/"))
            .and(header("authorization", format!("Bearer {token}").as_str()))
            .and(wiremock::matchers::body_partial_json(serde_json::json!({
                "source_info": { "total_chunk_count": total_chunk_count },
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "publish_id": "test_publish_id_12345",
                    "upload_url": format!("{}/upload/abc", server.uri()),
                },
                "error": { "code": "ok", "message": "" },
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    async fn mount_status(server: &MockServer, body: serde_json::Value) {
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/status/fetch/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn credential_error_takes_priority_over_missing_file() {
        let server = MockServer::start().await;
        let err = publisher_for(&server, None)
            .publish_video(Path::new("/nonexistent/path/video.mp4"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TikTokError::MissingCredential));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let server = MockServer::start().await;
        let err = publisher_for(&server, Some("env_token"))
            .publish_video(Path::new("/nonexistent/path/video.mp4"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TikTokError::FileNotFound(p) if p.ends_with("video.mp4")));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_file_is_rejected_before_init() {
        let server = MockServer::start().await;
        let file = video_file(0);
        let err = publisher_for(&server, Some("env_token"))
            .publish_video(file.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TikTokError::EmptyFile(_)));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn explicit_token_is_used_over_fallback() {
        let server = MockServer::start().await;
        mount_init(&server, "custom_token", 1).await;
        Mock::given(method("PUT"))
            .and(path("/upload/abc"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        mount_status(
            &server,
            serde_json::json!({
                "data": { "status": "PUBLISH_COMPLETE" },
                "error": { "code": "ok", "message": "" },
            }),
        )
        .await;

        let file = video_file(1000);
        let outcome = publisher_for(&server, Some("env_token"))
            .publish_video(file.path(), Some("custom_token"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            PublishOutcome {
                success: true,
                publish_id: "test_publish_id_12345".into(),
                status: "PUBLISH_COMPLETE".into(),
            }
        );
    }

    #[tokio::test]
    async fn twenty_five_mib_end_to_end() {
        let server = MockServer::start().await;
        mount_init(&server, "env_token", 3).await;
        for range in [
            "bytes 0-10485759/26214400",
            "bytes 10485760-20971519/26214400",
            "bytes 20971520-26214399/26214400",
        ] {
            Mock::given(method("PUT"))
                .and(path("/upload/abc"))
                .and(header("content-range", range))
                .respond_with(ResponseTemplate::new(206))
                .expect(1)
                .mount(&server)
                .await;
        }
        mount_status(
            &server,
            serde_json::json!({
                "data": { "status": "PROCESSING_UPLOAD" },
                "error": { "code": "ok", "message": "" },
            }),
        )
        .await;

        let file = video_file(25 * 1024 * 1024);
        let outcome = publisher_for(&server, Some("env_token"))
            .publish_video(file.path(), None)
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.publish_id, "test_publish_id_12345");
        assert_eq!(outcome.status, "PROCESSING_UPLOAD");

        let methods: Vec<_> = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.method.to_string(), r.url.path().to_string()))
            .collect();
        assert_eq!(
            methods,
            [
                ("POST".to_string(), "/v2/post/publish/video/init/".to_string()),
                ("PUT".to_string(), "/upload/abc".to_string()),
                ("PUT".to_string(), "/upload/abc".to_string()),
                ("PUT".to_string(), "/upload/abc".to_string()),
                (
                    "POST".to_string(),
                    "/v2/post/publish/status/fetch/".to_string()
                ),
            ]
        );
    }

    #[tokio::test]
    async fn absent_status_defaults_to_unknown() {
        let server = MockServer::start().await;
        mount_init(&server, "env_token", 1).await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        mount_status(
            &server,
            serde_json::json!({ "data": {}, "error": { "code": "ok" } }),
        )
        .await;

        let file = video_file(10);
        let outcome = publisher_for(&server, Some("env_token"))
            .publish_video(file.path(), None)
            .await
            .unwrap();
        assert_eq!(outcome.status, "UNKNOWN");
    }

    #[tokio::test]
    async fn upload_failure_skips_status_check() {
        let server = MockServer::start().await;
        mount_init(&server, "env_token", 1).await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/status/fetch/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let file = video_file(10);
        let err = publisher_for(&server, Some("env_token"))
            .publish_video(file.path(), None)
            .await
            .unwrap_err();
        assert_eq!(err.api_code(), Some("upload_failed"));
    }

    #[tokio::test]
    async fn init_failure_sends_no_chunks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/video/init/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": {
                    "code": "spam_risk_too_many_posts",
                    "message": "The daily post cap has been reached.",
                },
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let file = video_file(10);
        let err = publisher_for(&server, Some("env_token"))
            .publish_video(file.path(), None)
            .await
            .unwrap_err();
        match err {
            TikTokError::Api { code, message } => {
                assert_eq!(code, "spam_risk_too_many_posts");
                assert_eq!(message, "The daily post cap has been reached.");
            }
            other => panic!("expected API error, got {other:?}"),
        }
    }
}
