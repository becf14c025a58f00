//! Authenticated access to the TikTok Content Posting API.

use crate::config::TikTokConfig;
use crate::error::TikTokError;
use crate::tiktok_api::types::{
    ApiResponse, InitData, InitRequest, PostInfo, SourceInfo, StatusData, StatusRequest,
    VideoSource,
};
use crate::tiktok_api::upload::{ChunkPlan, UploadJob};
use eyre::Context;
use oauth2::url::Url;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::instrument;

const INIT_PATH: &str = "/v2/post/publish/video/init/";
const STATUS_PATH: &str = "/v2/post/publish/status/fetch/";

/// Client for the publish endpoints of the TikTok API.
///
/// The client holds no credentials; every call takes the access token to use, so one client can
/// serve many subjects concurrently.
#[derive(Debug, Clone)]
pub struct TikTokClient {
    api_base: Url,
    client: reqwest::Client,
}

impl TikTokClient {
    pub fn new(config: &TikTokConfig, client: reqwest::Client) -> Self {
        Self {
            api_base: config.api_base.clone(),
            client,
        }
    }

    /// The HTTP client, for requests that do not go to the JSON API (chunk uploads).
    pub(crate) fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    /// POSTs a JSON body with the bearer token and decodes the enveloped `data`.
    ///
    /// TikTok reports failures through the envelope's `error.code`, not (only) through the HTTP
    /// status, so the body is inspected regardless of status.
    #[instrument(skip(self, access_token, json_body), level = "trace")]
    async fn make_authenticated_request<T: DeserializeOwned>(
        &self,
        path: &str,
        access_token: &str,
        json_body: &impl Serialize,
    ) -> Result<T, TikTokError> {
        let url = self
            .api_base
            .join(path)
            .with_context(|| format!("construct TikTok endpoint URL for {path}"))?;

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Content-Type", "application/json; charset=UTF-8")
            .body(serde_json::to_vec(json_body).context("serialize request body")?)
            .send()
            .await
            .with_context(|| format!("send request to TikTok API: {path}"))?;

        let status_code = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("read TikTok API response from {path}"))?;

        match serde_json::from_str::<ApiResponse>(&text) {
            Ok(envelope) => envelope.into_data(),
            Err(_) if !status_code.is_success() => Err(TikTokError::api(
                "unknown",
                format!("{path} failed with status {status_code}: {text}"),
            )),
            Err(e) => Err(eyre::Report::new(e)
                .wrap_err(format!("parse TikTok API response from {path} as JSON"))
                .into()),
        }
    }

    /// Announces an upload and obtains the `publish_id` and the pre-signed upload URL.
    ///
    /// The chunk layout sent to TikTok is taken from `plan`, which must be the same plan later
    /// used to upload the bytes.
    ///
    /// # API Reference
    ///
    /// <https://developers.tiktok.com/doc/content-posting-api-reference-direct-post>
    #[instrument(skip(self, access_token, post_info), fields(video_size = plan.total_size()))]
    pub async fn init_video_upload(
        &self,
        access_token: &str,
        post_info: &PostInfo,
        plan: &ChunkPlan,
    ) -> Result<UploadJob, TikTokError> {
        let request = InitRequest {
            post_info,
            source_info: SourceInfo {
                source: VideoSource::FileUpload,
                video_size: plan.total_size(),
                chunk_size: plan.chunk_size(),
                total_chunk_count: plan.total_chunk_count(),
            },
        };

        let data: InitData = self
            .make_authenticated_request(INIT_PATH, access_token, &request)
            .await?;

        tracing::debug!(publish_id = data.publish_id, "initialized video upload");

        Ok(UploadJob {
            publish_id: data.publish_id,
            upload_url: data.upload_url,
            total_size: plan.total_size(),
            chunk_size: plan.chunk_size(),
        })
    }

    /// Fetches the current status of a publish job, once.
    ///
    /// # API Reference
    ///
    /// <https://developers.tiktok.com/doc/content-posting-api-reference-get-video-status>
    #[instrument(skip(self, access_token))]
    pub async fn fetch_publish_status(
        &self,
        access_token: &str,
        publish_id: &str,
    ) -> Result<StatusData, TikTokError> {
        let data: StatusData = self
            .make_authenticated_request(STATUS_PATH, access_token, &StatusRequest { publish_id })
            .await?;

        tracing::debug!(publish_id, status = ?data.status, "fetched publish status");
        Ok(data)
    }
}
