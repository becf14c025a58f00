//! Request and response bodies of the TikTok Content Posting API.

use crate::error::TikTokError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Title used when the caller does not provide one.
pub const DEFAULT_TITLE: &str = "Video uploaded via Autoposter";

/// The `error.code` value TikTok uses to say "no error".
pub const OK_SENTINEL: &str = "ok";

/// Every Content Posting API response is wrapped in this envelope.
///
/// `data` is kept as raw JSON until the success sentinel has been checked, because error
/// responses carry an empty or partial `data` object that would not decode as the success type.
///
/// See: <https://developers.tiktok.com/doc/tiktok-api-v2-error-handling>
#[derive(Debug, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: ApiErrorBody,
}

/// The `error` object present on every response, successful or not.
#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorBody {
    /// `"ok"` on success, otherwise a machine-readable error code.
    pub code: Option<String>,
    pub message: Option<String>,
    /// Identifier TikTok support can use to trace the request.
    pub log_id: Option<String>,
}

impl ApiResponse {
    /// Checks the success sentinel and decodes `data` into `T`.
    ///
    /// A non-`"ok"` code becomes [`TikTokError::Api`] with TikTok's code and message verbatim.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T, TikTokError> {
        if self.error.code.as_deref() != Some(OK_SENTINEL) {
            tracing::debug!(
                code = ?self.error.code,
                log_id = ?self.error.log_id,
                "TikTok API returned an error"
            );
            return Err(TikTokError::api(
                self.error.code.unwrap_or_else(|| "unknown".to_string()),
                self.error
                    .message
                    .unwrap_or_else(|| "Unknown error occurred".to_string()),
            ));
        }

        let data = self.data.ok_or_else(|| {
            TikTokError::api("unknown", "successful response did not include data")
        })?;
        serde_json::from_value(data).map_err(|e| {
            TikTokError::api("unknown", format!("unexpected response data: {e}"))
        })
    }
}

/// Who can see the post once it is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrivacyLevel {
    PublicToEveryone,
    MutualFollowFriends,
    FollowerOfCreator,
    /// Only the creator. The creator can widen it later from the TikTok app.
    #[default]
    SelfOnly,
}

/// Post metadata sent with the init request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostInfo {
    pub title: String,
    pub privacy_level: PrivacyLevel,
    pub disable_duet: bool,
    pub disable_comment: bool,
    pub disable_stitch: bool,
}

impl Default for PostInfo {
    fn default() -> Self {
        Self {
            title: DEFAULT_TITLE.to_string(),
            privacy_level: PrivacyLevel::SelfOnly,
            disable_duet: false,
            disable_comment: false,
            disable_stitch: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VideoSource {
    FileUpload,
}

/// How the video bytes will reach TikTok.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceInfo {
    pub source: VideoSource,
    pub video_size: u64,
    pub chunk_size: u64,
    pub total_chunk_count: u64,
}

/// Body of `POST /v2/post/publish/video/init/`.
#[derive(Debug, Clone, Serialize)]
pub struct InitRequest<'a> {
    pub post_info: &'a PostInfo,
    pub source_info: SourceInfo,
}

/// `data` of a successful init response.
#[derive(Debug, Clone, Deserialize)]
pub struct InitData {
    pub publish_id: String,
    pub upload_url: String,
}

/// Body of `POST /v2/post/publish/status/fetch/`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusRequest<'a> {
    pub publish_id: &'a str,
}

/// `data` of a successful status response.
///
/// See: <https://developers.tiktok.com/doc/content-posting-api-reference-get-video-status>
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusData {
    /// e.g. `PROCESSING_UPLOAD`, `PROCESSING_DOWNLOAD`, `SEND_TO_USER_INBOX`,
    /// `PUBLISH_COMPLETE`, `FAILED`.
    pub status: Option<String>,
    pub fail_reason: Option<String>,
    pub uploaded_bytes: Option<u64>,
    /// TikTok's spelling. Sent as `null` or left out until the post is public.
    #[serde(rename = "publicaly_available_post_id", default)]
    pub publicly_available_post_id: Option<Vec<u64>>,
}
