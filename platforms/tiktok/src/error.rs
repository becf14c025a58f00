//! Failure kinds surfaced by the OAuth and publishing operations.

use std::path::PathBuf;

/// Platform error codes that indicate a transient condition on TikTok's side.
const TRANSIENT_API_CODES: &[&str] = &["rate_limit_exceeded", "internal_error", "upload_failed"];

/// Errors returned by the TikTok integration.
///
/// Callers should branch on the variant rather than on the message: [`TikTokError::Config`]
/// is an operator problem, [`TikTokError::MissingCredential`] means the subject has to go
/// through the OAuth flow again, [`TikTokError::FileNotFound`] and [`TikTokError::EmptyFile`]
/// are input errors, and [`TikTokError::Api`] carries TikTok's own code and message verbatim.
#[derive(Debug, thiserror::Error)]
pub enum TikTokError {
    /// A required piece of OAuth configuration is absent.
    #[error("TikTok OAuth is not configured: {0} is not set")]
    Config(&'static str),

    /// No usable access token was supplied or configured.
    #[error(
        "no TikTok access token available: link a TikTok account or set TIKTOK_ACCESS_TOKEN"
    )]
    MissingCredential,

    #[error("video file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("video file is empty: {}", .0.display())]
    EmptyFile(PathBuf),

    /// A non-success answer from TikTok at any step.
    #[error("TikTok API error [{code}]: {message}")]
    Api { code: String, message: String },

    /// An OAuth callback presented a state value that was never issued, already used, or expired.
    #[error("invalid or expired OAuth state parameter")]
    InvalidState,

    /// I/O, transport, and decoding failures.
    #[error(transparent)]
    Other(#[from] eyre::Report),
}

impl TikTokError {
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the whole operation later could plausibly succeed.
    ///
    /// Partial progress is never resumed, so a retry always starts from scratch.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { code, .. } => TRANSIENT_API_CODES.contains(&code.as_str()),
            Self::Other(report) => report
                .chain()
                .any(|cause| cause.downcast_ref::<reqwest::Error>().is_some()),
            Self::Config(_)
            | Self::MissingCredential
            | Self::FileNotFound(_)
            | Self::EmptyFile(_)
            | Self::InvalidState => false,
        }
    }

    /// The platform error code, if this error came from TikTok.
    pub fn api_code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            _ => None,
        }
    }
}
