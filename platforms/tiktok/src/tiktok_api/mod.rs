//! TikTok Content Posting API: wire types, the authenticated client, and chunked uploads.

pub mod client;
pub mod types;
pub mod upload;

pub use client::TikTokClient;
pub use types::{PostInfo, PrivacyLevel, StatusData};
pub use upload::{CHUNK_SIZE, ChunkPlan, ChunkRange, UploadJob, video_mime_type};
