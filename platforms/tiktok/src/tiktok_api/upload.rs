//! Chunked transfer of a video file to TikTok's pre-signed upload URL.
//!
//! The file is cut into fixed-size, contiguous, inclusive byte ranges. Chunks go out strictly in
//! order with one in flight at a time, so memory use is bounded by a single chunk buffer. The
//! first rejected chunk aborts the transfer; nothing is resumed.

use crate::error::TikTokError;
use crate::tiktok_api::client::TikTokClient;
use eyre::Context;
use std::num::NonZeroU64;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::instrument;

/// Size of every chunk except possibly the last.
pub const CHUNK_SIZE: NonZeroU64 = NonZeroU64::new(10 * 1024 * 1024).unwrap();

/// Statuses TikTok's upload endpoint uses to accept a chunk.
const ACCEPTED_STATUSES: [u16; 3] = [200, 201, 206];

/// A publish job between init and status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    pub publish_id: String,
    pub upload_url: String,
    pub total_size: u64,
    pub chunk_size: u64,
}

/// One contiguous slice of the file, with an inclusive end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: u64,
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value of the `Content-Range` header for this chunk.
    pub fn content_range(&self, total_size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total_size)
    }
}

/// How a file of a given size is split into chunks.
///
/// The chunk count is the ceiling of `total_size / chunk_size`, so an empty file has no chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total_size: u64,
    chunk_size: NonZeroU64,
}

impl ChunkPlan {
    pub fn new(total_size: u64, chunk_size: NonZeroU64) -> Self {
        Self {
            total_size,
            chunk_size,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size.get()
    }

    pub fn total_chunk_count(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size.get())
    }

    /// The byte ranges in upload order. The last one holds whatever remains; there is no padding.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkRange> + use<> {
        let total_size = self.total_size;
        let chunk_size = self.chunk_size.get();
        (0..self.total_chunk_count()).map(move |index| {
            let start = index * chunk_size;
            let len = chunk_size.min(total_size - start);
            ChunkRange {
                index,
                start,
                end: start + len - 1,
            }
        })
    }
}

/// `Content-Type` for the chunks of a video, by file extension.
pub fn video_mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        _ => "video/mp4",
    }
}

impl TikTokClient {
    /// Streams `file_path` to `upload_url` chunk by chunk according to `plan`.
    ///
    /// Each chunk must be answered with 200, 201, or 206. Any other status fails with
    /// `upload_failed` and no further chunks are sent.
    #[instrument(skip(self, upload_url), fields(total_size = plan.total_size()))]
    pub async fn upload_video_chunks(
        &self,
        upload_url: &str,
        file_path: &Path,
        plan: &ChunkPlan,
    ) -> Result<(), TikTokError> {
        let content_type = video_mime_type(file_path);
        let mut file = tokio::fs::File::open(file_path)
            .await
            .with_context(|| format!("open video file {}", file_path.display()))?;

        for chunk in plan.chunks() {
            let len = usize::try_from(chunk.len()).context("chunk does not fit in memory")?;
            let mut buffer = vec![0; len];
            file.read_exact(&mut buffer)
                .await
                .with_context(|| format!("read chunk {} of {}", chunk.index, file_path.display()))?;

            let content_range = chunk.content_range(plan.total_size());
            let response = self
                .http_client()
                .put(upload_url)
                .header("Content-Type", content_type)
                .header("Content-Length", chunk.len().to_string())
                .header("Content-Range", &content_range)
                .body(buffer)
                .send()
                .await
                .with_context(|| format!("send chunk {} to TikTok", chunk.index))?;

            let status = response.status();
            if !ACCEPTED_STATUSES.contains(&status.as_u16()) {
                tracing::debug!(chunk_index = chunk.index, %status, "chunk rejected");
                return Err(TikTokError::api(
                    "upload_failed",
                    format!(
                        "Chunk {} upload failed with status {}",
                        chunk.index,
                        status.as_u16()
                    ),
                ));
            }

            tracing::debug!(
                chunk_index = chunk.index,
                range = content_range,
                %status,
                "chunk uploaded"
            );
        }

        Ok(())
    }
}
