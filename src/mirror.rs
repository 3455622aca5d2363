//! Re-hosting of attachments and embed images in durable storage.

use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::debug;

use crate::config::Config;
use crate::error::{MirrorError, Result};
use crate::model::{MediaSource, MessageRecord, Snowflake};

#[async_trait]
pub trait MediaMirror: Send + Sync {
    /// Copies the file at `url` into storage and returns its storage id.
    async fn mirror_from_url(
        &self,
        id: &str,
        filename: &str,
        content_type: Option<&str>,
        url: &str,
    ) -> Result<String>;
}

/// One file to mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaJob {
    pub message_id: Snowflake,
    pub source: MediaSource,
    pub id: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub url: String,
}

impl MediaJob {
    /// Attachments plus every image referenced by an embed.
    pub fn collect(message: &MessageRecord) -> Vec<MediaJob> {
        let mut jobs: Vec<MediaJob> = message
            .attachments
            .iter()
            .map(|a| MediaJob {
                message_id: message.id,
                source: MediaSource::Attachment { attachment_id: a.id },
                id: a.id.to_string(),
                filename: a.filename.clone(),
                content_type: a.content_type.clone(),
                url: a.url.clone(),
            })
            .collect();

        for (index, url) in message
            .embeds
            .iter()
            .flat_map(|e| e.image_urls())
            .enumerate()
        {
            if jobs.iter().any(|j| j.url == url) {
                continue;
            }
            jobs.push(MediaJob {
                message_id: message.id,
                source: MediaSource::EmbedImage {
                    url: url.to_string(),
                },
                id: format!("{}-embed-{}", message.id, index),
                filename: filename_from_url(url),
                content_type: None,
                url: url.to_string(),
            });
        }
        jobs
    }
}

fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|segments| segments.last().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "image".to_string())
}

/// Mirrors every job with at most `concurrency` downloads in flight.
/// Results come back in completion order, one per job.
pub async fn mirror_all(
    mirror: &dyn MediaMirror,
    jobs: Vec<MediaJob>,
    concurrency: usize,
) -> Vec<(MediaJob, Result<String>)> {
    stream::iter(jobs)
        .map(|job| async move {
            let result = mirror
                .mirror_from_url(
                    &job.id,
                    &job.filename,
                    job.content_type.as_deref(),
                    &job.url,
                )
                .await;
            (job, result)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
}

/// Stores mirrored files on the local filesystem under `root/<id>/<filename>`.
pub struct FsMediaMirror {
    http: reqwest::Client,
    root: PathBuf,
    max_bytes: u64,
}

impl FsMediaMirror {
    pub fn new(http: reqwest::Client, root: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            http,
            root: root.into(),
            max_bytes,
        }
    }

    pub fn from_config(config: &Config, http: reqwest::Client) -> Self {
        Self::new(http, &config.media_dir, config.media_max_bytes)
    }

    fn storage_id(id: &str, filename: &str) -> String {
        let clean = |s: &str| -> String {
            s.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                        c
                    } else {
                        '_'
                    }
                })
                .collect::<String>()
                .trim_start_matches('.')
                .to_string()
        };
        let name = clean(filename);
        let name = if name.is_empty() { "file".to_string() } else { name };
        format!("{}/{}", clean(id), name)
    }

    async fn store_bytes(&self, storage_id: &str, bytes: &[u8]) -> Result<()> {
        let path = self.root.join(storage_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }
}

fn append_capped(buf: &mut Vec<u8>, chunk: &[u8], limit: u64) -> Result<()> {
    let size = (buf.len() + chunk.len()) as u64;
    if size > limit {
        return Err(MirrorError::MediaTooLarge { size, limit });
    }
    buf.extend_from_slice(chunk);
    Ok(())
}

#[async_trait]
impl MediaMirror for FsMediaMirror {
    async fn mirror_from_url(
        &self,
        id: &str,
        filename: &str,
        content_type: Option<&str>,
        url: &str,
    ) -> Result<String> {
        let mut response = self.http.get(url).send().await?.error_for_status()?;
        if let Some(size) = response.content_length() {
            if size > self.max_bytes {
                return Err(MirrorError::MediaTooLarge {
                    size,
                    limit: self.max_bytes,
                });
            }
        }

        // Content-Length may be absent, so the cap is enforced while reading.
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            append_capped(&mut bytes, &chunk, self.max_bytes)?;
        }

        let storage_id = Self::storage_id(id, filename);
        self.store_bytes(&storage_id, &bytes).await?;
        debug!(
            "Media mirror: stored {} ({} bytes, {}) as {}",
            url,
            bytes.len(),
            content_type.unwrap_or("unknown type"),
            storage_id
        );
        Ok(storage_id)
    }
}
