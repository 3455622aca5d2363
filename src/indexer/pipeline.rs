//! Converts crawled messages into store writes and advances the checkpoint.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use futures::stream::{self, StreamExt, TryStreamExt};
use rand::Rng;
use tracing::{debug, instrument, warn};

use super::checkpoint::{self, CheckpointOutcome};
use crate::config::IndexingConfig;
use crate::convert::{self, MessageLocation};
use crate::error::Result;
use crate::mirror::{self, MediaJob, MediaMirror};
use crate::model::{BotServerSettings, MessageRecord, MirroredMedia, Snowflake};
use crate::remote::{RemoteMessage, RemoteUser};
use crate::store::ContentStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub received: usize,
    pub system_skipped: usize,
    pub conversion_failed: usize,
    pub written: usize,
    pub created: usize,
    pub accounts: usize,
    pub bots: usize,
    pub media_mirrored: usize,
    pub media_failed: usize,
    pub checkpoint: Option<CheckpointOutcome>,
}

#[derive(Debug, Clone)]
struct WritePolicy {
    chunk_size: usize,
    concurrency: usize,
    jitter_min: Duration,
    jitter_max: Duration,
    media_concurrency: usize,
}

impl WritePolicy {
    fn jitter(&self) -> Duration {
        if self.jitter_max <= self.jitter_min {
            return self.jitter_min;
        }
        let min = self.jitter_min.as_millis() as u64;
        let max = self.jitter_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

pub struct MessageIngestionPipeline {
    store: Arc<dyn ContentStore>,
    mirror: Option<Arc<dyn MediaMirror>>,
    policy: WritePolicy,
}

impl MessageIngestionPipeline {
    pub fn new(
        store: Arc<dyn ContentStore>,
        mirror: Option<Arc<dyn MediaMirror>>,
        config: &IndexingConfig,
    ) -> Self {
        Self {
            store,
            mirror,
            policy: WritePolicy {
                chunk_size: config.write_chunk_size.max(1),
                concurrency: config.write_concurrency.max(1),
                jitter_min: config.write_jitter_min,
                jitter_max: config.write_jitter_max,
                media_concurrency: config.media_concurrency.max(1),
            },
        }
    }

    /// Writes a crawled batch. Errors from the store abort the batch before
    /// the checkpoint moves, so the same range is crawled again next cycle.
    #[instrument(skip(self, messages), fields(count = messages.len()))]
    pub async fn ingest(
        &self,
        messages: &[RemoteMessage],
        location: MessageLocation,
        current_checkpoint: Option<Snowflake>,
    ) -> Result<IngestStats> {
        let mut stats = IngestStats {
            received: messages.len(),
            ..Default::default()
        };

        let (system, content): (Vec<&RemoteMessage>, Vec<&RemoteMessage>) =
            messages.iter().partition(|m| m.is_system());
        stats.system_skipped = system.len();

        stats.accounts = self.upsert_authors(&content).await?;
        stats.bots = self.upsert_bot_settings(&content, location.server_id).await?;

        let mut records: Vec<MessageRecord> = Vec::with_capacity(content.len());
        let mut oldest_failed: Option<Snowflake> = None;
        for msg in &content {
            match convert::message_record(msg, &location) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("Ingest: dropping message from batch: {}", e);
                    stats.conversion_failed += 1;
                    oldest_failed = Some(oldest_failed.map_or(msg.id, |id| id.min(msg.id)));
                }
            }
        }

        let created = self.write_records(&records).await?;
        stats.written = records.len();
        stats.created = created.len();

        if !created.is_empty() {
            let (mirrored, failed) = self.mirror_media(&records, &created).await;
            stats.media_mirrored = mirrored;
            stats.media_failed = failed;
        }

        // A message that failed conversion is not handled, so when it is the
        // newest content message the checkpoint stays below it and the next
        // crawl retries it. System messages only move the checkpoint up to the
        // first failure.
        let newest_handled = records
            .iter()
            .map(|r| r.id)
            .chain(
                system
                    .iter()
                    .map(|m| m.id)
                    .filter(|id| oldest_failed.map_or(true, |failed| *id < failed)),
            )
            .max();

        if let Some(newest) = newest_handled {
            if current_checkpoint.map_or(true, |current| newest > current) {
                let outcome = checkpoint::advance(
                    self.store.as_ref(),
                    location.server_id,
                    location.channel_id,
                    newest,
                    current_checkpoint,
                )
                .await?;
                stats.checkpoint = Some(outcome);
            }
        }

        debug!(
            "Ingest: channel {} wrote {} messages ({} new, {} system, {} failed)",
            location.channel_id,
            stats.written,
            stats.created,
            stats.system_skipped,
            stats.conversion_failed
        );
        Ok(stats)
    }

    async fn upsert_authors(&self, messages: &[&RemoteMessage]) -> Result<usize> {
        let mut authors: HashMap<Snowflake, &RemoteUser> = HashMap::new();
        for author in messages.iter().filter_map(|m| m.author.as_ref()) {
            authors.entry(author.id).or_insert(author);
        }
        let accounts: Vec<_> = authors.values().map(|a| convert::account_record(a)).collect();
        let count = accounts.len();

        let store = &self.store;
        stream::iter(accounts)
            .map(|account| async move { store.upsert_account(&account).await })
            .buffer_unordered(self.policy.concurrency)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(count)
    }

    async fn upsert_bot_settings(
        &self,
        messages: &[&RemoteMessage],
        server_id: Snowflake,
    ) -> Result<usize> {
        let bots: HashSet<Snowflake> = messages
            .iter()
            .filter_map(|m| m.author.as_ref())
            .filter(|a| a.bot)
            .map(|a| a.id)
            .collect();

        for bot_id in &bots {
            self.store
                .upsert_bot_server_settings(&BotServerSettings::new(*bot_id, server_id))
                .await?;
        }
        Ok(bots.len())
    }

    /// Chunked batch writes, `concurrency` chunks at a time, with a random
    /// pause between waves. Returns the ids that were newly created.
    async fn write_records(&self, records: &[MessageRecord]) -> Result<Vec<Snowflake>> {
        let chunks: Vec<&[MessageRecord]> = records.chunks(self.policy.chunk_size).collect();
        let mut created = Vec::new();

        let mut waves = chunks.chunks(self.policy.concurrency).peekable();
        while let Some(wave) = waves.next() {
            let results =
                try_join_all(wave.iter().map(|chunk| self.store.upsert_messages_batch(chunk)))
                    .await?;
            created.extend(results.into_iter().flatten());

            if waves.peek().is_some() {
                let pause = self.policy.jitter();
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            }
        }
        Ok(created)
    }

    async fn mirror_media(&self, records: &[MessageRecord], created: &[Snowflake]) -> (usize, usize) {
        let Some(mirror) = &self.mirror else {
            return (0, 0);
        };

        let created: HashSet<Snowflake> = created.iter().copied().collect();
        let jobs: Vec<MediaJob> = records
            .iter()
            .filter(|r| created.contains(&r.id))
            .flat_map(MediaJob::collect)
            .collect();
        if jobs.is_empty() {
            return (0, 0);
        }

        let mut mirrored = 0usize;
        let mut failed = 0usize;
        for (job, result) in
            mirror::mirror_all(mirror.as_ref(), jobs, self.policy.media_concurrency).await
        {
            let storage_id = match result {
                Ok(storage_id) => storage_id,
                Err(e) => {
                    warn!("Ingest: failed to mirror {} for message {}: {}", job.url, job.message_id, e);
                    failed += 1;
                    continue;
                }
            };

            let media = MirroredMedia {
                message_id: job.message_id,
                source: job.source,
                storage_id,
            };
            match self.store.record_mirrored_media(&media).await {
                Ok(()) => mirrored += 1,
                Err(e) => {
                    warn!("Ingest: failed to record mirrored media for message {}: {}", media.message_id, e);
                    failed += 1;
                }
            }
        }
        (mirrored, failed)
    }
}
