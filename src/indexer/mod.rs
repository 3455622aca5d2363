//! Periodic incremental crawl of every guild the bot is in.

pub mod checkpoint;
pub mod crawler;
pub mod guild;
pub mod invite;
pub mod pipeline;
pub mod scheduler;
pub mod threads;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

pub use guild::{GuildIndexer, GuildStats};
pub use scheduler::{IndexingRun, IndexingScheduler, RunOutcome};

use crate::config::IndexingConfig;
use crate::error::Result;
use crate::mirror::MediaMirror;
use crate::remote::RemoteContentClient;
use crate::store::ContentStore;

/// Totals for one full run, logged when the run ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub guilds_indexed: usize,
    pub guilds_failed: usize,
    pub channels_indexed: usize,
    pub channels_failed: usize,
    pub channels_skipped: usize,
    pub threads_indexed: usize,
    pub threads_failed: usize,
    pub messages_written: usize,
    pub messages_created: usize,
    pub media_mirrored: usize,
    pub media_failed: usize,
}

impl RunStats {
    fn absorb(&mut self, guild: &GuildStats) {
        self.guilds_indexed += 1;
        self.channels_indexed += guild.channels_indexed;
        self.channels_failed += guild.channels_failed;
        self.channels_skipped += guild.channels_unreadable + guild.channels_fresh;
        self.threads_indexed += guild.threads_indexed;
        self.threads_failed += guild.threads_failed;
        self.messages_written += guild.messages_written;
        self.messages_created += guild.messages_created;
        self.media_mirrored += guild.media_mirrored;
        self.media_failed += guild.media_failed;
    }
}

pub struct Indexer {
    remote: Arc<dyn RemoteContentClient>,
    guilds: GuildIndexer,
}

impl Indexer {
    pub fn new(
        remote: Arc<dyn RemoteContentClient>,
        store: Arc<dyn ContentStore>,
        mirror: Option<Arc<dyn MediaMirror>>,
        config: IndexingConfig,
    ) -> Self {
        Self {
            guilds: GuildIndexer::new(remote.clone(), store, mirror, config),
            remote,
        }
    }

    /// Guilds are crawled one after another. A guild that fails is logged
    /// and the run moves on; only failing to list guilds fails the run.
    #[instrument(skip(self))]
    pub async fn index_all_guilds(&self) -> Result<RunStats> {
        let started = Instant::now();
        let guilds = self.remote.list_guilds().await?;
        info!("Indexer: starting run over {} guilds", guilds.len());

        let mut stats = RunStats::default();
        for guild in &guilds {
            match self.guilds.index_guild(guild.id).await {
                Ok(guild_stats) => stats.absorb(&guild_stats),
                Err(e) => {
                    warn!("Indexer: failed to index guild {} ({}): {}", guild.name, guild.id, e);
                    stats.guilds_failed += 1;
                }
            }
        }

        info!(
            "Indexer: {} guilds crawled in {:?}",
            stats.guilds_indexed,
            started.elapsed()
        );
        Ok(stats)
    }
}

#[async_trait]
impl IndexingRun for Indexer {
    async fn run(&self) -> anyhow::Result<RunStats> {
        Ok(self.index_all_guilds().await?)
    }
}
