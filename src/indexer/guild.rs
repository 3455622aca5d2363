use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use super::checkpoint;
use super::crawler::ChannelCrawler;
use super::invite;
use super::pipeline::{IngestStats, MessageIngestionPipeline};
use super::threads::ThreadDiscoverer;
use crate::config::IndexingConfig;
use crate::convert::{self, MessageLocation};
use crate::error::Result;
use crate::mirror::MediaMirror;
use crate::model::{ChannelKind, ChannelSettings, ChannelSettingsPatch, Snowflake};
use crate::remote::{RemoteChannel, RemoteContentClient};
use crate::store::ContentStore;

/// Counters for one guild crawl.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuildStats {
    pub channels_enabled: usize,
    pub channels_indexed: usize,
    pub channels_unreadable: usize,
    pub channels_fresh: usize,
    pub channels_failed: usize,
    pub threads_indexed: usize,
    pub threads_failed: usize,
    pub messages_written: usize,
    pub messages_created: usize,
    pub conversion_failed: usize,
    pub media_mirrored: usize,
    pub media_failed: usize,
}

impl GuildStats {
    fn absorb(&mut self, ingest: &IngestStats) {
        self.messages_written += ingest.written;
        self.messages_created += ingest.created;
        self.conversion_failed += ingest.conversion_failed;
        self.media_mirrored += ingest.media_mirrored;
        self.media_failed += ingest.media_failed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelOutcome {
    Indexed,
    Unreadable,
    Fresh,
}

/// Crawls every indexing-enabled channel of one guild, one at a time.
pub struct GuildIndexer {
    remote: Arc<dyn RemoteContentClient>,
    store: Arc<dyn ContentStore>,
    crawler: ChannelCrawler,
    discoverer: ThreadDiscoverer,
    pipeline: MessageIngestionPipeline,
    config: IndexingConfig,
}

impl GuildIndexer {
    pub fn new(
        remote: Arc<dyn RemoteContentClient>,
        store: Arc<dyn ContentStore>,
        mirror: Option<Arc<dyn MediaMirror>>,
        config: IndexingConfig,
    ) -> Self {
        Self {
            crawler: ChannelCrawler::new(
                remote.clone(),
                config.page_size,
                config.max_messages_per_channel,
            ),
            discoverer: ThreadDiscoverer::new(remote.clone(), config.max_threads_per_forum),
            pipeline: MessageIngestionPipeline::new(store.clone(), mirror, &config),
            remote,
            store,
            config,
        }
    }

    /// Fails only when the guild itself cannot be read or stored. Channel
    /// failures are counted and the remaining channels still run.
    #[instrument(skip(self))]
    pub async fn index_guild(&self, guild_id: Snowflake) -> Result<GuildStats> {
        let started = Instant::now();
        let guild = self.remote.fetch_guild(guild_id).await?;
        self.store.upsert_server(&convert::server_record(&guild)).await?;

        let channels = self.remote.list_channels(guild_id).await?;
        let mut enabled: HashMap<Snowflake, ChannelSettings> = self
            .store
            .get_channel_settings_with_indexing_enabled(guild_id)
            .await?
            .into_iter()
            .map(|s| (s.channel_id, s))
            .collect();

        let mut targets: Vec<(RemoteChannel, ChannelSettings)> = channels
            .into_iter()
            .filter(|c| c.kind.is_indexable_root())
            .filter_map(|c| enabled.remove(&c.id).map(|s| (c, s)))
            .collect();
        targets.sort_by_key(|(c, _)| c.id);

        let mut stats = GuildStats {
            channels_enabled: targets.len(),
            ..Default::default()
        };
        info!(
            "Indexer: guild {} ({}) has {} channels to index",
            guild.name,
            guild_id,
            targets.len()
        );

        for (i, (channel, settings)) in targets.iter().enumerate() {
            if i > 0 {
                self.pause().await;
            }

            match self.index_channel(channel, settings, &mut stats).await {
                Ok(ChannelOutcome::Indexed) => stats.channels_indexed += 1,
                Ok(ChannelOutcome::Unreadable) => {
                    debug!("Indexer: no read access to #{} ({}), skipping", channel.name, channel.id);
                    stats.channels_unreadable += 1;
                }
                Ok(ChannelOutcome::Fresh) => {
                    debug!("Indexer: #{} ({}) indexed recently, skipping", channel.name, channel.id);
                    stats.channels_fresh += 1;
                }
                Err(e) => {
                    warn!("Indexer: failed to index #{} ({}): {}", channel.name, channel.id, e);
                    stats.channels_failed += 1;
                }
            }

            let done = i + 1;
            if done % self.config.progress_every.max(1) == 0 && done < targets.len() {
                info!(
                    "Indexer: guild {} progress {}/{} channels, {} messages written",
                    guild_id,
                    done,
                    targets.len(),
                    stats.messages_written
                );
            }
        }

        info!(
            "Indexer: guild {} done in {:?}: {} indexed, {} failed, {} skipped, {} threads, {} messages ({} new)",
            guild_id,
            started.elapsed(),
            stats.channels_indexed,
            stats.channels_failed,
            stats.channels_unreadable + stats.channels_fresh,
            stats.threads_indexed,
            stats.messages_written,
            stats.messages_created
        );
        Ok(stats)
    }

    fn is_fresh(&self, settings: &ChannelSettings) -> bool {
        let Some(last) = settings.last_indexed_at else {
            return false;
        };
        let window = chrono::Duration::from_std(self.config.freshness_window)
            .unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() - last < window
    }

    async fn pause(&self) {
        if !self.config.channel_delay.is_zero() {
            tokio::time::sleep(self.config.channel_delay).await;
        }
    }

    #[instrument(skip_all, fields(channel = channel.id))]
    async fn index_channel(
        &self,
        channel: &RemoteChannel,
        settings: &ChannelSettings,
        stats: &mut GuildStats,
    ) -> Result<ChannelOutcome> {
        if !channel.bot_can_read {
            return Ok(ChannelOutcome::Unreadable);
        }
        if self.is_fresh(settings) {
            return Ok(ChannelOutcome::Fresh);
        }

        let started = Instant::now();
        self.store
            .upsert_channel(&convert::channel_record(channel))
            .await?;
        if self.config.provision_invites {
            invite::ensure_invite(self.remote.as_ref(), self.store.as_ref(), settings).await;
        }

        match channel.kind {
            ChannelKind::Forum => self.index_forum(channel, settings, stats).await?,
            _ => self.index_text(channel, settings, stats).await?,
        }

        self.store
            .update_channel_settings(
                channel.id,
                channel.guild_id,
                &ChannelSettingsPatch::indexed_at(Utc::now()),
            )
            .await?;
        debug!("Indexer: #{} ({}) finished in {:?}", channel.name, channel.id, started.elapsed());
        Ok(ChannelOutcome::Indexed)
    }

    async fn index_text(
        &self,
        channel: &RemoteChannel,
        settings: &ChannelSettings,
        stats: &mut GuildStats,
    ) -> Result<()> {
        let checkpoint = settings.last_indexed_snowflake;
        let crawl = self.crawler.crawl(channel.id, checkpoint).await?;
        let ingest = self
            .pipeline
            .ingest(
                &crawl.messages,
                MessageLocation::channel(channel.guild_id, channel.id),
                checkpoint,
            )
            .await?;
        stats.absorb(&ingest);

        // Threads started from channel messages: the ones just crawled plus
        // any still active, which may have new replies.
        let mut seen = HashSet::new();
        let mut threads: Vec<RemoteChannel> = crawl
            .messages
            .iter()
            .filter_map(|m| m.thread.clone())
            .collect();
        match self.remote.fetch_active_threads(channel.id).await {
            Ok(active) => threads.extend(active),
            Err(e) => warn!("Indexer: could not list active threads of {}: {}", channel.id, e),
        }
        threads.retain(|t| seen.insert(t.id));
        if threads.is_empty() {
            return Ok(());
        }

        let checkpoints = self.thread_checkpoints(&threads).await?;
        let threads: Vec<RemoteChannel> = threads
            .into_iter()
            .filter(|t| match (checkpoints.get(&t.id), t.last_message_id) {
                (None, _) => true,
                (Some(done), Some(last)) => last > *done,
                (Some(_), None) => false,
            })
            .collect();
        self.index_threads(channel, &threads, &checkpoints, stats).await;
        Ok(())
    }

    async fn index_forum(
        &self,
        forum: &RemoteChannel,
        settings: &ChannelSettings,
        stats: &mut GuildStats,
    ) -> Result<()> {
        let cutoff = settings.last_indexed_snowflake;
        let discovered = self.discoverer.discover(forum.id, cutoff).await?;

        let all: Vec<RemoteChannel> = discovered
            .new_threads
            .iter()
            .chain(discovered.older_threads.iter())
            .cloned()
            .collect();
        let checkpoints = self.thread_checkpoints(&all).await?;
        let selected = discovered.to_index(&checkpoints);
        debug!(
            "Indexer: forum {} has {} threads to index ({} new)",
            forum.id,
            selected.len(),
            discovered.new_threads.len()
        );

        let succeeded = self.index_threads(forum, &selected, &checkpoints, stats).await;

        // Advance past new threads only while every earlier one succeeded,
        // so a failed thread stays above the cutoff for the next run.
        let mut newest = None;
        for thread in &discovered.new_threads {
            if !succeeded.contains(&thread.id) {
                break;
            }
            newest = Some(thread.id);
        }
        if let Some(newest) = newest {
            checkpoint::advance(self.store.as_ref(), forum.guild_id, forum.id, newest, cutoff)
                .await?;
        }
        Ok(())
    }

    async fn thread_checkpoints(
        &self,
        threads: &[RemoteChannel],
    ) -> Result<HashMap<Snowflake, Snowflake>> {
        let ids: Vec<Snowflake> = threads.iter().map(|t| t.id).collect();
        let settings = self.store.find_channel_settings_by_ids(&ids).await?;
        Ok(settings
            .into_iter()
            .filter_map(|s| s.last_indexed_snowflake.map(|c| (s.channel_id, c)))
            .collect())
    }

    /// Sequential on purpose: thread endpoints are the most rate limited.
    /// Returns the ids of threads that were fully indexed.
    async fn index_threads(
        &self,
        parent: &RemoteChannel,
        threads: &[RemoteChannel],
        checkpoints: &HashMap<Snowflake, Snowflake>,
        stats: &mut GuildStats,
    ) -> HashSet<Snowflake> {
        let mut succeeded = HashSet::new();
        for (i, thread) in threads.iter().enumerate() {
            if i > 0 {
                self.pause().await;
            }

            let checkpoint = checkpoints.get(&thread.id).copied();
            match self.index_thread(parent, thread, checkpoint).await {
                Ok(ingest) => {
                    stats.absorb(&ingest);
                    stats.threads_indexed += 1;
                    succeeded.insert(thread.id);
                }
                Err(e) => {
                    warn!("Indexer: failed to index thread {} in {}: {}", thread.id, parent.id, e);
                    stats.threads_failed += 1;
                }
            }

            let done = i + 1;
            if done % self.config.progress_every.max(1) == 0 && done < threads.len() {
                info!(
                    "Indexer: channel {} progress {}/{} threads",
                    parent.id,
                    done,
                    threads.len()
                );
            }
        }
        succeeded
    }

    async fn index_thread(
        &self,
        parent: &RemoteChannel,
        thread: &RemoteChannel,
        checkpoint: Option<Snowflake>,
    ) -> Result<IngestStats> {
        self.store
            .upsert_channel(&convert::channel_record(thread))
            .await?;
        let crawl = self.crawler.crawl(thread.id, checkpoint).await?;
        self.pipeline
            .ingest(
                &crawl.messages,
                MessageLocation::thread(parent.guild_id, thread.id, parent.id),
                checkpoint,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::db::Database;
    use crate::testing::{self, channel, thread, ScriptedRemote};

    fn indexer(remote: &Arc<ScriptedRemote>, db: &Database, config: IndexingConfig) -> GuildIndexer {
        GuildIndexer::new(remote.clone(), Arc::new(db.clone()), None, config)
    }

    fn checkpoint_of(db: &Database, channel_id: Snowflake) -> Option<Snowflake> {
        db.get_channel_settings(channel_id)
            .unwrap()
            .and_then(|s| s.last_indexed_snowflake)
    }

    #[tokio::test]
    async fn test_incremental_crawl_from_checkpoint() {
        let db = Database::open_in_memory().unwrap();
        db.set_channel_enabled(1, 10, true).unwrap();
        db.apply_settings_patch(10, 1, &ChannelSettingsPatch::checkpoint(100))
            .unwrap();

        let remote = Arc::new(ScriptedRemote::default());
        remote.add_guild(1);
        remote.set_channels(1, vec![channel(10, 1, ChannelKind::Text)]);
        remote.add_messages(10, (95..=103).collect());
        let indexer = indexer(&remote, &db, testing::fast_config());

        let stats = indexer.index_guild(1).await.unwrap();
        assert_eq!(stats.channels_indexed, 1);
        assert_eq!(stats.messages_created, 3);
        assert_eq!(db.count_messages(10).unwrap(), 3);
        assert_eq!(checkpoint_of(&db, 10), Some(103));

        let settings = db.get_channel_settings(10).unwrap().unwrap();
        assert!(settings.last_indexed_at.is_some());
        assert_eq!(settings.invite_code.as_deref(), Some("invite-10"));
        assert_eq!(db.is_server_kicked(1).unwrap(), Some(false));

        // Nothing new: the crawl ends on an empty page.
        let stats = indexer.index_guild(1).await.unwrap();
        assert_eq!(stats.messages_written, 0);
        assert_eq!(checkpoint_of(&db, 10), Some(103));
    }

    #[tokio::test]
    async fn test_only_enabled_readable_channels_are_crawled() {
        let db = Database::open_in_memory().unwrap();
        db.set_channel_enabled(1, 10, true).unwrap();
        db.set_channel_enabled(1, 12, true).unwrap();

        let mut hidden = channel(12, 1, ChannelKind::Text);
        hidden.bot_can_read = false;
        let remote = Arc::new(ScriptedRemote::default());
        remote.add_guild(1);
        remote.set_channels(
            1,
            vec![channel(10, 1, ChannelKind::Text), channel(11, 1, ChannelKind::Text), hidden],
        );
        remote.add_messages(10, vec![1, 2]);
        remote.add_messages(11, vec![3, 4]);
        remote.add_messages(12, vec![5, 6]);

        let stats = indexer(&remote, &db, testing::fast_config())
            .index_guild(1)
            .await
            .unwrap();
        assert_eq!(stats.channels_enabled, 2);
        assert_eq!(stats.channels_indexed, 1);
        assert_eq!(stats.channels_unreadable, 1);
        assert_eq!(db.count_messages(11).unwrap(), 0);
        assert_eq!(db.count_messages(12).unwrap(), 0);
        assert_eq!(remote.message_calls(12), 0);
    }

    #[tokio::test]
    async fn test_recently_indexed_channel_is_skipped() {
        let db = Database::open_in_memory().unwrap();
        db.set_channel_enabled(1, 10, true).unwrap();
        db.apply_settings_patch(10, 1, &ChannelSettingsPatch::indexed_at(Utc::now()))
            .unwrap();

        let remote = Arc::new(ScriptedRemote::default());
        remote.add_guild(1);
        remote.set_channels(1, vec![channel(10, 1, ChannelKind::Text)]);
        remote.add_messages(10, vec![1, 2]);

        let mut config = testing::fast_config();
        config.freshness_window = Duration::from_secs(3600);
        let stats = indexer(&remote, &db, config).index_guild(1).await.unwrap();
        assert_eq!(stats.channels_fresh, 1);
        assert_eq!(remote.message_calls(10), 0);
    }

    #[tokio::test]
    async fn test_channel_failure_does_not_abort_guild() {
        let db = Database::open_in_memory().unwrap();
        db.set_channel_enabled(1, 10, true).unwrap();
        db.set_channel_enabled(1, 11, true).unwrap();

        let remote = Arc::new(ScriptedRemote::default());
        remote.add_guild(1);
        remote.set_channels(
            1,
            vec![channel(10, 1, ChannelKind::Text), channel(11, 1, ChannelKind::Text)],
        );
        remote.fail_channel(10);
        remote.add_messages(11, vec![1, 2, 3]);

        let stats = indexer(&remote, &db, testing::fast_config())
            .index_guild(1)
            .await
            .unwrap();
        assert_eq!(stats.channels_failed, 1);
        assert_eq!(stats.channels_indexed, 1);
        assert_eq!(checkpoint_of(&db, 10), None);
        assert_eq!(checkpoint_of(&db, 11), Some(3));
        // A failed channel is not stamped, so it is retried next run.
        assert!(db.get_channel_settings(10).unwrap().unwrap().last_indexed_at.is_none());
    }

    fn forum_remote() -> Arc<ScriptedRemote> {
        let remote = Arc::new(ScriptedRemote::default());
        remote.add_guild(1);
        remote.set_channels(1, vec![channel(50, 1, ChannelKind::Forum)]);
        remote.set_active_threads(50, vec![thread(60, 1, 50, Some(62))]);
        remote.set_archived_threads(50, vec![thread(55, 1, 50, Some(57))], 10);
        remote.add_messages(55, vec![55, 56, 57]);
        remote.add_messages(60, vec![60, 61, 62]);
        remote
    }

    #[tokio::test]
    async fn test_forum_threads_get_their_own_checkpoints() {
        let db = Database::open_in_memory().unwrap();
        db.set_channel_enabled(1, 50, true).unwrap();
        let remote = forum_remote();
        let indexer = indexer(&remote, &db, testing::fast_config());

        let stats = indexer.index_guild(1).await.unwrap();
        assert_eq!(stats.threads_indexed, 2);
        assert_eq!(db.count_messages(55).unwrap(), 3);
        assert_eq!(checkpoint_of(&db, 55), Some(57));
        assert_eq!(checkpoint_of(&db, 60), Some(62));
        assert_eq!(checkpoint_of(&db, 50), Some(60));
        // Thread rows never turn on indexing by themselves.
        assert!(!db.get_channel_settings(60).unwrap().unwrap().indexing_enabled);

        // A reply in an older thread is picked up through its own checkpoint.
        remote.add_messages(60, vec![63]);
        remote.set_active_threads(50, vec![thread(60, 1, 50, Some(63))]);
        let stats = indexer.index_guild(1).await.unwrap();
        assert_eq!(stats.threads_indexed, 1);
        assert_eq!(stats.messages_created, 1);
        assert_eq!(checkpoint_of(&db, 60), Some(63));
        assert_eq!(checkpoint_of(&db, 50), Some(60));
    }

    #[tokio::test]
    async fn test_failed_thread_holds_back_forum_checkpoint() {
        let db = Database::open_in_memory().unwrap();
        db.set_channel_enabled(1, 50, true).unwrap();
        let remote = forum_remote();
        remote.fail_channel(60);

        let stats = indexer(&remote, &db, testing::fast_config())
            .index_guild(1)
            .await
            .unwrap();
        assert_eq!(stats.threads_failed, 1);
        assert_eq!(checkpoint_of(&db, 50), Some(55));
        assert_eq!(checkpoint_of(&db, 60), None);
    }

    #[tokio::test]
    async fn test_thread_with_unconvertible_starter_is_retried() {
        let db = Database::open_in_memory().unwrap();
        db.set_channel_enabled(1, 50, true).unwrap();
        let remote = Arc::new(ScriptedRemote::default());
        remote.add_guild(1);
        remote.set_channels(1, vec![channel(50, 1, ChannelKind::Forum)]);
        remote.set_active_threads(50, vec![thread(60, 1, 50, Some(60))]);
        remote.add_messages(60, vec![60]);
        remote.strip_author(60, 60);
        let indexer = indexer(&remote, &db, testing::fast_config());

        indexer.index_guild(1).await.unwrap();
        assert_eq!(checkpoint_of(&db, 50), Some(60));
        assert_eq!(checkpoint_of(&db, 60), None);

        // The thread is now below the forum cutoff but was never ingested.
        remote.add_messages(60, vec![61]);
        remote.set_active_threads(50, vec![thread(60, 1, 50, Some(61))]);
        let stats = indexer.index_guild(1).await.unwrap();
        assert_eq!(stats.threads_indexed, 1);
        assert_eq!(db.count_messages(60).unwrap(), 1);
        assert_eq!(checkpoint_of(&db, 60), Some(61));
    }

    #[tokio::test]
    async fn test_text_channel_child_threads_are_indexed() {
        let db = Database::open_in_memory().unwrap();
        db.set_channel_enabled(1, 10, true).unwrap();

        let remote = Arc::new(ScriptedRemote::default());
        remote.add_guild(1);
        remote.set_channels(1, vec![channel(10, 1, ChannelKind::Text)]);
        remote.add_messages(10, vec![101, 102]);
        remote.attach_thread(10, 102, thread(102, 1, 10, Some(104)));
        remote.add_messages(102, vec![103, 104]);

        let stats = indexer(&remote, &db, testing::fast_config())
            .index_guild(1)
            .await
            .unwrap();
        assert_eq!(stats.threads_indexed, 1);
        assert_eq!(db.count_messages(102).unwrap(), 2);
        assert_eq!(checkpoint_of(&db, 102), Some(104));
        assert_eq!(checkpoint_of(&db, 10), Some(102));
    }
}
