use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Largest page the platform returns for a message fetch.
pub const MAX_MESSAGE_PAGE_SIZE: u8 = 100;

#[derive(Clone)]
pub struct Config {
    pub discord_token: String,
    pub database_url: String,

    // Media mirroring
    pub media_mirror_enabled: bool,
    pub media_dir: String,
    pub media_max_bytes: u64,

    pub indexing: IndexingConfig,
}

/// Crawl tunables. These encode rate-limit tolerances of the platform and
/// the store, so none of them are hard-coded in the indexer.
#[derive(Debug, Clone)]
pub struct IndexingConfig {
    pub enabled: bool,
    /// Cron expression, 5 or 6 fields (seconds optional).
    pub cron: String,
    /// IANA timezone the cron expression is evaluated in.
    pub timezone: String,
    pub page_size: u8,
    pub max_messages_per_channel: usize,
    pub max_threads_per_forum: usize,
    /// Channels crawled more recently than this are skipped.
    pub freshness_window: Duration,
    pub channel_delay: Duration,
    pub write_chunk_size: usize,
    pub write_concurrency: usize,
    pub write_jitter_min: Duration,
    pub write_jitter_max: Duration,
    pub media_concurrency: usize,
    /// Log guild progress every N channels or threads.
    pub progress_every: usize,
    pub provision_invites: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: "0 */6 * * *".to_string(),
            timezone: "UTC".to_string(),
            page_size: MAX_MESSAGE_PAGE_SIZE,
            max_messages_per_channel: 10_000,
            max_threads_per_forum: 1_000,
            freshness_window: Duration::from_secs(60 * 60),
            channel_delay: Duration::from_millis(500),
            write_chunk_size: 25,
            write_concurrency: 10,
            write_jitter_min: Duration::from_millis(100),
            write_jitter_max: Duration::from_millis(500),
            media_concurrency: 4,
            progress_every: 10,
            provision_invites: true,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_duration(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| humantime::parse_duration(v.trim()).ok())
        .unwrap_or(default)
}

impl IndexingConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        let write_jitter_min = env_duration("INDEXING_WRITE_JITTER_MIN", defaults.write_jitter_min);
        let write_jitter_max = env_duration("INDEXING_WRITE_JITTER_MAX", defaults.write_jitter_max)
            .max(write_jitter_min);

        Self {
            enabled: env_or("INDEXING_ENABLED", defaults.enabled),
            cron: env::var("INDEXING_CRON").unwrap_or(defaults.cron),
            timezone: env::var("INDEXING_TIMEZONE").unwrap_or(defaults.timezone),
            page_size: env_or("INDEXING_PAGE_SIZE", defaults.page_size)
                .clamp(1, MAX_MESSAGE_PAGE_SIZE),
            max_messages_per_channel: env_or(
                "INDEXING_MAX_MESSAGES_PER_CHANNEL",
                defaults.max_messages_per_channel,
            )
            .max(1),
            max_threads_per_forum: env_or(
                "INDEXING_MAX_THREADS_PER_FORUM",
                defaults.max_threads_per_forum,
            )
            .max(1),
            freshness_window: env_duration("INDEXING_FRESHNESS_WINDOW", defaults.freshness_window),
            channel_delay: env_duration("INDEXING_CHANNEL_DELAY", defaults.channel_delay),
            write_chunk_size: env_or("INDEXING_WRITE_CHUNK_SIZE", defaults.write_chunk_size).max(1),
            write_concurrency: env_or("INDEXING_WRITE_CONCURRENCY", defaults.write_concurrency)
                .max(1),
            write_jitter_min,
            write_jitter_max,
            media_concurrency: env_or("INDEXING_MEDIA_CONCURRENCY", defaults.media_concurrency)
                .max(1),
            progress_every: env_or("INDEXING_PROGRESS_EVERY", defaults.progress_every).max(1),
            provision_invites: env_or("INDEXING_PROVISION_INVITES", defaults.provision_invites),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        Ok(Config {
            discord_token: env::var("DISCORD_TOKEN")
                .map_err(|_| anyhow::anyhow!("DISCORD_TOKEN must be set"))?,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/mirrorcord.db".to_string()),
            media_mirror_enabled: env_or("MEDIA_MIRROR_ENABLED", true),
            media_dir: env::var("MEDIA_DIR").unwrap_or_else(|_| "data/media".to_string()),
            media_max_bytes: env_or("MEDIA_MAX_BYTES", 25 * 1024 * 1024),
            indexing: IndexingConfig::from_env(),
        })
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("discord_token", &"[REDACTED]")
            .field("database_url", &self.database_url)
            .field("media_mirror_enabled", &self.media_mirror_enabled)
            .field("media_dir", &self.media_dir)
            .field("media_max_bytes", &self.media_max_bytes)
            .field("indexing", &self.indexing)
            .finish()
    }
}
