mod schema;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{MirrorError, Result};
use crate::model::{
    AccountRecord, BotServerSettings, ChannelKind, ChannelRecord, ChannelSettings,
    ChannelSettingsPatch, MediaSource, MessageRecord, MirroredMedia, ServerRecord, Snowflake,
};
use crate::store::ContentStore;

// Snowflakes stay below 2^63, so the cast is lossless.
fn sql_id(id: Snowflake) -> i64 {
    id as i64
}

fn from_sql_id(value: i64) -> Snowflake {
    value as Snowflake
}

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(config: &Config) -> Result<Self> {
        Self::open(&config.database_url)
    }

    pub fn open(path: &str) -> Result<Self> {
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Self::open(":memory:")?;
        db.execute_init()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| MirrorError::LockPoisoned)
    }

    pub fn execute_init(&self) -> Result<()> {
        info!("Database: Initializing schema...");
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(schema::SCHEMA)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    /// Runs a blocking database closure on the blocking thread pool.
    pub async fn run_blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    // --- Servers ---

    pub fn save_server(&self, server: &ServerRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO servers (id, name, icon, description, vanity_url_code, approximate_member_count, kicked_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, CURRENT_TIMESTAMP)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                icon = excluded.icon,
                description = excluded.description,
                vanity_url_code = excluded.vanity_url_code,
                approximate_member_count = COALESCE(excluded.approximate_member_count, approximate_member_count),
                kicked_at = NULL,
                updated_at = CURRENT_TIMESTAMP",
            params![
                sql_id(server.id),
                server.name,
                server.icon,
                server.description,
                server.vanity_url_code,
                server.approximate_member_count.map(|c| c as i64),
            ],
        )?;
        Ok(())
    }

    pub fn set_server_kicked(&self, server_id: Snowflake) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE servers SET kicked_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND kicked_at IS NULL",
            params![sql_id(server_id)],
        )?;
        Ok(())
    }

    /// `None` when the server was never mirrored, otherwise whether it is kicked.
    pub fn is_server_kicked(&self, server_id: Snowflake) -> Result<Option<bool>> {
        let conn = self.conn()?;
        let kicked = conn
            .query_row(
                "SELECT kicked_at IS NOT NULL FROM servers WHERE id = ?1",
                params![sql_id(server_id)],
                |row| row.get::<_, bool>(0),
            )
            .optional()?;
        Ok(kicked)
    }

    // --- Channels ---

    pub fn save_channel(&self, channel: &ChannelRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO channels (id, server_id, name, kind, parent_id, archived_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, CURRENT_TIMESTAMP)
             ON CONFLICT(id) DO UPDATE SET
                server_id = excluded.server_id,
                name = excluded.name,
                kind = excluded.kind,
                parent_id = excluded.parent_id,
                archived_at = excluded.archived_at,
                updated_at = CURRENT_TIMESTAMP",
            params![
                sql_id(channel.id),
                sql_id(channel.server_id),
                channel.name,
                channel.kind.as_i64(),
                channel.parent_id.map(sql_id),
                channel.archived_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn remove_channel(&self, channel_id: Snowflake) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let id = sql_id(channel_id);
        tx.execute(
            "DELETE FROM attachments WHERE message_id IN (SELECT id FROM messages WHERE channel_id = ?1)",
            params![id],
        )?;
        tx.execute(
            "DELETE FROM embed_images WHERE message_id IN (SELECT id FROM messages WHERE channel_id = ?1)",
            params![id],
        )?;
        let purged = tx.execute("DELETE FROM messages WHERE channel_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM channels WHERE id = ?1", params![id])?;
        tx.commit()?;
        debug!(
            "Database: Removed channel {} ({} messages purged)",
            channel_id, purged
        );
        Ok(removed > 0)
    }

    pub fn get_channels(&self, ids: &[Snowflake]) -> Result<Vec<ChannelRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let sql = format!(
            "SELECT id, server_id, name, kind, parent_id, archived_at FROM channels WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter().map(|id| sql_id(*id))), |row| {
            Ok(ChannelRecord {
                id: from_sql_id(row.get(0)?),
                server_id: from_sql_id(row.get(1)?),
                name: row.get(2)?,
                kind: ChannelKind::from_i64(row.get(3)?),
                parent_id: row.get::<_, Option<i64>>(4)?.map(from_sql_id),
                archived_at: parse_ts(row.get(5)?),
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // --- Channel Settings ---

    const SETTINGS_COLUMNS: &'static str = "channel_id, server_id, indexing_enabled, last_indexed_snowflake, \
         last_indexed_at, invite_code, solution_tag_id, flags";

    fn settings_from_row(row: &Row<'_>) -> rusqlite::Result<ChannelSettings> {
        Ok(ChannelSettings {
            channel_id: from_sql_id(row.get(0)?),
            server_id: from_sql_id(row.get(1)?),
            indexing_enabled: row.get(2)?,
            last_indexed_snowflake: row.get::<_, Option<i64>>(3)?.map(from_sql_id),
            last_indexed_at: parse_ts(row.get(4)?),
            invite_code: row.get(5)?,
            solution_tag_id: row.get::<_, Option<i64>>(6)?.map(from_sql_id),
            flags: row.get::<_, i64>(7)? as u64,
        })
    }

    /// Admin toggle for whether a channel is crawled.
    pub fn set_channel_enabled(
        &self,
        server_id: Snowflake,
        channel_id: Snowflake,
        enabled: bool,
    ) -> Result<()> {
        self.apply_settings_patch(
            channel_id,
            server_id,
            &ChannelSettingsPatch {
                indexing_enabled: Some(enabled),
                ..Default::default()
            },
        )
    }

    pub fn get_channel_settings(&self, channel_id: Snowflake) -> Result<Option<ChannelSettings>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM channel_settings WHERE channel_id = ?1",
            Self::SETTINGS_COLUMNS
        );
        let settings = conn
            .query_row(&sql, params![sql_id(channel_id)], Self::settings_from_row)
            .optional()?;
        Ok(settings)
    }

    pub fn list_enabled_channel_settings(&self, server_id: Snowflake) -> Result<Vec<ChannelSettings>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM channel_settings WHERE server_id = ?1 AND indexing_enabled = 1",
            Self::SETTINGS_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![sql_id(server_id)], Self::settings_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn list_channel_settings(&self, ids: &[Snowflake]) -> Result<Vec<ChannelSettings>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM channel_settings WHERE channel_id IN ({})",
            Self::SETTINGS_COLUMNS,
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(ids.iter().map(|id| sql_id(*id))),
            Self::settings_from_row,
        )?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn apply_settings_patch(
        &self,
        channel_id: Snowflake,
        server_id: Snowflake,
        patch: &ChannelSettingsPatch,
    ) -> Result<()> {
        let conn = self.conn()?;
        // The checkpoint column only ever moves forward, whatever the caller
        // believed the current value to be.
        conn.execute(
            "INSERT INTO channel_settings
                (channel_id, server_id, indexing_enabled, last_indexed_snowflake, last_indexed_at,
                 invite_code, solution_tag_id, flags)
             VALUES (?1, ?2, COALESCE(?3, FALSE), ?4, ?5, ?6, ?7, COALESCE(?8, 0))
             ON CONFLICT(channel_id) DO UPDATE SET
                indexing_enabled = COALESCE(?3, indexing_enabled),
                last_indexed_snowflake = CASE
                    WHEN ?4 IS NULL THEN last_indexed_snowflake
                    WHEN last_indexed_snowflake IS NULL OR ?4 > last_indexed_snowflake THEN ?4
                    ELSE last_indexed_snowflake
                END,
                last_indexed_at = COALESCE(?5, last_indexed_at),
                invite_code = COALESCE(?6, invite_code),
                solution_tag_id = COALESCE(?7, solution_tag_id),
                flags = COALESCE(?8, flags),
                updated_at = CURRENT_TIMESTAMP",
            params![
                sql_id(channel_id),
                sql_id(server_id),
                patch.indexing_enabled,
                patch.last_indexed_snowflake.map(sql_id),
                patch.last_indexed_at.map(|t| t.to_rfc3339()),
                patch.invite_code,
                patch.solution_tag_id.map(sql_id),
                patch.flags.map(|f| f as i64),
            ],
        )?;
        Ok(())
    }

    // --- Accounts ---

    pub fn save_account(&self, account: &AccountRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO accounts (id, name, avatar, updated_at) VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                avatar = excluded.avatar,
                updated_at = CURRENT_TIMESTAMP",
            params![sql_id(account.id), account.name, account.avatar],
        )?;
        Ok(())
    }

    pub fn get_account(&self, id: Snowflake) -> Result<Option<AccountRecord>> {
        let conn = self.conn()?;
        let account = conn
            .query_row(
                "SELECT id, name, avatar FROM accounts WHERE id = ?1",
                params![sql_id(id)],
                |row| {
                    Ok(AccountRecord {
                        id: from_sql_id(row.get(0)?),
                        name: row.get(1)?,
                        avatar: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(account)
    }

    pub fn save_bot_server_settings(&self, settings: &BotServerSettings) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO bot_server_settings (user_id, server_id, permissions, indexing_disabled)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, server_id) DO UPDATE SET updated_at = CURRENT_TIMESTAMP",
            params![
                sql_id(settings.user_id),
                sql_id(settings.server_id),
                settings.permissions as i64,
                settings.indexing_disabled,
            ],
        )?;
        Ok(())
    }

    /// Moderator override: stop mirroring a bot's messages in one server.
    pub fn set_bot_indexing_disabled(
        &self,
        user_id: Snowflake,
        server_id: Snowflake,
        disabled: bool,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO bot_server_settings (user_id, server_id, indexing_disabled) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, server_id) DO UPDATE SET
                indexing_disabled = excluded.indexing_disabled,
                updated_at = CURRENT_TIMESTAMP",
            params![sql_id(user_id), sql_id(server_id), disabled],
        )?;
        Ok(())
    }

    pub fn get_bot_server_settings(
        &self,
        user_id: Snowflake,
        server_id: Snowflake,
    ) -> Result<Option<BotServerSettings>> {
        let conn = self.conn()?;
        let settings = conn
            .query_row(
                "SELECT user_id, server_id, permissions, indexing_disabled FROM bot_server_settings
                 WHERE user_id = ?1 AND server_id = ?2",
                params![sql_id(user_id), sql_id(server_id)],
                |row| {
                    Ok(BotServerSettings {
                        user_id: from_sql_id(row.get(0)?),
                        server_id: from_sql_id(row.get(1)?),
                        permissions: row.get::<_, i64>(2)? as u64,
                        indexing_disabled: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(settings)
    }

    // --- Messages ---

    pub fn save_messages(&self, messages: &[MessageRecord]) -> Result<Vec<Snowflake>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut created = Vec::new();
        {
            let mut exists = tx.prepare_cached("SELECT 1 FROM messages WHERE id = ?1")?;
            let mut upsert = tx.prepare_cached(
                "INSERT INTO messages
                    (id, author_id, server_id, channel_id, parent_channel_id, child_thread_id,
                     question_id, reference_id, content, flags, kind, pinned, created_at, embeds, reactions)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(id) DO UPDATE SET
                    content = excluded.content,
                    flags = excluded.flags,
                    pinned = excluded.pinned,
                    child_thread_id = COALESCE(excluded.child_thread_id, child_thread_id),
                    embeds = excluded.embeds,
                    reactions = excluded.reactions,
                    updated_at = CURRENT_TIMESTAMP",
            )?;
            let mut attachment = tx.prepare_cached(
                "INSERT INTO attachments (id, message_id, filename, url, content_type, size, width, height)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    filename = excluded.filename,
                    url = excluded.url,
                    content_type = excluded.content_type",
            )?;
            let mut embed_image = tx.prepare_cached(
                "INSERT OR IGNORE INTO embed_images (message_id, url) VALUES (?1, ?2)",
            )?;

            for msg in messages {
                let id = sql_id(msg.id);
                if !exists.exists(params![id])? && !created.contains(&msg.id) {
                    created.push(msg.id);
                }
                upsert.execute(params![
                    id,
                    sql_id(msg.author_id),
                    sql_id(msg.server_id),
                    sql_id(msg.channel_id),
                    msg.parent_channel_id.map(sql_id),
                    msg.child_thread_id.map(sql_id),
                    msg.question_id.map(sql_id),
                    msg.reference_id.map(sql_id),
                    msg.content,
                    msg.flags as i64,
                    msg.kind as i64,
                    msg.pinned,
                    msg.created_at.map(|t| t.to_rfc3339()),
                    serde_json::to_string(&msg.embeds)?,
                    serde_json::to_string(&msg.reactions)?,
                ])?;
                for a in &msg.attachments {
                    attachment.execute(params![
                        sql_id(a.id),
                        id,
                        a.filename,
                        a.url,
                        a.content_type,
                        a.size as i64,
                        a.width,
                        a.height,
                    ])?;
                }
                for url in msg.embeds.iter().flat_map(|e| e.image_urls()) {
                    embed_image.execute(params![id, url])?;
                }
            }
        }
        tx.commit()?;
        debug!(
            "Database: Saved {} messages ({} new)",
            messages.len(),
            created.len()
        );
        Ok(created)
    }

    pub fn get_message_content(&self, message_id: Snowflake) -> Result<Option<String>> {
        let conn = self.conn()?;
        let content = conn
            .query_row(
                "SELECT content FROM messages WHERE id = ?1",
                params![sql_id(message_id)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(content)
    }

    pub fn count_messages(&self, channel_id: Snowflake) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE channel_id = ?1",
            params![sql_id(channel_id)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn remove_message(&self, message_id: Snowflake) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let id = sql_id(message_id);
        tx.execute("DELETE FROM attachments WHERE message_id = ?1", params![id])?;
        tx.execute("DELETE FROM embed_images WHERE message_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    // --- Media ---

    pub fn save_mirrored_media(&self, media: &MirroredMedia) -> Result<()> {
        let conn = self.conn()?;
        match &media.source {
            MediaSource::Attachment { attachment_id } => {
                conn.execute(
                    "UPDATE attachments SET storage_id = ?1 WHERE id = ?2 AND message_id = ?3",
                    params![
                        media.storage_id,
                        sql_id(*attachment_id),
                        sql_id(media.message_id)
                    ],
                )?;
            }
            MediaSource::EmbedImage { url } => {
                conn.execute(
                    "UPDATE embed_images SET storage_id = ?1 WHERE message_id = ?2 AND url = ?3",
                    params![media.storage_id, sql_id(media.message_id), url],
                )?;
            }
        }
        Ok(())
    }

    pub fn get_attachment_storage_id(&self, attachment_id: Snowflake) -> Result<Option<String>> {
        let conn = self.conn()?;
        let storage_id = conn
            .query_row(
                "SELECT storage_id FROM attachments WHERE id = ?1",
                params![sql_id(attachment_id)],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(storage_id.flatten())
    }
}

#[async_trait]
impl ContentStore for Database {
    async fn upsert_server(&self, server: &ServerRecord) -> Result<()> {
        let server = server.clone();
        self.run_blocking(move |db| db.save_server(&server)).await
    }

    async fn mark_server_kicked(&self, server_id: Snowflake) -> Result<()> {
        self.run_blocking(move |db| db.set_server_kicked(server_id))
            .await
    }

    async fn upsert_channel(&self, channel: &ChannelRecord) -> Result<()> {
        let channel = channel.clone();
        self.run_blocking(move |db| db.save_channel(&channel)).await
    }

    async fn delete_channel(&self, channel_id: Snowflake) -> Result<bool> {
        self.run_blocking(move |db| db.remove_channel(channel_id))
            .await
    }

    async fn find_channels_by_ids(&self, ids: &[Snowflake]) -> Result<Vec<ChannelRecord>> {
        let ids = ids.to_vec();
        self.run_blocking(move |db| db.get_channels(&ids)).await
    }

    async fn get_channel_settings_with_indexing_enabled(
        &self,
        server_id: Snowflake,
    ) -> Result<Vec<ChannelSettings>> {
        self.run_blocking(move |db| db.list_enabled_channel_settings(server_id))
            .await
    }

    async fn find_channel_settings_by_ids(
        &self,
        ids: &[Snowflake],
    ) -> Result<Vec<ChannelSettings>> {
        let ids = ids.to_vec();
        self.run_blocking(move |db| db.list_channel_settings(&ids))
            .await
    }

    async fn update_channel_settings(
        &self,
        channel_id: Snowflake,
        server_id: Snowflake,
        patch: &ChannelSettingsPatch,
    ) -> Result<()> {
        let patch = patch.clone();
        self.run_blocking(move |db| db.apply_settings_patch(channel_id, server_id, &patch))
            .await
    }

    async fn upsert_account(&self, account: &AccountRecord) -> Result<()> {
        let account = account.clone();
        self.run_blocking(move |db| db.save_account(&account)).await
    }

    async fn upsert_bot_server_settings(&self, settings: &BotServerSettings) -> Result<()> {
        let settings = settings.clone();
        self.run_blocking(move |db| db.save_bot_server_settings(&settings))
            .await
    }

    async fn upsert_messages_batch(&self, messages: &[MessageRecord]) -> Result<Vec<Snowflake>> {
        let messages = messages.to_vec();
        self.run_blocking(move |db| db.save_messages(&messages))
            .await
    }

    async fn delete_message(&self, message_id: Snowflake) -> Result<bool> {
        self.run_blocking(move |db| db.remove_message(message_id))
            .await
    }

    async fn record_mirrored_media(&self, media: &MirroredMedia) -> Result<()> {
        let media = media.clone();
        self.run_blocking(move |db| db.save_mirrored_media(&media))
            .await
    }
}
