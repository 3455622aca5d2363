//! Boundary to the chat platform.
//!
//! The crawler never reads a shared client cache. Every call returns a fresh,
//! owned snapshot so the indexer can be driven by a scripted client in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{ChannelKind, Snowflake};

/// Message types that carry user content. Everything else (joins, pins,
/// boosts, thread-created notices...) is a platform system message.
const CONTENT_MESSAGE_KINDS: [u8; 4] = [0, 19, 20, 23];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteGuild {
    pub id: Snowflake,
    pub name: String,
    pub icon: Option<String>,
    pub description: Option<String>,
    pub vanity_url_code: Option<String>,
    pub approximate_member_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChannel {
    pub id: Snowflake,
    pub guild_id: Snowflake,
    pub name: String,
    pub kind: ChannelKind,
    pub parent_id: Option<Snowflake>,
    pub last_message_id: Option<Snowflake>,
    pub archived_at: Option<DateTime<Utc>>,
    /// Bot holds both view and read-history permission.
    pub bot_can_read: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUser {
    pub id: Snowflake,
    pub name: String,
    pub global_name: Option<String>,
    pub avatar: Option<String>,
    pub bot: bool,
}

impl RemoteUser {
    pub fn display_name(&self) -> &str {
        self.global_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAttachment {
    pub id: Snowflake,
    pub filename: String,
    pub url: String,
    pub content_type: Option<String>,
    pub size: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteEmbed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteReaction {
    pub emoji: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    pub guild_id: Option<Snowflake>,
    /// Missing when the platform omits the author payload.
    pub author: Option<RemoteUser>,
    pub content: String,
    pub kind: u8,
    pub flags: u64,
    pub pinned: bool,
    pub timestamp: Option<DateTime<Utc>>,
    pub embeds: Vec<RemoteEmbed>,
    pub attachments: Vec<RemoteAttachment>,
    pub reactions: Vec<RemoteReaction>,
    pub reference_id: Option<Snowflake>,
    /// Thread started from this message, if any.
    pub thread: Option<RemoteChannel>,
}

impl RemoteMessage {
    pub fn is_system(&self) -> bool {
        !CONTENT_MESSAGE_KINDS.contains(&self.kind)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArchivedThreadsPage {
    pub threads: Vec<RemoteChannel>,
    pub has_more: bool,
}

#[async_trait]
pub trait RemoteContentClient: Send + Sync {
    async fn list_guilds(&self) -> Result<Vec<RemoteGuild>>;

    async fn fetch_guild(&self, guild_id: Snowflake) -> Result<RemoteGuild>;

    async fn list_channels(&self, guild_id: Snowflake) -> Result<Vec<RemoteChannel>>;

    /// Up to `limit` of the oldest messages strictly newer than `cursor`.
    /// Order within the page is not guaranteed.
    async fn fetch_messages_after(
        &self,
        channel_id: Snowflake,
        cursor: Option<Snowflake>,
        limit: u8,
    ) -> Result<Vec<RemoteMessage>>;

    async fn fetch_active_threads(&self, channel_id: Snowflake) -> Result<Vec<RemoteChannel>>;

    /// Archived threads, newest archive first, archived strictly before `before`.
    async fn fetch_archived_threads(
        &self,
        channel_id: Snowflake,
        before: Option<DateTime<Utc>>,
    ) -> Result<ArchivedThreadsPage>;

    /// Creates (or reuses) a permanent invite and returns its code.
    async fn create_invite(&self, channel_id: Snowflake) -> Result<String>;
}
