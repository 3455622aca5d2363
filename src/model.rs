//! Canonical records mirrored into the content store.
//!
//! Every record is keyed by the platform's snowflake id, so writes from the
//! crawler and from gateway events are idempotent upserts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Time-sortable 64-bit platform identifier. Higher means newer.
pub type Snowflake = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    Text,
    Announcement,
    Forum,
    Thread,
    Other,
}

impl ChannelKind {
    pub fn as_i64(self) -> i64 {
        match self {
            ChannelKind::Text => 0,
            ChannelKind::Announcement => 5,
            ChannelKind::Forum => 15,
            ChannelKind::Thread => 11,
            ChannelKind::Other => -1,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => ChannelKind::Text,
            5 => ChannelKind::Announcement,
            15 => ChannelKind::Forum,
            11 => ChannelKind::Thread,
            _ => ChannelKind::Other,
        }
    }

    /// Channel kinds the crawler knows how to index directly.
    pub fn is_indexable_root(self) -> bool {
        matches!(
            self,
            ChannelKind::Text | ChannelKind::Announcement | ChannelKind::Forum
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: Snowflake,
    pub name: String,
    pub icon: Option<String>,
    pub description: Option<String>,
    pub vanity_url_code: Option<String>,
    pub approximate_member_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: Snowflake,
    pub server_id: Snowflake,
    pub name: String,
    pub kind: ChannelKind,
    /// Only set for threads.
    pub parent_id: Option<Snowflake>,
    /// Only set for archived threads.
    pub archived_at: Option<DateTime<Utc>>,
}

/// Per-channel crawl state. Threads get their own row (indexing flag off)
/// so they carry an independent checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelSettings {
    pub channel_id: Snowflake,
    pub server_id: Snowflake,
    pub indexing_enabled: bool,
    pub last_indexed_snowflake: Option<Snowflake>,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub invite_code: Option<String>,
    pub solution_tag_id: Option<Snowflake>,
    pub flags: u64,
}

/// Partial update for [`ChannelSettings`]. `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSettingsPatch {
    pub indexing_enabled: Option<bool>,
    pub last_indexed_snowflake: Option<Snowflake>,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub invite_code: Option<String>,
    pub solution_tag_id: Option<Snowflake>,
    pub flags: Option<u64>,
}

impl ChannelSettingsPatch {
    pub fn checkpoint(value: Snowflake) -> Self {
        Self {
            last_indexed_snowflake: Some(value),
            ..Default::default()
        }
    }

    pub fn indexed_at(at: DateTime<Utc>) -> Self {
        Self {
            last_indexed_at: Some(at),
            ..Default::default()
        }
    }

    pub fn invite(code: String) -> Self {
        Self {
            invite_code: Some(code),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: Snowflake,
    pub name: String,
    pub avatar: Option<String>,
}

/// Per-server settings kept for bot authors. Only the key is written by the
/// indexer; the flags belong to moderators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotServerSettings {
    pub user_id: Snowflake,
    pub server_id: Snowflake,
    pub permissions: u64,
    pub indexing_disabled: bool,
}

impl BotServerSettings {
    pub fn new(user_id: Snowflake, server_id: Snowflake) -> Self {
        Self {
            user_id,
            server_id,
            permissions: 0,
            indexing_disabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub id: Snowflake,
    pub filename: String,
    pub url: String,
    pub content_type: Option<String>,
    pub size: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedRecord {
    pub title: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

impl EmbedRecord {
    /// Image URLs referenced by this embed, image first.
    pub fn image_urls(&self) -> impl Iterator<Item = &str> {
        self.image_url
            .as_deref()
            .into_iter()
            .chain(self.thumbnail_url.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRecord {
    pub emoji: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Snowflake,
    pub author_id: Snowflake,
    pub server_id: Snowflake,
    pub channel_id: Snowflake,
    pub parent_channel_id: Option<Snowflake>,
    pub child_thread_id: Option<Snowflake>,
    pub question_id: Option<Snowflake>,
    pub reference_id: Option<Snowflake>,
    pub content: String,
    pub flags: u64,
    pub kind: u8,
    pub pinned: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub embeds: Vec<EmbedRecord>,
    pub attachments: Vec<AttachmentRecord>,
    pub reactions: Vec<ReactionRecord>,
}

/// Where a mirrored file came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    Attachment { attachment_id: Snowflake },
    EmbedImage { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirroredMedia {
    pub message_id: Snowflake,
    pub source: MediaSource,
    pub storage_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_kind_round_trips_through_storage_value() {
        for kind in [
            ChannelKind::Text,
            ChannelKind::Announcement,
            ChannelKind::Forum,
            ChannelKind::Thread,
        ] {
            assert_eq!(ChannelKind::from_i64(kind.as_i64()), kind);
        }
        assert_eq!(ChannelKind::from_i64(2), ChannelKind::Other);
    }

    #[test]
    fn test_embed_image_urls() {
        let embed = EmbedRecord {
            title: None,
            description: None,
            url: None,
            image_url: Some("https://cdn.example/a.png".to_string()),
            thumbnail_url: Some("https://cdn.example/t.png".to_string()),
        };
        let urls: Vec<_> = embed.image_urls().collect();
        assert_eq!(urls, vec!["https://cdn.example/a.png", "https://cdn.example/t.png"]);
    }
}
