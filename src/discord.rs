//! Serenity side of the mirror: the HTTP-backed content client and the
//! mapping from gateway events to [`SyncEvent`]s.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serenity::builder::{CreateInvite, GetMessages};
use serenity::client::FullEvent;
use serenity::http::{GuildPagination, Http};
use serenity::model::prelude::{
    ChannelId, ChannelType, GuildChannel, GuildId, Member, Message, MessageId, PartialGuild,
    Permissions, Timestamp, User, UserId,
};
use tracing::debug;

use crate::config::MAX_MESSAGE_PAGE_SIZE;
use crate::error::{MirrorError, Result};
use crate::model::{ChannelKind, Snowflake};
use crate::remote::{
    ArchivedThreadsPage, RemoteAttachment, RemoteChannel, RemoteContentClient, RemoteEmbed,
    RemoteGuild, RemoteMessage, RemoteReaction, RemoteUser,
};
use crate::sync::SyncEvent;

const GUILD_PAGE_SIZE: u64 = 200;
const ARCHIVED_THREAD_PAGE_SIZE: u64 = 100;

// Goes through RFC 3339 to keep the milliseconds thread archive paging needs.
fn timestamp(ts: &Timestamp) -> Option<DateTime<Utc>> {
    ts.to_rfc3339()
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| Utc.timestamp_opt(ts.unix_timestamp(), 0).single())
}

/// The archive endpoint takes whole seconds. Rounding up keeps threads
/// archived earlier in the same second on the next page; the ones already
/// seen come back again and are deduplicated by the caller.
fn archive_cursor(before: DateTime<Utc>) -> u64 {
    let secs = before.timestamp().max(0) as u64;
    if before.timestamp_subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

pub fn channel_kind(kind: ChannelType) -> ChannelKind {
    match u8::from(kind) {
        0 => ChannelKind::Text,
        5 => ChannelKind::Announcement,
        15 => ChannelKind::Forum,
        10..=12 => ChannelKind::Thread,
        _ => ChannelKind::Other,
    }
}

pub fn remote_channel(channel: &GuildChannel, bot_can_read: bool) -> RemoteChannel {
    RemoteChannel {
        id: channel.id.get(),
        guild_id: channel.guild_id.get(),
        name: channel.name.clone(),
        kind: channel_kind(channel.kind),
        parent_id: channel.parent_id.map(|id| id.get()),
        last_message_id: channel.last_message_id.map(|id| id.get()),
        archived_at: channel
            .thread_metadata
            .as_ref()
            .filter(|meta| meta.archived)
            .and_then(|meta| meta.archive_timestamp.as_ref())
            .and_then(timestamp),
        bot_can_read,
    }
}

pub fn remote_user(user: &User) -> RemoteUser {
    RemoteUser {
        id: user.id.get(),
        name: user.name.clone(),
        global_name: user.global_name.clone(),
        avatar: user.avatar.map(|hash| hash.to_string()),
        bot: user.bot,
    }
}

pub fn remote_message(msg: &Message) -> RemoteMessage {
    RemoteMessage {
        id: msg.id.get(),
        channel_id: msg.channel_id.get(),
        guild_id: msg.guild_id.map(|id| id.get()),
        author: Some(remote_user(&msg.author)),
        content: msg.content.clone(),
        kind: u8::from(msg.kind),
        flags: msg.flags.map(|f| f.bits()).unwrap_or(0),
        pinned: msg.pinned,
        timestamp: timestamp(&msg.timestamp),
        embeds: msg
            .embeds
            .iter()
            .map(|e| RemoteEmbed {
                title: e.title.clone(),
                description: e.description.clone(),
                url: e.url.clone(),
                image_url: e.image.as_ref().map(|i| i.url.clone()),
                thumbnail_url: e.thumbnail.as_ref().map(|t| t.url.clone()),
            })
            .collect(),
        attachments: msg
            .attachments
            .iter()
            .map(|a| RemoteAttachment {
                id: a.id.get(),
                filename: a.filename.clone(),
                url: a.url.clone(),
                content_type: a.content_type.clone(),
                size: u64::from(a.size),
                width: a.width,
                height: a.height,
            })
            .collect(),
        reactions: msg
            .reactions
            .iter()
            .map(|r| RemoteReaction {
                emoji: r.reaction_type.to_string(),
                count: r.count,
            })
            .collect(),
        reference_id: msg
            .message_reference
            .as_ref()
            .and_then(|r| r.message_id)
            .map(|id| id.get()),
        thread: msg.thread.as_ref().map(|t| remote_channel(t, true)),
    }
}

fn remote_guild(guild: &PartialGuild) -> RemoteGuild {
    RemoteGuild {
        id: guild.id.get(),
        name: guild.name.clone(),
        icon: guild.icon.map(|hash| hash.to_string()),
        description: guild.description.clone(),
        vanity_url_code: guild.vanity_url_code.clone(),
        approximate_member_count: guild.approximate_member_count,
    }
}

/// Lifts the gateway events the mirror cares about. DMs and events without
/// enough data (uncached edits, unavailable guilds) map to `None`.
pub fn sync_event(event: &FullEvent) -> Option<SyncEvent> {
    match event {
        FullEvent::Message { new_message } => {
            new_message.guild_id?;
            Some(SyncEvent::MessageUpsert(remote_message(new_message)))
        }
        FullEvent::MessageUpdate { new, .. } => {
            let new = new.as_ref()?;
            new.guild_id?;
            Some(SyncEvent::MessageUpsert(remote_message(new)))
        }
        FullEvent::MessageDelete {
            deleted_message_id,
            ..
        } => Some(SyncEvent::MessageDeleted {
            message_id: deleted_message_id.get(),
        }),
        FullEvent::MessageDeleteBulk {
            multiple_deleted_messages_ids,
            ..
        } => Some(SyncEvent::MessagesDeleted {
            message_ids: multiple_deleted_messages_ids.iter().map(|id| id.get()).collect(),
        }),
        FullEvent::ChannelCreate { channel } => {
            Some(SyncEvent::ChannelUpsert(remote_channel(channel, true)))
        }
        FullEvent::ChannelUpdate { new, .. } => {
            Some(SyncEvent::ChannelUpsert(remote_channel(new, true)))
        }
        FullEvent::ChannelDelete { channel, .. } => Some(SyncEvent::ChannelDeleted {
            channel_id: channel.id.get(),
        }),
        FullEvent::ThreadCreate { thread } => {
            Some(SyncEvent::ThreadUpsert(remote_channel(thread, true)))
        }
        FullEvent::ThreadUpdate { new, .. } => {
            Some(SyncEvent::ThreadUpsert(remote_channel(new, true)))
        }
        FullEvent::ThreadDelete { thread, .. } => Some(SyncEvent::ThreadDeleted {
            thread_id: thread.id.get(),
        }),
        FullEvent::GuildCreate { guild, .. } => Some(SyncEvent::GuildUpsert(RemoteGuild {
            id: guild.id.get(),
            name: guild.name.clone(),
            icon: guild.icon.map(|hash| hash.to_string()),
            description: guild.description.clone(),
            vanity_url_code: guild.vanity_url_code.clone(),
            approximate_member_count: Some(guild.member_count),
        })),
        FullEvent::GuildUpdate { new_data, .. } => {
            Some(SyncEvent::GuildUpsert(remote_guild(new_data)))
        }
        // An unavailable guild is an outage, not a removal.
        FullEvent::GuildDelete { incomplete, .. } if !incomplete.unavailable => {
            Some(SyncEvent::GuildLeft {
                guild_id: incomplete.id.get(),
            })
        }
        _ => None,
    }
}

/// [`RemoteContentClient`] over serenity's REST client. Nothing is read
/// from the gateway cache.
pub struct SerenityRemote {
    http: Arc<Http>,
    bot_id: UserId,
}

impl SerenityRemote {
    pub fn new(http: Arc<Http>, bot_id: u64) -> Self {
        Self {
            http,
            bot_id: UserId::new(bot_id),
        }
    }

    async fn bot_member(&self, guild_id: GuildId) -> Result<Member> {
        Ok(self.http.get_member(guild_id, self.bot_id).await?)
    }

    async fn guild_of(&self, channel_id: Snowflake) -> Result<GuildId> {
        let channel = self.http.get_channel(ChannelId::new(channel_id)).await?;
        channel
            .guild()
            .map(|c| c.guild_id)
            .ok_or_else(|| MirrorError::Remote(format!("channel {} is not in a guild", channel_id)))
    }
}

fn non_zero(id: Snowflake, what: &str) -> Result<Snowflake> {
    if id == 0 {
        return Err(MirrorError::Remote(format!("invalid {} id 0", what)));
    }
    Ok(id)
}

#[async_trait]
impl RemoteContentClient for SerenityRemote {
    async fn list_guilds(&self) -> Result<Vec<RemoteGuild>> {
        let mut guilds = Vec::new();
        let mut after: Option<GuildId> = None;
        loop {
            let page = self
                .http
                .get_guilds(after.map(GuildPagination::After), Some(GUILD_PAGE_SIZE))
                .await?;
            let fetched = page.len();
            after = page.last().map(|g| g.id);
            guilds.extend(page.into_iter().map(|g| RemoteGuild {
                id: g.id.get(),
                name: g.name,
                icon: g.icon.map(|hash| hash.to_string()),
                description: None,
                vanity_url_code: None,
                approximate_member_count: None,
            }));
            if (fetched as u64) < GUILD_PAGE_SIZE || after.is_none() {
                break;
            }
        }
        Ok(guilds)
    }

    async fn fetch_guild(&self, guild_id: Snowflake) -> Result<RemoteGuild> {
        let guild_id = GuildId::new(non_zero(guild_id, "guild")?);
        let guild = self.http.get_guild_with_counts(guild_id).await?;
        Ok(remote_guild(&guild))
    }

    async fn list_channels(&self, guild_id: Snowflake) -> Result<Vec<RemoteChannel>> {
        let guild_id = GuildId::new(non_zero(guild_id, "guild")?);
        let guild = self.http.get_guild(guild_id).await?;
        let member = self.bot_member(guild_id).await?;
        let needed = Permissions::VIEW_CHANNEL | Permissions::READ_MESSAGE_HISTORY;

        let channels = self.http.get_channels(guild_id).await?;
        Ok(channels
            .iter()
            .map(|c| {
                let can_read = guild.user_permissions_in(c, &member).contains(needed);
                remote_channel(c, can_read)
            })
            .collect())
    }

    async fn fetch_messages_after(
        &self,
        channel_id: Snowflake,
        cursor: Option<Snowflake>,
        limit: u8,
    ) -> Result<Vec<RemoteMessage>> {
        let channel = ChannelId::new(non_zero(channel_id, "channel")?);
        // Snowflakes start at 1, so this is the start of the channel.
        let after = MessageId::new(cursor.unwrap_or(0).max(1));
        let builder = GetMessages::new()
            .after(after)
            .limit(limit.clamp(1, MAX_MESSAGE_PAGE_SIZE));
        let messages = channel.messages(&self.http, builder).await?;
        debug!(
            "Discord: fetched {} messages from {} after {}",
            messages.len(),
            channel_id,
            after
        );
        Ok(messages.iter().map(remote_message).collect())
    }

    async fn fetch_active_threads(&self, channel_id: Snowflake) -> Result<Vec<RemoteChannel>> {
        let guild_id = self.guild_of(non_zero(channel_id, "channel")?).await?;
        let active = self.http.get_guild_active_threads(guild_id).await?;
        Ok(active
            .threads
            .iter()
            .filter(|t| t.parent_id.map(|p| p.get()) == Some(channel_id))
            .map(|t| remote_channel(t, true))
            .collect())
    }

    async fn fetch_archived_threads(
        &self,
        channel_id: Snowflake,
        before: Option<DateTime<Utc>>,
    ) -> Result<ArchivedThreadsPage> {
        let channel = ChannelId::new(non_zero(channel_id, "channel")?);
        let before = before.map(archive_cursor);
        let data = self
            .http
            .get_channel_archived_public_threads(channel, before, Some(ARCHIVED_THREAD_PAGE_SIZE))
            .await?;
        Ok(ArchivedThreadsPage {
            threads: data.threads.iter().map(|t| remote_channel(t, true)).collect(),
            has_more: data.has_more,
        })
    }

    async fn create_invite(&self, channel_id: Snowflake) -> Result<String> {
        let channel = ChannelId::new(non_zero(channel_id, "channel")?);
        let invite = channel
            .create_invite(&self.http, CreateInvite::new().max_age(0).unique(false))
            .await?;
        Ok(invite.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serenity::model::prelude::MessageReference;

    fn mock_message(id: u64, channel_id: u64, user_id: u64, content: &str) -> Message {
        let mut msg = Message::default();
        msg.id = MessageId::new(id);
        msg.channel_id = ChannelId::new(channel_id);
        msg.guild_id = Some(GuildId::new(1));
        msg.author = User::default();
        msg.author.id = UserId::new(user_id);
        msg.author.name = "alice".to_string();
        msg.content = content.to_string();
        msg.timestamp = Timestamp::now();
        msg
    }

    #[test]
    fn test_message_conversion() {
        let mut msg = mock_message(101, 10, 7, "hello");
        msg.pinned = true;
        msg.message_reference = Some(MessageReference::from((
            ChannelId::new(10),
            MessageId::new(100),
        )));

        let remote = remote_message(&msg);
        assert_eq!(remote.id, 101);
        assert_eq!(remote.guild_id, Some(1));
        assert_eq!(remote.author.as_ref().map(|a| a.id), Some(7));
        assert_eq!(remote.reference_id, Some(100));
        assert!(remote.pinned);
        assert!(!remote.is_system());
        assert!(remote.timestamp.is_some());
    }

    #[test]
    fn test_timestamps_keep_milliseconds() {
        let ts = Timestamp::parse("2024-05-01T10:00:07.250Z").unwrap();
        let converted = timestamp(&ts).unwrap();
        assert_eq!(converted.timestamp(), 1_714_557_607);
        assert_eq!(converted.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_archive_cursor_rounds_up() {
        let whole = Utc.timestamp_opt(1_714_557_607, 0).unwrap();
        let partial = Utc.timestamp_opt(1_714_557_607, 250_000_000).unwrap();
        assert_eq!(archive_cursor(whole), 1_714_557_607);
        assert_eq!(archive_cursor(partial), 1_714_557_608);
    }

    #[test]
    fn test_channel_kinds() {
        assert_eq!(channel_kind(ChannelType::Text), ChannelKind::Text);
        assert_eq!(channel_kind(ChannelType::News), ChannelKind::Announcement);
        assert_eq!(channel_kind(ChannelType::Forum), ChannelKind::Forum);
        assert_eq!(channel_kind(ChannelType::PublicThread), ChannelKind::Thread);
        assert_eq!(channel_kind(ChannelType::Voice), ChannelKind::Other);
    }

    #[test]
    fn test_dm_messages_are_ignored() {
        let mut msg = mock_message(101, 10, 7, "hi");
        msg.guild_id = None;
        let event = FullEvent::Message { new_message: msg };
        assert!(sync_event(&event).is_none());
    }

    #[test]
    fn test_bulk_delete_event() {
        let event = FullEvent::MessageDeleteBulk {
            channel_id: ChannelId::new(10),
            multiple_deleted_messages_ids: vec![MessageId::new(1), MessageId::new(2)],
            guild_id: Some(GuildId::new(1)),
        };
        match sync_event(&event) {
            Some(SyncEvent::MessagesDeleted { message_ids }) => assert_eq!(message_ids, vec![1, 2]),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
