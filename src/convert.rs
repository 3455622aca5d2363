//! Remote snapshots to canonical records.

use thiserror::Error;

use crate::model::{
    AccountRecord, AttachmentRecord, ChannelRecord, EmbedRecord, MessageRecord, ReactionRecord,
    ServerRecord, Snowflake,
};
use crate::remote::{RemoteChannel, RemoteGuild, RemoteMessage, RemoteUser};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("message {message_id} has no author")]
    MissingAuthor { message_id: Snowflake },

    #[error("message {message_id} belongs to server {actual}, expected {expected}")]
    ServerMismatch {
        message_id: Snowflake,
        expected: Snowflake,
        actual: Snowflake,
    },
}

/// Where a batch of messages lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLocation {
    pub server_id: Snowflake,
    pub channel_id: Snowflake,
    /// Set when `channel_id` is a thread.
    pub parent_channel_id: Option<Snowflake>,
}

impl MessageLocation {
    pub fn channel(server_id: Snowflake, channel_id: Snowflake) -> Self {
        Self {
            server_id,
            channel_id,
            parent_channel_id: None,
        }
    }

    pub fn thread(server_id: Snowflake, thread_id: Snowflake, parent_id: Snowflake) -> Self {
        Self {
            server_id,
            channel_id: thread_id,
            parent_channel_id: Some(parent_id),
        }
    }
}

pub fn message_record(
    msg: &RemoteMessage,
    location: &MessageLocation,
) -> Result<MessageRecord, ConversionError> {
    let author = msg
        .author
        .as_ref()
        .ok_or(ConversionError::MissingAuthor { message_id: msg.id })?;

    if let Some(guild_id) = msg.guild_id {
        if guild_id != location.server_id {
            return Err(ConversionError::ServerMismatch {
                message_id: msg.id,
                expected: location.server_id,
                actual: guild_id,
            });
        }
    }

    // The starter message of a thread shares the thread's id; every other
    // message in the thread answers it.
    let question_id = location
        .parent_channel_id
        .filter(|_| msg.id != location.channel_id)
        .map(|_| location.channel_id);

    Ok(MessageRecord {
        id: msg.id,
        author_id: author.id,
        server_id: location.server_id,
        channel_id: location.channel_id,
        parent_channel_id: location.parent_channel_id,
        child_thread_id: msg.thread.as_ref().map(|t| t.id),
        question_id,
        reference_id: msg.reference_id,
        content: msg.content.clone(),
        flags: msg.flags,
        kind: msg.kind,
        pinned: msg.pinned,
        created_at: msg.timestamp,
        embeds: msg
            .embeds
            .iter()
            .map(|e| EmbedRecord {
                title: e.title.clone(),
                description: e.description.clone(),
                url: e.url.clone(),
                image_url: e.image_url.clone(),
                thumbnail_url: e.thumbnail_url.clone(),
            })
            .collect(),
        attachments: msg
            .attachments
            .iter()
            .map(|a| AttachmentRecord {
                id: a.id,
                filename: a.filename.clone(),
                url: a.url.clone(),
                content_type: a.content_type.clone(),
                size: a.size,
                width: a.width,
                height: a.height,
            })
            .collect(),
        reactions: msg
            .reactions
            .iter()
            .map(|r| ReactionRecord {
                emoji: r.emoji.clone(),
                count: r.count,
            })
            .collect(),
    })
}

pub fn account_record(user: &RemoteUser) -> AccountRecord {
    AccountRecord {
        id: user.id,
        name: user.display_name().to_string(),
        avatar: user.avatar.clone(),
    }
}

pub fn channel_record(channel: &RemoteChannel) -> ChannelRecord {
    ChannelRecord {
        id: channel.id,
        server_id: channel.guild_id,
        name: channel.name.clone(),
        kind: channel.kind,
        parent_id: channel.parent_id,
        archived_at: channel.archived_at,
    }
}

pub fn server_record(guild: &RemoteGuild) -> ServerRecord {
    ServerRecord {
        id: guild.id,
        name: guild.name.clone(),
        icon: guild.icon.clone(),
        description: guild.description.clone(),
        vanity_url_code: guild.vanity_url_code.clone(),
        approximate_member_count: guild.approximate_member_count,
    }
}
