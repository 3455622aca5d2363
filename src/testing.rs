//! In-memory fakes for the platform client and the media store.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::config::IndexingConfig;
use crate::error::{MirrorError, Result};
use crate::mirror::MediaMirror;
use crate::model::{ChannelKind, Snowflake};
use crate::remote::{
    ArchivedThreadsPage, RemoteChannel, RemoteContentClient, RemoteGuild, RemoteMessage,
    RemoteUser,
};

/// Default indexing settings with every delay removed and small write
/// chunks so batching is exercised.
pub fn fast_config() -> IndexingConfig {
    IndexingConfig {
        freshness_window: Duration::ZERO,
        channel_delay: Duration::ZERO,
        write_chunk_size: 10,
        write_concurrency: 3,
        write_jitter_min: Duration::ZERO,
        write_jitter_max: Duration::ZERO,
        ..Default::default()
    }
}

pub fn guild(id: Snowflake) -> RemoteGuild {
    RemoteGuild {
        id,
        name: format!("guild-{}", id),
        icon: None,
        description: None,
        vanity_url_code: None,
        approximate_member_count: Some(10),
    }
}

pub fn channel(id: Snowflake, guild_id: Snowflake, kind: ChannelKind) -> RemoteChannel {
    RemoteChannel {
        id,
        guild_id,
        name: format!("channel-{}", id),
        kind,
        parent_id: None,
        last_message_id: None,
        archived_at: None,
        bot_can_read: true,
    }
}

/// A thread whose archive time follows its id, so archive order and id
/// order agree.
pub fn thread(
    id: Snowflake,
    guild_id: Snowflake,
    parent_id: Snowflake,
    last_message_id: Option<Snowflake>,
) -> RemoteChannel {
    RemoteChannel {
        id,
        guild_id,
        name: format!("thread-{}", id),
        kind: ChannelKind::Thread,
        parent_id: Some(parent_id),
        last_message_id,
        archived_at: Some(archived_at(id)),
        bot_can_read: true,
    }
}

fn archived_at(id: Snowflake) -> DateTime<Utc> {
    Utc.timestamp_opt(1_600_000_000 + id as i64, 0).unwrap()
}

/// A plain user message with no guild id on the payload.
pub fn message(id: Snowflake, channel_id: Snowflake, author_id: Snowflake) -> RemoteMessage {
    RemoteMessage {
        id,
        channel_id,
        guild_id: None,
        author: Some(RemoteUser {
            id: author_id,
            name: format!("user{}", author_id),
            global_name: None,
            avatar: None,
            bot: false,
        }),
        content: format!("message {}", id),
        kind: 0,
        flags: 0,
        pinned: false,
        timestamp: None,
        embeds: Vec::new(),
        attachments: Vec::new(),
        reactions: Vec::new(),
        reference_id: None,
        thread: None,
    }
}

#[derive(Default)]
struct RemoteState {
    guilds: Vec<RemoteGuild>,
    failing_guilds: HashSet<Snowflake>,
    channels: HashMap<Snowflake, Vec<RemoteChannel>>,
    messages: HashMap<Snowflake, Vec<RemoteMessage>>,
    stuck_pages: HashMap<Snowflake, Vec<RemoteMessage>>,
    failing_channels: HashSet<Snowflake>,
    active_threads: HashMap<Snowflake, Vec<RemoteChannel>>,
    /// Newest archive first, plus the page size.
    archived_threads: HashMap<Snowflake, (Vec<RemoteChannel>, usize)>,
    archived_calls: HashMap<Snowflake, usize>,
    message_calls: HashMap<Snowflake, usize>,
    invite_calls: usize,
    deny_invites: bool,
}

/// Scripted platform client. Pages come back newest first, like the real
/// API, so callers have to sort.
#[derive(Default)]
pub struct ScriptedRemote {
    state: Mutex<RemoteState>,
}

impl ScriptedRemote {
    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap()
    }

    pub fn add_guild(&self, id: Snowflake) {
        self.state().guilds.push(guild(id));
    }

    pub fn fail_guild(&self, id: Snowflake) {
        self.state().failing_guilds.insert(id);
    }

    pub fn set_channels(&self, guild_id: Snowflake, channels: Vec<RemoteChannel>) {
        self.state().channels.insert(guild_id, channels);
    }

    pub fn add_messages(&self, channel_id: Snowflake, ids: Vec<Snowflake>) {
        let mut state = self.state();
        let messages = state.messages.entry(channel_id).or_default();
        for id in ids {
            if !messages.iter().any(|m| m.id == id) {
                messages.push(message(id, channel_id, 7));
            }
        }
    }

    pub fn attach_thread(&self, channel_id: Snowflake, message_id: Snowflake, thread: RemoteChannel) {
        let mut state = self.state();
        if let Some(msg) = state
            .messages
            .get_mut(&channel_id)
            .and_then(|msgs| msgs.iter_mut().find(|m| m.id == message_id))
        {
            msg.thread = Some(thread);
        }
    }

    /// Drops the author so the message fails conversion.
    pub fn strip_author(&self, channel_id: Snowflake, message_id: Snowflake) {
        let mut state = self.state();
        if let Some(msg) = state
            .messages
            .get_mut(&channel_id)
            .and_then(|msgs| msgs.iter_mut().find(|m| m.id == message_id))
        {
            msg.author = None;
        }
    }

    /// Makes the channel ignore the cursor and always return these ids.
    pub fn stuck_page(&self, channel_id: Snowflake, ids: Vec<Snowflake>) {
        let page = ids.into_iter().map(|id| message(id, channel_id, 7)).collect();
        self.state().stuck_pages.insert(channel_id, page);
    }

    pub fn fail_channel(&self, channel_id: Snowflake) {
        self.state().failing_channels.insert(channel_id);
    }

    pub fn set_active_threads(&self, channel_id: Snowflake, threads: Vec<RemoteChannel>) {
        self.state().active_threads.insert(channel_id, threads);
    }

    pub fn set_archived_threads(
        &self,
        channel_id: Snowflake,
        newest_first: Vec<RemoteChannel>,
        page_size: usize,
    ) {
        self.state()
            .archived_threads
            .insert(channel_id, (newest_first, page_size));
    }

    pub fn deny_invites(&self) {
        self.state().deny_invites = true;
    }

    pub fn archived_calls(&self, channel_id: Snowflake) -> usize {
        self.state().archived_calls.get(&channel_id).copied().unwrap_or(0)
    }

    pub fn message_calls(&self, channel_id: Snowflake) -> usize {
        self.state().message_calls.get(&channel_id).copied().unwrap_or(0)
    }

    pub fn invite_calls(&self) -> usize {
        self.state().invite_calls
    }
}

#[async_trait]
impl RemoteContentClient for ScriptedRemote {
    async fn list_guilds(&self) -> Result<Vec<RemoteGuild>> {
        Ok(self.state().guilds.clone())
    }

    async fn fetch_guild(&self, guild_id: Snowflake) -> Result<RemoteGuild> {
        let state = self.state();
        if state.failing_guilds.contains(&guild_id) {
            return Err(MirrorError::Remote(format!("guild {} unavailable", guild_id)));
        }
        state
            .guilds
            .iter()
            .find(|g| g.id == guild_id)
            .cloned()
            .ok_or_else(|| MirrorError::Remote(format!("unknown guild {}", guild_id)))
    }

    async fn list_channels(&self, guild_id: Snowflake) -> Result<Vec<RemoteChannel>> {
        Ok(self.state().channels.get(&guild_id).cloned().unwrap_or_default())
    }

    async fn fetch_messages_after(
        &self,
        channel_id: Snowflake,
        cursor: Option<Snowflake>,
        limit: u8,
    ) -> Result<Vec<RemoteMessage>> {
        let mut state = self.state();
        *state.message_calls.entry(channel_id).or_default() += 1;
        if state.failing_channels.contains(&channel_id) {
            return Err(MirrorError::Remote(format!("channel {} timed out", channel_id)));
        }
        if let Some(page) = state.stuck_pages.get(&channel_id) {
            return Ok(page.clone());
        }

        let after = cursor.unwrap_or(0);
        let mut page: Vec<RemoteMessage> = state
            .messages
            .get(&channel_id)
            .map(|msgs| msgs.iter().filter(|m| m.id > after).cloned().collect())
            .unwrap_or_default();
        page.sort_by_key(|m| m.id);
        page.truncate(limit as usize);
        page.reverse();
        Ok(page)
    }

    async fn fetch_active_threads(&self, channel_id: Snowflake) -> Result<Vec<RemoteChannel>> {
        Ok(self
            .state()
            .active_threads
            .get(&channel_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_archived_threads(
        &self,
        channel_id: Snowflake,
        before: Option<DateTime<Utc>>,
    ) -> Result<ArchivedThreadsPage> {
        let mut state = self.state();
        *state.archived_calls.entry(channel_id).or_default() += 1;
        let Some((threads, page_size)) = state.archived_threads.get(&channel_id) else {
            return Ok(ArchivedThreadsPage::default());
        };

        let eligible: Vec<&RemoteChannel> = threads
            .iter()
            .filter(|t| match (before, t.archived_at) {
                (None, _) => true,
                (Some(before), Some(at)) => at < before,
                (Some(_), None) => false,
            })
            .collect();
        Ok(ArchivedThreadsPage {
            threads: eligible.iter().take(*page_size).map(|t| (*t).clone()).collect(),
            has_more: eligible.len() > *page_size,
        })
    }

    async fn create_invite(&self, channel_id: Snowflake) -> Result<String> {
        let mut state = self.state();
        state.invite_calls += 1;
        if state.deny_invites {
            return Err(MirrorError::Remote("missing CREATE_INSTANT_INVITE".to_string()));
        }
        Ok(format!("invite-{}", channel_id))
    }
}

/// Media mirror that records requests instead of downloading.
#[derive(Default)]
pub struct RecordingMirror {
    requests: Mutex<Vec<String>>,
    failing_filename: Option<String>,
}

impl RecordingMirror {
    pub fn failing_on(filename: &str) -> Self {
        Self {
            failing_filename: Some(filename.to_string()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl MediaMirror for RecordingMirror {
    async fn mirror_from_url(
        &self,
        id: &str,
        filename: &str,
        _content_type: Option<&str>,
        url: &str,
    ) -> Result<String> {
        self.requests.lock().unwrap().push(url.to_string());
        if self.failing_filename.as_deref() == Some(filename) {
            return Err(MirrorError::Remote(format!("download of {} failed", url)));
        }
        Ok(format!("{}/{}", id, filename))
    }
}
