//! Keeps the mirror fresh between crawls by applying gateway events directly.
//!
//! Each event maps to a list of store mutations through [`mutations_for`],
//! a plain function of the event and what the store says about where the
//! event belongs. Nothing here reads or writes checkpoints.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::convert::{self, MessageLocation};
use crate::error::Result;
use crate::model::{
    AccountRecord, BotServerSettings, ChannelKind, ChannelRecord, MessageRecord, ServerRecord,
    Snowflake,
};
use crate::remote::{RemoteChannel, RemoteGuild, RemoteMessage};
use crate::store::ContentStore;

/// Platform events the mirror cares about, already lifted out of the
/// gateway payloads.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    GuildUpsert(RemoteGuild),
    GuildLeft { guild_id: Snowflake },
    ChannelUpsert(RemoteChannel),
    ChannelDeleted { channel_id: Snowflake },
    ThreadUpsert(RemoteChannel),
    ThreadDeleted { thread_id: Snowflake },
    MessageUpsert(RemoteMessage),
    MessageDeleted { message_id: Snowflake },
    MessagesDeleted { message_ids: Vec<Snowflake> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreMutation {
    UpsertServer(ServerRecord),
    MarkServerKicked(Snowflake),
    UpsertChannel(ChannelRecord),
    DeleteChannel(Snowflake),
    UpsertAccount(AccountRecord),
    UpsertBotSettings(BotServerSettings),
    UpsertMessage(MessageRecord),
    DeleteMessage(Snowflake),
}

/// Whether content events for a channel should be mirrored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// The event is not content-scoped (guild and channel metadata, deletes).
    Always,
    /// The owning channel has indexing enabled.
    Open(MessageLocation),
    Closed,
}

pub fn mutations_for(event: &SyncEvent, gate: &Gate) -> Vec<StoreMutation> {
    match event {
        SyncEvent::GuildUpsert(guild) => {
            vec![StoreMutation::UpsertServer(convert::server_record(guild))]
        }
        SyncEvent::GuildLeft { guild_id } => vec![StoreMutation::MarkServerKicked(*guild_id)],
        SyncEvent::ChannelUpsert(channel) => {
            if channel.kind == ChannelKind::Other {
                return Vec::new();
            }
            vec![StoreMutation::UpsertChannel(convert::channel_record(channel))]
        }
        SyncEvent::ChannelDeleted { channel_id } => vec![StoreMutation::DeleteChannel(*channel_id)],
        SyncEvent::ThreadUpsert(thread) => match gate {
            Gate::Closed => Vec::new(),
            _ => vec![StoreMutation::UpsertChannel(convert::channel_record(thread))],
        },
        SyncEvent::ThreadDeleted { thread_id } => vec![StoreMutation::DeleteChannel(*thread_id)],
        SyncEvent::MessageUpsert(msg) => {
            let Gate::Open(location) = gate else {
                return Vec::new();
            };
            message_mutations(msg, location)
        }
        SyncEvent::MessageDeleted { message_id } => vec![StoreMutation::DeleteMessage(*message_id)],
        SyncEvent::MessagesDeleted { message_ids } => message_ids
            .iter()
            .map(|id| StoreMutation::DeleteMessage(*id))
            .collect(),
    }
}

fn message_mutations(msg: &RemoteMessage, location: &MessageLocation) -> Vec<StoreMutation> {
    if msg.is_system() {
        return Vec::new();
    }
    let record = match convert::message_record(msg, location) {
        Ok(record) => record,
        Err(e) => {
            warn!("Sync: skipping message event: {}", e);
            return Vec::new();
        }
    };

    let mut mutations = Vec::with_capacity(3);
    if let Some(author) = &msg.author {
        mutations.push(StoreMutation::UpsertAccount(convert::account_record(author)));
        if author.bot {
            mutations.push(StoreMutation::UpsertBotSettings(BotServerSettings::new(
                author.id,
                location.server_id,
            )));
        }
    }
    mutations.push(StoreMutation::UpsertMessage(record));
    mutations
}

pub struct SyncEngine {
    store: Arc<dyn ContentStore>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }

    /// Applies one event and returns how many mutations were written.
    pub async fn apply(&self, event: &SyncEvent) -> Result<usize> {
        let gate = self.gate(event).await?;
        let mutations = mutations_for(event, &gate);
        if mutations.is_empty() {
            debug!("Sync: nothing to apply for {:?} ({:?})", event_name(event), gate);
            return Ok(0);
        }

        let count = mutations.len();
        for mutation in mutations {
            self.execute(mutation).await?;
        }
        Ok(count)
    }

    async fn gate(&self, event: &SyncEvent) -> Result<Gate> {
        match event {
            SyncEvent::ThreadUpsert(thread) => {
                let Some(parent) = thread.parent_id else {
                    return Ok(Gate::Closed);
                };
                Ok(if self.indexing_enabled(parent).await? {
                    Gate::Open(MessageLocation::thread(thread.guild_id, thread.id, parent))
                } else {
                    Gate::Closed
                })
            }
            SyncEvent::MessageUpsert(msg) => self.message_gate(msg).await,
            _ => Ok(Gate::Always),
        }
    }

    async fn message_gate(&self, msg: &RemoteMessage) -> Result<Gate> {
        let settings = self
            .store
            .find_channel_settings_by_ids(&[msg.channel_id])
            .await?;
        if let Some(settings) = settings.into_iter().find(|s| s.indexing_enabled) {
            return Ok(Gate::Open(MessageLocation::channel(
                settings.server_id,
                msg.channel_id,
            )));
        }

        // Threads are gated on their parent channel.
        let channel = self
            .store
            .find_channels_by_ids(&[msg.channel_id])
            .await?
            .into_iter()
            .next();
        let Some(ChannelRecord {
            kind: ChannelKind::Thread,
            parent_id: Some(parent),
            server_id,
            ..
        }) = channel
        else {
            return Ok(Gate::Closed);
        };
        Ok(if self.indexing_enabled(parent).await? {
            Gate::Open(MessageLocation::thread(server_id, msg.channel_id, parent))
        } else {
            Gate::Closed
        })
    }

    async fn indexing_enabled(&self, channel_id: Snowflake) -> Result<bool> {
        let settings = self
            .store
            .find_channel_settings_by_ids(&[channel_id])
            .await?;
        Ok(settings.iter().any(|s| s.indexing_enabled))
    }

    async fn execute(&self, mutation: StoreMutation) -> Result<()> {
        match mutation {
            StoreMutation::UpsertServer(server) => self.store.upsert_server(&server).await,
            StoreMutation::MarkServerKicked(id) => self.store.mark_server_kicked(id).await,
            StoreMutation::UpsertChannel(channel) => self.store.upsert_channel(&channel).await,
            StoreMutation::DeleteChannel(id) => {
                if !self.store.delete_channel(id).await? {
                    debug!("Sync: channel {} was not mirrored", id);
                }
                Ok(())
            }
            StoreMutation::UpsertAccount(account) => self.store.upsert_account(&account).await,
            StoreMutation::UpsertBotSettings(settings) => {
                self.store.upsert_bot_server_settings(&settings).await
            }
            StoreMutation::UpsertMessage(record) => {
                self.store
                    .upsert_messages_batch(std::slice::from_ref(&record))
                    .await?;
                Ok(())
            }
            StoreMutation::DeleteMessage(id) => {
                if !self.store.delete_message(id).await? {
                    debug!("Sync: message {} was not mirrored", id);
                }
                Ok(())
            }
        }
    }
}

fn event_name(event: &SyncEvent) -> &'static str {
    match event {
        SyncEvent::GuildUpsert(_) => "guild upsert",
        SyncEvent::GuildLeft { .. } => "guild left",
        SyncEvent::ChannelUpsert(_) => "channel upsert",
        SyncEvent::ChannelDeleted { .. } => "channel delete",
        SyncEvent::ThreadUpsert(_) => "thread upsert",
        SyncEvent::ThreadDeleted { .. } => "thread delete",
        SyncEvent::MessageUpsert(_) => "message upsert",
        SyncEvent::MessageDeleted { .. } => "message delete",
        SyncEvent::MessagesDeleted { .. } => "bulk message delete",
    }
}
