use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    AccountRecord, BotServerSettings, ChannelRecord, ChannelSettings, ChannelSettingsPatch,
    MessageRecord, MirroredMedia, ServerRecord, Snowflake,
};

/// Document store the mirror writes into. All writes are upserts keyed by the
/// platform id, so the crawler and the gateway sync may interleave freely.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Inserts or refreshes a server and clears its kicked flag.
    async fn upsert_server(&self, server: &ServerRecord) -> Result<()>;

    async fn mark_server_kicked(&self, server_id: Snowflake) -> Result<()>;

    async fn upsert_channel(&self, channel: &ChannelRecord) -> Result<()>;

    /// Removes a channel and the messages mirrored from it. Returns whether
    /// a channel row existed.
    async fn delete_channel(&self, channel_id: Snowflake) -> Result<bool>;

    async fn find_channels_by_ids(&self, ids: &[Snowflake]) -> Result<Vec<ChannelRecord>>;

    async fn get_channel_settings_with_indexing_enabled(
        &self,
        server_id: Snowflake,
    ) -> Result<Vec<ChannelSettings>>;

    async fn find_channel_settings_by_ids(&self, ids: &[Snowflake])
        -> Result<Vec<ChannelSettings>>;

    /// Applies a partial update, creating the row when missing. A checkpoint
    /// in the patch never lowers the stored value.
    async fn update_channel_settings(
        &self,
        channel_id: Snowflake,
        server_id: Snowflake,
        patch: &ChannelSettingsPatch,
    ) -> Result<()>;

    async fn upsert_account(&self, account: &AccountRecord) -> Result<()>;

    /// Creates the row if missing. Existing permission and indexing flags are
    /// left as they are.
    async fn upsert_bot_server_settings(&self, settings: &BotServerSettings) -> Result<()>;

    /// Writes the batch atomically and returns the ids that did not exist
    /// before the call.
    async fn upsert_messages_batch(&self, messages: &[MessageRecord]) -> Result<Vec<Snowflake>>;

    /// Returns whether a message row existed.
    async fn delete_message(&self, message_id: Snowflake) -> Result<bool>;

    async fn record_mirrored_media(&self, media: &MirroredMedia) -> Result<()>;
}
