//! Single choke point for moving a channel's `last_indexed_snowflake`.

use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{ChannelSettingsPatch, Snowflake};
use crate::store::ContentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Advanced {
        from: Option<Snowflake>,
        to: Snowflake,
    },
    Rejected {
        attempted: Snowflake,
        current: Snowflake,
    },
}

impl CheckpointOutcome {
    pub fn advanced(&self) -> bool {
        matches!(self, CheckpointOutcome::Advanced { .. })
    }
}

/// Moves a channel checkpoint forward. A value at or below the current one
/// is logged and dropped; it usually means an ordering bug upstream.
pub async fn advance(
    store: &dyn ContentStore,
    server_id: Snowflake,
    channel_id: Snowflake,
    new_value: Snowflake,
    current: Option<Snowflake>,
) -> Result<CheckpointOutcome> {
    if let Some(current) = current {
        if new_value <= current {
            warn!(
                "Checkpoint: rejected regression for channel {} ({} <= {})",
                channel_id, new_value, current
            );
            return Ok(CheckpointOutcome::Rejected {
                attempted: new_value,
                current,
            });
        }
    }

    store
        .update_channel_settings(
            channel_id,
            server_id,
            &ChannelSettingsPatch::checkpoint(new_value),
        )
        .await?;
    debug!(
        "Checkpoint: channel {} advanced {:?} -> {}",
        channel_id, current, new_value
    );
    Ok(CheckpointOutcome::Advanced {
        from: current,
        to: new_value,
    })
}
