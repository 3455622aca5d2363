use tracing::{info, warn};

use crate::model::{ChannelSettings, ChannelSettingsPatch};
use crate::remote::RemoteContentClient;
use crate::store::ContentStore;

/// Creates and stores a permanent invite for a channel that has none.
/// Returns the code that was stored. Failures are logged and swallowed so a
/// missing CREATE_INSTANT_INVITE permission never blocks a crawl.
pub async fn ensure_invite(
    remote: &dyn RemoteContentClient,
    store: &dyn ContentStore,
    settings: &ChannelSettings,
) -> Option<String> {
    if settings.invite_code.is_some() {
        return None;
    }

    let code = match remote.create_invite(settings.channel_id).await {
        Ok(code) => code,
        Err(e) => {
            warn!(
                "Indexer: could not create invite for channel {}: {}",
                settings.channel_id, e
            );
            return None;
        }
    };

    let patch = ChannelSettingsPatch::invite(code.clone());
    if let Err(e) = store
        .update_channel_settings(settings.channel_id, settings.server_id, &patch)
        .await
    {
        warn!(
            "Indexer: could not store invite for channel {}: {}",
            settings.channel_id, e
        );
        return None;
    }

    info!("Indexer: created invite {} for channel {}", code, settings.channel_id);
    Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::testing::ScriptedRemote;

    fn settings(db: &Database) -> ChannelSettings {
        db.set_channel_enabled(1, 10, true).unwrap();
        db.get_channel_settings(10).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_invite_is_created_once() {
        let db = Database::open_in_memory().unwrap();
        let remote = ScriptedRemote::default();

        let code = ensure_invite(&remote, &db, &settings(&db)).await;
        assert_eq!(code.as_deref(), Some("invite-10"));

        let stored = db.get_channel_settings(10).unwrap().unwrap();
        assert_eq!(stored.invite_code.as_deref(), Some("invite-10"));
        assert!(ensure_invite(&remote, &db, &stored).await.is_none());
        assert_eq!(remote.invite_calls(), 1);
    }

    #[tokio::test]
    async fn test_invite_failure_is_not_fatal() {
        let db = Database::open_in_memory().unwrap();
        let remote = ScriptedRemote::default();
        remote.deny_invites();

        assert!(ensure_invite(&remote, &db, &settings(&db)).await.is_none());
        let stored = db.get_channel_settings(10).unwrap().unwrap();
        assert_eq!(stored.invite_code, None);
        assert!(stored.indexing_enabled);
    }
}
