use std::sync::Arc;

use mirrorcord::discord::{self, SerenityRemote};
use mirrorcord::indexer::{Indexer, IndexingScheduler};
use mirrorcord::mirror::{FsMediaMirror, MediaMirror};
use mirrorcord::sync::SyncEngine;
use mirrorcord::{config::Config, db::Database, Data, Error};
use poise::serenity_prelude as serenity;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Loaded configuration: {:?}", config);
    let discord_token = config.discord_token.clone();

    let db = Database::new(&config)?;
    db.execute_init()?;
    let store = Arc::new(db);

    // REST client for the crawler, independent of the gateway cache
    let http = Arc::new(serenity::Http::new(&discord_token));
    let bot_user = http.get_current_user().await?;
    info!("Authenticated as {} ({})", bot_user.name, bot_user.id);

    let mirror: Option<Arc<dyn MediaMirror>> = if config.media_mirror_enabled {
        Some(Arc::new(FsMediaMirror::from_config(&config, reqwest::Client::new())))
    } else {
        None
    };

    let scheduler = if config.indexing.enabled {
        let remote = Arc::new(SerenityRemote::new(http.clone(), bot_user.id.get()));
        let indexer = Arc::new(Indexer::new(
            remote,
            store.clone(),
            mirror,
            config.indexing.clone(),
        ));
        let scheduler = Arc::new(IndexingScheduler::new(indexer, &config.indexing)?);
        scheduler.start();
        Some(scheduler)
    } else {
        info!("Indexing disabled, only live events will be mirrored");
        None
    };

    let sync = Arc::new(SyncEngine::new(store));

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions::<Data, Error> {
            commands: vec![],
            event_handler: |_ctx, event, _framework, data| {
                Box::pin(async move {
                    if let Some(sync_event) = discord::sync_event(event) {
                        match data.sync.apply(&sync_event).await {
                            Ok(n) => debug!("Applied {} mutations for {}", n, event.snake_case_name()),
                            Err(e) => warn!("Failed to apply {}: {}", event.snake_case_name(), e),
                        }
                    }
                    Ok(())
                })
            },
            ..Default::default()
        })
        .setup(|_ctx, ready, _framework| {
            Box::pin(async move {
                info!("Connected to gateway as {} in {} guilds", ready.user.name, ready.guilds.len());
                Ok(Data { sync })
            })
        })
        .build();

    let intents = serenity::GatewayIntents::non_privileged()
        | serenity::GatewayIntents::MESSAGE_CONTENT
        | serenity::GatewayIntents::GUILD_MESSAGES;

    let mut client = serenity::ClientBuilder::new(&discord_token, intents)
        .framework(framework)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create client: {}", e))?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Shutting down gateway...");
            shard_manager.shutdown_all().await;
        }
    });

    info!("Starting bot...");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    // Let an in-flight crawl finish its writes before exiting
    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }

    Ok(())
}
