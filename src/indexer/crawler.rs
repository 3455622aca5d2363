use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::error::Result;
use crate::model::Snowflake;
use crate::remote::{RemoteContentClient, RemoteMessage};

/// Why a crawl stopped paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlStop {
    EmptyPage,
    ShortPage,
    MessageCap,
    NoProgress,
}

#[derive(Debug)]
pub struct Crawl {
    /// Ascending by id, never more than the configured cap.
    pub messages: Vec<RemoteMessage>,
    pub stop: CrawlStop,
    pub pages: usize,
}

/// Pages one channel's history forward from a checkpoint.
pub struct ChannelCrawler {
    remote: Arc<dyn RemoteContentClient>,
    page_size: u8,
    max_messages: usize,
}

impl ChannelCrawler {
    pub fn new(remote: Arc<dyn RemoteContentClient>, page_size: u8, max_messages: usize) -> Self {
        Self {
            remote,
            page_size: page_size.max(1),
            max_messages: max_messages.max(1),
        }
    }

    #[instrument(skip(self), fields(page_size = self.page_size))]
    pub async fn crawl(&self, channel_id: Snowflake, start_after: Option<Snowflake>) -> Result<Crawl> {
        let mut messages: Vec<RemoteMessage> = Vec::new();
        let mut cursor = start_after;
        let mut pages = 0usize;

        let stop = loop {
            let mut page = self
                .remote
                .fetch_messages_after(channel_id, cursor, self.page_size)
                .await?;
            pages += 1;

            if page.is_empty() {
                break CrawlStop::EmptyPage;
            }

            page.sort_by_key(|m| m.id);
            let fetched = page.len();
            let last_id = page.last().map(|m| m.id);

            if last_id <= cursor {
                warn!(
                    "Crawler: channel {} returned no new messages past {:?}, stopping",
                    channel_id, cursor
                );
                break CrawlStop::NoProgress;
            }

            // Anything at or below the cursor was already indexed.
            messages.extend(page.into_iter().filter(|m| Some(m.id) > cursor));
            cursor = last_id;

            if messages.len() >= self.max_messages {
                messages.truncate(self.max_messages);
                break CrawlStop::MessageCap;
            }
            if fetched < self.page_size as usize {
                break CrawlStop::ShortPage;
            }
        };

        debug!(
            "Crawler: channel {} fetched {} messages in {} pages ({:?})",
            channel_id,
            messages.len(),
            pages,
            stop
        );
        Ok(Crawl {
            messages,
            stop,
            pages,
        })
    }
}
