use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::error::Result;
use crate::model::Snowflake;
use crate::remote::{RemoteChannel, RemoteContentClient};

/// Threads seen while walking a forum, split around the cutoff.
#[derive(Debug, Default)]
pub struct DiscoveredThreads {
    /// Newer than the cutoff, ascending by id.
    pub new_threads: Vec<RemoteChannel>,
    /// At or below the cutoff. Candidates for re-crawl when they have replies
    /// past their own checkpoint.
    pub older_threads: Vec<RemoteChannel>,
}

impl DiscoveredThreads {
    /// Brand-new threads plus older threads whose last message is past their
    /// stored checkpoint, ascending by id. An older thread with messages but
    /// no checkpoint counts as outdated: nothing in it has been ingested yet.
    pub fn to_index(&self, checkpoints: &HashMap<Snowflake, Snowflake>) -> Vec<RemoteChannel> {
        let outdated = self.older_threads.iter().filter(|t| {
            match (t.last_message_id, checkpoints.get(&t.id)) {
                (Some(last), Some(checkpoint)) => last > *checkpoint,
                (Some(_), None) => true,
                (None, _) => false,
            }
        });

        let mut selected: Vec<RemoteChannel> = self
            .new_threads
            .iter()
            .chain(outdated)
            .cloned()
            .collect();
        selected.sort_by_key(|t| t.id);
        selected.dedup_by_key(|t| t.id);
        selected
    }
}

/// Enumerates a forum's active and archived threads.
pub struct ThreadDiscoverer {
    remote: Arc<dyn RemoteContentClient>,
    max_threads: usize,
}

impl ThreadDiscoverer {
    pub fn new(remote: Arc<dyn RemoteContentClient>, max_threads: usize) -> Self {
        Self {
            remote,
            max_threads: max_threads.max(1),
        }
    }

    #[instrument(skip(self))]
    pub async fn discover(
        &self,
        forum_id: Snowflake,
        cutoff: Option<Snowflake>,
    ) -> Result<DiscoveredThreads> {
        let mut seen: HashSet<Snowflake> = HashSet::new();
        let mut threads: Vec<RemoteChannel> = Vec::new();

        for thread in self.remote.fetch_active_threads(forum_id).await? {
            if seen.insert(thread.id) {
                threads.push(thread);
            }
        }

        let mut before = None;
        let mut pages = 0usize;
        while threads.len() < self.max_threads {
            let page = self.remote.fetch_archived_threads(forum_id, before).await?;
            pages += 1;
            if page.threads.is_empty() {
                break;
            }

            let oldest_id = page.threads.iter().map(|t| t.id).min();
            let next_before = page.threads.iter().filter_map(|t| t.archived_at).min();
            let before_len = threads.len();
            for thread in page.threads {
                if seen.insert(thread.id) {
                    threads.push(thread);
                }
            }
            if threads.len() == before_len {
                break;
            }

            // Everything further back is older than what we already indexed.
            if let (Some(cutoff), Some(oldest_id)) = (cutoff, oldest_id) {
                if oldest_id < cutoff {
                    break;
                }
            }
            if !page.has_more || next_before.is_none() || next_before == before {
                break;
            }
            before = next_before;
        }

        // Keep the newest threads when the forum is larger than the cap.
        threads.sort_by_key(|t| std::cmp::Reverse(t.id));
        threads.truncate(self.max_threads);
        threads.sort_by_key(|t| t.id);

        let (new_threads, older_threads): (Vec<_>, Vec<_>) = threads
            .into_iter()
            .partition(|t| cutoff.map_or(true, |c| t.id > c));

        debug!(
            "Thread discovery: forum {} has {} new and {} older threads ({} archive pages)",
            forum_id,
            new_threads.len(),
            older_threads.len(),
            pages
        );
        Ok(DiscoveredThreads {
            new_threads,
            older_threads,
        })
    }
}
