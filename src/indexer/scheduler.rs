//! Cron-driven trigger with a single-flight lock around each indexing run.

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::{watch, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::RunStats;
use crate::config::IndexingConfig;
use crate::error::{MirrorError, Result};

/// One full indexing pass.
#[async_trait]
pub trait IndexingRun: Send + Sync + 'static {
    async fn run(&self) -> anyhow::Result<RunStats>;
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(RunStats),
    /// Another run held the lock, or the scheduler is shutting down.
    Skipped,
    Failed(String),
}

pub struct IndexingScheduler {
    job: Arc<dyn IndexingRun>,
    schedule: Schedule,
    timezone: Tz,
    lock: Arc<Semaphore>,
    stop: watch::Sender<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// Accepts the usual 5-field form by pinning seconds to zero.
fn parse_schedule(expr: &str) -> Result<Schedule> {
    let expr = expr.trim();
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| MirrorError::Config(format!("invalid cron expression '{}': {}", expr, e)))
}

impl IndexingScheduler {
    pub fn new(job: Arc<dyn IndexingRun>, config: &IndexingConfig) -> Result<Self> {
        let schedule = parse_schedule(&config.cron)?;
        let timezone: Tz = config.timezone.parse().map_err(|e| {
            MirrorError::Config(format!("invalid timezone '{}': {}", config.timezone, e))
        })?;
        let (stop, _) = watch::channel(false);

        Ok(Self {
            job,
            schedule,
            timezone,
            lock: Arc::new(Semaphore::new(1)),
            stop,
            ticker: Mutex::new(None),
        })
    }

    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Runs the job now unless a run is already in flight. Never queues.
    pub async fn trigger(&self) -> RunOutcome {
        let permit = match self.lock.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                info!("Indexer: previous run still in progress, skipping this one");
                return RunOutcome::Skipped;
            }
            Err(TryAcquireError::Closed) => {
                info!("Indexer: scheduler is shutting down, not starting a run");
                return RunOutcome::Skipped;
            }
        };

        let started = Instant::now();
        let job = self.job.clone();
        // The permit moves into the task, so the lock stays held until the
        // run really ends even if this future is dropped.
        let joined = tokio::spawn(async move {
            let _permit = permit;
            job.run().await
        })
        .await;

        match joined {
            Ok(Ok(stats)) => {
                info!(
                    "Indexer: run finished in {:?}: {} guilds ({} failed), {} channels, {} threads, {} messages ({} new)",
                    started.elapsed(),
                    stats.guilds_indexed,
                    stats.guilds_failed,
                    stats.channels_indexed,
                    stats.threads_indexed,
                    stats.messages_written,
                    stats.messages_created
                );
                RunOutcome::Completed(stats)
            }
            Ok(Err(e)) => {
                error!("Indexer: run failed after {:?}: {:#}", started.elapsed(), e);
                RunOutcome::Failed(e.to_string())
            }
            Err(e) => {
                error!("Indexer: run aborted after {:?}: {}", started.elapsed(), e);
                RunOutcome::Failed(e.to_string())
            }
        }
    }

    /// Spawns the cron loop. Each fire runs in its own task so a long run
    /// lets the next fire observe the lock and skip.
    pub fn start(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        let mut stop = self.stop.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next) = scheduler.next_fire(now) else {
                    warn!("Indexer: cron schedule has no future fire times, stopping");
                    break;
                };
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                info!("Indexer: next run at {}", next.with_timezone(&scheduler.timezone));

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = stop.changed() => break,
                }

                let run = Arc::clone(&scheduler);
                tokio::spawn(async move {
                    run.trigger().await;
                });
            }
        });

        if let Ok(mut ticker) = self.ticker.lock() {
            *ticker = Some(handle);
        }
    }

    /// Stops firing, then waits for an in-flight run to release the lock.
    /// Later triggers are skipped.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);
        let ticker = self.ticker.lock().ok().and_then(|mut t| t.take());
        if let Some(ticker) = ticker {
            let _ = ticker.await;
        }

        if self.lock.available_permits() == 0 {
            info!("Indexer: waiting for the current run to finish");
        }
        match self.lock.acquire().await {
            Ok(permit) => {
                self.lock.close();
                drop(permit);
            }
            Err(_) => self.lock.close(),
        }
        info!("Indexer: scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Blocks inside `run` until the test releases it.
    struct GatedRun {
        started: Notify,
        release: Semaphore,
        runs: AtomicUsize,
    }

    impl GatedRun {
        fn new() -> Self {
            Self {
                started: Notify::new(),
                release: Semaphore::new(0),
                runs: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl IndexingRun for GatedRun {
        async fn run(&self) -> anyhow::Result<RunStats> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.release.acquire().await?.forget();
            Ok(RunStats::default())
        }
    }

    struct FailingRun;

    #[async_trait]
    impl IndexingRun for FailingRun {
        async fn run(&self) -> anyhow::Result<RunStats> {
            anyhow::bail!("store unavailable")
        }
    }

    struct PanickingRun;

    #[async_trait]
    impl IndexingRun for PanickingRun {
        async fn run(&self) -> anyhow::Result<RunStats> {
            panic!("boom")
        }
    }

    fn scheduler(job: Arc<dyn IndexingRun>) -> Arc<IndexingScheduler> {
        Arc::new(IndexingScheduler::new(job, &IndexingConfig::default()).unwrap())
    }

    #[test]
    fn test_five_field_cron_is_accepted() {
        let s = scheduler(Arc::new(FailingRun));
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        assert_eq!(
            s.next_fire(after),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_schedule_honours_timezone() {
        let config = IndexingConfig {
            cron: "0 9 * * *".to_string(),
            timezone: "Europe/Berlin".to_string(),
            ..Default::default()
        };
        let s = IndexingScheduler::new(Arc::new(FailingRun), &config).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            s.next_fire(after),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_invalid_schedule_is_a_config_error() {
        let bad_cron = IndexingConfig {
            cron: "every six hours".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            IndexingScheduler::new(Arc::new(FailingRun), &bad_cron),
            Err(MirrorError::Config(_))
        ));

        let bad_tz = IndexingConfig {
            timezone: "Mars/Olympus".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            IndexingScheduler::new(Arc::new(FailingRun), &bad_tz),
            Err(MirrorError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_second_trigger_skips_while_running() {
        let job = Arc::new(GatedRun::new());
        let s = scheduler(job.clone());

        let first = tokio::spawn({
            let s = s.clone();
            async move { s.trigger().await }
        });
        job.started.notified().await;

        assert!(matches!(s.trigger().await, RunOutcome::Skipped));
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);

        job.release.add_permits(1);
        assert!(matches!(first.await.unwrap(), RunOutcome::Completed(_)));

        // Lock is free again.
        job.release.add_permits(1);
        assert!(matches!(s.trigger().await, RunOutcome::Completed(_)));
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_run_releases_lock() {
        let s = scheduler(Arc::new(FailingRun));
        assert!(matches!(s.trigger().await, RunOutcome::Failed(msg) if msg.contains("store unavailable")));
        assert!(matches!(s.trigger().await, RunOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_panicking_run_is_contained() {
        let s = scheduler(Arc::new(PanickingRun));
        assert!(matches!(s.trigger().await, RunOutcome::Failed(_)));
        assert!(matches!(s.trigger().await, RunOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_run() {
        let job = Arc::new(GatedRun::new());
        let s = scheduler(job.clone());
        s.start();

        let run = tokio::spawn({
            let s = s.clone();
            async move { s.trigger().await }
        });
        job.started.notified().await;

        let mut shutdown = tokio::spawn({
            let s = s.clone();
            async move { s.shutdown().await }
        });
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut shutdown)
                .await
                .is_err(),
            "shutdown must wait for the run"
        );

        job.release.add_permits(1);
        shutdown.await.unwrap();
        assert!(matches!(run.await.unwrap(), RunOutcome::Completed(_)));
        assert!(matches!(s.trigger().await, RunOutcome::Skipped));
    }
}
