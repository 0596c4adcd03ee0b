//! Test cycles and the recurring timer that drives them
//!
//! One cycle fetches every registered feed, probes its candidates window by
//! window and queues a publish batch. Cycles never overlap: a tick that fires
//! while a cycle is still running is skipped.

use crate::proxy::checker::LinkProber;
use crate::proxy::crawler::{sanitize_name, FeedFetcher};
use crate::proxy::models::{ProbeResult, ProbeTarget};
use crate::proxy::parser::LinkParser;
use crate::proxy::scheduler::{BatchScheduler, ProbeEvent};
use crate::proxy::selector::{Aggregator, SelectionMode};
use crate::queue::OutputQueue;
use crate::registry::SourceRegistry;
use crate::{Config, Result};
use anyhow::Context;
use rand::seq::SliceRandom;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Source name used for batches in merged mode
const MERGED_SOURCE: &str = "merged";

/// Counters for one finished cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub sources: usize,
    pub failed_sources: usize,
    pub candidates: usize,
    pub probed: usize,
    pub passed: usize,
    pub published: usize,
    pub pooled: usize,
}

/// Everything needed to run one test cycle
pub struct CycleDriver {
    fetcher: FeedFetcher,
    prober: LinkProber,
    scheduler: BatchScheduler,
    aggregator: Aggregator,
    queue: OutputQueue,
    mode: SelectionMode,
    pool_ttl: chrono::Duration,
    temp_dir: PathBuf,
}

impl CycleDriver {
    pub fn from_config(config: &Config) -> Result<Self> {
        let prober = LinkProber::with_config(config.probe_config()).with_geo(config.geo_resolver()?);
        let pool_ttl = chrono::Duration::from_std(config.pool_ttl).context("pool ttl out of range")?;

        Ok(Self {
            fetcher: FeedFetcher::new()?,
            prober,
            scheduler: BatchScheduler::new(config.concurrency, config.base_port),
            aggregator: Aggregator::new(config.rank_policy, config.batch_size)
                .with_marker(config.channel_tag.clone()),
            queue: OutputQueue::new(&config.results_dir, &config.pool_file),
            mode: config.selection_mode,
            pool_ttl,
            temp_dir: config.temp_dir.clone(),
        })
    }

    /// Report probe progress to `sender`
    pub fn with_events(mut self, sender: UnboundedSender<ProbeEvent>) -> Self {
        self.scheduler = self.scheduler.with_events(sender);
        self
    }

    pub fn queue(&self) -> &OutputQueue {
        &self.queue
    }

    /// Run one full cycle over every registered source.
    ///
    /// Only a registry failure aborts the cycle; feed failures skip the source.
    pub async fn run_cycle(&self, registry: &SourceRegistry) -> Result<CycleReport> {
        let span = info_span!("cycle", id = %Uuid::new_v4());
        async {
            let mut sources = registry
                .list_sources()
                .await
                .context("failed to list sources")?;
            sources.shuffle(&mut rand::rng());
            info!("Starting test cycle with {} sources", sources.len());

            self.prepare()?;
            let mut report = CycleReport {
                sources: sources.len(),
                ..CycleReport::default()
            };
            let mut merged = Vec::new();

            for source in &sources {
                let name = source.name();
                let feed = self.fetcher.fetch_feed(&name, &source.url).await;
                if let Some(e) = &feed.error {
                    warn!("Failed to fetch {}: {}", source.url, e);
                    report.failed_sources += 1;
                    continue;
                }
                report.candidates += feed.candidates.len();

                let targets: Vec<ProbeTarget> = feed
                    .candidates
                    .iter()
                    .filter_map(LinkParser::decode_target)
                    .collect();
                info!(
                    "Found {} unique links in {} ({} decodable)",
                    feed.candidates.len(),
                    name,
                    targets.len()
                );

                let results = self.probe_targets(&targets, &name).await;
                report.probed += targets.len();
                report.passed += results.len();

                match self.mode {
                    SelectionMode::PerSource => {
                        if let Err(e) = self.publish_into(&name, results, &mut report) {
                            error!("Failed to queue results for {}: {:#}", name, e);
                        }
                    }
                    SelectionMode::Merged => merged.extend(results),
                }
            }

            if self.mode == SelectionMode::Merged {
                self.publish_into(MERGED_SOURCE, merged, &mut report)?;
            }

            info!(
                "Cycle finished: {} passed of {} probed, {} published, {} pooled",
                report.passed, report.probed, report.published, report.pooled
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Probe every link in a local file and queue a batch for it
    pub async fn check_file(&self, path: &Path) -> Result<CycleReport> {
        let targets = LinkParser::parse_file(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let source = path
            .file_stem()
            .map(|stem| sanitize_name(&stem.to_string_lossy()))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "file".to_string());

        let span = info_span!("cycle", id = %Uuid::new_v4(), source = %source);
        async {
            self.prepare()?;
            info!("Testing {} links from {}", targets.len(), path.display());
            let results = self.probe_targets(&targets, &source).await;
            let mut report = CycleReport {
                sources: 1,
                candidates: targets.len(),
                probed: targets.len(),
                passed: results.len(),
                ..CycleReport::default()
            };
            self.publish_into(&source, results, &mut report)?;
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Probe targets without publishing
    pub async fn probe_targets(&self, targets: &[ProbeTarget], source: &str) -> Vec<ProbeResult> {
        self.scheduler.run_probes(&self.prober, targets, source).await
    }

    /// Select a batch from `fresh` plus the pool, write it and store the overflow
    pub fn publish(&self, source: &str, fresh: Vec<ProbeResult>) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        self.publish_into(source, fresh, &mut report)?;
        Ok(report)
    }

    fn publish_into(
        &self,
        source: &str,
        fresh: Vec<ProbeResult>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let pooled = self.queue.load_pool(self.pool_ttl);
        if fresh.is_empty() && pooled.is_empty() {
            return Ok(());
        }

        let selection = self.aggregator.select(fresh, pooled, &mut rand::rng());
        if !selection.batch.is_empty() {
            let path = self.queue.write_batch(source, &selection.batch)?;
            info!(
                "Queued {} results for {} in {}",
                selection.batch.len(),
                source,
                path.display()
            );
        }
        self.queue.store_pool(&selection.overflow)?;

        report.published += selection.batch.len();
        report.pooled = selection.overflow.len();
        Ok(())
    }

    fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.temp_dir)
            .with_context(|| format!("failed to create {}", self.temp_dir.display()))?;
        self.queue.ensure_dirs()
    }
}

/// Owns the single handle of the recurring tick task
#[derive(Debug, Default)]
pub struct CycleTimer {
    handle: Option<JoinHandle<()>>,
    period: Option<Duration>,
}

impl CycleTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `tick` every `period`, first after one full period.
    ///
    /// Re-arming cancels the previous schedule.
    pub fn arm<F>(&mut self, period: Duration, tick: F)
    where
        F: Fn() + Send + 'static,
    {
        self.cancel();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                tick();
            }
        });
        self.handle = Some(handle);
        self.period = Some(period);
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.period = None;
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for CycleTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Top-level controller of scheduled mode
#[derive(Clone)]
pub struct Lifecycle {
    driver: Arc<CycleDriver>,
    registry: SourceRegistry,
    guard: Arc<Semaphore>,
    default_interval: Duration,
    interval_tx: UnboundedSender<Duration>,
}

impl Lifecycle {
    /// Build the controller and the receiver of interval updates
    pub fn new(
        driver: CycleDriver,
        registry: SourceRegistry,
        default_interval: Duration,
    ) -> (Self, UnboundedReceiver<Duration>) {
        let (interval_tx, interval_rx) = mpsc::unbounded_channel();
        let lifecycle = Self {
            driver: Arc::new(driver),
            registry,
            guard: Arc::new(Semaphore::new(1)),
            default_interval,
            interval_tx,
        };
        (lifecycle, interval_rx)
    }

    /// Start a cycle in the background unless one is already running.
    ///
    /// Returns the task handle, or `None` when the tick was skipped.
    pub fn spawn_cycle(&self) -> Option<JoinHandle<()>> {
        let Ok(permit) = Arc::clone(&self.guard).try_acquire_owned() else {
            info!("Previous cycle still running, skipping this tick");
            return None;
        };

        let this = self.clone();
        Some(tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = this.driver.run_cycle(&this.registry).await {
                error!("Test cycle aborted: {:#}", e);
            }
            match this.registry.interval(this.default_interval).await {
                Ok(interval) => {
                    let _ = this.interval_tx.send(interval);
                }
                Err(e) => warn!("Failed to read cycle interval: {}", e),
            }
        }))
    }

    /// Run cycles until Ctrl-C, re-arming the timer when the interval changes
    pub async fn run(self, mut interval_rx: UnboundedReceiver<Duration>) -> Result<()> {
        let interval = self
            .registry
            .interval(self.default_interval)
            .await
            .unwrap_or(self.default_interval);

        let mut timer = CycleTimer::new();
        let ticker = self.clone();
        timer.arm(interval, move || {
            ticker.spawn_cycle();
        });
        info!("Scheduled test cycles every {}s", interval.as_secs());
        self.spawn_cycle();

        loop {
            tokio::select! {
                Some(next) = interval_rx.recv() => {
                    if timer.period() != Some(next) {
                        info!("Cycle interval changed to {}s", next.as_secs());
                        let ticker = self.clone();
                        timer.arm(next, move || {
                            ticker.spawn_cycle();
                        });
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down");
                    timer.cancel();
                    break;
                }
            }
        }

        Ok(())
    }

    /// Run a single cycle and wait for it
    pub async fn run_once(&self) -> Result<CycleReport> {
        self.driver.run_cycle(&self.registry).await
    }
}
