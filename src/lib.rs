//! Link Prober - subscription link decoder and live prober
//!
//! Extracts proxy links from subscription feeds, validates each one through an
//! external transport engine, ranks the survivors and queues publish batches
//! for a downstream publisher.

pub mod cycle;
pub mod proxy;
pub mod queue;
pub mod registry;
pub mod tui;

pub use proxy::*;

use anyhow::{bail, Context};
use clap::ValueEnum;
use std::path::PathBuf;
use std::time::Duration;

/// Application result type
pub type Result<T> = anyhow::Result<T>;

/// Timeout for a single geolocation request
const GEO_TIMEOUT_SECS: u64 = 5;

/// Where server countries are looked up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum GeoLookup {
    /// Skip geolocation
    Off,
    /// ip-api.com JSON API
    #[default]
    IpApi,
    /// Local MaxMind database (`--mmdb-path`)
    Mmdb,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file holding sources and settings
    pub db_path: PathBuf,
    /// Transport engine binary
    pub engine_path: PathBuf,
    /// Scratch directory for engine configs
    pub temp_dir: PathBuf,
    /// Directory the publisher reads batches from
    pub results_dir: PathBuf,
    /// Overflow pool file
    pub pool_file: PathBuf,
    /// Probes per window
    pub concurrency: usize,
    pub base_port: u16,
    /// Latency budget per probe
    pub max_latency: Duration,
    /// Default cycle interval when the registry has none
    pub interval: Duration,
    pub warmup: Duration,
    /// URL whose response proves a link works
    pub test_url: String,
    pub speed_test: bool,
    pub speed_test_url: String,
    pub service_tests: bool,
    pub batch_size: usize,
    /// Marker embedded in every published label
    pub channel_tag: String,
    pub selection_mode: SelectionMode,
    pub rank_policy: RankPolicy,
    /// How long pooled results stay eligible
    pub pool_ttl: Duration,
    pub mmdb_path: Option<PathBuf>,
    pub geo_lookup: GeoLookup,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("prober.sqlite"),
            engine_path: PathBuf::from("./xray"),
            temp_dir: PathBuf::from("./tmp"),
            results_dir: PathBuf::from("./results"),
            pool_file: PathBuf::from("./pool.json"),
            concurrency: DEFAULT_CONCURRENCY,
            base_port: DEFAULT_BASE_PORT,
            max_latency: Duration::from_millis(3000),
            interval: Duration::from_secs(30 * 60),
            warmup: Duration::from_millis(300),
            test_url: DEFAULT_TEST_URL.to_string(),
            speed_test: false,
            speed_test_url: DEFAULT_SPEED_TEST_URL.to_string(),
            service_tests: true,
            batch_size: 5,
            channel_tag: String::new(),
            selection_mode: SelectionMode::default(),
            rank_policy: RankPolicy::default(),
            pool_ttl: Duration::from_secs(24 * 60 * 60),
            mmdb_path: None,
            geo_lookup: GeoLookup::default(),
        }
    }
}

impl Config {
    /// Reject settings the prober cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.batch_size == 0 {
            bail!("publish batch size must be at least 1");
        }
        if self.base_port as usize + self.concurrency > u16::MAX as usize {
            bail!(
                "ports {}..{} exceed the valid port range",
                self.base_port,
                self.base_port as usize + self.concurrency
            );
        }
        if self.max_latency.is_zero() {
            bail!("latency budget must be greater than zero");
        }
        if self.geo_lookup == GeoLookup::Mmdb && self.mmdb_path.is_none() {
            bail!("mmdb geolocation requires an mmdb path");
        }
        Ok(())
    }

    /// Fail when the engine is given as a path that does not exist.
    ///
    /// Bare program names are resolved through `PATH` at launch.
    pub fn check_engine(&self) -> Result<()> {
        let is_path = self.engine_path.components().count() > 1;
        if is_path && !self.engine_path.exists() {
            bail!("engine binary not found: {}", self.engine_path.display());
        }
        Ok(())
    }

    pub fn probe_config(&self) -> ProbeConfig {
        let mut config = ProbeConfig::new()
            .with_engine_path(&self.engine_path)
            .with_temp_dir(&self.temp_dir)
            .with_warmup(self.warmup)
            .with_latency_timeout(self.max_latency)
            .with_test_url(self.test_url.clone());
        if !self.service_tests {
            config = config.with_services(Vec::new());
        }
        if self.speed_test {
            config = config.with_speed_test(self.speed_test_url.clone());
        }
        config
    }

    pub fn geo_resolver(&self) -> Result<GeoResolver> {
        match self.geo_lookup {
            GeoLookup::Off => Ok(GeoResolver::disabled()),
            GeoLookup::IpApi => GeoResolver::ip_api(Duration::from_secs(GEO_TIMEOUT_SECS)),
            GeoLookup::Mmdb => {
                let path = self
                    .mmdb_path
                    .as_deref()
                    .context("mmdb geolocation requires an mmdb path")?;
                GeoResolver::mmdb(path)
                    .with_context(|| format!("failed to open {}", path.display()))
            }
        }
    }
}
