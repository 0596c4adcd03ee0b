//! Live probing of decoded links through the transport engine
//!
//! Each probe owns one engine process and one temporary config file for its
//! whole lifetime. [`EngineHarness`] pairs the two so that both are released
//! on every exit path: explicitly via [`EngineHarness::shutdown`], or by drop
//! (`kill_on_drop` plus [`TempPath`] removal) if the probe future is dropped.

use crate::proxy::geo::GeoResolver;
use crate::proxy::models::{ProbeResult, ProbeTarget, Protocol};
use crate::proxy::outbound::{EngineConfig, OutboundBuilder, LOOPBACK};
use chrono::Utc;
use futures::future::join_all;
use reqwest::{Client, Proxy as ReqwestProxy, StatusCode};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempPath;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Default engine binary
const DEFAULT_ENGINE_PATH: &str = "./xray";

/// Default directory for temporary engine configs
const DEFAULT_TEMP_DIR: &str = "./tmp";

/// Time the engine gets to bind its listener
const DEFAULT_WARMUP_MS: u64 = 300;

/// Default latency budget in milliseconds
const DEFAULT_LATENCY_TIMEOUT_MS: u64 = 3000;

/// Default low-payload URL for the latency check
pub const DEFAULT_TEST_URL: &str = "http://www.gstatic.com/generate_204";

/// Timeout for each auxiliary service check
const DEFAULT_SERVICE_TIMEOUT_SECS: u64 = 5;

/// Default reference payload for throughput tests
pub const DEFAULT_SPEED_TEST_URL: &str = "http://cachefly.cachefly.net/5mb.test";

const DEFAULT_SPEED_TEST_TIMEOUT_SECS: u64 = 20;

/// A named external service whose reachability is reported as a tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCheck {
    pub url: String,
    pub tag: String,
}

impl ServiceCheck {
    pub fn new(url: &str, tag: &str) -> Self {
        Self {
            url: url.to_string(),
            tag: tag.to_string(),
        }
    }

    /// The default service list
    pub fn defaults() -> Vec<Self> {
        vec![
            ServiceCheck::new("https://music.youtube.com", "#YouTube_Music"),
            ServiceCheck::new("https://www.spotify.com", "#Spotify"),
            ServiceCheck::new("https://chat.openai.com", "#ChatGPT"),
            ServiceCheck::new("https://gemini.google.com", "#Gemini"),
        ]
    }
}

/// Configuration for the probe runner
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Transport engine binary, launched as `<engine> -c <config>`
    pub engine_path: PathBuf,
    /// Directory for temporary engine configs
    pub temp_dir: PathBuf,
    /// Delay between engine launch and the first request
    pub warmup: Duration,
    /// Bound on the latency request
    pub latency_timeout: Duration,
    /// URL fetched for the latency measurement
    pub test_url: String,
    /// Auxiliary services to check
    pub services: Vec<ServiceCheck>,
    pub service_timeout: Duration,
    /// Reference payload for throughput; `None` disables the speed test
    pub speed_test_url: Option<String>,
    pub speed_test_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            engine_path: PathBuf::from(DEFAULT_ENGINE_PATH),
            temp_dir: PathBuf::from(DEFAULT_TEMP_DIR),
            warmup: Duration::from_millis(DEFAULT_WARMUP_MS),
            latency_timeout: Duration::from_millis(DEFAULT_LATENCY_TIMEOUT_MS),
            test_url: DEFAULT_TEST_URL.to_string(),
            services: ServiceCheck::defaults(),
            service_timeout: Duration::from_secs(DEFAULT_SERVICE_TIMEOUT_SECS),
            speed_test_url: None,
            speed_test_timeout: Duration::from_secs(DEFAULT_SPEED_TEST_TIMEOUT_SECS),
        }
    }
}

impl ProbeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engine_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.engine_path = path.into();
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn with_latency_timeout(mut self, timeout: Duration) -> Self {
        self.latency_timeout = timeout;
        self
    }

    pub fn with_test_url(mut self, url: String) -> Self {
        self.test_url = url;
        self
    }

    pub fn with_services(mut self, services: Vec<ServiceCheck>) -> Self {
        self.services = services;
        self
    }

    pub fn with_service_timeout(mut self, timeout: Duration) -> Self {
        self.service_timeout = timeout;
        self
    }

    pub fn with_speed_test(mut self, url: String) -> Self {
        self.speed_test_url = Some(url);
        self
    }

    pub fn with_speed_test_timeout(mut self, timeout: Duration) -> Self {
        self.speed_test_timeout = timeout;
        self
    }
}

/// Why a probe produced no result
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("protocol {0} cannot be carried by the engine")]
    Unsupported(Protocol),
    #[error("failed to encode engine config: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write engine config: {0}")]
    WriteConfig(std::io::Error),
    #[error("failed to launch engine: {0}")]
    Launch(std::io::Error),
    #[error("engine exited during warm-up ({0})")]
    EngineExited(ExitStatus),
    #[error("timed out")]
    Timeout,
    #[error("request failed: {0}")]
    Request(reqwest::Error),
    #[error("HTTP status: {0}")]
    Status(StatusCode),
}

impl ProbeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProbeError::Timeout)
    }
}

impl From<reqwest::Error> for ProbeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProbeError::Timeout
        } else {
            ProbeError::Request(e)
        }
    }
}

/// A running engine process and the temporary config it was started with
pub struct EngineHarness {
    child: Child,
    config_path: TempPath,
    port: u16,
}

impl EngineHarness {
    /// Write `config` to a uniquely named file in `temp_dir` and start the engine on it
    pub fn launch(
        engine: &Path,
        temp_dir: &Path,
        config: &EngineConfig,
        port: u16,
    ) -> Result<Self, ProbeError> {
        let json = config.to_json()?;

        let mut file = tempfile::Builder::new()
            .prefix("probe_")
            .suffix(".json")
            .tempfile_in(temp_dir)
            .map_err(ProbeError::WriteConfig)?;
        file.write_all(json.as_bytes())
            .and_then(|_| file.flush())
            .map_err(ProbeError::WriteConfig)?;
        let config_path = file.into_temp_path();

        let child = Command::new(engine)
            .arg("-c")
            .arg(&*config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(ProbeError::Launch)?;

        Ok(Self {
            child,
            config_path,
            port,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// SOCKS proxy URL of the engine inbound, with remote DNS
    pub fn proxy_url(&self) -> String {
        format!("socks5h://{}:{}", LOOPBACK, self.port)
    }

    /// Fail if the engine has already exited
    pub fn ensure_running(&mut self) -> Result<(), ProbeError> {
        match self.child.try_wait() {
            Ok(Some(status)) => Err(ProbeError::EngineExited(status)),
            _ => Ok(()),
        }
    }

    /// Kill the engine and remove the config file. Errors are logged, never returned.
    pub async fn shutdown(self) {
        let Self {
            mut child,
            config_path,
            ..
        } = self;

        if let Err(e) = child.kill().await {
            debug!(error = %e, "engine already stopped");
        }
        let path = config_path.to_path_buf();
        if let Err(e) = config_path.close() {
            warn!(path = %path.display(), error = %e, "failed to remove engine config");
        }
    }
}

/// Probe runner validating links through the transport engine
#[derive(Clone)]
pub struct LinkProber {
    config: ProbeConfig,
    geo: GeoResolver,
}

impl LinkProber {
    /// Create a new prober with default configuration and no geolocation
    pub fn new() -> Self {
        Self::with_config(ProbeConfig::default())
    }

    pub fn with_config(config: ProbeConfig) -> Self {
        Self {
            config,
            geo: GeoResolver::disabled(),
        }
    }

    pub fn with_geo(mut self, geo: GeoResolver) -> Self {
        self.geo = geo;
        self
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Run one full live validation of `target` with the engine listening on `port`
    pub async fn probe(
        &self,
        target: &ProbeTarget,
        port: u16,
        source: &str,
    ) -> Result<ProbeResult, ProbeError> {
        let engine_config = OutboundBuilder::engine_config(&target.params, port)
            .ok_or_else(|| ProbeError::Unsupported(target.params.protocol()))?;

        let mut harness = EngineHarness::launch(
            &self.config.engine_path,
            &self.config.temp_dir,
            &engine_config,
            port,
        )?;
        debug!(
            pid = ?harness.pid(),
            config = %harness.config_path().display(),
            port,
            "engine started"
        );
        let outcome = self.exercise(&mut harness, target, source).await;
        harness.shutdown().await;

        outcome
    }

    async fn exercise(
        &self,
        harness: &mut EngineHarness,
        target: &ProbeTarget,
        source: &str,
    ) -> Result<ProbeResult, ProbeError> {
        tokio::time::sleep(self.config.warmup).await;
        harness.ensure_running()?;

        let client = Client::builder()
            .proxy(ReqwestProxy::all(harness.proxy_url())?)
            .timeout(self.config.latency_timeout)
            .build()?;

        let latency = self.measure_latency(&client).await?;
        let tags = self.check_services(&client).await;
        let speed_mbps = self.measure_throughput(&client, &target.label).await;
        let country = self.geo.resolve(&target.params.endpoint().host).await;
        if !country.is_known() {
            debug!(label = %target.label, country = %country.name, "country not resolved");
        }

        Ok(ProbeResult {
            config: target.candidate.link.clone(),
            latency,
            speed_mbps,
            country_code: country.code,
            country_name: country.name,
            name: target.label.clone(),
            tags,
            source: source.to_string(),
            fingerprint: target.candidate.fingerprint.clone(),
            probed_at: Utc::now(),
        })
    }

    async fn measure_latency(&self, client: &Client) -> Result<u64, ProbeError> {
        let start = Instant::now();
        let response = tokio::time::timeout(
            self.config.latency_timeout,
            client.get(&self.config.test_url).send(),
        )
        .await
        .map_err(|_| ProbeError::Timeout)??;

        if !response.status().is_success() {
            return Err(ProbeError::Status(response.status()));
        }

        Ok(start.elapsed().as_millis() as u64)
    }

    /// Tags of the services reachable through the engine, in list order
    async fn check_services(&self, client: &Client) -> Vec<String> {
        let checks = self.config.services.iter().map(|service| async move {
            let reachable = client
                .get(&service.url)
                .timeout(self.config.service_timeout)
                .send()
                .await
                .and_then(|response| response.error_for_status())
                .is_ok();
            debug!(tag = %service.tag, reachable, "service check");
            reachable.then(|| service.tag.clone())
        });

        join_all(checks).await.into_iter().flatten().collect()
    }

    /// Download the reference payload. A failure here leaves the latency result intact.
    async fn measure_throughput(&self, client: &Client, label: &str) -> Option<f64> {
        let url = self.config.speed_test_url.as_ref()?;
        let start = Instant::now();

        let body = async {
            client
                .get(url)
                .timeout(self.config.speed_test_timeout)
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await
        }
        .await;

        match body {
            Ok(bytes) => throughput_mbps(bytes.len(), start.elapsed()),
            Err(e) => {
                debug!(label, error = %e, "speed test failed");
                None
            }
        }
    }
}

impl Default for LinkProber {
    fn default() -> Self {
        Self::new()
    }
}

/// Throughput in Mbps rounded to two decimals, `None` for an empty or instant transfer
pub fn throughput_mbps(bytes: usize, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if bytes == 0 || secs <= 0.0 {
        return None;
    }
    let mbps = bytes as f64 * 8.0 / 1_000_000.0 / secs;
    Some((mbps * 100.0).round() / 100.0)
}
