//! Subscription feed fetching
//!
//! This module provides functionality for:
//! - Downloading subscription feeds over HTTP
//! - Extracting link candidates from the feed body
//! - Deriving filesystem-safe source names from feed URLs

use crate::proxy::models::Candidate;
use crate::proxy::parser::LinkParser;
use crate::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use std::time::Duration;
use url::Url;

/// Default timeout for feed requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Default user agent for feed requests
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Characters that are not safe in result file names
static UNSAFE_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("Invalid name regex"));

/// Result of fetching a single feed
#[derive(Debug, Clone)]
pub struct FeedResult {
    /// Name of the source that was fetched
    pub source: String,
    /// Candidates extracted from the feed
    pub candidates: Vec<Candidate>,
    /// Error message if fetching failed
    pub error: Option<String>,
}

impl FeedResult {
    pub fn success(source: String, candidates: Vec<Candidate>) -> Self {
        Self {
            source,
            candidates,
            error: None,
        }
    }

    pub fn failure(source: String, error: String) -> Self {
        Self {
            source,
            candidates: Vec::new(),
            error: Some(error),
        }
    }
}

/// Configuration for feed fetching
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl FetcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// Downloads subscription feeds and extracts candidates
#[derive(Debug, Clone)]
pub struct FeedFetcher {
    config: FetcherConfig,
    client: Client,
}

impl FeedFetcher {
    /// Create a fetcher with the default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(FetcherConfig::default())
    }

    pub fn with_config(config: FetcherConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Download the raw body of a feed, failing on non-success statuses
    pub async fn fetch_text(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }

    /// Download a feed and extract its unique candidates
    pub async fn fetch_candidates(&self, url: &str) -> Result<Vec<Candidate>> {
        let content = self.fetch_text(url).await?;
        Ok(LinkParser::extract_candidates(&content))
    }

    /// Fetch one named feed, capturing failures in the result
    pub async fn fetch_feed(&self, source: &str, url: &str) -> FeedResult {
        match self.fetch_candidates(url).await {
            Ok(candidates) => FeedResult::success(source.to_string(), candidates),
            Err(e) => FeedResult::failure(source.to_string(), e.to_string()),
        }
    }
}

/// Source name derived from a feed URL: the last path segment without `.txt`
pub fn source_name(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .next_back()?;
    let segment = urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    let stem = segment.strip_suffix(".txt").unwrap_or(&segment);
    let name = sanitize_name(stem);
    (!name.is_empty()).then_some(name)
}

/// Replace runs of unsafe characters with `_`
pub fn sanitize_name(name: &str) -> String {
    UNSAFE_NAME_REGEX
        .replace_all(name, "_")
        .trim_matches('_')
        .to_string()
}
