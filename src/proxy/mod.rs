//! Proxy link handling
//!
//! This module provides functionality for:
//! - Decoding subscription links into typed connection parameters
//! - Building transport engine configs for each protocol
//! - Probing links through the engine with windowed concurrency
//! - Ranking, selecting and relabelling results for publishing
//! - Fetching subscription feeds

pub mod checker;
pub mod crawler;
pub mod geo;
pub mod models;
pub mod outbound;
pub mod parser;
pub mod scheduler;
pub mod selector;

pub use checker::{
    EngineHarness, LinkProber, ProbeConfig, ProbeError, ServiceCheck, DEFAULT_SPEED_TEST_URL,
    DEFAULT_TEST_URL,
};
pub use crawler::{FeedFetcher, FeedResult, FetcherConfig};
pub use geo::{CountryInfo, GeoResolver};
pub use models::{Candidate, ConnectionParams, Endpoint, ProbeResult, ProbeTarget, Protocol};
pub use outbound::{EngineConfig, OutboundBuilder};
pub use parser::LinkParser;
pub use scheduler::{BatchScheduler, ProbeEvent, DEFAULT_BASE_PORT, DEFAULT_CONCURRENCY};
pub use selector::{Aggregator, RankPolicy, Selection, SelectionMode};
