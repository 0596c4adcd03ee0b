//! Ranking, batch selection and relabelling of probe results

use crate::proxy::models::{fingerprint, ProbeResult};
use crate::proxy::parser::decode_base64_text;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::ValueEnum;
use once_cell::sync::Lazy;
use rand::seq::index::sample;
use rand::Rng;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;

/// Glyph used when no country flag is available
pub const FALLBACK_FLAG: &str = "🌐";

/// Two consecutive regional indicator symbols
static FLAG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x{1F1E6}-\x{1F1FF}]{2}").expect("Invalid flag regex"));

/// How probe results are ordered before selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum RankPolicy {
    /// Service tags, then throughput, then latency
    #[default]
    ServicesFirst,
    /// Throughput, then latency
    SpeedLatency,
}

impl RankPolicy {
    /// Ordering where the better result comes first
    pub fn compare(&self, a: &ProbeResult, b: &ProbeResult) -> Ordering {
        let by_speed = speed_of(b).total_cmp(&speed_of(a));
        let by_latency = a.latency.cmp(&b.latency);
        match self {
            RankPolicy::ServicesFirst => b
                .tags
                .len()
                .cmp(&a.tags.len())
                .then(by_speed)
                .then(by_latency),
            RankPolicy::SpeedLatency => by_speed.then(by_latency),
        }
    }

    /// Sort best first. The sort is stable, so exact ties keep input order.
    pub fn rank(&self, results: &mut [ProbeResult]) {
        results.sort_by(|a, b| self.compare(a, b));
    }
}

fn speed_of(result: &ProbeResult) -> f64 {
    result.speed_mbps.unwrap_or(0.0)
}

/// Whether results are published per source or across all sources
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum SelectionMode {
    #[default]
    PerSource,
    Merged,
}

/// One publish batch and what is left for later cycles
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub batch: Vec<ProbeResult>,
    pub overflow: Vec<ProbeResult>,
}

/// Pick a publish batch of at most `size` from results ranked best first.
///
/// The top result is always included; the rest of the batch is sampled
/// uniformly without replacement from the remainder.
pub fn select_batch<R: Rng + ?Sized>(
    ranked: Vec<ProbeResult>,
    size: usize,
    rng: &mut R,
) -> Selection {
    if ranked.is_empty() || size == 0 {
        return Selection {
            batch: Vec::new(),
            overflow: ranked,
        };
    }

    let mut rest = ranked;
    let top = rest.remove(0);
    let amount = (size - 1).min(rest.len());

    let picked: HashSet<usize> = sample(rng, rest.len(), amount).into_iter().collect();

    let mut batch = vec![top];
    let mut overflow = Vec::with_capacity(rest.len() - amount);
    for (index, result) in rest.into_iter().enumerate() {
        if picked.contains(&index) {
            batch.push(result);
        } else {
            overflow.push(result);
        }
    }

    Selection { batch, overflow }
}

/// Keep the first result for each fingerprint
pub fn dedupe_by_fingerprint(results: Vec<ProbeResult>) -> Vec<ProbeResult> {
    let mut seen = HashSet::new();
    results
        .into_iter()
        .filter(|result| seen.insert(result_key(result)))
        .collect()
}

fn result_key(result: &ProbeResult) -> String {
    if result.fingerprint.is_empty() {
        let config = result.config.split('#').next().unwrap_or_default();
        fingerprint(config)
    } else {
        result.fingerprint.clone()
    }
}

/// Flag emoji for a two-letter country code
pub fn flag_from_country_code(code: &str) -> Option<String> {
    if code.len() != 2 || code.eq_ignore_ascii_case("XX") {
        return None;
    }
    code.chars()
        .map(|c| {
            let c = c.to_ascii_uppercase();
            if c.is_ascii_uppercase() {
                char::from_u32(0x1F1E6 + (c as u32 - 'A' as u32))
            } else {
                None
            }
        })
        .collect()
}

/// First flag emoji found in `text`
pub fn extract_flag(text: &str) -> Option<String> {
    FLAG_REGEX.find(text).map(|m| m.as_str().to_string())
}

/// Build the published label, e.g. `🇩🇪 DE | @channel`
pub fn display_label(country_code: &str, current_name: &str, marker: &str) -> String {
    let mut label = match flag_from_country_code(country_code) {
        Some(flag) => format!("{} {}", flag, country_code.to_ascii_uppercase()),
        None => extract_flag(current_name).unwrap_or_else(|| FALLBACK_FLAG.to_string()),
    };
    if !marker.is_empty() {
        label.push_str(" | ");
        label.push_str(marker);
    }
    label
}

/// Rewrite the remark embedded in a link
pub fn relabel_link(link: &str, label: &str) -> String {
    let config = link.split('#').next().unwrap_or_default();

    if let Some(payload) = strip_prefix_ignore_case(config, "vmess://") {
        if let Some(relabelled) = relabel_vmess(payload, label) {
            return relabelled;
        }
    }

    format!("{}#{}", config, urlencoding::encode(label))
}

fn relabel_vmess(payload: &str, label: &str) -> Option<String> {
    let json = decode_base64_text(payload)?;
    let mut value: Value = serde_json::from_str(&json).ok()?;
    value
        .as_object_mut()?
        .insert("ps".to_string(), Value::String(label.to_string()));
    let encoded = STANDARD.encode(serde_json::to_string(&value).ok()?);
    Some(format!("vmess://{}", encoded))
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then_some(&text[prefix.len()..])
}

/// Ranks, selects and relabels results for publishing
#[derive(Debug, Clone)]
pub struct Aggregator {
    policy: RankPolicy,
    batch_size: usize,
    marker: String,
}

impl Aggregator {
    pub fn new(policy: RankPolicy, batch_size: usize) -> Self {
        Self {
            policy,
            batch_size,
            marker: String::new(),
        }
    }

    /// Identifying marker embedded in every published label
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = marker.into();
        self
    }

    pub fn policy(&self) -> RankPolicy {
        self.policy
    }

    /// Merge fresh and pooled results, then pick one publish batch.
    ///
    /// Fresh results win over pooled ones with the same fingerprint. Only the
    /// batch is relabelled; the overflow is returned untouched.
    pub fn select<R: Rng + ?Sized>(
        &self,
        fresh: Vec<ProbeResult>,
        pooled: Vec<ProbeResult>,
        rng: &mut R,
    ) -> Selection {
        let mut results = dedupe_by_fingerprint(fresh.into_iter().chain(pooled).collect());
        self.policy.rank(&mut results);

        let mut selection = select_batch(results, self.batch_size, rng);
        for result in &mut selection.batch {
            self.relabel(result);
        }
        selection
    }

    /// Recompute the display label and rewrite it into the link
    pub fn relabel(&self, result: &mut ProbeResult) {
        let label = display_label(&result.country_code, &result.name, &self.marker);
        result.config = relabel_link(&result.config, &label);
        result.name = label;
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(RankPolicy::default(), 5)
    }
}
