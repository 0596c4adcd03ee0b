//! Link, connection and probe result models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Proxy protocol families understood by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    ShadowsocksR,
    Hysteria2,
}

impl Protocol {
    /// Map a link scheme (without `://`) to a protocol. `hy2` is an alias of `hysteria2`.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "vmess" => Some(Protocol::Vmess),
            "vless" => Some(Protocol::Vless),
            "trojan" => Some(Protocol::Trojan),
            "ss" => Some(Protocol::Shadowsocks),
            "ssr" => Some(Protocol::ShadowsocksR),
            "hysteria2" | "hy2" => Some(Protocol::Hysteria2),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Vmess => write!(f, "vmess"),
            Protocol::Vless => write!(f, "vless"),
            Protocol::Trojan => write!(f, "trojan"),
            Protocol::Shadowsocks => write!(f, "ss"),
            Protocol::ShadowsocksR => write!(f, "ssr"),
            Protocol::Hysteria2 => write!(f, "hysteria2"),
        }
    }
}

/// Remote server address. IPv6 hosts are stored without brackets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Build an endpoint, rejecting an empty host or port zero
    pub fn new(host: impl Into<String>, port: u16) -> Option<Self> {
        let host = host.into();
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        if host.is_empty() || port == 0 {
            return None;
        }
        Some(Self { host, port })
    }

    /// Parse `host:port`, `[v6]:port` included
    pub fn parse(authority: &str) -> Option<Self> {
        let (host, port) = authority.trim().rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        Self::new(host, port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// REALITY handshake parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealityOptions {
    pub public_key: String,
    pub short_id: Option<String>,
    pub spider_x: Option<String>,
}

/// Transport and TLS attributes shared by the V2Ray-family protocols
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Transport type (tcp, ws, grpc, ...)
    pub network: Option<String>,
    /// Security layer (tls, reality, none)
    pub security: Option<String>,
    /// TLS server name
    pub sni: Option<String>,
    /// HTTP `Host` header for ws/http transports
    pub host_header: Option<String>,
    pub path: Option<String>,
    /// gRPC service name
    pub service_name: Option<String>,
    pub header_type: Option<String>,
    pub alpn: Vec<String>,
    /// uTLS fingerprint
    pub fingerprint: Option<String>,
    pub allow_insecure: bool,
    pub reality: Option<RealityOptions>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmessParams {
    pub endpoint: Endpoint,
    pub id: String,
    pub alter_id: u32,
    /// Cipher (`scy`), `auto` when absent
    pub cipher: Option<String>,
    pub stream: StreamOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlessParams {
    pub endpoint: Endpoint,
    pub id: String,
    pub flow: Option<String>,
    pub stream: StreamOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrojanParams {
    pub endpoint: Endpoint,
    pub password: String,
    pub stream: StreamOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowsocksParams {
    pub endpoint: Endpoint,
    pub method: String,
    pub password: String,
    pub plugin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowsocksRParams {
    pub endpoint: Endpoint,
    /// SSR protocol plugin (origin, auth_aes128_md5, ...)
    pub protocol: String,
    pub method: String,
    pub obfs: String,
    pub password: String,
    pub obfs_param: Option<String>,
    pub protocol_param: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hysteria2Params {
    pub endpoint: Endpoint,
    pub auth: String,
    pub sni: Option<String>,
    pub insecure: bool,
    pub obfs: Option<String>,
    pub obfs_password: Option<String>,
}

/// Normalized connection parameters, one variant per protocol family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionParams {
    Vmess(VmessParams),
    Vless(VlessParams),
    Trojan(TrojanParams),
    Shadowsocks(ShadowsocksParams),
    ShadowsocksR(ShadowsocksRParams),
    Hysteria2(Hysteria2Params),
}

impl ConnectionParams {
    pub fn protocol(&self) -> Protocol {
        match self {
            ConnectionParams::Vmess(_) => Protocol::Vmess,
            ConnectionParams::Vless(_) => Protocol::Vless,
            ConnectionParams::Trojan(_) => Protocol::Trojan,
            ConnectionParams::Shadowsocks(_) => Protocol::Shadowsocks,
            ConnectionParams::ShadowsocksR(_) => Protocol::ShadowsocksR,
            ConnectionParams::Hysteria2(_) => Protocol::Hysteria2,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        match self {
            ConnectionParams::Vmess(p) => &p.endpoint,
            ConnectionParams::Vless(p) => &p.endpoint,
            ConnectionParams::Trojan(p) => &p.endpoint,
            ConnectionParams::Shadowsocks(p) => &p.endpoint,
            ConnectionParams::ShadowsocksR(p) => &p.endpoint,
            ConnectionParams::Hysteria2(p) => &p.endpoint,
        }
    }

    /// The credential: UUID, password, or `method:password`
    pub fn identifier(&self) -> String {
        match self {
            ConnectionParams::Vmess(p) => p.id.clone(),
            ConnectionParams::Vless(p) => p.id.clone(),
            ConnectionParams::Trojan(p) => p.password.clone(),
            ConnectionParams::Shadowsocks(p) => format!("{}:{}", p.method, p.password),
            ConnectionParams::ShadowsocksR(p) => format!("{}:{}", p.method, p.password),
            ConnectionParams::Hysteria2(p) => p.auth.clone(),
        }
    }
}

/// One raw link extracted from feed text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// The full token as found in the feed, label fragment included
    pub link: String,
    /// The technical part before the first `#`
    pub config: String,
    /// Percent-decoded label fragment, if any
    pub remark: Option<String>,
    /// Hex SHA-256 of `config`, used as the dedup key
    pub fingerprint: String,
}

impl Candidate {
    pub fn new(link: impl Into<String>) -> Self {
        let link = link.into();
        let (config, remark) = match link.split_once('#') {
            Some((config, fragment)) => {
                let remark = urlencoding::decode(fragment)
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| fragment.to_string());
                let remark = remark.trim().to_string();
                (config.to_string(), (!remark.is_empty()).then_some(remark))
            }
            None => (link.clone(), None),
        };
        let fingerprint = fingerprint(&config);

        Self {
            link,
            config,
            remark,
            fingerprint,
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.link)
    }
}

/// Hex-encoded SHA-256 of a pre-label link
pub fn fingerprint(config: &str) -> String {
    hex::encode(Sha256::digest(config.as_bytes()))
}

/// A decoded candidate ready to be probed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub candidate: Candidate,
    pub params: ConnectionParams,
    /// Display label used in logs and as the initial result name
    pub label: String,
}

/// Outcome of one successful live validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    /// The link to republish
    pub config: String,
    /// Round-trip latency in milliseconds
    pub latency: u64,
    pub speed_mbps: Option<f64>,
    pub country_code: String,
    pub country_name: String,
    /// Display label
    pub name: String,
    /// Reachable auxiliary services
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub fingerprint: String,
    /// When the measurement was taken
    #[serde(default = "Utc::now")]
    pub probed_at: DateTime<Utc>,
}

impl ProbeResult {
    /// Render the HTML message posted by the publisher
    pub fn publish_message(&self) -> String {
        let mut message = format!(
            "<code>{}</code>\n\n<b>Latency:</b> {}ms",
            escape_html(&self.config),
            self.latency
        );
        if let Some(speed) = self.speed_mbps {
            message.push_str(&format!("\n<b>Speed:</b> {:.2} Mbps", speed));
        }
        if !self.tags.is_empty() {
            message.push_str(&format!("\n\n{}", self.tags.join(" ")));
        }
        message
    }
}

/// Escape text for Telegram's HTML parse mode
fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
