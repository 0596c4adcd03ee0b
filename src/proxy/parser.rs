//! Link decoder for subscription feed text
//!
//! Turns raw feed lines into [`Candidate`]s and decodes each candidate into
//! protocol-tagged [`ConnectionParams`]. Decoding is pure: no I/O, and any
//! malformed input simply yields `None`.

use crate::proxy::models::{
    Candidate, ConnectionParams, Endpoint, Hysteria2Params, ProbeTarget, Protocol,
    RealityOptions, ShadowsocksParams, ShadowsocksRParams, StreamOptions, TrojanParams,
    VlessParams, VmessParams,
};
use crate::Result;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use url::Url;

/// Known link prefixes, anchored to a word boundary so the `ss://` tail of
/// `vless://` never matches on its own. A token runs until whitespace or quoting.
static LINK_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(vmess|vless|trojan|ssr|ss|hysteria2|hy2)://[^\s"'<>`]+"#)
        .expect("Invalid link regex")
});

const LENIENT: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_decode_padding_mode(DecodePaddingMode::Indifferent)
    .with_decode_allow_trailing_bits(true);

const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

/// A decoded link plus any label embedded in its payload
struct Decoded {
    params: ConnectionParams,
    remark: Option<String>,
}

impl From<ConnectionParams> for Decoded {
    fn from(params: ConnectionParams) -> Self {
        Self {
            params,
            remark: None,
        }
    }
}

/// Shadowsocks userinfo layouts, tried in order until one yields a valid endpoint
const SHADOWSOCKS_LAYOUTS: &[fn(&str) -> Option<ShadowsocksParams>] = &[
    shadowsocks_plain_userinfo,
    shadowsocks_encoded_userinfo,
    shadowsocks_raw_userinfo,
    shadowsocks_encoded_payload,
];

/// Link parser for subscription feeds
pub struct LinkParser;

impl LinkParser {
    /// Extract the first link found anywhere in a line
    pub fn extract_link(line: &str) -> Option<Candidate> {
        LINK_REGEX
            .find(line)
            .map(|m| Candidate::new(m.as_str()))
    }

    /// Extract unique candidates from feed text.
    ///
    /// Duplicates are detected by the fingerprint of the pre-label link, so
    /// the same server with two different labels is kept once (first wins).
    /// When nothing is found line by line and the whole body is base64, the
    /// decoded body is scanned instead.
    pub fn extract_candidates(content: &str) -> Vec<Candidate> {
        let candidates = Self::extract_from_lines(content);
        if !candidates.is_empty() {
            return candidates;
        }

        match decode_base64_text(content) {
            Some(decoded) => Self::extract_from_lines(&decoded),
            None => candidates,
        }
    }

    fn extract_from_lines(content: &str) -> Vec<Candidate> {
        let mut seen = HashSet::new();
        content
            .lines()
            .filter_map(Self::extract_link)
            .filter(|candidate| seen.insert(candidate.fingerprint.clone()))
            .collect()
    }

    /// Decode a candidate into connection parameters
    pub fn decode(candidate: &Candidate) -> Option<ConnectionParams> {
        Self::decode_inner(candidate).map(|decoded| decoded.params)
    }

    /// Decode a candidate and resolve its display label
    pub fn decode_target(candidate: &Candidate) -> Option<ProbeTarget> {
        let Decoded { params, remark } = Self::decode_inner(candidate)?;
        let label = candidate
            .remark
            .clone()
            .or(remark)
            .unwrap_or_else(|| params.endpoint().to_string());

        Some(ProbeTarget {
            candidate: candidate.clone(),
            params,
            label,
        })
    }

    fn decode_inner(candidate: &Candidate) -> Option<Decoded> {
        let (scheme, payload) = candidate.config.split_once("://")?;
        let protocol = Protocol::from_scheme(scheme)?;

        match protocol {
            Protocol::Vmess => decode_vmess(payload),
            Protocol::Vless => decode_vless(&candidate.config).map(Decoded::from),
            Protocol::Trojan => decode_trojan(&candidate.config).map(Decoded::from),
            Protocol::Shadowsocks => SHADOWSOCKS_LAYOUTS
                .iter()
                .find_map(|layout| layout(&candidate.config))
                .map(|params| Decoded::from(ConnectionParams::Shadowsocks(params))),
            Protocol::ShadowsocksR => decode_shadowsocks_r(payload),
            Protocol::Hysteria2 => decode_hysteria2(&candidate.config).map(Decoded::from),
        }
    }

    /// Parse a single line into a probe target
    pub fn parse_line(line: &str) -> Option<ProbeTarget> {
        Self::extract_link(line).and_then(|candidate| Self::decode_target(&candidate))
    }

    /// Extract and decode every unique link in a feed
    pub fn parse_string(content: &str) -> Vec<ProbeTarget> {
        Self::extract_candidates(content)
            .iter()
            .filter_map(Self::decode_target)
            .collect()
    }

    /// Extract and decode every unique link in a file
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Vec<ProbeTarget>> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse_string(&content))
    }
}

/// Decode base64 in either alphabet, tolerating missing padding and whitespace
pub fn decode_base64(input: &str) -> Option<Vec<u8>> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let compact = compact.trim_end_matches('=');
    if compact.is_empty() {
        return None;
    }

    STANDARD_LENIENT
        .decode(compact)
        .or_else(|_| URL_SAFE_LENIENT.decode(compact))
        .ok()
}

/// Decode base64 into UTF-8 text
pub fn decode_base64_text(input: &str) -> Option<String> {
    decode_base64(input).and_then(|bytes| String::from_utf8(bytes).ok())
}

fn decode_vmess(payload: &str) -> Option<Decoded> {
    let payload = payload.split('?').next().unwrap_or(payload);
    let json = decode_base64_text(payload)?;
    let value: Value = serde_json::from_str(&json).ok()?;

    let endpoint = Endpoint::new(json_str(&value, "add")?, json_u16(&value, "port")?)?;
    let id = json_str(&value, "id")?;

    let security = json_str(&value, "tls").filter(|s| s != "none");
    let stream = StreamOptions {
        network: json_str(&value, "net"),
        security,
        sni: json_str(&value, "sni"),
        host_header: json_str(&value, "host"),
        path: json_str(&value, "path"),
        service_name: None,
        header_type: json_str(&value, "type").filter(|s| s != "none"),
        alpn: split_list(json_str(&value, "alpn").as_deref()),
        fingerprint: json_str(&value, "fp"),
        allow_insecure: json_str(&value, "allowInsecure").is_some_and(|v| is_truthy(&v)),
        reality: None,
    };

    let params = VmessParams {
        endpoint,
        id,
        alter_id: json_u16(&value, "aid").map(u32::from).unwrap_or(0),
        cipher: json_str(&value, "scy"),
        stream,
    };

    Some(Decoded {
        params: ConnectionParams::Vmess(params),
        remark: json_str(&value, "ps"),
    })
}

/// Read a non-empty string field; numbers are rendered as text
fn json_str(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_u16(value: &Value, key: &str) -> Option<u16> {
    match value.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A credential-in-authority link with its userinfo percent-decoded
struct AuthorityLink {
    endpoint: Endpoint,
    username: String,
    password: Option<String>,
    query: HashMap<String, String>,
}

fn parse_authority_link(link: &str) -> Option<AuthorityLink> {
    let url = Url::parse(link).ok()?;
    let endpoint = Endpoint::new(url.host_str()?, url.port()?)?;

    Some(AuthorityLink {
        endpoint,
        username: percent_decode(url.username()),
        password: url.password().map(percent_decode),
        query: url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
    })
}

fn decode_vless(link: &str) -> Option<ConnectionParams> {
    let AuthorityLink {
        endpoint,
        username: id,
        query,
        ..
    } = parse_authority_link(link)?;
    if id.is_empty() {
        return None;
    }

    Some(ConnectionParams::Vless(VlessParams {
        endpoint,
        id,
        flow: query_value(&query, "flow"),
        stream: stream_from_query(&query),
    }))
}

fn decode_trojan(link: &str) -> Option<ConnectionParams> {
    let AuthorityLink {
        endpoint,
        username: password,
        query,
        ..
    } = parse_authority_link(link)?;
    if password.is_empty() {
        return None;
    }

    Some(ConnectionParams::Trojan(TrojanParams {
        endpoint,
        password,
        stream: stream_from_query(&query),
    }))
}

fn decode_hysteria2(link: &str) -> Option<ConnectionParams> {
    let AuthorityLink {
        endpoint,
        username,
        password,
        query,
    } = parse_authority_link(link)?;
    let auth = match password {
        Some(password) => format!("{}:{}", username, password),
        None => username,
    };
    if auth.is_empty() {
        return None;
    }

    Some(ConnectionParams::Hysteria2(Hysteria2Params {
        endpoint,
        auth,
        sni: query_value(&query, "sni"),
        insecure: query_value(&query, "insecure").is_some_and(|v| is_truthy(&v)),
        obfs: query_value(&query, "obfs"),
        obfs_password: query_value(&query, "obfs-password"),
    }))
}

fn stream_from_query(query: &HashMap<String, String>) -> StreamOptions {
    let security = query_value(query, "security").filter(|s| s != "none");
    let reality = match (security.as_deref(), query_value(query, "pbk")) {
        (Some("reality"), Some(public_key)) => Some(RealityOptions {
            public_key,
            short_id: query_value(query, "sid"),
            spider_x: query_value(query, "spx"),
        }),
        _ => None,
    };

    StreamOptions {
        network: query_value(query, "type"),
        security,
        sni: query_value(query, "sni").or_else(|| query_value(query, "peer")),
        host_header: query_value(query, "host"),
        path: query_value(query, "path"),
        service_name: query_value(query, "serviceName"),
        header_type: query_value(query, "headerType").filter(|s| s != "none"),
        alpn: split_list(query_value(query, "alpn").as_deref()),
        fingerprint: query_value(query, "fp"),
        allow_insecure: query_value(query, "allowInsecure")
            .or_else(|| query_value(query, "insecure"))
            .is_some_and(|v| is_truthy(&v)),
        reality,
    }
}

/// Layout (a): `ss://method:password@host:port`
fn shadowsocks_plain_userinfo(link: &str) -> Option<ShadowsocksParams> {
    let AuthorityLink {
        endpoint,
        username: method,
        password,
        query,
    } = parse_authority_link(link)?;
    let password = password.filter(|p| !p.is_empty())?;
    if method.is_empty() {
        return None;
    }

    Some(ShadowsocksParams {
        endpoint,
        method,
        password,
        plugin: query_value(&query, "plugin"),
    })
}

/// Layout (b): `ss://base64(method:password)@host:port`
fn shadowsocks_encoded_userinfo(link: &str) -> Option<ShadowsocksParams> {
    let AuthorityLink {
        endpoint,
        username: userinfo,
        password,
        query,
    } = parse_authority_link(link)?;
    if password.is_some() {
        return None;
    }
    let (method, password) = split_method_password(&decode_base64_text(&userinfo)?)?;

    Some(ShadowsocksParams {
        endpoint,
        method,
        password,
        plugin: query_value(&query, "plugin"),
    })
}

/// Layout (b) without URL parsing, for base64 userinfo containing `/`
fn shadowsocks_raw_userinfo(link: &str) -> Option<ShadowsocksParams> {
    let payload = link.split_once("://")?.1;
    let (main, query) = match payload.split_once('?') {
        Some((main, query)) => (main, query),
        None => (payload, ""),
    };
    let (userinfo, authority) = main.trim_end_matches('/').rsplit_once('@')?;
    let (method, password) = split_method_password(&decode_base64_text(&percent_decode(userinfo))?)?;
    let query: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    Some(ShadowsocksParams {
        endpoint: Endpoint::parse(authority)?,
        method,
        password,
        plugin: query_value(&query, "plugin"),
    })
}

/// Layout (c): `ss://base64(method:password@host:port)`
fn shadowsocks_encoded_payload(link: &str) -> Option<ShadowsocksParams> {
    let payload = link.split_once("://")?.1;
    let payload = payload.split('?').next()?.trim_end_matches('/');
    let decoded = decode_base64_text(payload)?;
    let (userinfo, authority) = decoded.rsplit_once('@')?;
    let (method, password) = split_method_password(userinfo)?;

    Some(ShadowsocksParams {
        endpoint: Endpoint::parse(authority)?,
        method,
        password,
        plugin: None,
    })
}

fn split_method_password(userinfo: &str) -> Option<(String, String)> {
    let (method, password) = userinfo.split_once(':')?;
    let method = method.trim();
    if method.is_empty() || password.is_empty() {
        return None;
    }
    Some((method.to_string(), password.to_string()))
}

/// `ssr://base64(host:port:protocol:method:obfs:base64(password)/?params)`
fn decode_shadowsocks_r(payload: &str) -> Option<Decoded> {
    let decoded = decode_base64_text(payload)?;
    let (main, query) = match decoded.split_once('?') {
        Some((main, query)) => (main, query),
        None => (decoded.as_str(), ""),
    };
    let main = main.trim_end_matches('/');

    // From the right, so an IPv6 host keeps its colons.
    let mut fields = main.rsplitn(6, ':');
    let password = decode_base64_text(fields.next()?)?;
    let obfs = fields.next()?.to_string();
    let method = fields.next()?.to_string();
    let protocol = fields.next()?.to_string();
    let port: u16 = fields.next()?.parse().ok()?;
    let endpoint = Endpoint::new(fields.next()?, port)?;

    let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
        .filter_map(|(k, v)| {
            let value = decode_base64_text(&v)?;
            let value = value.trim();
            (!value.is_empty()).then(|| (k.into_owned(), value.to_string()))
        })
        .collect();

    if method.is_empty() || password.is_empty() {
        return None;
    }

    Some(Decoded {
        params: ConnectionParams::ShadowsocksR(ShadowsocksRParams {
            endpoint,
            protocol,
            method,
            obfs,
            password,
            obfs_param: params.get("obfsparam").cloned(),
            protocol_param: params.get("protoparam").cloned(),
        }),
        remark: params.get("remarks").cloned(),
    })
}

fn query_value(query: &HashMap<String, String>, key: &str) -> Option<String> {
    query
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn percent_decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}
