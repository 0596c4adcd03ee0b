//! Transport engine configuration builder
//!
//! Maps [`ConnectionParams`] onto the Xray-style JSON the external engine
//! reads: one loopback SOCKS inbound and one protocol-specific outbound.
//! Optional attributes that are missing or unknown are left out. Obfuscation
//! the engine cannot reproduce (SIP003 plugins, hysteria2 obfs) makes the
//! link unbuildable instead of being dropped.

use crate::proxy::models::{
    ConnectionParams, Endpoint, Hysteria2Params, ShadowsocksParams, ShadowsocksRParams,
    StreamOptions, TrojanParams, VlessParams, VmessParams,
};
use serde::Serialize;
use std::collections::BTreeMap;

/// Loopback address the probe inbound listens on
pub const LOOPBACK: &str = "127.0.0.1";

/// Complete engine configuration for one probe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfig {
    pub log: LogSettings,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
}

impl EngineConfig {
    /// Wrap an outbound with a single SOCKS inbound on `127.0.0.1:port`
    pub fn socks_probe(outbound: Outbound, port: u16) -> Self {
        Self {
            log: LogSettings {
                loglevel: "none".to_string(),
            },
            inbounds: vec![Inbound {
                port,
                listen: LOOPBACK.to_string(),
                protocol: "socks".to_string(),
                settings: InboundSettings {
                    auth: "noauth".to_string(),
                    udp: true,
                },
            }],
            outbounds: vec![outbound],
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogSettings {
    pub loglevel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inbound {
    pub port: u16,
    pub listen: String,
    pub protocol: String,
    pub settings: InboundSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundSettings {
    pub auth: String,
    pub udp: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    pub protocol: String,
    pub settings: OutboundSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundSettings {
    Vnext { vnext: Vec<VnextServer> },
    Servers { servers: Vec<ServerEntry> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VnextServer {
    pub address: String,
    pub port: u16,
    pub users: Vec<VnextUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VnextUser {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alter_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerEntry {
    pub address: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reality_settings: Option<RealitySettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_settings: Option<GrpcSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_settings: Option<TcpSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_settings: Option<HttpSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub httpupgrade_settings: Option<UpgradeSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xhttp_settings: Option<UpgradeSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub allow_insecure: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealitySettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spider_x: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WsSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<WsHeaders>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WsHeaders {
    #[serde(rename = "Host")]
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcSettings {
    pub service_name: String,
}

/// Raw TCP with an optional HTTP/1.1 disguise header
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TcpSettings {
    pub header: TcpHeader,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TcpHeader {
    #[serde(rename = "type")]
    pub header_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<TcpRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TcpRequest {
    pub path: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, Vec<String>>,
}

/// `h2`/`http` transport
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub host: Vec<String>,
}

/// `httpupgrade` and `xhttp` transports
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpgradeSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Builds engine outbounds from decoded links
pub struct OutboundBuilder;

impl OutboundBuilder {
    /// Build the outbound for a decoded link, or `None` if the engine cannot carry it
    pub fn build(params: &ConnectionParams) -> Option<Outbound> {
        match params {
            ConnectionParams::Vmess(p) => Some(Self::vmess(p)),
            ConnectionParams::Vless(p) => Some(Self::vless(p)),
            ConnectionParams::Trojan(p) => Some(Self::trojan(p)),
            ConnectionParams::Shadowsocks(p) => Self::shadowsocks(p),
            ConnectionParams::ShadowsocksR(p) => Self::shadowsocks_r(p),
            ConnectionParams::Hysteria2(p) => Self::hysteria2(p),
        }
    }

    /// Build the full engine configuration with a SOCKS inbound on `port`
    pub fn engine_config(params: &ConnectionParams, port: u16) -> Option<EngineConfig> {
        Self::build(params).map(|outbound| EngineConfig::socks_probe(outbound, port))
    }

    fn vmess(p: &VmessParams) -> Outbound {
        let user = VnextUser {
            id: p.id.clone(),
            alter_id: Some(p.alter_id),
            security: Some(p.cipher.clone().unwrap_or_else(|| "auto".to_string())),
            encryption: None,
            flow: None,
        };
        let server_name = p.stream.sni.clone().or_else(|| p.stream.host_header.clone());

        Outbound {
            protocol: "vmess".to_string(),
            settings: vnext(&p.endpoint, user),
            stream_settings: Some(stream_settings(&p.stream, None, server_name)),
        }
    }

    fn vless(p: &VlessParams) -> Outbound {
        let user = VnextUser {
            id: p.id.clone(),
            alter_id: None,
            security: None,
            encryption: Some("none".to_string()),
            flow: p.flow.clone(),
        };

        Outbound {
            protocol: "vless".to_string(),
            settings: vnext(&p.endpoint, user),
            stream_settings: Some(stream_settings(&p.stream, None, p.stream.sni.clone())),
        }
    }

    fn trojan(p: &TrojanParams) -> Outbound {
        let server_name = p.stream.sni.clone().or_else(|| p.stream.host_header.clone());

        Outbound {
            protocol: "trojan".to_string(),
            settings: servers(&p.endpoint, None, &p.password),
            stream_settings: Some(stream_settings(&p.stream, Some("tls"), server_name)),
        }
    }

    /// SIP003 plugins run outside the engine, so plugin links are not carried
    fn shadowsocks(p: &ShadowsocksParams) -> Option<Outbound> {
        if p.plugin.is_some() {
            return None;
        }

        Some(Outbound {
            protocol: "shadowsocks".to_string(),
            settings: servers(&p.endpoint, Some(&p.method), &p.password),
            stream_settings: None,
        })
    }

    /// Only plain SSR (origin protocol, no obfs) is carried, as shadowsocks
    fn shadowsocks_r(p: &ShadowsocksRParams) -> Option<Outbound> {
        if p.protocol != "origin" || p.obfs != "plain" {
            return None;
        }

        Some(Outbound {
            protocol: "shadowsocks".to_string(),
            settings: servers(&p.endpoint, Some(&p.method), &p.password),
            stream_settings: None,
        })
    }

    /// Salamander obfs has no engine counterpart, so obfuscated links are not carried
    fn hysteria2(p: &Hysteria2Params) -> Option<Outbound> {
        if p.obfs.is_some() {
            return None;
        }

        Some(Outbound {
            protocol: "hysteria2".to_string(),
            settings: servers(&p.endpoint, None, &p.auth),
            stream_settings: Some(StreamSettings {
                network: "udp".to_string(),
                security: Some("tls".to_string()),
                tls_settings: Some(TlsSettings {
                    server_name: p.sni.clone(),
                    allow_insecure: p.insecure,
                    alpn: vec!["h3".to_string()],
                    fingerprint: None,
                }),
                ..Default::default()
            }),
        })
    }
}

fn vnext(endpoint: &Endpoint, user: VnextUser) -> OutboundSettings {
    OutboundSettings::Vnext {
        vnext: vec![VnextServer {
            address: endpoint.host.clone(),
            port: endpoint.port,
            users: vec![user],
        }],
    }
}

fn servers(endpoint: &Endpoint, method: Option<&str>, password: &str) -> OutboundSettings {
    OutboundSettings::Servers {
        servers: vec![ServerEntry {
            address: endpoint.host.clone(),
            port: endpoint.port,
            method: method.map(str::to_string),
            password: password.to_string(),
        }],
    }
}

fn stream_settings(
    opts: &StreamOptions,
    default_security: Option<&str>,
    server_name: Option<String>,
) -> StreamSettings {
    let network = opts.network.clone().unwrap_or_else(|| "tcp".to_string());
    let security = opts
        .security
        .clone()
        .or_else(|| default_security.map(str::to_string));

    let mut settings = StreamSettings {
        network,
        security: security.clone(),
        ..Default::default()
    };

    match security.as_deref() {
        Some("tls") => {
            settings.tls_settings = Some(TlsSettings {
                server_name,
                allow_insecure: opts.allow_insecure,
                alpn: opts.alpn.clone(),
                fingerprint: opts.fingerprint.clone(),
            });
        }
        Some("reality") => {
            settings.reality_settings = opts.reality.as_ref().map(|reality| RealitySettings {
                server_name,
                public_key: reality.public_key.clone(),
                short_id: reality.short_id.clone(),
                fingerprint: opts
                    .fingerprint
                    .clone()
                    .unwrap_or_else(|| "chrome".to_string()),
                spider_x: reality.spider_x.clone(),
            });
        }
        _ => {}
    }

    match settings.network.as_str() {
        "ws" => {
            settings.ws_settings = Some(WsSettings {
                path: opts.path.clone(),
                headers: opts.host_header.clone().map(|host| WsHeaders { host }),
            });
        }
        "grpc" => {
            settings.grpc_settings = opts
                .service_name
                .clone()
                .or_else(|| opts.path.clone())
                .map(|service_name| GrpcSettings { service_name });
        }
        "tcp" if opts.header_type.as_deref() == Some("http") => {
            let headers = opts
                .host_header
                .iter()
                .map(|host| ("Host".to_string(), split_hosts(host)))
                .collect();
            settings.tcp_settings = Some(TcpSettings {
                header: TcpHeader {
                    header_type: "http".to_string(),
                    request: Some(TcpRequest {
                        path: vec![opts.path.clone().unwrap_or_else(|| "/".to_string())],
                        headers,
                    }),
                },
            });
        }
        "h2" | "http" => {
            settings.http_settings = Some(HttpSettings {
                path: opts.path.clone(),
                host: opts.host_header.as_deref().map(split_hosts).unwrap_or_default(),
            });
        }
        "httpupgrade" => {
            settings.httpupgrade_settings = Some(upgrade_settings(opts));
        }
        "xhttp" | "splithttp" => {
            settings.xhttp_settings = Some(upgrade_settings(opts));
        }
        _ => {}
    }

    settings
}

fn upgrade_settings(opts: &StreamOptions) -> UpgradeSettings {
    UpgradeSettings {
        path: opts.path.clone(),
        host: opts.host_header.clone(),
    }
}

/// Comma separated host list as found in share links
fn split_hosts(hosts: &str) -> Vec<String> {
    hosts
        .split(',')
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::RealityOptions;

    fn endpoint() -> Endpoint {
        Endpoint::new("1.2.3.4", 443).unwrap()
    }

    #[test]
    fn test_vmess_ws_tls() {
        let params = ConnectionParams::Vmess(VmessParams {
            endpoint: endpoint(),
            id: "abc".to_string(),
            alter_id: 0,
            cipher: None,
            stream: StreamOptions {
                network: Some("ws".to_string()),
                security: Some("tls".to_string()),
                host_header: Some("cdn.example.com".to_string()),
                path: Some("/ray".to_string()),
                ..Default::default()
            },
        });
        let value = serde_json::to_value(OutboundBuilder::build(&params).unwrap()).unwrap();
        assert_eq!(value["protocol"], "vmess");
        assert_eq!(value["settings"]["vnext"][0]["address"], "1.2.3.4");
        assert_eq!(value["settings"]["vnext"][0]["users"][0]["security"], "auto");
        assert_eq!(value["streamSettings"]["network"], "ws");
        assert_eq!(value["streamSettings"]["wsSettings"]["path"], "/ray");
        assert_eq!(value["streamSettings"]["wsSettings"]["headers"]["Host"], "cdn.example.com");
        assert_eq!(value["streamSettings"]["tlsSettings"]["serverName"], "cdn.example.com");
        assert!(value["streamSettings"].get("realitySettings").is_none());
    }

    #[test]
    fn test_vless_reality() {
        let params = ConnectionParams::Vless(VlessParams {
            endpoint: endpoint(),
            id: "id".to_string(),
            flow: Some("xtls-rprx-vision".to_string()),
            stream: StreamOptions {
                security: Some("reality".to_string()),
                sni: Some("www.example.com".to_string()),
                reality: Some(RealityOptions {
                    public_key: "PUB".to_string(),
                    short_id: Some("ab".to_string()),
                    spider_x: None,
                }),
                ..Default::default()
            },
        });
        let value = serde_json::to_value(OutboundBuilder::build(&params).unwrap()).unwrap();
        let user = &value["settings"]["vnext"][0]["users"][0];
        assert_eq!(user["encryption"], "none");
        assert_eq!(user["flow"], "xtls-rprx-vision");
        let reality = &value["streamSettings"]["realitySettings"];
        assert_eq!(reality["publicKey"], "PUB");
        assert_eq!(reality["fingerprint"], "chrome");
        assert_eq!(reality["serverName"], "www.example.com");
        assert_eq!(value["streamSettings"]["network"], "tcp");
    }

    #[test]
    fn test_trojan_defaults_to_tls() {
        let params = ConnectionParams::Trojan(TrojanParams {
            endpoint: endpoint(),
            password: "pw".to_string(),
            stream: StreamOptions::default(),
        });
        let value = serde_json::to_value(OutboundBuilder::build(&params).unwrap()).unwrap();
        assert_eq!(value["settings"]["servers"][0]["password"], "pw");
        assert!(value["settings"]["servers"][0].get("method").is_none());
        assert_eq!(value["streamSettings"]["security"], "tls");
    }

    #[test]
    fn test_shadowsocks() {
        let params = ConnectionParams::Shadowsocks(ShadowsocksParams {
            endpoint: endpoint(),
            method: "aes-256-gcm".to_string(),
            password: "pass".to_string(),
            plugin: None,
        });
        let value = serde_json::to_value(OutboundBuilder::build(&params).unwrap()).unwrap();
        assert_eq!(value["protocol"], "shadowsocks");
        assert_eq!(value["settings"]["servers"][0]["method"], "aes-256-gcm");
        assert!(value.get("streamSettings").is_none());
    }

    #[test]
    fn test_shadowsocks_r_only_plain() {
        let mut ssr = ShadowsocksRParams {
            endpoint: endpoint(),
            protocol: "origin".to_string(),
            method: "aes-256-cfb".to_string(),
            obfs: "plain".to_string(),
            password: "pw".to_string(),
            obfs_param: None,
            protocol_param: None,
        };
        assert!(OutboundBuilder::build(&ConnectionParams::ShadowsocksR(ssr.clone())).is_some());

        ssr.protocol = "auth_aes128_md5".to_string();
        assert!(OutboundBuilder::build(&ConnectionParams::ShadowsocksR(ssr)).is_none());
    }

    #[test]
    fn test_engine_config_shape() {
        let params = ConnectionParams::Hysteria2(Hysteria2Params {
            endpoint: endpoint(),
            auth: "secret".to_string(),
            sni: Some("example.com".to_string()),
            insecure: true,
            obfs: None,
            obfs_password: None,
        });
        let config = OutboundBuilder::engine_config(&params, 20801).unwrap();
        let value: serde_json::Value = serde_json::from_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(value["log"]["loglevel"], "none");
        assert_eq!(value["inbounds"][0]["port"], 20801);
        assert_eq!(value["inbounds"][0]["listen"], "127.0.0.1");
        assert_eq!(value["inbounds"][0]["protocol"], "socks");
        assert_eq!(value["inbounds"][0]["settings"]["udp"], true);
        assert_eq!(value["inbounds"][0]["settings"]["auth"], "noauth");
        assert_eq!(value["outbounds"][0]["protocol"], "hysteria2");
        assert_eq!(value["outbounds"][0]["streamSettings"]["tlsSettings"]["allowInsecure"], true);
        assert_eq!(value["outbounds"][0]["streamSettings"]["tlsSettings"]["alpn"][0], "h3");
    }

    fn vless_with(stream: StreamOptions) -> serde_json::Value {
        let params = ConnectionParams::Vless(VlessParams {
            endpoint: endpoint(),
            id: "id".to_string(),
            flow: None,
            stream,
        });
        serde_json::to_value(OutboundBuilder::build(&params).unwrap()).unwrap()
    }

    #[test]
    fn test_tcp_http_header() {
        let value = vless_with(StreamOptions {
            network: Some("tcp".to_string()),
            header_type: Some("http".to_string()),
            host_header: Some("a.com, b.com".to_string()),
            ..Default::default()
        });
        let header = &value["streamSettings"]["tcpSettings"]["header"];
        assert_eq!(header["type"], "http");
        assert_eq!(header["request"]["path"][0], "/");
        assert_eq!(header["request"]["headers"]["Host"][0], "a.com");
        assert_eq!(header["request"]["headers"]["Host"][1], "b.com");

        let plain = vless_with(StreamOptions::default());
        assert!(plain["streamSettings"].get("tcpSettings").is_none());
    }

    #[test]
    fn test_http_family_transports() {
        let value = vless_with(StreamOptions {
            network: Some("h2".to_string()),
            host_header: Some("h2.example".to_string()),
            path: Some("/h2".to_string()),
            ..Default::default()
        });
        assert_eq!(value["streamSettings"]["httpSettings"]["path"], "/h2");
        assert_eq!(value["streamSettings"]["httpSettings"]["host"][0], "h2.example");

        let value = vless_with(StreamOptions {
            network: Some("httpupgrade".to_string()),
            host_header: Some("up.example".to_string()),
            path: Some("/up".to_string()),
            ..Default::default()
        });
        assert_eq!(value["streamSettings"]["httpupgradeSettings"]["path"], "/up");
        assert_eq!(value["streamSettings"]["httpupgradeSettings"]["host"], "up.example");

        let value = vless_with(StreamOptions {
            network: Some("xhttp".to_string()),
            path: Some("/x".to_string()),
            ..Default::default()
        });
        assert_eq!(value["streamSettings"]["xhttpSettings"]["path"], "/x");
    }

    #[test]
    fn test_obfuscated_links_are_not_carried() {
        let plugin = ConnectionParams::Shadowsocks(ShadowsocksParams {
            endpoint: endpoint(),
            method: "aes-256-gcm".to_string(),
            password: "pass".to_string(),
            plugin: Some("obfs-local;obfs=http".to_string()),
        });
        assert!(OutboundBuilder::build(&plugin).is_none());

        let mut hy2 = Hysteria2Params {
            endpoint: endpoint(),
            auth: "pw".to_string(),
            sni: None,
            insecure: false,
            obfs: Some("salamander".to_string()),
            obfs_password: Some("secret".to_string()),
        };
        assert!(OutboundBuilder::build(&ConnectionParams::Hysteria2(hy2.clone())).is_none());

        hy2.obfs = None;
        hy2.obfs_password = None;
        assert!(OutboundBuilder::build(&ConnectionParams::Hysteria2(hy2)).is_some());
    }
}
