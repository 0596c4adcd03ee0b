use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use link_prober::proxy::models::{ConnectionParams, Protocol};
use link_prober::proxy::LinkParser;

fn vmess_link(json: &str) -> String {
    format!("vmess://{}", STANDARD.encode(json))
}

#[test]
fn vmess_link_decodes_host_and_port() {
    let link = vmess_link(r#"{"add":"1.2.3.4","port":443,"id":"abc","ps":"test"}"#);
    let target = LinkParser::parse_line(&link).expect("decodes");

    assert_eq!(target.params.protocol(), Protocol::Vmess);
    assert_eq!(target.params.endpoint().host, "1.2.3.4");
    assert_eq!(target.params.endpoint().port, 443);
    assert_eq!(target.params.identifier(), "abc");
    assert_eq!(target.label, "test");
}

#[test]
fn shadowsocks_link_decodes_method_password_and_label() {
    let target = LinkParser::parse_line("ss://YWVzLTI1Ni1nY206cGFzcw==@5.6.7.8:8388#MyNode")
        .expect("decodes");

    let ConnectionParams::Shadowsocks(params) = &target.params else {
        panic!("expected shadowsocks, got {:?}", target.params);
    };
    assert_eq!(params.method, "aes-256-gcm");
    assert_eq!(params.password, "pass");
    assert_eq!(params.endpoint.host, "5.6.7.8");
    assert_eq!(params.endpoint.port, 8388);
    assert_eq!(target.label, "MyNode");
}

#[test]
fn feed_with_prose_yields_one_candidate() {
    let feed = "Fresh servers below, updated hourly!\n\
                trojan://secret@example.com:443?sni=example.com#Node1\n";
    let candidates = LinkParser::extract_candidates(feed);
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].config, "trojan://secret@example.com:443?sni=example.com");
}

#[test]
fn every_protocol_prefix_decodes() {
    let links = [
        (
            vmess_link(r#"{"add":"a.example","port":"8443","id":"uuid-1","net":"ws"}"#),
            Protocol::Vmess,
        ),
        (
            "vless://uuid-2@b.example:443?security=tls&type=grpc&serviceName=svc".to_string(),
            Protocol::Vless,
        ),
        ("trojan://pw@c.example:443".to_string(), Protocol::Trojan),
        (
            "ss://chacha20-ietf-poly1305:pw@d.example:8388".to_string(),
            Protocol::Shadowsocks,
        ),
        (
            format!(
                "ssr://{}",
                STANDARD.encode(format!("e.example:8388:origin:aes-256-cfb:plain:{}/", STANDARD.encode("pw")))
            ),
            Protocol::ShadowsocksR,
        ),
        ("hysteria2://auth@f.example:443".to_string(), Protocol::Hysteria2),
        ("hy2://auth@f.example:443".to_string(), Protocol::Hysteria2),
    ];

    for (link, protocol) in links {
        let params = LinkParser::parse_line(&link)
            .unwrap_or_else(|| panic!("failed to decode {}", link))
            .params;
        assert_eq!(params.protocol(), protocol, "{}", link);
        assert!(!params.identifier().is_empty(), "{}", link);
    }
}

#[test]
fn unknown_prefixes_are_ignored() {
    for line in [
        "http://1.2.3.4:8080",
        "socks5://1.2.3.4:1080",
        "just some words",
        "",
        "ssx://abc@host:1",
    ] {
        assert!(LinkParser::parse_line(line).is_none(), "{}", line);
    }
}

#[test]
fn duplicates_collapse_regardless_of_order() {
    let a = "vless://id@h.example:443?security=tls#First";
    let b = "vless://id@h.example:443?security=tls#Second";
    let c = "trojan://pw@other.example:443#Other";

    for feed in [
        format!("{}\n{}\n{}", a, b, c),
        format!("{}\n{}\n{}", c, b, a),
        format!("{}\n{}\n{}", b, c, a),
    ] {
        let candidates = LinkParser::extract_candidates(&feed);
        assert_eq!(candidates.len(), 2, "{}", feed);
        let vless: Vec<_> = candidates
            .iter()
            .filter(|c| c.config.starts_with("vless://"))
            .collect();
        assert_eq!(vless.len(), 1);
    }
}

#[test]
fn decoding_is_idempotent() {
    let feed = format!(
        "{}\nss://YWVzLTI1Ni1nY206cGFzcw==@5.6.7.8:8388#MyNode\nhy2://auth@[2001:db8::1]:443?sni=x#v6",
        vmess_link(r#"{"add":"1.2.3.4","port":443,"id":"abc","tls":"tls","sni":"s.example"}"#)
    );
    for candidate in LinkParser::extract_candidates(&feed) {
        let first = LinkParser::decode(&candidate).expect("decodes");
        let second = LinkParser::decode(&candidate).expect("decodes");
        assert_eq!(first, second);
    }
}

#[test]
fn base64_subscription_body_is_scanned() {
    let body = STANDARD.encode(
        "trojan://pw@a.example:443#A\nvless://id@b.example:443?security=tls#B\n",
    );
    let targets = LinkParser::parse_string(&body);
    assert_eq!(targets.len(), 2);
    assert_eq!(targets[0].label, "A");
    assert_eq!(targets[1].label, "B");
}

#[test]
fn shadowsocks_userinfo_in_standard_alphabet_decodes() {
    let target = LinkParser::parse_line("ss://YWVzLTI1Ni1nY206cGE/c3M+dz8=@5.6.7.8:8388#x")
        .expect("decodes");

    let ConnectionParams::Shadowsocks(params) = &target.params else {
        panic!("expected shadowsocks, got {:?}", target.params);
    };
    assert_eq!(params.method, "aes-256-gcm");
    assert_eq!(params.password, "pa?ss>w?");
    assert_eq!(params.endpoint.port, 8388);
    assert_eq!(target.label, "x");
}
