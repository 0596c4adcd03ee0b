//! End-to-end probes against a stub engine.

#![cfg(unix)]

mod common;

use common::{assert_not_running, closed_port, spawn_http, spawn_socks, Fixture};
use link_prober::proxy::{
    BatchScheduler, LinkParser, LinkProber, ProbeError, ProbeTarget, ServiceCheck,
};
use std::time::{Duration, Instant};

fn target() -> ProbeTarget {
    LinkParser::parse_line("trojan://secret@203.0.113.5:443?sni=example.com#Stub").unwrap()
}

#[tokio::test]
async fn successful_probe_cleans_up() {
    let fixture = Fixture::new("exec sleep 30");
    let http = spawn_http(None).await;
    let socks = spawn_socks(0).await;
    let dead = closed_port().await;

    let config = fixture
        .config(format!("http://127.0.0.1:{}/generate_204", http))
        .with_services(vec![
            ServiceCheck::new(&format!("http://127.0.0.1:{}/ok", http), "#Ok"),
            ServiceCheck::new(&format!("http://127.0.0.1:{}/", dead), "#Dead"),
        ])
        .with_speed_test(format!("http://127.0.0.1:{}/payload", dead));
    let prober = LinkProber::with_config(config);

    let result = prober.probe(&target(), socks, "feed").await.expect("probe passes");

    assert!(result.latency < 1500);
    assert_eq!(result.tags, vec!["#Ok".to_string()]);
    // A failed speed test keeps the latency result.
    assert_eq!(result.speed_mbps, None);
    assert_eq!(result.name, "Stub");
    assert_eq!(result.source, "feed");
    assert_eq!(result.country_code, "XX");

    let engine_config = fixture.engine_config();
    assert_eq!(engine_config["inbounds"][0]["port"], socks);
    assert_eq!(engine_config["inbounds"][0]["listen"], "127.0.0.1");
    assert_eq!(engine_config["outbounds"][0]["protocol"], "trojan");

    assert_eq!(fixture.temp_files(), 0);
    assert_not_running(fixture.engine_pid().expect("engine started"));
}

#[tokio::test]
async fn speed_test_reports_throughput() {
    let fixture = Fixture::new("exec sleep 30");
    let http = spawn_http(None).await;
    let socks = spawn_socks(0).await;

    let config = fixture
        .config(format!("http://127.0.0.1:{}/generate_204", http))
        .with_speed_test(format!("http://127.0.0.1:{}/payload", http));
    let result = LinkProber::with_config(config)
        .probe(&target(), socks, "feed")
        .await
        .expect("probe passes");

    assert!(result.speed_mbps.unwrap_or(0.0) > 0.0);
    assert_eq!(fixture.temp_files(), 0);
}

#[tokio::test]
async fn unreachable_server_times_out_within_budget() {
    let fixture = Fixture::new("exec sleep 30");
    let socks = spawn_socks(usize::MAX).await;

    let config = fixture
        .config("http://127.0.0.1:9/generate_204".to_string())
        .with_latency_timeout(Duration::from_millis(500));
    let prober = LinkProber::with_config(config);

    let started = Instant::now();
    let err = prober.probe(&target(), socks, "feed").await.unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {}", err);
    assert!(started.elapsed() < Duration::from_secs(3));

    assert_eq!(fixture.temp_files(), 0);
    assert_not_running(fixture.engine_pid().expect("engine started"));
}

#[tokio::test]
async fn batch_continues_after_a_timeout() {
    let fixture = Fixture::new("exec sleep 30");
    let http = spawn_http(None).await;
    let socks = spawn_socks(1).await;

    let config = fixture
        .config(format!("http://127.0.0.1:{}/generate_204", http))
        .with_latency_timeout(Duration::from_millis(500));
    let prober = LinkProber::with_config(config);

    let targets = LinkParser::parse_string(
        "trojan://a@203.0.113.5:443#First\ntrojan://b@203.0.113.6:443#Second\n",
    );
    assert_eq!(targets.len(), 2);

    let results = BatchScheduler::new(1, socks)
        .run_probes(&prober, &targets, "feed")
        .await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].name, "Second");
    assert_eq!(fixture.temp_files(), 0);
}

#[tokio::test]
async fn engine_that_exits_early_fails_fast() {
    let fixture = Fixture::new("exit 1");
    let config = fixture.config("http://127.0.0.1:9/".to_string());

    let err = LinkProber::with_config(config)
        .probe(&target(), closed_port().await, "feed")
        .await
        .unwrap_err();
    assert!(matches!(err, ProbeError::EngineExited(_)), "{}", err);
    assert_eq!(fixture.temp_files(), 0);
}
