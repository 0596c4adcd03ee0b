//! A full cycle: registry, feed fetch, probing through a stub engine, publish.

#![cfg(unix)]

mod common;

use common::{closed_port, spawn_http, spawn_socks, Fixture};
use link_prober::cycle::CycleDriver;
use link_prober::proxy::ProbeResult;
use link_prober::registry::SourceRegistry;
use link_prober::{Config, GeoLookup};
use std::fs;
use std::time::Duration;

const FEED: &str = "Daily servers, enjoy!\n\
                    trojan://a@203.0.113.5:443?sni=a.example#First\n\
                    trojan://a@203.0.113.5:443?sni=a.example#Duplicate\n\
                    trojan://b@203.0.113.6:443?sni=b.example#Second\n\
                    not-a-link://whatever\n";

fn config(fixture: &Fixture, http: u16, socks: u16) -> Config {
    let root = fixture.dir.path();
    Config {
        db_path: root.join("prober.sqlite"),
        engine_path: fixture.engine.clone(),
        temp_dir: fixture.temp_dir(),
        results_dir: root.join("results"),
        pool_file: root.join("pool.json"),
        concurrency: 1,
        base_port: socks,
        max_latency: Duration::from_millis(1500),
        warmup: Duration::from_millis(200),
        test_url: format!("http://127.0.0.1:{}/generate_204", http),
        service_tests: false,
        batch_size: 1,
        channel_tag: "@test".to_string(),
        geo_lookup: GeoLookup::Off,
        ..Config::default()
    }
}

#[tokio::test]
async fn cycle_publishes_top_result_and_pools_the_rest() {
    let fixture = Fixture::new("exec sleep 30");
    let http = spawn_http(Some(FEED.to_string())).await;
    let socks = spawn_socks(0).await;
    let dead = closed_port().await;

    let config = config(&fixture, http, socks);
    config.validate().expect("valid config");

    let registry = SourceRegistry::connect(&config.db_path).await.unwrap();
    registry
        .add_source(&format!("http://127.0.0.1:{}/feed.txt", http))
        .await
        .unwrap();
    registry
        .add_source(&format!("http://127.0.0.1:{}/gone.txt", dead))
        .await
        .unwrap();

    let driver = CycleDriver::from_config(&config).unwrap();
    let report = driver.run_cycle(&registry).await.unwrap();

    assert_eq!(report.sources, 2);
    assert_eq!(report.failed_sources, 1);
    assert_eq!(report.candidates, 2);
    assert_eq!(report.probed, 2);
    assert_eq!(report.passed, 2);
    assert_eq!(report.published, 1);
    assert_eq!(report.pooled, 1);

    let batches: Vec<_> = fs::read_dir(&config.results_dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(batches.len(), 1);
    let file_name = batches[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(file_name.starts_with("feed_"), "{}", file_name);

    let batch: Vec<ProbeResult> =
        serde_json::from_str(&fs::read_to_string(&batches[0]).unwrap()).unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].name, "🌐 | @test");
    assert_eq!(batch[0].source, "feed");
    assert!(batch[0].config.ends_with(&*urlencoding::encode("🌐 | @test")));

    let pooled = driver.queue().load_pool(chrono::Duration::hours(1));
    assert_eq!(pooled.len(), 1);
    assert_ne!(pooled[0].fingerprint, batch[0].fingerprint);
    // Pooled results keep their original label until they are published.
    assert!(pooled[0].name == "First" || pooled[0].name == "Second");

    assert_eq!(fixture.temp_files(), 0);
}

#[tokio::test]
async fn pool_survives_a_cycle_without_fresh_results() {
    let fixture = Fixture::new("exec sleep 30");
    let http = spawn_http(Some(FEED.to_string())).await;
    let socks = spawn_socks(0).await;
    let config = config(&fixture, http, socks);

    let registry = SourceRegistry::connect(&config.db_path).await.unwrap();
    let source = registry
        .add_source(&format!("http://127.0.0.1:{}/feed.txt", http))
        .await
        .unwrap();
    let driver = CycleDriver::from_config(&config).unwrap();
    driver.run_cycle(&registry).await.unwrap();

    // Swap the working feed for a dead one.
    assert!(registry.remove_source(source.id).await.unwrap());
    let dead = closed_port().await;
    registry
        .add_source(&format!("http://127.0.0.1:{}/feed.txt", dead))
        .await
        .unwrap();

    let report = driver.run_cycle(&registry).await.unwrap();
    assert_eq!(report.failed_sources, 1);
    assert_eq!(report.published, 0);
    assert_eq!(driver.queue().load_pool(chrono::Duration::hours(1)).len(), 1);
}

#[tokio::test]
async fn publish_failure_does_not_stop_later_sources() {
    let fixture = Fixture::new("exec sleep 30");
    let first = spawn_http(Some(FEED.to_string())).await;
    let second = spawn_http(Some(FEED.to_string())).await;
    let socks = spawn_socks(0).await;
    let config = config(&fixture, first, socks);

    // A directory in place of the pool file makes every pool write fail.
    fs::create_dir_all(&config.pool_file).unwrap();

    let registry = SourceRegistry::connect(&config.db_path).await.unwrap();
    for port in [first, second] {
        registry
            .add_source(&format!("http://127.0.0.1:{}/feed.txt", port))
            .await
            .unwrap();
    }

    let driver = CycleDriver::from_config(&config).unwrap();
    let report = driver.run_cycle(&registry).await.expect("cycle keeps going");

    assert_eq!(report.sources, 2);
    assert_eq!(report.failed_sources, 0);
    assert_eq!(report.probed, 4);
    assert_eq!(report.passed, 4);
    assert_eq!(report.published, 0);
    // Both sources still got their batch written before the pool write failed.
    assert_eq!(fs::read_dir(&config.results_dir).unwrap().count(), 2);
    assert_eq!(fixture.temp_files(), 0);
}
