//! Shared fixtures for end-to-end tests.
//!
//! The stub engine only records its pid and config, then sleeps. The SOCKS
//! listener the real engine would open is played by an in-test SOCKS5 server
//! bound to the probe port, relaying to a local HTTP server.

#![allow(dead_code)]

use link_prober::proxy::ProbeConfig;
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const PAYLOAD_BYTES: usize = 256 * 1024;

pub struct Fixture {
    pub dir: TempDir,
    pub engine: PathBuf,
}

impl Fixture {
    pub fn new(script_body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("tmp")).unwrap();
        let engine = dir.path().join("engine.sh");
        let script = format!(
            "#!/bin/sh\necho $$ > '{dir}/engine.pid'\ncp \"$2\" '{dir}/engine.json'\n{body}\n",
            dir = dir.path().display(),
            body = script_body
        );
        fs::write(&engine, script).unwrap();
        fs::set_permissions(&engine, fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir, engine }
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.dir.path().join("tmp")
    }

    pub fn config(&self, test_url: String) -> ProbeConfig {
        ProbeConfig::new()
            .with_engine_path(&self.engine)
            .with_temp_dir(self.temp_dir())
            .with_warmup(Duration::from_millis(200))
            .with_latency_timeout(Duration::from_millis(1500))
            .with_test_url(test_url)
            .with_services(Vec::new())
    }

    pub fn temp_files(&self) -> usize {
        fs::read_dir(self.temp_dir()).unwrap().count()
    }

    pub fn engine_pid(&self) -> Option<u32> {
        fs::read_to_string(self.dir.path().join("engine.pid"))
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    pub fn engine_config(&self) -> serde_json::Value {
        let raw = fs::read_to_string(self.dir.path().join("engine.json")).unwrap();
        serde_json::from_str(&raw).unwrap()
    }
}

pub fn assert_not_running(pid: u32) {
    if cfg!(target_os = "linux") {
        assert!(
            !Path::new(&format!("/proc/{}", pid)).exists(),
            "engine {} still running",
            pid
        );
    }
}

/// Local HTTP server: `/payload` returns a body, `/feed.txt` the given feed,
/// everything else is 204
pub async fn spawn_http(feed: Option<String>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let feed = Arc::new(feed);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let feed = Arc::clone(&feed);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]);
                let response = if request.starts_with("GET /payload") {
                    ok_response(&vec![b'x'; PAYLOAD_BYTES])
                } else if let (true, Some(feed)) = (request.starts_with("GET /feed.txt"), feed.as_ref()) {
                    ok_response(feed.as_bytes())
                } else {
                    b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n".to_vec()
                };
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    port
}

fn ok_response(body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

/// SOCKS5 server that stalls its first `stalled` connections and relays the rest
pub async fn spawn_socks(stalled: usize) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let index = accepted.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if index < stalled {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    drop(socket);
                } else {
                    let _ = relay(socket).await;
                }
            });
        }
    });
    port
}

async fn relay(mut client: TcpStream) -> std::io::Result<()> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    client.read_exact(&mut methods).await?;
    client.write_all(&[5, 0]).await?;

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    let host = match request[3] {
        1 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        3 => {
            let len = client.read_u8().await?;
            let mut name = vec![0u8; len as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        4 => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip).await?;
            Ipv6Addr::from(ip).to_string()
        }
        _ => return Ok(()),
    };
    let port = client.read_u16().await?;

    match TcpStream::connect((host.as_str(), port)).await {
        Ok(mut upstream) => {
            client.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
            tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        }
        Err(_) => {
            client.write_all(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
        }
    }
    Ok(())
}

/// A port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
