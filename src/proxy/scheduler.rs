//! Windowed fan-out of probes
//!
//! Targets are split into consecutive windows of `concurrency` items. All
//! probes of a window run concurrently, each on its own local port
//! (`base_port + offset`), and the next window starts only once the whole
//! window has finished. Ports are therefore reused across windows but never
//! shared by two live probes.

use crate::proxy::checker::{LinkProber, ProbeError};
use crate::proxy::models::{ProbeResult, ProbeTarget};
use futures::future::join_all;
use std::future::Future;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

/// First local port handed to probes
pub const DEFAULT_BASE_PORT: u16 = 20800;

/// Default number of probes per window
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Progress notifications emitted while a batch runs
#[derive(Debug, Clone)]
pub enum ProbeEvent {
    /// A window is about to start (`index` is zero-based)
    WindowStarted { index: usize, total: usize },
    Passed(ProbeResult),
    Failed { label: String, reason: String },
}

/// Runs probes window by window under a fixed concurrency limit
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    concurrency: usize,
    base_port: u16,
    events: Option<UnboundedSender<ProbeEvent>>,
}

impl BatchScheduler {
    pub fn new(concurrency: usize, base_port: u16) -> Self {
        Self {
            concurrency: concurrency.max(1),
            base_port,
            events: None,
        }
    }

    /// Report progress to `sender`
    pub fn with_events(mut self, sender: UnboundedSender<ProbeEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Number of windows needed for `count` targets
    pub fn window_count(&self, count: usize) -> usize {
        count.div_ceil(self.concurrency)
    }

    /// Local port of the probe at `offset` within its window
    pub fn port_for(&self, offset: usize) -> u16 {
        self.base_port.saturating_add(offset as u16)
    }

    /// Probe every target with `probe`, returning the successful results in window order.
    ///
    /// Failures are logged and dropped; they never abort the batch.
    pub async fn run<F, Fut>(&self, targets: &[ProbeTarget], probe: F) -> Vec<ProbeResult>
    where
        F: Fn(ProbeTarget, u16) -> Fut,
        Fut: Future<Output = Result<ProbeResult, ProbeError>>,
    {
        let total = self.window_count(targets.len());
        let mut results = Vec::new();

        for (index, window) in targets.chunks(self.concurrency).enumerate() {
            info!("Testing window {} of {} ({} links)", index + 1, total, window.len());
            self.emit(ProbeEvent::WindowStarted { index, total });

            let probes = window.iter().enumerate().map(|(offset, target)| {
                let label = target.label.clone();
                let pending = probe(target.clone(), self.port_for(offset));
                async move { (label, pending.await) }
            });

            for (label, outcome) in join_all(probes).await {
                match outcome {
                    Ok(result) => {
                        info!(
                            "[SUCCESS] ({}ms) | Speed: {} | {} | {}",
                            result.latency,
                            result
                                .speed_mbps
                                .map(|s| format!("{:.2}Mbps", s))
                                .unwrap_or_else(|| "N/A".to_string()),
                            result.country_name,
                            label
                        );
                        self.emit(ProbeEvent::Passed(result.clone()));
                        results.push(result);
                    }
                    Err(e) => {
                        let reason = if e.is_timeout() {
                            "Timeout".to_string()
                        } else {
                            e.to_string()
                        };
                        info!("[FAIL] ({}) {}", reason, label);
                        self.emit(ProbeEvent::Failed { label, reason });
                    }
                }
            }
        }

        results
    }

    /// Probe every target through `prober`, tagging results with `source`
    pub async fn run_probes(
        &self,
        prober: &LinkProber,
        targets: &[ProbeTarget],
        source: &str,
    ) -> Vec<ProbeResult> {
        self.run(targets, |target, port| async move {
            prober.probe(&target, port, source).await
        })
        .await
    }

    fn emit(&self, event: ProbeEvent) {
        if let Some(sender) = &self.events {
            if sender.send(event).is_err() {
                debug!("progress receiver dropped");
            }
        }
    }
}

impl Default for BatchScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY, DEFAULT_BASE_PORT)
    }
}
