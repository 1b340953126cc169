//! Periodic draining of every signal buffer to the gateway

use crate::errors::Result;
use crate::queue::BufferedQueue;
use crate::transport::HttpForwarder;

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, warn};

/// A buffer the scheduler can drain, independent of its item type
#[async_trait]
pub trait Drain: Send + Sync {
    fn signal_type(&self) -> &str;

    async fn drain_all(&self, timeout: Duration) -> Result<usize>;

    async fn shutdown(&self);
}

#[async_trait]
impl<T: Send + Sync + 'static> Drain for BufferedQueue<T> {
    fn signal_type(&self) -> &str {
        BufferedQueue::signal_type(self)
    }

    async fn drain_all(&self, timeout: Duration) -> Result<usize> {
        BufferedQueue::drain_all(self, timeout).await
    }

    async fn shutdown(&self) {
        BufferedQueue::shutdown(self).await
    }
}

/// Outcome of draining one signal buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignalDrain {
    pub signal: String,
    pub exported: usize,
    pub error: Option<String>,
}

/// Outcome of one pass over every signal buffer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub signals: Vec<SignalDrain>,
}

impl DrainReport {
    pub fn total_exported(&self) -> usize {
        self.signals.iter().map(|signal| signal.exported).sum()
    }

    pub fn failures(&self) -> usize {
        self.signals.iter().filter(|signal| signal.error.is_some()).count()
    }
}

/// Drains each buffer on a fixed interval and whenever triggered.
pub struct DrainScheduler {
    queues: Vec<Arc<dyn Drain>>,
    interval: Duration,
    timeout: Duration,
    trigger: Arc<Notify>,
}

impl DrainScheduler {
    pub fn new(queues: Vec<Arc<dyn Drain>>, interval: Duration, timeout: Duration) -> Self {
        Self {
            queues,
            interval,
            timeout,
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Request a drain pass without waiting for the next tick
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Handle other tasks can use to request a drain pass
    pub fn trigger_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    /// Drain every buffer once. A failing buffer does not stop the others.
    #[instrument(skip(self))]
    pub async fn drain_once(&self) -> DrainReport {
        let mut report = DrainReport::default();

        for queue in &self.queues {
            let signal = queue.signal_type().to_string();
            let entry = match queue.drain_all(self.timeout).await {
                Ok(exported) => SignalDrain {
                    signal,
                    exported,
                    error: None,
                },
                Err(e) => {
                    error!("Failed to drain {} buffer: {}", signal, e);
                    SignalDrain {
                        signal,
                        exported: 0,
                        error: Some(e.to_string()),
                    }
                }
            };
            report.signals.push(entry);
        }

        report
    }

    /// Drain on every tick and trigger until `shutdown` completes.
    ///
    /// Returns the number of batches exported over the whole run.
    pub async fn run_until<F>(&self, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        let mut drain_interval = interval(self.interval);
        drain_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            "Draining {} buffers every {}s",
            self.queues.len(),
            self.interval.as_secs()
        );

        let mut exported = 0;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = drain_interval.tick() => {}
                _ = self.trigger.notified() => debug!("Drain triggered"),
            }

            let report = self.drain_once().await;
            if report.total_exported() > 0 || report.failures() > 0 {
                info!(
                    "Drain pass exported {} batches, {} buffers failed",
                    report.total_exported(),
                    report.failures()
                );
            }
            exported += report.total_exported();
        }

        info!("Drain scheduler stopped after exporting {} batches", exported);
        exported
    }

    /// Close every buffer
    pub async fn shutdown(&self) {
        for queue in &self.queues {
            queue.shutdown().await;
        }
    }
}

/// Poll the gateway health endpoint and request a drain as soon as it
/// becomes reachable again. Runs until the task is dropped.
pub async fn watch_gateway(forwarder: HttpForwarder, period: Duration, trigger: Arc<Notify>) {
    let mut check_interval = interval(period);
    check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reachable = false;

    loop {
        check_interval.tick().await;

        let now_reachable = forwarder.test_connectivity().await;
        if now_reachable && !reachable {
            info!("Gateway reachable, requesting a drain");
            trigger.notify_one();
        } else if !now_reachable && reachable {
            warn!("Gateway became unreachable, buffered data stays on disk");
        }
        reachable = now_reachable;
    }
}
