//! Background persistence.
//!
//! Writes go through a FIFO queue drained by a single [`PersistenceWorker`],
//! so history keeps broker-delivery order and a slow store never delays a
//! broadcast.

use crate::event::TelemetryReading;
use crate::gateway::PersistenceGateway;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// A unit of work for the persistence worker.
#[derive(Debug)]
pub enum PersistJob {
    Telemetry(TelemetryReading),
    /// `device` is the device label.
    DeviceAction { device: String, action: String },
    /// Acknowledged once every earlier job is done.
    Flush(oneshot::Sender<()>),
}

/// Write counters shared by the queue and its worker.
#[derive(Debug, Default)]
pub struct PersistStats {
    written: AtomicU64,
    failed: AtomicU64,
}

impl PersistStats {
    /// Writes that succeeded.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Writes that failed.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Producer side of the persistence queue.
#[derive(Debug, Clone)]
pub struct PersistenceQueue {
    tx: mpsc::UnboundedSender<PersistJob>,
    stats: Arc<PersistStats>,
}

impl PersistenceQueue {
    /// Create a queue and the worker that drains it into `gateway`.
    #[must_use]
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> (Self, PersistenceWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(PersistStats::default());
        let worker = PersistenceWorker {
            rx,
            gateway,
            stats: Arc::clone(&stats),
        };
        (Self { tx, stats }, worker)
    }

    /// Queue a telemetry write.
    pub fn telemetry(&self, reading: TelemetryReading) {
        self.submit(PersistJob::Telemetry(reading));
    }

    /// Queue a device action write.
    pub fn device_action(&self, device: impl Into<String>, action: impl Into<String>) {
        self.submit(PersistJob::DeviceAction {
            device: device.into(),
            action: action.into(),
        });
    }

    /// Wait until every job queued so far has been processed.
    ///
    /// Returns `false` if the worker is no longer running.
    pub async fn flush(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(PersistJob::Flush(tx)).is_err() {
            return false;
        }
        rx.await.is_ok()
    }

    /// Write counters.
    #[must_use]
    pub fn stats(&self) -> &PersistStats {
        &self.stats
    }

    fn submit(&self, job: PersistJob) {
        if self.tx.send(job).is_err() {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!("Persistence worker stopped, dropping write");
        }
    }
}

/// Consumer side of the persistence queue.
pub struct PersistenceWorker {
    rx: mpsc::UnboundedReceiver<PersistJob>,
    gateway: Arc<dyn PersistenceGateway>,
    stats: Arc<PersistStats>,
}

impl PersistenceWorker {
    /// Process jobs until every [`PersistenceQueue`] handle is dropped.
    pub async fn run(mut self) {
        debug!(backend = self.gateway.name(), "Persistence worker started");

        while let Some(job) = self.rx.recv().await {
            match job {
                PersistJob::Telemetry(reading) => {
                    match self.gateway.append_telemetry(&reading).await {
                        Ok(id) => {
                            self.stats.written.fetch_add(1, Ordering::Relaxed);
                            trace!(id, "Telemetry stored");
                        }
                        Err(e) => {
                            self.stats.failed.fetch_add(1, Ordering::Relaxed);
                            warn!(error = %e, "Failed to store telemetry");
                        }
                    }
                }
                PersistJob::DeviceAction { device, action } => {
                    match self.gateway.append_device_action(&device, &action).await {
                        Ok(id) => {
                            self.stats.written.fetch_add(1, Ordering::Relaxed);
                            trace!(id, device = %device, action = %action, "Device action stored");
                        }
                        Err(e) => {
                            self.stats.failed.fetch_add(1, Ordering::Relaxed);
                            warn!(device = %device, action = %action, error = %e, "Failed to store device action");
                        }
                    }
                }
                PersistJob::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }

        debug!("Persistence worker stopped");
    }
}
