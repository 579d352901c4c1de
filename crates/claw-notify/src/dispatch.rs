//! Delivery of flushed batches to plugins.
//!
//! Each plugin gets one dispatch worker fed by its own bounded queue, so a
//! plugin handles one notify at a time while different plugins proceed
//! concurrently. [`DispatchRouter::dispatch`] waits while the plugin's queue
//! is full: a slow plugin holds up the batcher, which stops draining the
//! ingestion queue, which in turn makes producers wait.
//!
//! Delivery is best effort. A failed or timed out notify is logged and the
//! batch is dropped; a plugin that is not ready drops its batches.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use claw_notify_proto::Alert;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::batch::FlushedBatch;
use crate::error::{BrokerError, Result};

/// Runtime status of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginStatus {
    /// Spawned, handshake or configure in progress.
    Starting,
    /// Accepting batches.
    Ready,
    /// Crashed or failed to start. Terminal.
    Failed,
    /// Stopped by the broker. Terminal.
    Stopped,
}

impl PluginStatus {
    /// Check if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// The request side of a plugin.
#[async_trait]
pub trait PluginSink: Send + Sync {
    /// The configured plugin name.
    fn name(&self) -> &str;

    /// Current status.
    fn status(&self) -> PluginStatus;

    /// Sends the plugin its configuration section.
    async fn configure(&self, config: Value) -> Result<()>;

    /// Delivers one batch.
    async fn notify(&self, alerts: Vec<Alert>) -> Result<()>;
}

/// Per-plugin delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Batches acknowledged by the plugin.
    pub delivered: usize,
    /// Batches the plugin failed or timed out on.
    pub failed: usize,
    /// Batches dropped because the plugin was not ready.
    pub dropped: usize,
}

impl DispatchStats {
    fn merge(&mut self, other: Self) {
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.dropped += other.dropped;
    }
}

/// Routes flushed batches to their plugin's worker.
#[derive(Debug, Default)]
pub struct DispatchRouter {
    queues: HashMap<Arc<str>, mpsc::Sender<FlushedBatch>>,
}

impl DispatchRouter {
    /// Queues a batch for its plugin, waiting while the queue is full.
    ///
    /// Returns false if the batch was dropped because no worker takes it.
    pub async fn dispatch(&self, batch: FlushedBatch) -> bool {
        let Some(queue) = self.queues.get(&batch.key.plugin) else {
            warn!(
                profile = %batch.key.profile,
                plugin = %batch.key.plugin,
                alerts = batch.alerts.len(),
                "no dispatch worker for plugin, dropping batch"
            );
            return false;
        };

        match queue.send(batch).await {
            Ok(()) => true,
            Err(mpsc::error::SendError(batch)) => {
                warn!(
                    profile = %batch.key.profile,
                    plugin = %batch.key.plugin,
                    alerts = batch.alerts.len(),
                    "dispatch worker gone, dropping batch"
                );
                false
            }
        }
    }

    /// Queues batches in order. Returns the number queued.
    pub async fn dispatch_all(&self, batches: Vec<FlushedBatch>) -> usize {
        let mut queued = 0;
        for batch in batches {
            if self.dispatch(batch).await {
                queued += 1;
            }
        }
        queued
    }
}

/// Handles to the running dispatch workers.
#[derive(Debug, Default)]
pub struct DispatchWorkers {
    handles: Vec<(String, JoinHandle<DispatchStats>)>,
    closed: CancellationToken,
}

impl DispatchWorkers {
    /// Closes every queue and waits for the workers to deliver what was
    /// already queued.
    ///
    /// Batches dispatched after this point are dropped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Task`] naming the first worker that panicked;
    /// the remaining workers are still awaited.
    pub async fn join(self) -> Result<DispatchStats> {
        self.closed.cancel();

        let mut total = DispatchStats::default();
        let mut first_error = None;

        for (plugin, handle) in self.handles {
            match handle.await {
                Ok(stats) => total.merge(stats),
                Err(e) => {
                    error!(plugin = %plugin, error = %e, "dispatch worker failed");
                    first_error.get_or_insert(BrokerError::Task(format!(
                        "dispatch worker for {plugin}: {e}"
                    )));
                }
            }
        }

        first_error.map_or(Ok(total), Err)
    }
}

/// Starts one dispatch worker per plugin, each queueing at most `capacity`
/// batches.
pub fn spawn_workers(
    plugins: impl IntoIterator<Item = Arc<dyn PluginSink>>,
    capacity: usize,
) -> (DispatchRouter, DispatchWorkers) {
    let mut router = DispatchRouter::default();
    let mut workers = DispatchWorkers::default();

    for plugin in plugins {
        let name = plugin.name().to_string();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        router.queues.insert(Arc::from(name.as_str()), tx);
        let closed = workers.closed.clone();
        workers
            .handles
            .push((name, tokio::spawn(run_worker(plugin, rx, closed))));
    }

    (router, workers)
}

async fn run_worker(
    plugin: Arc<dyn PluginSink>,
    mut queue: mpsc::Receiver<FlushedBatch>,
    closed: CancellationToken,
) -> DispatchStats {
    let mut stats = DispatchStats::default();

    loop {
        tokio::select! {
            biased;
            batch = queue.recv() => match batch {
                Some(batch) => deliver(plugin.as_ref(), batch, &mut stats).await,
                None => break,
            },
            () = closed.cancelled() => {
                queue.close();
                while let Some(batch) = queue.recv().await {
                    deliver(plugin.as_ref(), batch, &mut stats).await;
                }
                break;
            }
        }
    }

    debug!(
        plugin = %plugin.name(),
        delivered = stats.delivered,
        failed = stats.failed,
        dropped = stats.dropped,
        "dispatch worker finished"
    );
    stats
}

async fn deliver(plugin: &dyn PluginSink, batch: FlushedBatch, stats: &mut DispatchStats) {
    let status = plugin.status();
    if status != PluginStatus::Ready {
        warn!(
            plugin = %plugin.name(),
            profile = %batch.key.profile,
            alerts = batch.alerts.len(),
            status = %status,
            "plugin unavailable, dropping batch"
        );
        stats.dropped += 1;
        return;
    }

    let count = batch.alerts.len();
    match plugin.notify(batch.alerts).await {
        Ok(()) => {
            debug!(
                plugin = %plugin.name(),
                profile = %batch.key.profile,
                alerts = count,
                trigger = %batch.trigger,
                "batch delivered"
            );
            stats.delivered += 1;
        }
        Err(e) => {
            warn!(
                plugin = %plugin.name(),
                profile = %batch.key.profile,
                alerts = count,
                error = %e,
                "notify failed, dropping batch"
            );
            stats.failed += 1;
        }
    }
}
