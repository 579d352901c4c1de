//! The notification broker.
//!
//! [`PluginBroker::start`] validates and starts every configured plugin, then
//! runs two supervised tasks:
//!
//! - **batcher**: consumes the bounded alert queue, routes each alert into
//!   the batches of its profile and runs the single shared clock driving
//!   time-triggered flushes. Every flushed batch is queued for its plugin
//!   before the next alert or tick is handled, so a full plugin queue stalls
//!   ingestion and producers wait.
//! - **events**: logs plugin crashes
//!
//! A third task waits for cancellation and runs the shutdown sequence:
//! close the queue and route what it still holds, flush every pending batch,
//! let the dispatch workers deliver their queues, then stop every plugin.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use claw_notify_proto::ProfileAlert;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::BatchEngine;
use crate::catalog::PluginCatalog;
use crate::config::BrokerConfig;
use crate::dispatch::{self, DispatchRouter, DispatchStats, DispatchWorkers, PluginSink, PluginStatus};
use crate::error::{BrokerError, Result};
use crate::process::{PluginEvent, PluginProcess, ProcessSupervisor};
use crate::security;
use crate::tasks::TaskGroup;

/// Broker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// Constructed, nothing validated yet.
    Created,
    /// Validating and starting plugins.
    Initializing,
    /// Ingesting and flushing.
    Running,
    /// Draining after a stop request.
    Stopping,
    /// All plugins stopped.
    Stopped,
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

fn transition(state: &RwLock<BrokerState>, to: BrokerState) {
    let from = std::mem::replace(&mut *state.write(), to);
    if from != to {
        info!(from = %from, to = %to, "broker state changed");
    }
}

/// Producer handle for the ingestion queue.
///
/// Sending waits while the queue is full.
#[derive(Debug, Clone)]
pub struct AlertSender {
    tx: mpsc::Sender<ProfileAlert>,
}

impl AlertSender {
    /// Enqueues an alert, waiting for room.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ChannelClosed`] once the broker is stopping.
    pub async fn send(&self, item: ProfileAlert) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| BrokerError::ChannelClosed)
    }

    /// Enqueues an alert from synchronous code, blocking for room.
    ///
    /// Must not be called from within an async runtime.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ChannelClosed`] once the broker is stopping.
    pub fn blocking_send(&self, item: ProfileAlert) -> Result<()> {
        self.tx
            .blocking_send(item)
            .map_err(|_| BrokerError::ChannelClosed)
    }

    /// Returns true once the broker no longer accepts alerts.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Outcome of a completed shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Batches flushed by the final drain.
    pub drained_batches: usize,
    /// Plugins stopped.
    pub stopped_plugins: usize,
    /// Delivery counters over the broker's lifetime.
    pub dispatch: DispatchStats,
}

/// A running notification broker.
pub struct PluginBroker {
    state: Arc<RwLock<BrokerState>>,
    sender: AlertSender,
    plugins: HashMap<String, Arc<PluginProcess>>,
    tasks: TaskGroup,
    report: Arc<Mutex<Option<ShutdownReport>>>,
}

impl fmt::Debug for PluginBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginBroker")
            .field("state", &self.state())
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl PluginBroker {
    /// Validates and starts every plugin, then starts ingestion.
    ///
    /// Initialization is all-or-nothing: every binary and identity is
    /// checked before anything is spawned, and if any plugin fails to start
    /// the ones already started are stopped before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first configuration, policy or process error.
    pub async fn start(config: BrokerConfig) -> Result<Self> {
        let state = Arc::new(RwLock::new(BrokerState::Created));

        config.validate()?;
        transition(&state, BrokerState::Initializing);

        let catalog = PluginCatalog::scan(&config.plugin_dir)?;

        let mut validated = Vec::with_capacity(config.plugins.len());
        for plugin in &config.plugins {
            let binary = catalog.resolve(plugin)?;
            let identity = security::validate_plugin(plugin, binary, &config.run_as)?;
            validated.push((plugin, binary.to_path_buf(), identity));
        }

        for plugin in &config.plugins {
            if !config
                .profiles
                .iter()
                .any(|p| p.notifications.contains(&plugin.name))
            {
                warn!(plugin = %plugin.name, "plugin is not bound to any profile");
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let supervisor =
            ProcessSupervisor::new(config.handshake_timeout, config.stop_timeout, events_tx);

        let mut processes: Vec<Arc<PluginProcess>> = Vec::with_capacity(validated.len());
        for (plugin, binary, identity) in validated {
            match supervisor.start(plugin, &binary, identity.as_ref()).await {
                Ok(process) => processes.push(Arc::new(process)),
                Err(e) => {
                    error!(plugin = %plugin.name, error = %e, "plugin failed to start");
                    stop_all(&processes).await;
                    transition(&state, BrokerState::Stopped);
                    return Err(e);
                }
            }
        }
        drop(supervisor);

        let engine = Arc::new(BatchEngine::new(&config.profiles, &config.plugins));
        let (router, workers) = dispatch::spawn_workers(
            processes
                .iter()
                .map(|p| Arc::clone(p) as Arc<dyn PluginSink>),
            config.dispatch_capacity,
        );
        let router = Arc::new(router);

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let tasks = TaskGroup::new();
        let token = tasks.token().clone();

        let batcher = tasks.spawn(
            "batcher",
            batch_loop(
                rx,
                Arc::clone(&engine),
                Arc::clone(&router),
                config.tick_interval,
                token.clone(),
            ),
        );
        tasks.spawn("events", event_loop(events_rx, token.clone()));

        let report = Arc::new(Mutex::new(None));
        tasks.spawn(
            "shutdown",
            ShutdownSequence {
                token,
                state: Arc::clone(&state),
                batcher,
                engine,
                router,
                workers,
                processes: processes.clone(),
                report: Arc::clone(&report),
            }
            .run(),
        );

        transition(&state, BrokerState::Running);
        info!(
            plugins = processes.len(),
            profiles = config.profiles.len(),
            tick = %humantime::format_duration(config.tick_interval),
            "broker running"
        );

        Ok(Self {
            state,
            sender: AlertSender { tx },
            plugins: processes
                .into_iter()
                .map(|p| (p.name().to_string(), p))
                .collect(),
            tasks,
            report,
        })
    }

    /// A producer handle for the ingestion queue.
    #[must_use]
    pub fn sender(&self) -> AlertSender {
        self.sender.clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> BrokerState {
        *self.state.read()
    }

    /// Status of a plugin by name.
    #[must_use]
    pub fn plugin_status(&self, name: &str) -> Option<PluginStatus> {
        self.plugins.get(name).map(|p| p.status())
    }

    /// Names of the started plugins.
    pub fn plugin_names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    /// The token whose cancellation stops the broker.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.tasks.token().clone()
    }

    /// Requests a graceful stop. Returns immediately.
    pub fn stop(&self) {
        if !self.tasks.is_stopping() {
            info!("broker stop requested");
        }
        self.tasks.stop();
    }

    /// Waits until the broker has stopped.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error raised by a broker task, including a
    /// failed shutdown step.
    pub async fn wait(&self) -> Result<()> {
        self.tasks.wait().await
    }

    /// The shutdown report, once the broker has stopped.
    #[must_use]
    pub fn report(&self) -> Option<ShutdownReport> {
        *self.report.lock()
    }

    /// Stops the broker and waits for the shutdown sequence to complete.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error raised by a broker task.
    pub async fn shutdown(self) -> Result<ShutdownReport> {
        self.stop();
        self.wait().await?;
        self.report().ok_or_else(|| BrokerError::Shutdown {
            step: "report",
            reason: "shutdown sequence did not complete".to_string(),
        })
    }
}

impl Drop for PluginBroker {
    fn drop(&mut self) {
        self.tasks.stop();
    }
}

async fn stop_all(processes: &[Arc<PluginProcess>]) {
    futures::future::join_all(processes.iter().map(|p| p.stop())).await;
}

async fn route(engine: &BatchEngine, router: &DispatchRouter, item: ProfileAlert) {
    let profile = item.profile_id;
    match engine.append(item, Instant::now()) {
        Some(flushed) => {
            router.dispatch_all(flushed).await;
        }
        None => warn!(profile = %profile, "no plugin bound to profile, dropping alert"),
    }
}

async fn batch_loop(
    mut rx: mpsc::Receiver<ProfileAlert>,
    engine: Arc<BatchEngine>,
    router: Arc<DispatchRouter>,
    period: Duration,
    token: CancellationToken,
) -> Result<()> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut senders_gone = false;

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = interval.tick() => {
                let flushed = engine.tick(Instant::now());
                if !flushed.is_empty() {
                    let queued = router.dispatch_all(flushed).await;
                    debug!(queued, "tick flushed batches");
                }
            }
            item = rx.recv(), if !senders_gone => match item {
                Some(item) => route(&engine, &router, item).await,
                None => {
                    debug!("all alert senders dropped");
                    senders_gone = true;
                }
            },
        }
    }

    // Refuse new alerts but keep the ones already queued.
    rx.close();
    let mut buffered = 0usize;
    while let Some(item) = rx.recv().await {
        route(&engine, &router, item).await;
        buffered += 1;
    }

    debug!(buffered, "ingestion stopped");
    Ok(())
}

async fn event_loop(
    mut events: mpsc::UnboundedReceiver<PluginEvent>,
    token: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            event = events.recv() => match event {
                Some(PluginEvent::Exited { plugin, .. }) => {
                    warn!(plugin = %plugin, "plugin marked failed, its batches will be dropped");
                }
                None => break,
            },
        }
    }
    Ok(())
}

struct ShutdownSequence {
    token: CancellationToken,
    state: Arc<RwLock<BrokerState>>,
    batcher: JoinHandle<()>,
    engine: Arc<BatchEngine>,
    router: Arc<DispatchRouter>,
    workers: DispatchWorkers,
    processes: Vec<Arc<PluginProcess>>,
    report: Arc<Mutex<Option<ShutdownReport>>>,
}

impl ShutdownSequence {
    async fn run(self) -> Result<()> {
        self.token.cancelled().await;
        transition(&self.state, BrokerState::Stopping);

        let mut first_error = None;

        if let Err(e) = self.batcher.await {
            first_error.get_or_insert(BrokerError::Shutdown {
                step: "ingestion",
                reason: e.to_string(),
            });
        }

        let drained = self.engine.drain();
        let drained_batches = drained.len();
        self.router.dispatch_all(drained).await;
        debug!(drained_batches, "pending batches flushed");

        let dispatch = match self.workers.join().await {
            Ok(stats) => stats,
            Err(e) => {
                first_error.get_or_insert(BrokerError::Shutdown {
                    step: "dispatch",
                    reason: e.to_string(),
                });
                DispatchStats::default()
            }
        };

        stop_all(&self.processes).await;
        transition(&self.state, BrokerState::Stopped);

        let report = ShutdownReport {
            drained_batches,
            stopped_plugins: self.processes.len(),
            dispatch,
        };
        info!(
            drained_batches,
            stopped_plugins = report.stopped_plugins,
            delivered = dispatch.delivered,
            failed = dispatch.failed,
            dropped = dispatch.dropped,
            "broker stopped"
        );
        *self.report.lock() = Some(report);

        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PluginConfig, ProfileBinding};
    use claw_notify_proto::Alert;
    use tempfile::TempDir;

    #[test]
    fn state_display() {
        assert_eq!(BrokerState::Running.to_string(), "running");
        assert_eq!(BrokerState::Stopped.to_string(), "stopped");
    }

    #[test]
    fn transition_updates_state() {
        let state = RwLock::new(BrokerState::Created);
        transition(&state, BrokerState::Initializing);
        assert_eq!(*state.read(), BrokerState::Initializing);
    }

    #[tokio::test]
    async fn broker_without_plugins_runs_and_stops() {
        let dir = TempDir::new().unwrap();
        let config = BrokerConfig::new(dir.path()).with_tick_interval(Duration::from_millis(10));

        let broker = PluginBroker::start(config).await.unwrap();
        assert_eq!(broker.state(), BrokerState::Running);
        assert_eq!(broker.plugin_names().count(), 0);

        let sender = broker.sender();
        // Unrouted alerts are dropped, not queued forever.
        sender
            .send(ProfileAlert::new(1, Alert::default()))
            .await
            .unwrap();

        let report = broker.shutdown().await.unwrap();
        assert_eq!(report, ShutdownReport::default());

        let err = sender
            .send(ProfileAlert::new(1, Alert::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ChannelClosed));
        assert!(sender.is_closed());
    }

    #[tokio::test]
    async fn missing_plugin_dir_fails_start() {
        let dir = TempDir::new().unwrap();
        let config = BrokerConfig::new(dir.path().join("missing"));

        let err = PluginBroker::start(config).await.unwrap_err();

        assert!(matches!(err, BrokerError::PluginDir { .. }));
        assert!(err.is_fatal_at_init());
    }

    #[tokio::test]
    async fn invalid_config_fails_before_scanning() {
        let config = BrokerConfig::new("/nonexistent")
            .with_plugin(PluginConfig::new("p", "file"))
            .with_profile(ProfileBinding::new(1, "default").with_notification("other"));

        let err = PluginBroker::start(config).await.unwrap_err();

        assert!(matches!(err, BrokerError::Config(_)));
    }

    #[tokio::test]
    async fn cancellation_token_stops_broker() {
        let dir = TempDir::new().unwrap();
        let broker = PluginBroker::start(BrokerConfig::new(dir.path()))
            .await
            .unwrap();

        broker.cancellation_token().cancel();
        tokio::time::timeout(Duration::from_secs(5), broker.wait())
            .await
            .expect("broker should stop")
            .unwrap();

        assert_eq!(broker.state(), BrokerState::Stopped);
        assert!(broker.report().is_some());
    }
}
