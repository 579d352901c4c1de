//! Plugin process supervision.
//!
//! A plugin runs as a child process speaking the JSON lines protocol over its
//! stdin and stdout. Starting a plugin:
//!
//! 1. Spawn the binary, optionally under a validated non-root identity,
//!    with a fresh cookie in its environment
//! 2. Wait (bounded) for a `hello` carrying that cookie
//! 3. Send the plugin its configuration section
//!
//! A watcher task owns the child and notices when it exits. An exit the
//! broker did not ask for marks the plugin Failed and emits a
//! [`PluginEvent::Exited`]. There is no restart.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use claw_notify_proto::{
    Alert, BrokerMessage, JsonLinesCodec, PluginMessage, ProtoError, COOKIE_ENV,
    PROTOCOL_VERSION, PROTOCOL_VERSION_ENV,
};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PluginConfig;
use crate::dispatch::{PluginSink, PluginStatus};
use crate::error::{BrokerError, Result};
use crate::security::RunAsIdentity;

/// Lifecycle events reported by supervised plugins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginEvent {
    /// The plugin exited without being asked to.
    Exited {
        /// The configured plugin name.
        plugin: String,
        /// Exit code, if it exited normally.
        code: Option<i32>,
        /// Terminating signal, if it was killed.
        signal: Option<i32>,
    },
}

impl fmt::Display for PluginEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited {
                plugin,
                code: Some(code),
                ..
            } => write!(f, "plugin {plugin} exited with code {code}"),
            Self::Exited {
                plugin,
                signal: Some(signal),
                ..
            } => write!(f, "plugin {plugin} killed by signal {signal}"),
            Self::Exited { plugin, .. } => write!(f, "plugin {plugin} exited"),
        }
    }
}

/// Result of one request on the plugin channel: the plugin's own verdict,
/// or a transport failure.
type CallResult = std::result::Result<std::result::Result<(), String>, ProtoError>;

/// Request/response channel over the plugin's stdio.
struct RpcChannel {
    reader: FramedRead<ChildStdout, JsonLinesCodec<PluginMessage>>,
    writer: FramedWrite<ChildStdin, JsonLinesCodec<BrokerMessage>>,
    next_id: u64,
}

impl RpcChannel {
    fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self {
            reader: FramedRead::new(stdout, JsonLinesCodec::new()),
            writer: FramedWrite::new(stdin, JsonLinesCodec::new()),
            next_id: 1,
        }
    }

    async fn recv(&mut self) -> claw_notify_proto::Result<PluginMessage> {
        self.reader
            .next()
            .await
            .unwrap_or(Err(ProtoError::ConnectionClosed))
    }

    /// Sends a request and waits for the response carrying its id.
    ///
    /// Responses to earlier requests that timed out are discarded. Once the
    /// handshake is done, lines that are not protocol messages are skipped
    /// by the codec.
    async fn call(&mut self, request: impl FnOnce(u64) -> BrokerMessage) -> CallResult {
        let id = self.next_id;
        self.next_id += 1;
        self.writer.send(request(id)).await?;

        loop {
            match self.recv().await? {
                PluginMessage::Ack { id: got } if got == id => return Ok(Ok(())),
                PluginMessage::Error { id: got, message } if got == id => return Ok(Err(message)),
                other => {
                    debug!(
                        expected = id,
                        got = ?other.id(),
                        message_type = other.message_type(),
                        "discarding stale response"
                    );
                }
            }
        }
    }

    async fn shutdown(&mut self) -> claw_notify_proto::Result<()> {
        self.writer.send(BrokerMessage::Shutdown).await?;
        self.writer.close().await
    }
}

/// Spawns and stops plugin processes.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    handshake_timeout: Duration,
    stop_timeout: Duration,
    events: mpsc::UnboundedSender<PluginEvent>,
}

impl ProcessSupervisor {
    /// Creates a supervisor reporting plugin events on `events`.
    #[must_use]
    pub fn new(
        handshake_timeout: Duration,
        stop_timeout: Duration,
        events: mpsc::UnboundedSender<PluginEvent>,
    ) -> Self {
        Self {
            handshake_timeout,
            stop_timeout,
            events,
        }
    }

    /// Starts a plugin: spawn, handshake, configure.
    ///
    /// On failure the child is killed and reaped before returning.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Spawn`], [`BrokerError::HandshakeFailed`] or
    /// [`BrokerError::ConfigureFailed`].
    pub async fn start(
        &self,
        plugin: &PluginConfig,
        binary: &Path,
        identity: Option<&RunAsIdentity>,
    ) -> Result<PluginProcess> {
        let section = plugin.to_value()?;
        let cookie = Uuid::new_v4().to_string();

        let mut command = Command::new(binary);
        command
            .env(COOKIE_ENV, &cookie)
            .env(PROTOCOL_VERSION_ENV, PROTOCOL_VERSION.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(identity) = identity {
            command.uid(identity.uid).gid(identity.gid);
        }

        let mut child = spawn_child(&mut command)
            .await
            .map_err(|source| BrokerError::Spawn {
                plugin: plugin.name.clone(),
                source,
            })?;
        let pid = child.id();

        info!(
            plugin = %plugin.name,
            binary = %binary.display(),
            pid,
            user = identity.map(|i| i.user.as_str()),
            "plugin spawned"
        );

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(BrokerError::HandshakeFailed {
                plugin: plugin.name.clone(),
                reason: "plugin stdio was not captured".to_string(),
            });
        };

        tokio::spawn(forward_stderr(plugin.name.clone(), stderr));

        let status = Arc::new(RwLock::new(PluginStatus::Starting));
        let kill = CancellationToken::new();
        let (exited_tx, exited_rx) = watch::channel(false);

        tokio::spawn(watch_exit(
            plugin.name.clone(),
            child,
            Arc::clone(&status),
            kill.clone(),
            self.events.clone(),
            exited_tx,
        ));

        let mut rpc = RpcChannel::new(stdin, stdout);

        let capabilities = match tokio::time::timeout(
            self.handshake_timeout,
            handshake(&mut rpc, &cookie),
        )
        .await
        {
            Ok(Ok(capabilities)) => capabilities,
            Ok(Err(reason)) => {
                return Err(abort_start(plugin, &status, &kill, exited_rx, reason).await);
            }
            Err(_) => {
                let reason = format!(
                    "no hello within {}",
                    humantime::format_duration(self.handshake_timeout)
                );
                return Err(abort_start(plugin, &status, &kill, exited_rx, reason).await);
            }
        };

        debug!(plugin = %plugin.name, ?capabilities, "handshake complete");

        // From here on, stray stdout lines are logged and skipped.
        rpc.reader.decoder_mut().set_skip_invalid(true);

        let process = PluginProcess {
            name: plugin.name.clone(),
            pid,
            capabilities,
            notify_timeout: plugin.timeout,
            configure_timeout: self.handshake_timeout,
            stop_timeout: self.stop_timeout,
            status,
            rpc: Mutex::new(rpc),
            kill,
            exited: exited_rx,
        };

        if let Err(e) = process.configure(section).await {
            *process.status.write() = PluginStatus::Failed;
            process.terminate().await;
            return Err(e);
        }

        // The watcher may already have seen the child die.
        let ready = {
            let mut status = process.status.write();
            if *status == PluginStatus::Starting {
                *status = PluginStatus::Ready;
                true
            } else {
                false
            }
        };
        if !ready {
            process.terminate().await;
            return Err(BrokerError::HandshakeFailed {
                plugin: plugin.name.clone(),
                reason: "plugin exited during startup".to_string(),
            });
        }

        info!(plugin = %plugin.name, pid, "plugin ready");

        Ok(process)
    }
}

async fn abort_start(
    plugin: &PluginConfig,
    status: &RwLock<PluginStatus>,
    kill: &CancellationToken,
    mut exited: watch::Receiver<bool>,
    reason: String,
) -> BrokerError {
    warn!(plugin = %plugin.name, reason = %reason, "handshake failed");
    *status.write() = PluginStatus::Failed;
    kill.cancel();
    let _ = exited.wait_for(|exited| *exited).await;

    BrokerError::HandshakeFailed {
        plugin: plugin.name.clone(),
        reason,
    }
}

async fn handshake(
    rpc: &mut RpcChannel,
    cookie: &str,
) -> std::result::Result<Vec<String>, String> {
    match rpc.recv().await {
        Ok(PluginMessage::Hello {
            protocol_version,
            cookie: got,
            capabilities,
        }) => {
            if got != cookie {
                return Err("cookie mismatch".to_string());
            }
            if protocol_version != PROTOCOL_VERSION {
                return Err(format!(
                    "plugin speaks protocol version {protocol_version}, broker speaks {PROTOCOL_VERSION}"
                ));
            }
            Ok(capabilities)
        }
        Ok(other) => Err(format!("expected hello, got {}", other.message_type())),
        Err(ProtoError::ConnectionClosed) => Err("plugin exited before hello".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

/// `ETXTBSY` while a freshly installed binary is still held open for writing.
const TEXT_FILE_BUSY: i32 = 26;
const SPAWN_ATTEMPTS: u32 = 5;

async fn spawn_child(command: &mut Command) -> std::io::Result<Child> {
    let mut attempt = 1;
    loop {
        match command.spawn() {
            Err(e) if e.raw_os_error() == Some(TEXT_FILE_BUSY) && attempt < SPAWN_ATTEMPTS => {
                debug!(attempt, "plugin binary busy, retrying spawn");
                tokio::time::sleep(Duration::from_millis(20 * u64::from(attempt))).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

async fn forward_stderr(plugin: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(plugin = %plugin, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(plugin = %plugin, error = %e, "stopped reading plugin stderr");
                break;
            }
        }
    }
}

async fn watch_exit(
    plugin: String,
    mut child: Child,
    status: Arc<RwLock<PluginStatus>>,
    kill: CancellationToken,
    events: mpsc::UnboundedSender<PluginEvent>,
    exited: watch::Sender<bool>,
) {
    let outcome = tokio::select! {
        outcome = child.wait() => outcome,
        () = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                debug!(plugin = %plugin, error = %e, "kill failed");
            }
            child.wait().await
        }
    };

    let (code, signal) = match outcome {
        Ok(exit) => (exit.code(), exit.signal()),
        Err(e) => {
            warn!(plugin = %plugin, error = %e, "failed to reap plugin");
            (None, None)
        }
    };

    let unexpected = {
        let mut status = status.write();
        let unexpected = matches!(*status, PluginStatus::Starting | PluginStatus::Ready);
        if unexpected {
            *status = PluginStatus::Failed;
        }
        unexpected
    };

    if unexpected {
        let event = PluginEvent::Exited {
            plugin: plugin.clone(),
            code,
            signal,
        };
        warn!(plugin = %plugin, code, signal, "{event}");
        let _ = events.send(event);
    } else {
        debug!(plugin = %plugin, code, signal, "plugin exited");
    }

    let _ = exited.send(true);
}

/// A running plugin.
pub struct PluginProcess {
    name: String,
    pid: Option<u32>,
    capabilities: Vec<String>,
    notify_timeout: Duration,
    configure_timeout: Duration,
    stop_timeout: Duration,
    status: Arc<RwLock<PluginStatus>>,
    rpc: Mutex<RpcChannel>,
    kill: CancellationToken,
    exited: watch::Receiver<bool>,
}

impl fmt::Debug for PluginProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginProcess")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("capabilities", &self.capabilities)
            .field("status", &*self.status.read())
            .finish_non_exhaustive()
    }
}

impl PluginProcess {
    /// OS process id, if the process was still alive when spawned.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Capabilities announced in the handshake.
    #[must_use]
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Returns true once the child has been reaped.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    fn ensure_ready(&self) -> Result<()> {
        let status = *self.status.read();
        if status == PluginStatus::Ready {
            Ok(())
        } else {
            Err(BrokerError::PluginUnavailable {
                plugin: self.name.clone(),
                status: status.to_string(),
            })
        }
    }

    async fn wait_exit(&self) {
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|exited| *exited).await;
    }

    async fn terminate(&self) {
        self.kill.cancel();
        self.wait_exit().await;
    }

    /// Stops the plugin.
    ///
    /// Asks the plugin to shut down, waits up to the stop timeout for it to
    /// exit, then kills it. Returns once the child has been reaped.
    pub async fn stop(&self) {
        let previous = {
            let mut status = self.status.write();
            let previous = *status;
            if !previous.is_terminal() {
                *status = PluginStatus::Stopped;
            }
            previous
        };

        if previous == PluginStatus::Stopped {
            return;
        }

        if !previous.is_terminal() {
            let polite = async {
                let mut rpc = self.rpc.lock().await;
                rpc.shutdown().await
            };
            match tokio::time::timeout(self.stop_timeout, polite).await {
                Ok(Ok(())) => debug!(plugin = %self.name, "shutdown requested"),
                Ok(Err(e)) => debug!(plugin = %self.name, error = %e, "shutdown request failed"),
                Err(_) => debug!(plugin = %self.name, "shutdown request timed out"),
            }
        }

        if tokio::time::timeout(self.stop_timeout, self.wait_exit())
            .await
            .is_err()
        {
            warn!(
                plugin = %self.name,
                timeout = %humantime::format_duration(self.stop_timeout),
                "plugin did not exit in time, killing"
            );
            self.terminate().await;
        }

        info!(plugin = %self.name, "plugin stopped");
    }
}

#[async_trait]
impl PluginSink for PluginProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> PluginStatus {
        *self.status.read()
    }

    async fn configure(&self, config: Value) -> Result<()> {
        let mut rpc = self.rpc.lock().await;
        let call = rpc.call(|id| BrokerMessage::Configure { id, config });

        let reason = match tokio::time::timeout(self.configure_timeout, call).await {
            Ok(Ok(Ok(()))) => return Ok(()),
            Ok(Ok(Err(message))) => message,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "timed out after {}",
                humantime::format_duration(self.configure_timeout)
            ),
        };

        Err(BrokerError::ConfigureFailed {
            plugin: self.name.clone(),
            reason,
        })
    }

    async fn notify(&self, alerts: Vec<Alert>) -> Result<()> {
        self.ensure_ready()?;

        let mut rpc = self.rpc.lock().await;
        let plugin = self.name.clone();
        let call = rpc.call(|id| BrokerMessage::Notify { id, plugin, alerts });

        let reason = match tokio::time::timeout(self.notify_timeout, call).await {
            Ok(Ok(Ok(()))) => return Ok(()),
            Ok(Ok(Err(message))) => message,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "timed out after {}",
                humantime::format_duration(self.notify_timeout)
            ),
        };

        Err(BrokerError::NotifyFailed {
            plugin: self.name.clone(),
            reason,
        })
    }
}
