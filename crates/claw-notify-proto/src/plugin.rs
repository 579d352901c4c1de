//! Plugin-side runtime.
//!
//! A plugin binary implements [`Notifier`] and hands it to [`serve`], which
//! performs the handshake on stdout and then answers broker requests read from
//! stdin until the broker sends `shutdown` or closes the pipe. Anything the
//! plugin wants to log must go to stderr: stdout belongs to the protocol.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::alert::Alert;
use crate::codec::JsonLinesCodec;
use crate::error::{ProtoError, Result};
use crate::messages::{
    BrokerMessage, PluginMessage, CAPABILITY_NOTIFY, COOKIE_ENV, PROTOCOL_VERSION,
    PROTOCOL_VERSION_ENV,
};

/// The delivery side of a notification plugin.
pub trait Notifier: Send {
    /// Capabilities announced during the handshake.
    fn capabilities(&self) -> Vec<String> {
        vec![CAPABILITY_NOTIFY.to_string()]
    }

    /// Applies the plugin's configuration section. Called once, before any
    /// `notify`.
    ///
    /// # Errors
    ///
    /// Returns a human readable reason when the configuration is unusable.
    fn configure(&mut self, config: Value) -> std::result::Result<(), String>;

    /// Delivers one batch of alerts.
    ///
    /// # Errors
    ///
    /// Returns a human readable reason when delivery failed.
    fn notify(&mut self, plugin: &str, alerts: Vec<Alert>) -> std::result::Result<(), String>;
}

/// Handshake parameters received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// The cookie to echo back in `hello`.
    pub cookie: String,
}

impl Handshake {
    /// Reads the handshake parameters from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Handshake`] when the binary was not launched by
    /// a broker or the broker speaks another protocol version.
    pub fn from_env() -> Result<Self> {
        Self::from_values(
            std::env::var(COOKIE_ENV).ok(),
            std::env::var(PROTOCOL_VERSION_ENV).ok(),
        )
    }

    /// Builds the handshake from raw environment values.
    ///
    /// # Errors
    ///
    /// See [`Handshake::from_env`].
    pub fn from_values(cookie: Option<String>, version: Option<String>) -> Result<Self> {
        let cookie = cookie.filter(|c| !c.is_empty()).ok_or_else(|| {
            ProtoError::Handshake(
                "this binary is a notification plugin and is not meant to be executed directly"
                    .to_string(),
            )
        })?;

        if let Some(version) = version {
            let expected = PROTOCOL_VERSION.to_string();
            if version != expected {
                return Err(ProtoError::Handshake(format!(
                    "broker speaks protocol version {version}, plugin speaks {expected}"
                )));
            }
        }

        Ok(Self { cookie })
    }
}

/// Serves the protocol over the process's stdin and stdout.
///
/// # Errors
///
/// Returns an error if the handshake environment is missing or the channel
/// breaks.
pub async fn serve<N: Notifier>(notifier: N) -> Result<()> {
    let handshake = Handshake::from_env()?;
    serve_io(notifier, &handshake, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serves the protocol over arbitrary streams.
///
/// # Errors
///
/// Returns an error if a frame cannot be decoded or the writer fails.
pub async fn serve_io<N, R, W>(
    mut notifier: N,
    handshake: &Handshake,
    reader: R,
    writer: W,
) -> Result<()>
where
    N: Notifier,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FramedRead::new(reader, JsonLinesCodec::<BrokerMessage>::new());
    let mut writer = FramedWrite::new(writer, JsonLinesCodec::<PluginMessage>::new());

    writer
        .send(PluginMessage::hello(
            handshake.cookie.clone(),
            notifier.capabilities(),
        ))
        .await?;

    while let Some(message) = reader.next().await {
        let reply = match message? {
            BrokerMessage::Configure { id, config } => {
                debug!(id, "configure request");
                respond(id, notifier.configure(config))
            }
            BrokerMessage::Notify { id, plugin, alerts } => {
                debug!(id, plugin = %plugin, alerts = alerts.len(), "notify request");
                respond(id, notifier.notify(&plugin, alerts))
            }
            BrokerMessage::Shutdown => {
                debug!("shutdown requested");
                break;
            }
        };

        if let PluginMessage::Error { id, message } = &reply {
            warn!(id, error = %message, "request failed");
        }
        writer.send(reply).await?;
    }

    Ok(())
}

fn respond(id: u64, outcome: std::result::Result<(), String>) -> PluginMessage {
    match outcome {
        Ok(()) => PluginMessage::Ack { id },
        Err(message) => PluginMessage::Error { id, message },
    }
}
