//! Wire protocol between the Clawbernetes notification broker and its plugins.
//!
//! A notification plugin is a standalone binary supervised by the broker. The
//! two sides talk over the plugin's stdio, one JSON message per line:
//!
//! 1. The broker launches the plugin with a random cookie in
//!    [`COOKIE_ENV`](messages::COOKIE_ENV).
//! 2. The plugin answers with [`PluginMessage::Hello`] echoing the cookie and
//!    its [`PROTOCOL_VERSION`](messages::PROTOCOL_VERSION).
//! 3. The broker sends [`BrokerMessage::Configure`] once, then one
//!    [`BrokerMessage::Notify`] per flushed batch; each is answered by
//!    [`PluginMessage::Ack`] or [`PluginMessage::Error`].
//! 4. [`BrokerMessage::Shutdown`] (or EOF on stdin) ends the session.
//!
//! # Writing a plugin
//!
//! ```rust,no_run
//! use claw_notify_proto::{Alert, Notifier, serve};
//!
//! struct Stdout;
//!
//! impl Notifier for Stdout {
//!     fn configure(&mut self, _config: serde_json::Value) -> Result<(), String> {
//!         Ok(())
//!     }
//!
//!     fn notify(&mut self, plugin: &str, alerts: Vec<Alert>) -> Result<(), String> {
//!         eprintln!("{plugin}: {} alerts", alerts.len());
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> claw_notify_proto::Result<()> {
//! serve(Stdout).await
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod alert;
pub mod codec;
pub mod error;
pub mod messages;
pub mod plugin;

pub use alert::{Alert, AlertSource, ProfileAlert, ProfileId};
pub use codec::{JsonLinesCodec, MAX_FRAME_LENGTH};
pub use error::{ProtoError, Result};
pub use messages::{
    BrokerMessage, PluginMessage, CAPABILITY_NOTIFY, COOKIE_ENV, PROTOCOL_VERSION,
    PROTOCOL_VERSION_ENV,
};
pub use plugin::{serve, serve_io, Handshake, Notifier};
