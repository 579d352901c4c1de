//! Plugin notification broker for Clawbernetes security alerts.
//!
//! Alerts tagged with the profile that produced them are pushed into a
//! [`PluginBroker`]. The broker groups them into batches per
//! (profile, plugin) binding and hands each flushed batch to an out-of-process
//! notification plugin over the [`claw_notify_proto`] wire protocol.
//!
//! ```rust,no_run
//! use claw_notify::{BrokerConfig, PluginBroker};
//! use claw_notify_proto::{Alert, ProfileAlert};
//!
//! # async fn run() -> claw_notify::Result<()> {
//! let config = BrokerConfig::from_file("/etc/claw-notify/config.json")?;
//! let broker = PluginBroker::start(config).await?;
//!
//! broker
//!     .sender()
//!     .send(ProfileAlert::new(1, Alert::new("ssh-bruteforce")))
//!     .await?;
//!
//! let report = broker.shutdown().await?;
//! println!("{} batches flushed on shutdown", report.drained_batches);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod batch;
pub mod broker;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod process;
pub mod security;
pub mod tasks;

pub use batch::{AlertBatch, BatchEngine, BatchKey, BatchPolicy, FlushTrigger, FlushedBatch};
pub use broker::{AlertSender, BrokerState, PluginBroker, ShutdownReport};
pub use catalog::{PluginCatalog, BINARY_PREFIX};
pub use config::{BrokerConfig, PluginConfig, ProfileBinding, RunAs};
pub use dispatch::{DispatchStats, PluginSink, PluginStatus};
pub use error::{BrokerError, IdentityKind, Result};
pub use process::{PluginEvent, PluginProcess, ProcessSupervisor};
pub use security::RunAsIdentity;
pub use tasks::TaskGroup;
