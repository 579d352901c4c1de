//! Broker configuration.
//!
//! The broker is configured from a single JSON document describing:
//! - Where plugin binaries live and the default identity they run as
//! - One entry per notification plugin, with its batching policy
//! - The profiles, each bound to one or more plugins by name
//!
//! Durations are written as human readable strings (`"30s"`, `"1m 30s"`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use claw_notify_proto::ProfileId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BrokerError, Result};

/// Default polling period of the shared batch clock.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Default capacity of the ingestion queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
/// Default number of flushed batches queued for each plugin.
pub const DEFAULT_DISPATCH_CAPACITY: usize = 16;
/// Default deadline for a plugin to complete the handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default grace period for a plugin to exit on stop.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Default deadline for a single notify call.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Serde adapter for durations written as humantime strings.
///
/// Plain integers are accepted as seconds.
mod duration_str {
    use std::fmt;
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_zero() {
            return serializer.serialize_str("0s");
        }
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration such as \"30s\" or a number of seconds")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                let v = v.trim();
                if v.is_empty() || v == "0" {
                    return Ok(Duration::ZERO);
                }
                humantime::parse_duration(v)
                    .map_err(|e| E::custom(format!("invalid duration '{v}': {e}")))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                u64::try_from(v)
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom(format!("negative duration: {v}")))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

const fn default_tick_interval() -> Duration {
    DEFAULT_TICK_INTERVAL
}

const fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

const fn default_dispatch_capacity() -> usize {
    DEFAULT_DISPATCH_CAPACITY
}

const fn default_handshake_timeout() -> Duration {
    DEFAULT_HANDSHAKE_TIMEOUT
}

const fn default_stop_timeout() -> Duration {
    DEFAULT_STOP_TIMEOUT
}

const fn default_notify_timeout() -> Duration {
    DEFAULT_NOTIFY_TIMEOUT
}

/// The OS identity a plugin runs as.
///
/// Both fields must be set, or neither. When neither is set the plugin
/// inherits the broker's own identity, which is refused if that is root.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunAs {
    /// User name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Group name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl RunAs {
    /// Creates a run-as identity from a user and group name.
    #[must_use]
    pub fn new(user: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            group: Some(group.into()),
        }
    }

    /// Returns true if neither user nor group is set. Empty strings count as
    /// unset.
    #[must_use]
    pub fn is_unset(&self) -> bool {
        self.user().is_none() && self.group().is_none()
    }

    /// The user name, if set and non-empty.
    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref().filter(|u| !u.is_empty())
    }

    /// The group name, if set and non-empty.
    #[must_use]
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref().filter(|g| !g.is_empty())
    }
}

/// Configuration of one notification plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginConfig {
    /// Unique name of this notification target.
    pub name: String,
    /// Plugin type; selects the `notification-<type>` binary.
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Maximum time a batch accumulates before a time-triggered flush.
    #[serde(default, with = "duration_str")]
    pub group_wait: Duration,
    /// Alert count that triggers an immediate flush. Zero disables it.
    #[serde(default)]
    pub group_threshold: usize,
    /// Deadline for a single notify call.
    #[serde(default = "default_notify_timeout", with = "duration_str")]
    pub timeout: Duration,
    /// User to run the plugin as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Group to run the plugin as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Type-specific parameters, passed through to the plugin.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl PluginConfig {
    /// Creates a plugin configuration with default batching policy.
    #[must_use]
    pub fn new(name: impl Into<String>, plugin_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            plugin_type: plugin_type.into(),
            group_wait: Duration::ZERO,
            group_threshold: 0,
            timeout: DEFAULT_NOTIFY_TIMEOUT,
            user: None,
            group: None,
            params: Map::new(),
        }
    }

    /// Sets the time trigger.
    #[must_use]
    pub const fn with_group_wait(mut self, group_wait: Duration) -> Self {
        self.group_wait = group_wait;
        self
    }

    /// Sets the count trigger.
    #[must_use]
    pub const fn with_group_threshold(mut self, group_threshold: usize) -> Self {
        self.group_threshold = group_threshold;
        self
    }

    /// Sets the notify deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the run-as user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Sets the run-as group.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Adds a type-specific parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Name of the binary implementing this plugin's type.
    #[must_use]
    pub fn binary_name(&self) -> String {
        format!("{}{}", crate::catalog::BINARY_PREFIX, self.plugin_type)
    }

    /// The identity this plugin runs as.
    ///
    /// A plugin that sets either `user` or `group` overrides the broker-wide
    /// default as a pair; otherwise the default applies.
    #[must_use]
    pub fn effective_run_as(&self, default: &RunAs) -> RunAs {
        let own = RunAs {
            user: self.user.clone(),
            group: self.group.clone(),
        };
        if own.is_unset() { default.clone() } else { own }
    }

    /// The configuration section sent to the plugin at configure time.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Binds a profile to the plugins that receive its alerts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileBinding {
    /// Profile identifier carried by ingested alerts.
    pub id: ProfileId,
    /// Human readable profile name.
    #[serde(default)]
    pub name: String,
    /// Names of the plugins bound to this profile.
    #[serde(default)]
    pub notifications: Vec<String>,
}

impl ProfileBinding {
    /// Creates a binding with no plugins.
    #[must_use]
    pub fn new(id: impl Into<ProfileId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            notifications: Vec::new(),
        }
    }

    /// Binds another plugin.
    #[must_use]
    pub fn with_notification(mut self, plugin: impl Into<String>) -> Self {
        self.notifications.push(plugin.into());
        self
    }
}

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    /// Directory holding the `notification-*` binaries.
    pub plugin_dir: PathBuf,
    /// Period of the shared batch clock.
    #[serde(default = "default_tick_interval", with = "duration_str")]
    pub tick_interval: Duration,
    /// Capacity of the ingestion queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Flushed batches queued per plugin before the batcher waits.
    #[serde(default = "default_dispatch_capacity")]
    pub dispatch_capacity: usize,
    /// Deadline for each plugin's handshake.
    #[serde(default = "default_handshake_timeout", with = "duration_str")]
    pub handshake_timeout: Duration,
    /// Grace period before a stopping plugin is killed.
    #[serde(default = "default_stop_timeout", with = "duration_str")]
    pub stop_timeout: Duration,
    /// Default identity for plugins that do not set their own.
    #[serde(default)]
    pub run_as: RunAs,
    /// Configured plugins.
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
    /// Profile bindings.
    #[serde(default)]
    pub profiles: Vec<ProfileBinding>,
}

impl BrokerConfig {
    /// Creates an empty configuration for the given plugin directory.
    #[must_use]
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            dispatch_capacity: DEFAULT_DISPATCH_CAPACITY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            run_as: RunAs::default(),
            plugins: Vec::new(),
            profiles: Vec::new(),
        }
    }

    /// Sets the batch clock period.
    #[must_use]
    pub const fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Sets the ingestion queue capacity.
    #[must_use]
    pub const fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Sets the per-plugin dispatch queue capacity.
    #[must_use]
    pub const fn with_dispatch_capacity(mut self, dispatch_capacity: usize) -> Self {
        self.dispatch_capacity = dispatch_capacity;
        self
    }

    /// Sets the handshake deadline.
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the default run-as identity.
    #[must_use]
    pub fn with_run_as(mut self, run_as: RunAs) -> Self {
        self.run_as = run_as;
        self
    }

    /// Adds a plugin.
    #[must_use]
    pub fn with_plugin(mut self, plugin: PluginConfig) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Adds a profile binding.
    #[must_use]
    pub fn with_profile(mut self, profile: ProfileBinding) -> Self {
        self.profiles.push(profile);
        self
    }

    /// Looks up a plugin by name.
    #[must_use]
    pub fn plugin(&self, name: &str) -> Option<&PluginConfig> {
        self.plugins.iter().find(|p| p.name == name)
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            BrokerError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| BrokerError::Config(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate the configuration shape.
    ///
    /// Identity checks are left to the security validator, which runs at
    /// broker start.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(BrokerError::Config(
                "tick_interval must be greater than 0".to_string(),
            ));
        }

        if self.queue_capacity == 0 {
            return Err(BrokerError::Config(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.dispatch_capacity == 0 {
            return Err(BrokerError::Config(
                "dispatch_capacity must be greater than 0".to_string(),
            ));
        }

        if self.handshake_timeout.is_zero() {
            return Err(BrokerError::Config(
                "handshake_timeout must be greater than 0".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for plugin in &self.plugins {
            if plugin.name.is_empty() {
                return Err(BrokerError::Config("plugin name cannot be empty".to_string()));
            }

            if !names.insert(plugin.name.as_str()) {
                return Err(BrokerError::Config(format!(
                    "duplicate plugin name '{}'",
                    plugin.name
                )));
            }

            // The type becomes part of a file name inside plugin_dir.
            if plugin.plugin_type.is_empty()
                || !plugin
                    .plugin_type
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(BrokerError::Config(format!(
                    "plugin '{}' has invalid type '{}'",
                    plugin.name, plugin.plugin_type
                )));
            }

            if plugin.timeout.is_zero() {
                return Err(BrokerError::Config(format!(
                    "plugin '{}' timeout must be greater than 0",
                    plugin.name
                )));
            }
        }

        let mut ids = HashSet::new();
        for profile in &self.profiles {
            if !ids.insert(profile.id) {
                return Err(BrokerError::Config(format!(
                    "duplicate profile id {}",
                    profile.id
                )));
            }

            let mut bound = HashSet::new();
            for plugin in &profile.notifications {
                if !names.contains(plugin.as_str()) {
                    return Err(BrokerError::Config(format!(
                        "profile {} references unknown plugin '{plugin}'",
                        profile.id
                    )));
                }

                if !bound.insert(plugin.as_str()) {
                    return Err(BrokerError::Config(format!(
                        "profile {} lists plugin '{plugin}' more than once",
                        profile.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// A starter configuration with one file plugin bound to profile 1.
    #[must_use]
    pub fn example() -> Self {
        Self::new("/usr/local/lib/claw-notify/plugins")
            .with_plugin(
                PluginConfig::new("file_default", "file")
                    .with_group_wait(Duration::from_secs(30))
                    .with_group_threshold(10)
                    .with_param("output_file", "/var/log/claw-notify/alerts.json"),
            )
            .with_profile(ProfileBinding::new(1, "default").with_notification("file_default"))
    }
}
