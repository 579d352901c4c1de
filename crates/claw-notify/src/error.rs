//! Error types for the claw-notify crate.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Which kind of OS identity failed to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    /// A user account.
    User,
    /// A group.
    Group,
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Group => write!(f, "group"),
        }
    }
}

/// Errors that can occur in the notification broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The plugin directory cannot be listed.
    #[error("unable to read plugin directory {}: {source}", path.display())]
    PluginDir {
        /// The configured plugin directory.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// No usable binary exists for a configured plugin.
    #[error("binary for plugin {plugin} not found")]
    PluginNotFound {
        /// The configured plugin name.
        plugin: String,
    },

    /// The plugin binary can be modified by any user.
    #[error("{} is world writable", path.display())]
    WorldWritable {
        /// Path of the offending binary.
        path: PathBuf,
    },

    /// The plugin binary can be modified by its group.
    #[error("{} is group writable", path.display())]
    GroupWritable {
        /// Path of the offending binary.
        path: PathBuf,
    },

    /// The plugin binary carries the setgid bit.
    #[error("{} has the setgid bit set", path.display())]
    SetgidBinary {
        /// Path of the offending binary.
        path: PathBuf,
    },

    /// Only one of user and group was configured.
    #[error("plugin {plugin}: both plugin user and group must be set")]
    IncompletePrivilegeSpec {
        /// The configured plugin name.
        plugin: String,
    },

    /// A configured user or group does not exist.
    #[error("unknown {kind} '{name}'")]
    UnknownIdentity {
        /// User or group.
        kind: IdentityKind,
        /// The name that failed to resolve.
        name: String,
    },

    /// The configured run-as identity is root.
    #[error("refusing to run plugin {plugin} as root")]
    RefusedRootExecution {
        /// The configured plugin name.
        plugin: String,
    },

    /// The plugin process could not be spawned.
    #[error("failed to start plugin {plugin}: {source}")]
    Spawn {
        /// The configured plugin name.
        plugin: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The plugin did not complete the handshake.
    #[error("handshake with plugin {plugin} failed: {reason}")]
    HandshakeFailed {
        /// The configured plugin name.
        plugin: String,
        /// What went wrong.
        reason: String,
    },

    /// The plugin rejected its configuration.
    #[error("plugin {plugin} rejected its configuration: {reason}")]
    ConfigureFailed {
        /// The configured plugin name.
        plugin: String,
        /// What went wrong.
        reason: String,
    },

    /// A batch could not be delivered.
    #[error("notify to plugin {plugin} failed: {reason}")]
    NotifyFailed {
        /// The configured plugin name.
        plugin: String,
        /// What went wrong.
        reason: String,
    },

    /// The plugin is not in a state that accepts requests.
    #[error("plugin {plugin} is {status}")]
    PluginUnavailable {
        /// The configured plugin name.
        plugin: String,
        /// The current status, as text.
        status: String,
    },

    /// The broker configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The ingestion channel is closed.
    #[error("alert channel closed")]
    ChannelClosed,

    /// A step of the shutdown sequence failed.
    #[error("shutdown step '{step}' failed: {reason}")]
    Shutdown {
        /// The step that failed.
        step: &'static str,
        /// What went wrong.
        reason: String,
    },

    /// A supervised task panicked or was aborted.
    #[error("task failed: {0}")]
    Task(String),

    /// Protocol error on a plugin channel.
    #[error("protocol error: {0}")]
    Proto(#[from] claw_notify_proto::ProtoError),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// Returns true for violations of the plugin execution policy.
    ///
    /// These are never downgraded to warnings.
    #[must_use]
    pub const fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::WorldWritable { .. }
                | Self::GroupWritable { .. }
                | Self::SetgidBinary { .. }
                | Self::RefusedRootExecution { .. }
        )
    }

    /// Returns true for errors caused by the shape of the configuration.
    #[must_use]
    pub const fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::IncompletePrivilegeSpec { .. } | Self::UnknownIdentity { .. } | Self::Config(_)
        )
    }

    /// Returns true for per-plugin process errors.
    #[must_use]
    pub const fn is_process_error(&self) -> bool {
        matches!(
            self,
            Self::PluginNotFound { .. }
                | Self::Spawn { .. }
                | Self::HandshakeFailed { .. }
                | Self::ConfigureFailed { .. }
        )
    }

    /// Returns true if this error aborts broker initialization.
    ///
    /// Initialization is all-or-nothing: configuration errors, policy
    /// violations and per-plugin process errors all abort the start.
    #[must_use]
    pub const fn is_fatal_at_init(&self) -> bool {
        self.is_security_violation()
            || self.is_configuration_error()
            || self.is_process_error()
            || matches!(self, Self::PluginDir { .. })
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn error_display_world_writable() {
        let err = BrokerError::WorldWritable {
            path: PathBuf::from("/plugins/notification-dummy"),
        };
        assert_eq!(err.to_string(), "/plugins/notification-dummy is world writable");
    }

    #[test]
    fn error_display_group_writable() {
        let err = BrokerError::GroupWritable {
            path: PathBuf::from("/plugins/notification-dummy"),
        };
        assert_eq!(err.to_string(), "/plugins/notification-dummy is group writable");
    }

    #[test]
    fn error_display_plugin_not_found() {
        let err = BrokerError::PluginNotFound {
            plugin: "dummy_default".to_string(),
        };
        assert_eq!(err.to_string(), "binary for plugin dummy_default not found");
    }

    #[test]
    fn error_display_incomplete_privilege_spec() {
        let err = BrokerError::IncompletePrivilegeSpec {
            plugin: "slack".to_string(),
        };
        assert!(err.to_string().contains("both plugin user and group must be set"));
    }

    #[test]
    fn error_display_unknown_identity() {
        let err = BrokerError::UnknownIdentity {
            kind: IdentityKind::Group,
            name: "toto1234".to_string(),
        };
        assert_eq!(err.to_string(), "unknown group 'toto1234'");
    }

    #[test]
    fn error_display_plugin_dir() {
        let err = BrokerError::PluginDir {
            path: PathBuf::from("/nope"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err.to_string().starts_with("unable to read plugin directory /nope"));
    }

    #[test_case(BrokerError::WorldWritable { path: PathBuf::new() }, true ; "world writable")]
    #[test_case(BrokerError::GroupWritable { path: PathBuf::new() }, true ; "group writable")]
    #[test_case(BrokerError::SetgidBinary { path: PathBuf::new() }, true ; "setgid")]
    #[test_case(BrokerError::RefusedRootExecution { plugin: String::new() }, true ; "root")]
    #[test_case(BrokerError::ChannelClosed, false ; "channel closed")]
    #[test_case(BrokerError::Config(String::new()), false ; "config")]
    fn security_violation_classification(err: BrokerError, expected: bool) {
        assert_eq!(err.is_security_violation(), expected);
    }

    #[test]
    fn configuration_error_classification() {
        assert!(BrokerError::IncompletePrivilegeSpec {
            plugin: "p".to_string()
        }
        .is_configuration_error());
        assert!(!BrokerError::ChannelClosed.is_configuration_error());
    }

    #[test]
    fn process_error_classification() {
        let err = BrokerError::HandshakeFailed {
            plugin: "p".to_string(),
            reason: "timeout".to_string(),
        };
        assert!(err.is_process_error());
        assert!(err.is_fatal_at_init());
        assert!(!err.is_security_violation());
    }

    #[test]
    fn dispatch_errors_are_not_fatal_at_init() {
        let err = BrokerError::NotifyFailed {
            plugin: "p".to_string(),
            reason: "timeout".to_string(),
        };
        assert!(!err.is_fatal_at_init());
    }

    #[test]
    fn error_from_serde_json() {
        let json_err = serde_json::from_str::<String>("invalid json");
        assert!(json_err.is_err());
        let err: BrokerError = json_err.unwrap_err().into();
        assert!(matches!(err, BrokerError::Serialization(_)));
    }
}
