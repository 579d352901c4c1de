//! Messages exchanged over a plugin's stdio channel.
//!
//! The broker writes [`BrokerMessage`]s to the plugin's stdin and reads
//! [`PluginMessage`]s from its stdout, one JSON object per line. The first
//! message a plugin emits must be [`PluginMessage::Hello`].

use serde::{Deserialize, Serialize};

use crate::alert::Alert;
use crate::ProtoError;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable carrying the per-launch handshake cookie.
pub const COOKIE_ENV: &str = "CLAW_NOTIFY_PLUGIN_COOKIE";

/// Environment variable carrying the protocol version the broker expects.
pub const PROTOCOL_VERSION_ENV: &str = "CLAW_NOTIFY_PROTOCOL_VERSION";

/// Capability advertised by plugins that accept `notify` requests.
pub const CAPABILITY_NOTIFY: &str = "notify";

/// Messages sent from the broker to a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerMessage {
    /// Hands the plugin its own configuration section.
    Configure {
        /// Request identifier.
        id: u64,
        /// The plugin configuration, as configured in the broker.
        config: serde_json::Value,
    },

    /// Delivers one batch of alerts.
    Notify {
        /// Request identifier.
        id: u64,
        /// Name of the configured plugin instance.
        plugin: String,
        /// The batch, in arrival order.
        alerts: Vec<Alert>,
    },

    /// Asks the plugin to exit.
    Shutdown,
}

impl BrokerMessage {
    /// Returns the request identifier, if this message expects a response.
    #[must_use]
    pub const fn id(&self) -> Option<u64> {
        match self {
            Self::Configure { id, .. } | Self::Notify { id, .. } => Some(*id),
            Self::Shutdown => None,
        }
    }

    /// Get the message type name for error reporting.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::Configure { .. } => "configure",
            Self::Notify { .. } => "notify",
            Self::Shutdown => "shutdown",
        }
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::Encoding(e.to_string()))
    }

    /// Deserialize from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn from_json(json: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(json).map_err(|e| ProtoError::Decoding(e.to_string()))
    }
}

/// Messages sent from a plugin to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginMessage {
    /// Handshake, emitted once right after launch.
    Hello {
        /// Protocol version implemented by the plugin.
        protocol_version: u32,
        /// The cookie received through [`COOKIE_ENV`].
        cookie: String,
        /// Declared capabilities.
        #[serde(default)]
        capabilities: Vec<String>,
    },

    /// The request with this id succeeded.
    Ack {
        /// Request identifier.
        id: u64,
    },

    /// The request with this id failed.
    Error {
        /// Request identifier.
        id: u64,
        /// Failure description.
        message: String,
    },
}

impl PluginMessage {
    /// Builds the handshake message.
    #[must_use]
    pub fn hello(cookie: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self::Hello {
            protocol_version: PROTOCOL_VERSION,
            cookie: cookie.into(),
            capabilities,
        }
    }

    /// Returns the request identifier this message answers.
    #[must_use]
    pub const fn id(&self) -> Option<u64> {
        match self {
            Self::Ack { id } | Self::Error { id, .. } => Some(*id),
            Self::Hello { .. } => None,
        }
    }

    /// Get the message type name for error reporting.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Ack { .. } => "ack",
            Self::Error { .. } => "error",
        }
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::Encoding(e.to_string()))
    }

    /// Deserialize from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn from_json(json: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(json).map_err(|e| ProtoError::Decoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn notify_message_wire_format() {
        let msg = BrokerMessage::Notify {
            id: 7,
            plugin: "file_default".to_string(),
            alerts: vec![Alert::default(), Alert::default()],
        };

        let json = msg.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"notify","id":7,"plugin":"file_default","alerts":[{},{}]}"#
        );
    }

    #[test]
    fn shutdown_has_no_id() {
        assert_eq!(BrokerMessage::Shutdown.id(), None);
        assert_eq!(BrokerMessage::Shutdown.to_json().unwrap(), r#"{"type":"shutdown"}"#);
    }

    #[test]
    fn hello_uses_current_version() {
        let msg = PluginMessage::hello("cookie", vec![CAPABILITY_NOTIFY.to_string()]);
        match msg {
            PluginMessage::Hello {
                protocol_version,
                cookie,
                capabilities,
            } => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(cookie, "cookie");
                assert_eq!(capabilities, vec!["notify".to_string()]);
            }
            other => panic!("expected hello, got {other:?}"),
        }
    }

    #[test]
    fn hello_capabilities_default_to_empty() {
        let msg =
            PluginMessage::from_json(r#"{"type":"hello","protocol_version":1,"cookie":"c"}"#)
                .unwrap();
        assert_eq!(
            msg,
            PluginMessage::Hello {
                protocol_version: 1,
                cookie: "c".to_string(),
                capabilities: Vec::new(),
            }
        );
    }

    #[test_case(r#"{"type":"ack","id":3}"#, Some(3), "ack" ; "ack")]
    #[test_case(r#"{"type":"error","id":4,"message":"disk full"}"#, Some(4), "error" ; "error")]
    #[test_case(r#"{"type":"hello","protocol_version":1,"cookie":"x"}"#, None, "hello" ; "hello")]
    fn plugin_message_ids(json: &str, id: Option<u64>, kind: &str) {
        let msg = PluginMessage::from_json(json).unwrap();
        assert_eq!(msg.id(), id);
        assert_eq!(msg.message_type(), kind);
    }

    #[test]
    fn unknown_message_type_is_a_decoding_error() {
        let err = PluginMessage::from_json(r#"{"type":"bogus"}"#).unwrap_err();
        assert!(matches!(err, ProtoError::Decoding(_)));
    }
}
