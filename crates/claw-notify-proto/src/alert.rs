//! Alert records exchanged between producers, the broker, and plugins.
//!
//! Every field of [`Alert`] is optional so that upstream components can hand
//! over whatever they know about an event; an empty `Alert::default()` is a
//! valid record and serializes to `{}`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a notification profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(pub u32);

impl ProfileId {
    /// Creates a profile identifier.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw numeric value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for ProfileId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an alert originated from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSource {
    /// Scope of the offending entity (`Ip`, `Range`, `Country`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Value within the scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Source IP address, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Source network range, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    /// Autonomous system name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_name: Option<String>,
    /// Country code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cn: Option<String>,
}

/// A single security event record to be delivered to notification plugins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Unique identifier assigned upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Name of the scenario that raised the alert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    /// Human readable summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Source of the offending traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<AlertSource>,
    /// Number of events that contributed to this alert.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub events_count: u32,
    /// When the first contributing event was seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,
    /// When the last contributing event was seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_at: Option<DateTime<Utc>>,
    /// Whether a remediation (decision) was attached.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub remediation: bool,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl Alert {
    /// Creates an alert for the given scenario.
    #[must_use]
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: Some(scenario.into()),
            ..Self::default()
        }
    }

    /// Sets the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Sets the source.
    #[must_use]
    pub fn with_source(mut self, source: AlertSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

/// An alert routed to a notification profile. This is the ingestion item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileAlert {
    /// The profile the alert was matched against.
    pub profile_id: ProfileId,
    /// The alert itself.
    pub alert: Alert,
}

impl ProfileAlert {
    /// Pairs an alert with a profile.
    #[must_use]
    pub fn new(profile_id: impl Into<ProfileId>, alert: Alert) -> Self {
        Self {
            profile_id: profile_id.into(),
            alert,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_alert_serializes_empty() {
        let json = serde_json::to_string(&Alert::default()).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn alert_builder_sets_fields() {
        let alert = Alert::new("ssh-bf")
            .with_message("ssh bruteforce from 1.2.3.4")
            .with_meta("machine", "web-1");

        assert_eq!(alert.scenario.as_deref(), Some("ssh-bf"));
        assert_eq!(alert.meta.get("machine").map(String::as_str), Some("web-1"));
    }

    #[test]
    fn alert_parses_partial_record() {
        let alert: Alert = serde_json::from_str(
            r#"{"scenario":"http-probing","source":{"ip":"10.0.0.1"},"events_count":7}"#,
        )
        .unwrap();

        assert_eq!(alert.events_count, 7);
        assert_eq!(
            alert.source.and_then(|s| s.ip).as_deref(),
            Some("10.0.0.1")
        );
    }

    #[test]
    fn profile_alert_uses_plain_integer_id() {
        let item = ProfileAlert::new(3, Alert::default());
        let json = serde_json::to_string(&item).unwrap();
        assert_eq!(json, r#"{"profile_id":3,"alert":{}}"#);
    }

    #[test]
    fn profile_id_display() {
        assert_eq!(ProfileId::new(12).to_string(), "12");
        assert_eq!(ProfileId::from(4).get(), 4);
    }
}
