//! Alert batching.
//!
//! Every `(profile, plugin)` binding owns an [`AlertBatch`] that moves between
//! two states:
//!
//! - **Empty**: no pending alerts.
//! - **Accumulating**: at least one alert, with `started_at` set by the first.
//!
//! An append that brings the batch to `group_threshold` flushes it on the
//! spot. Everything else is flushed by the shared clock: on each tick a batch
//! older than `group_wait` is flushed, and a `group_wait` of zero means "at
//! the next tick". Count flushes therefore never wait for a tick.
//!
//! A flush moves the alerts out of the batch into an owned [`FlushedBatch`]
//! while the batch lock is held, so the reset and the take are one step and
//! no alert can be seen twice or lost between them. Flushed batches are
//! returned to the caller, which dispatches them after the lock is released.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use claw_notify_proto::{Alert, ProfileAlert, ProfileId};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::{PluginConfig, ProfileBinding};

/// Identifies one batch: a profile and one of its plugins.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    /// The profile.
    pub profile: ProfileId,
    /// The bound plugin's name.
    pub plugin: Arc<str>,
}

impl BatchKey {
    /// Creates a key.
    #[must_use]
    pub fn new(profile: impl Into<ProfileId>, plugin: impl Into<Arc<str>>) -> Self {
        Self {
            profile: profile.into(),
            plugin: plugin.into(),
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "profile {}/{}", self.profile, self.plugin)
    }
}

/// When a batch is flushed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchPolicy {
    /// Age at which the tick flushes the batch. Zero flushes at the next tick.
    pub group_wait: Duration,
    /// Count at which an append flushes the batch. Zero disables it.
    pub group_threshold: usize,
}

impl BatchPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(group_wait: Duration, group_threshold: usize) -> Self {
        Self {
            group_wait,
            group_threshold,
        }
    }
}

impl From<&PluginConfig> for BatchPolicy {
    fn from(plugin: &PluginConfig) -> Self {
        Self::new(plugin.group_wait, plugin.group_threshold)
    }
}

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The count threshold was reached on append.
    Count,
    /// The tick found the batch due.
    Time,
    /// The broker is shutting down.
    Drain,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count => write!(f, "count"),
            Self::Time => write!(f, "time"),
            Self::Drain => write!(f, "drain"),
        }
    }
}

/// An immutable batch ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushedBatch {
    /// The batch this came from.
    pub key: BatchKey,
    /// The alerts, in arrival order.
    pub alerts: Vec<Alert>,
    /// What caused the flush.
    pub trigger: FlushTrigger,
}

/// Pending alerts for one binding.
#[derive(Debug, Clone)]
pub struct AlertBatch {
    policy: BatchPolicy,
    alerts: Vec<Alert>,
    started_at: Option<Instant>,
}

impl AlertBatch {
    /// Creates an empty batch.
    #[must_use]
    pub const fn new(policy: BatchPolicy) -> Self {
        Self {
            policy,
            alerts: Vec::new(),
            started_at: None,
        }
    }

    /// The batch's policy.
    #[must_use]
    pub const fn policy(&self) -> BatchPolicy {
        self.policy
    }

    /// Number of pending alerts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    /// When the first pending alert arrived.
    #[must_use]
    pub const fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Appends an alert, returning the batch if this append reached the
    /// count threshold.
    pub fn append(&mut self, alert: Alert, now: Instant) -> Option<Vec<Alert>> {
        if self.alerts.is_empty() {
            self.started_at = Some(now);
        }
        self.alerts.push(alert);

        let threshold = self.policy.group_threshold;
        if threshold > 0 && self.alerts.len() >= threshold {
            return self.take();
        }
        None
    }

    /// Returns true if the tick at `now` should flush this batch.
    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        match self.started_at {
            Some(_) if self.policy.group_wait.is_zero() => true,
            Some(started) => now.saturating_duration_since(started) >= self.policy.group_wait,
            None => false,
        }
    }

    /// Flushes the batch if it is due at `now`.
    pub fn tick(&mut self, now: Instant) -> Option<Vec<Alert>> {
        if self.is_due(now) { self.take() } else { None }
    }

    /// Flushes whatever is pending.
    pub fn take(&mut self) -> Option<Vec<Alert>> {
        self.started_at = None;
        if self.alerts.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.alerts))
        }
    }
}

#[derive(Debug)]
struct BatchSlot {
    key: BatchKey,
    batch: Mutex<AlertBatch>,
}

impl BatchSlot {
    fn flush(&self, alerts: Vec<Alert>, trigger: FlushTrigger) -> FlushedBatch {
        debug!(
            profile = %self.key.profile,
            plugin = %self.key.plugin,
            alerts = alerts.len(),
            trigger = %trigger,
            "flushing batch"
        );
        FlushedBatch {
            key: self.key.clone(),
            alerts,
            trigger,
        }
    }
}

/// All batches of a broker.
///
/// The set of batches is fixed at construction; only their contents change.
/// Each batch has its own lock, so profiles never contend with each other.
#[derive(Debug, Default)]
pub struct BatchEngine {
    slots: HashMap<ProfileId, Vec<BatchSlot>>,
}

impl BatchEngine {
    /// Builds one batch per `(profile, plugin)` binding.
    ///
    /// Bindings naming a plugin missing from `plugins` are skipped.
    #[must_use]
    pub fn new(profiles: &[ProfileBinding], plugins: &[PluginConfig]) -> Self {
        let mut slots: HashMap<ProfileId, Vec<BatchSlot>> = HashMap::new();

        for profile in profiles {
            for name in &profile.notifications {
                let Some(plugin) = plugins.iter().find(|p| &p.name == name) else {
                    continue;
                };
                slots.entry(profile.id).or_default().push(BatchSlot {
                    key: BatchKey::new(profile.id, plugin.name.as_str()),
                    batch: Mutex::new(AlertBatch::new(BatchPolicy::from(plugin))),
                });
            }
        }

        Self { slots }
    }

    /// All batch keys.
    pub fn keys(&self) -> impl Iterator<Item = &BatchKey> {
        self.slots.values().flatten().map(|slot| &slot.key)
    }

    /// Returns true if the profile has at least one bound plugin.
    #[must_use]
    pub fn is_routed(&self, profile: ProfileId) -> bool {
        self.slots.contains_key(&profile)
    }

    /// Total number of pending alerts across all batches.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.slots
            .values()
            .flatten()
            .map(|slot| slot.batch.lock().len())
            .sum()
    }

    /// Routes an alert into every batch of its profile.
    ///
    /// Returns the batches this append flushed on count, or `None` when the
    /// profile has no bindings and the alert was dropped.
    pub fn append(&self, item: ProfileAlert, now: Instant) -> Option<Vec<FlushedBatch>> {
        let slots = self.slots.get(&item.profile_id)?;

        let mut flushed = Vec::new();
        let mut alert = Some(item.alert);
        for (i, slot) in slots.iter().enumerate() {
            let alert = if i + 1 == slots.len() {
                alert.take()
            } else {
                alert.clone()
            };
            let Some(alert) = alert else { break };

            let taken = slot.batch.lock().append(alert, now);
            if let Some(alerts) = taken {
                flushed.push(slot.flush(alerts, FlushTrigger::Count));
            }
        }

        Some(flushed)
    }

    /// Flushes every batch that is due at `now`.
    #[must_use]
    pub fn tick(&self, now: Instant) -> Vec<FlushedBatch> {
        self.slots
            .values()
            .flatten()
            .filter_map(|slot| {
                let taken = slot.batch.lock().tick(now);
                taken.map(|alerts| slot.flush(alerts, FlushTrigger::Time))
            })
            .collect()
    }

    /// Flushes every non-empty batch.
    #[must_use]
    pub fn drain(&self) -> Vec<FlushedBatch> {
        self.slots
            .values()
            .flatten()
            .filter_map(|slot| {
                let taken = slot.batch.lock().take();
                taken.map(|alerts| slot.flush(alerts, FlushTrigger::Drain))
            })
            .collect()
    }
}
