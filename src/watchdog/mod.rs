//! Hang (ANR) detection.
//!
//! The host proves liveness by sending heartbeats to a worker thread. A worker that sees no
//! heartbeat for longer than the threshold pauses the debuggee through its own debug session,
//! converts the paused call frames into a stack trace and sends a report through its own
//! transport. Nothing the worker needs lives on the host side: configuration is moved into the
//! thread at spawn time, host state arrives with heartbeats.

pub mod report;
pub mod worker;

use crate::config::{Options, TagValue};
use crate::event::SessionInfo;
use crate::session::PausedEvent;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Host scope state copied into heartbeats.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeSnapshot {
    pub tags: BTreeMap<String, serde_json::Value>,
    pub contexts: BTreeMap<String, serde_json::Value>,
}

/// Liveness ping from the host. Only the latest one matters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartbeatMessage {
    pub session: Option<SessionInfo>,
    /// Script file name to its debug id.
    pub debug_ids: BTreeMap<String, String>,
    pub scope: Option<ScopeSnapshot>,
}

pub(crate) enum WorkerMessage {
    Heartbeat(HeartbeatMessage),
    /// Stop hang detection until [`WorkerMessage::Resume`].
    Suspend,
    Resume,
    Paused(PausedEvent),
    Stop,
}

/// Worker startup configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogConfig {
    pub anr_threshold: Duration,
    pub max_anr_events: u32,
    pub capture_stack_trace: bool,
    pub app_root_path: Option<String>,
    pub static_tags: BTreeMap<String, TagValue>,
    pub release: Option<String>,
    pub environment: Option<String>,
    pub dist: Option<String>,
}

impl From<&Options> for WatchdogConfig {
    fn from(options: &Options) -> Self {
        Self {
            anr_threshold: options.anr_threshold(),
            max_anr_events: options.max_anr_events,
            capture_stack_trace: options.capture_stack_trace,
            app_root_path: options.app_root_path.clone(),
            static_tags: options.static_tags.clone(),
            release: options.release.clone(),
            environment: options.environment.clone(),
            dist: options.dist.clone(),
        }
    }
}

/// Hang detection state machine, time is passed in by the caller.
///
/// Fires at most once per hang episode: after a trigger only a heartbeat (or re-enable) rearms
/// it.
#[derive(Debug)]
pub struct WatchdogTimer {
    last_heartbeat: Instant,
    threshold: Duration,
    enabled: bool,
    triggered: bool,
}

impl WatchdogTimer {
    pub fn new(now: Instant, threshold: Duration) -> Self {
        Self {
            last_heartbeat: now,
            threshold,
            enabled: true,
            triggered: false,
        }
    }

    /// Heartbeat arrived.
    pub fn poll(&mut self, now: Instant) {
        self.last_heartbeat = self.last_heartbeat.max(now);
        self.triggered = false;
    }

    /// Switch detection on or off. Switching on restarts the countdown.
    pub fn set_enabled(&mut self, enabled: bool, now: Instant) {
        if enabled && !self.enabled {
            self.poll(now);
        }
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Return `true` once when the time since the last heartbeat exceeds the threshold.
    pub fn check(&mut self, now: Instant) -> bool {
        if !self.enabled || self.triggered {
            return false;
        }
        if now.saturating_duration_since(self.last_heartbeat) > self.threshold {
            self.triggered = true;
            return true;
        }
        false
    }
}
