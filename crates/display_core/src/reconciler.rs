use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{
    domain::{ControlCommand, RenderMode},
    protocol::{ScreenControlState, ScreenUpdate},
};
use tracing::debug;

use crate::error::SignalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOrigin {
    Snapshot,
    Push,
    Operator,
}

/// Instruction about what the audience screen renders right now.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlSignal {
    pub key: RenderMode,
    pub value: Option<ControlCommand>,
    pub payload: Option<Value>,
    pub received_at: DateTime<Utc>,
    pub origin: SignalOrigin,
    pub sequence: Option<u64>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl ControlSignal {
    pub fn new(key: RenderMode, value: Option<ControlCommand>, origin: SignalOrigin) -> Self {
        Self {
            key,
            value,
            payload: None,
            received_at: Utc::now(),
            origin,
            sequence: None,
            sent_at: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn from_screen_update(update: ScreenUpdate, received_at: DateTime<Utc>) -> Self {
        Self {
            key: update.control_key,
            value: update.control_value,
            payload: update.media,
            received_at,
            origin: SignalOrigin::Push,
            sequence: update.sequence,
            sent_at: update.sent_at,
        }
    }

    pub fn from_snapshot(state: &ScreenControlState, received_at: DateTime<Utc>) -> Self {
        Self {
            key: state.control_key,
            value: state.control_value.clone(),
            payload: state.media.clone(),
            received_at,
            origin: SignalOrigin::Snapshot,
            sequence: state.sequence,
            sent_at: state.updated_at,
        }
    }

    pub fn validate(&self) -> Result<(), SignalError> {
        match &self.payload {
            None | Some(Value::Null) | Some(Value::Object(_)) => Ok(()),
            Some(_) => Err(SignalError::PayloadNotObject { mode: self.key }),
        }
    }
}

/// Decides whether an incoming signal may replace the current one.
pub trait SignalOrdering: Send + Sync {
    fn supersedes(&self, incoming: &ControlSignal, current: &ControlSignal) -> bool;
    fn name(&self) -> &'static str;
}

/// Last signal received wins, whatever it says about itself.
pub struct ArrivalOrder;

impl SignalOrdering for ArrivalOrder {
    fn supersedes(&self, _incoming: &ControlSignal, _current: &ControlSignal) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "arrival"
    }
}

/// Strictly higher controller sequence wins; unsequenced signals fall back to
/// arrival order.
pub struct ServerSequenceOrder;

impl SignalOrdering for ServerSequenceOrder {
    fn supersedes(&self, incoming: &ControlSignal, current: &ControlSignal) -> bool {
        match (incoming.sequence, current.sequence) {
            (Some(incoming), Some(current)) => incoming > current,
            _ => true,
        }
    }

    fn name(&self) -> &'static str {
        "sequence"
    }
}

/// A signal stamped no earlier than the current one wins; unstamped signals
/// fall back to arrival order.
pub struct ServerTimestampOrder;

impl SignalOrdering for ServerTimestampOrder {
    fn supersedes(&self, incoming: &ControlSignal, current: &ControlSignal) -> bool {
        match (incoming.sent_at, current.sent_at) {
            (Some(incoming), Some(current)) => incoming >= current,
            _ => true,
        }
    }

    fn name(&self) -> &'static str {
        "server_time"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalOrderingKind {
    #[default]
    Arrival,
    Sequence,
    ServerTime,
}

impl SignalOrderingKind {
    pub fn build(self) -> Box<dyn SignalOrdering> {
        match self {
            Self::Arrival => Box::new(ArrivalOrder),
            Self::Sequence => Box::new(ServerSequenceOrder),
            Self::ServerTime => Box::new(ServerTimestampOrder),
        }
    }
}

impl std::str::FromStr for SignalOrderingKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "arrival" => Ok(Self::Arrival),
            "sequence" => Ok(Self::Sequence),
            "server_time" | "server-time" => Ok(Self::ServerTime),
            other => Err(format!("unknown signal ordering '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalDecision {
    Applied { previous: Option<RenderMode> },
    Stale,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReconcilerState {
    pub mode: RenderMode,
    pub value: Option<ControlCommand>,
    pub payload: Option<Value>,
    pub applied: u64,
    pub stale: u64,
}

pub struct ScreenControlReconciler {
    current: Option<ControlSignal>,
    ordering: Box<dyn SignalOrdering>,
    applied: u64,
    stale: u64,
}

impl Default for ScreenControlReconciler {
    fn default() -> Self {
        Self::new(Box::new(ArrivalOrder))
    }
}

impl ScreenControlReconciler {
    pub fn new(ordering: Box<dyn SignalOrdering>) -> Self {
        Self {
            current: None,
            ordering,
            applied: 0,
            stale: 0,
        }
    }

    /// Replaces the canonical signal with `signal` as a whole, or leaves the
    /// state untouched when the signal is malformed or loses the ordering
    /// check.
    pub fn apply(&mut self, signal: ControlSignal) -> Result<SignalDecision, SignalError> {
        signal.validate()?;

        if let Some(current) = &self.current {
            if !self.ordering.supersedes(&signal, current) {
                self.stale += 1;
                debug!(
                    ordering = self.ordering.name(),
                    incoming = %signal.key,
                    current = %current.key,
                    "screen: dropping out-of-order signal"
                );
                return Ok(SignalDecision::Stale);
            }
        }

        let previous = self.current.replace(signal).map(|previous| previous.key);
        self.applied += 1;
        Ok(SignalDecision::Applied { previous })
    }

    pub fn render_mode(&self) -> RenderMode {
        self.current
            .as_ref()
            .map(|signal| signal.key)
            .unwrap_or_default()
    }

    pub fn current(&self) -> Option<&ControlSignal> {
        self.current.as_ref()
    }

    pub fn ordering_name(&self) -> &'static str {
        self.ordering.name()
    }

    pub fn state(&self) -> ReconcilerState {
        ReconcilerState {
            mode: self.render_mode(),
            value: self.current.as_ref().and_then(|signal| signal.value.clone()),
            payload: self.current.as_ref().and_then(|signal| signal.payload.clone()),
            applied: self.applied,
            stale: self.stale,
        }
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
