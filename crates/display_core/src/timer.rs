use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

/// Absolute remaining time reported for a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTick {
    pub remaining_seconds: u32,
    pub for_question_order: u32,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    pub remaining_seconds: u32,
    pub question_order: Option<u32>,
    pub expired: bool,
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    remaining_seconds: u32,
    question_order: u32,
    at: Instant,
}

/// Turns sparse remaining-time ticks into a countdown that moves once a
/// second between them.
#[derive(Debug, Default)]
pub struct TimerProjector {
    anchor: Option<Anchor>,
    remaining: u32,
}

impl TimerProjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_tick(&mut self, tick: TimerTick, now: Instant) {
        if let Some(anchor) = self.anchor {
            if anchor.question_order != tick.for_question_order {
                debug!(
                    from_question = anchor.question_order,
                    to_question = tick.for_question_order,
                    "timer: question changed, resetting countdown"
                );
            }
        }
        self.anchor = Some(Anchor {
            remaining_seconds: tick.remaining_seconds,
            question_order: tick.for_question_order,
            at: now,
        });
        self.remaining = tick.remaining_seconds;
    }

    /// Moves the countdown to `now`. Returns true when the displayed value
    /// changed.
    pub fn advance(&mut self, now: Instant) -> bool {
        let Some(anchor) = self.anchor else {
            return false;
        };
        let elapsed = now.saturating_duration_since(anchor.at).as_secs();
        let elapsed = u32::try_from(elapsed).unwrap_or(u32::MAX);
        let projected = anchor.remaining_seconds.saturating_sub(elapsed);
        // Never count back up between ticks.
        let next = projected.min(self.remaining);
        let changed = next != self.remaining;
        self.remaining = next;
        changed
    }

    /// When the displayed value drops next: a whole number of seconds after
    /// the last tick. `None` once the countdown is idle or at zero.
    pub fn next_change_at(&self) -> Option<Instant> {
        let anchor = self.anchor?;
        if self.remaining == 0 {
            return None;
        }
        let steps = anchor.remaining_seconds.saturating_sub(self.remaining) + 1;
        Some(anchor.at + Duration::from_secs(u64::from(steps)))
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn question_order(&self) -> Option<u32> {
        self.anchor.map(|anchor| anchor.question_order)
    }

    pub fn state(&self) -> TimerState {
        TimerState {
            remaining_seconds: self.remaining,
            question_order: self.question_order(),
            expired: self.anchor.is_some() && self.remaining == 0,
        }
    }

    pub fn clear(&mut self) {
        self.anchor = None;
        self.remaining = 0;
    }
}

#[cfg(test)]
#[path = "tests/timer_tests.rs"]
mod tests;
