//! Elimination and rescue choreography for contestant icons.
//!
//! Each contestant owns an [`AnimationState`]. Eliminations play
//! `idle -> fading -> disintegrated`, rescues play
//! `disintegrated -> restoring -> settled`. The transient phases hold for a
//! fixed duration and then advance on their own; the pending advance lives in
//! the state itself, so a newer transition replaces (and thereby cancels) it.
//!
//! A `(contestant, round, target)` triple animates at most once: replays of
//! the same change or command find the state already reflecting the target
//! for that round and do nothing.

use std::{collections::BTreeMap, time::Duration};

use serde::Serialize;
use shared::domain::{ContestantRecord, ContestantStatus, ControlCommand, RegistrationNumber};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::roster::{Roster, StatusChange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnimationPhase {
    #[default]
    Idle,
    Fading,
    Disintegrated,
    Restoring,
    Settled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingAdvance {
    due: Instant,
    to: AnimationPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AnimationState {
    phase: AnimationPhase,
    round_id: u32,
    pending: Option<PendingAdvance>,
}

impl AnimationState {
    pub fn phase(&self) -> AnimationPhase {
        self.phase
    }

    /// Question order at which the current phase was triggered.
    pub fn round_id(&self) -> u32 {
        self.round_id
    }

    pub fn pending_until(&self) -> Option<Instant> {
        self.pending.map(|pending| pending.due)
    }

    fn reflects_elimination(&self, round: u32) -> bool {
        self.round_id == round
            && matches!(
                self.phase,
                AnimationPhase::Fading | AnimationPhase::Disintegrated
            )
    }

    fn reflects_rescue(&self, round: u32) -> bool {
        self.round_id == round
            && matches!(self.phase, AnimationPhase::Restoring | AnimationPhase::Settled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnimationTiming {
    pub fade: Duration,
    pub restore: Duration,
}

impl Default for AnimationTiming {
    fn default() -> Self {
        Self {
            fade: Duration::from_secs(1),
            restore: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseChange {
    pub registration_number: RegistrationNumber,
    pub from: AnimationPhase,
    pub to: AnimationPhase,
    pub round_id: u32,
}

/// Operator commands that act on every contestant matching a predicate at
/// the moment they are processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchCommand {
    /// Reveal everyone eliminated in the current round.
    Eliminate,
    /// Restore everyone shown disintegrated whose record is now rescued.
    Rescued,
}

impl BatchCommand {
    pub fn from_control(command: &ControlCommand) -> Option<Self> {
        match command {
            ControlCommand::Eliminate => Some(Self::Eliminate),
            ControlCommand::Rescued => Some(Self::Rescued),
            ControlCommand::Custom(_) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ContestantLifecycleEngine {
    states: BTreeMap<RegistrationNumber, AnimationState>,
    timing: AnimationTiming,
}

impl ContestantLifecycleEngine {
    pub fn new(timing: AnimationTiming) -> Self {
        Self {
            states: BTreeMap::new(),
            timing,
        }
    }

    pub fn state(&self, registration_number: RegistrationNumber) -> AnimationState {
        self.states
            .get(&registration_number)
            .copied()
            .unwrap_or_default()
    }

    pub fn states(&self) -> &BTreeMap<RegistrationNumber, AnimationState> {
        &self.states
    }

    /// Places a contestant coming from a roster snapshot in its resting
    /// phase without animating.
    ///
    /// Outcomes of earlier rounds are shown as final. An elimination in the
    /// current round stays `idle` until the operator reveals it; a rescue in
    /// the current round of a contestant already shown disintegrated stays
    /// there until the operator restores it.
    pub fn seed(&mut self, change: &StatusChange, current_order: u32) -> Option<PhaseChange> {
        let record = &change.record;
        let number = record.registration_number;
        let state = self.state(number);

        match record.status {
            ContestantStatus::Eliminated => {
                let round = record.eliminated_at_question_order.unwrap_or(current_order);
                if state.reflects_elimination(round) {
                    None
                } else if round < current_order {
                    self.set(number, AnimationPhase::Disintegrated, round, None)
                } else {
                    self.set(number, AnimationPhase::Idle, state.round_id, None)
                }
            }
            ContestantStatus::Rescued => {
                let round = record.rescued_at_question_order.unwrap_or(current_order);
                let awaiting_restore = matches!(
                    state.phase,
                    AnimationPhase::Fading | AnimationPhase::Disintegrated
                ) && round >= current_order;
                if state.reflects_rescue(round) || awaiting_restore {
                    None
                } else {
                    self.set(number, AnimationPhase::Settled, round, None)
                }
            }
            _ => self.reset(number, state),
        }
    }

    /// Animates a status change that arrived as a live roster delta.
    pub fn observe(
        &mut self,
        change: &StatusChange,
        current_order: u32,
        now: Instant,
    ) -> Option<PhaseChange> {
        let record = &change.record;
        let number = record.registration_number;
        let state = self.state(number);

        match record.status {
            ContestantStatus::Eliminated => {
                let round = record.eliminated_at_question_order.unwrap_or(current_order);
                if state.reflects_elimination(round) {
                    debug!(
                        registration_number = number.0,
                        round, "lifecycle: elimination already shown for round"
                    );
                    return None;
                }
                self.start_elimination(number, round, now)
            }
            ContestantStatus::Rescued => {
                let round = record.rescued_at_question_order.unwrap_or(current_order);
                if state.reflects_rescue(round) {
                    debug!(
                        registration_number = number.0,
                        round, "lifecycle: rescue already shown for round"
                    );
                    return None;
                }
                match state.phase {
                    AnimationPhase::Fading | AnimationPhase::Disintegrated => {
                        self.start_restore(number, round, now)
                    }
                    _ => self.set(number, AnimationPhase::Settled, round, None),
                }
            }
            _ => self.reset(number, state),
        }
    }

    /// Applies `command` to every contestant matching its predicate right
    /// now. An empty match set makes the command a no-op.
    pub fn command(
        &mut self,
        command: BatchCommand,
        roster: &Roster,
        current_order: u32,
        now: Instant,
    ) -> Vec<PhaseChange> {
        let targets: Vec<&ContestantRecord> = roster
            .records()
            .filter(|record| self.matches(command, record, current_order))
            .collect();

        if targets.is_empty() {
            debug!(?command, current_order, "lifecycle: command matched no contestants");
            return Vec::new();
        }
        info!(
            ?command,
            current_order,
            contestants = targets.len(),
            "lifecycle: applying batch command"
        );

        let targets: Vec<(RegistrationNumber, u32)> = targets
            .into_iter()
            .map(|record| {
                let round = match command {
                    BatchCommand::Eliminate => current_order,
                    BatchCommand::Rescued => {
                        record.rescued_at_question_order.unwrap_or(current_order)
                    }
                };
                (record.registration_number, round)
            })
            .collect();

        targets
            .into_iter()
            .filter_map(|(number, round)| match command {
                BatchCommand::Eliminate => self.start_elimination(number, round, now),
                BatchCommand::Rescued => self.start_restore(number, round, now),
            })
            .collect()
    }

    fn matches(
        &self,
        command: BatchCommand,
        record: &ContestantRecord,
        current_order: u32,
    ) -> bool {
        let state = self.state(record.registration_number);
        match command {
            BatchCommand::Eliminate => {
                record.status == ContestantStatus::Eliminated
                    && record.eliminated_at_question_order == Some(current_order)
                    && !state.reflects_elimination(current_order)
            }
            BatchCommand::Rescued => {
                record.status == ContestantStatus::Rescued
                    && state.phase == AnimationPhase::Disintegrated
            }
        }
    }

    /// Fires every pending advance that is due at `now`.
    pub fn advance_due(&mut self, now: Instant) -> Vec<PhaseChange> {
        let mut changes = Vec::new();
        for (number, state) in self.states.iter_mut() {
            let Some(pending) = state.pending else {
                continue;
            };
            if pending.due > now {
                continue;
            }
            let from = state.phase;
            state.phase = pending.to;
            state.pending = None;
            changes.push(PhaseChange {
                registration_number: *number,
                from,
                to: pending.to,
                round_id: state.round_id,
            });
        }
        changes
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.states
            .values()
            .filter_map(AnimationState::pending_until)
            .min()
    }

    /// Forgets contestants that are no longer on the roster.
    pub fn retain(&mut self, roster: &Roster) {
        self.states.retain(|number, _| roster.get(*number).is_some());
    }

    fn start_elimination(
        &mut self,
        number: RegistrationNumber,
        round: u32,
        now: Instant,
    ) -> Option<PhaseChange> {
        let pending = PendingAdvance {
            due: now + self.timing.fade,
            to: AnimationPhase::Disintegrated,
        };
        self.set(number, AnimationPhase::Fading, round, Some(pending))
    }

    fn start_restore(
        &mut self,
        number: RegistrationNumber,
        round: u32,
        now: Instant,
    ) -> Option<PhaseChange> {
        let pending = PendingAdvance {
            due: now + self.timing.restore,
            to: AnimationPhase::Settled,
        };
        self.set(number, AnimationPhase::Restoring, round, Some(pending))
    }

    fn reset(&mut self, number: RegistrationNumber, state: AnimationState) -> Option<PhaseChange> {
        if state.phase == AnimationPhase::Idle && state.pending.is_none() {
            return None;
        }
        self.set(number, AnimationPhase::Idle, state.round_id, None)
    }

    fn set(
        &mut self,
        number: RegistrationNumber,
        phase: AnimationPhase,
        round_id: u32,
        pending: Option<PendingAdvance>,
    ) -> Option<PhaseChange> {
        let state = self.states.entry(number).or_default();
        let from = state.phase;
        if state.pending.is_some() && state.pending != pending {
            debug!(
                registration_number = number.0,
                ?from,
                to = ?phase,
                "lifecycle: superseding pending advance"
            );
        }
        *state = AnimationState {
            phase,
            round_id,
            pending,
        };
        (from != phase).then_some(PhaseChange {
            registration_number: number,
            from,
            to: phase,
            round_id,
        })
    }
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
