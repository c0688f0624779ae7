use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ContestantRecord, ContestantStatus, RegistrationNumber},
    protocol::RescueStatusUpdate,
};
use tracing::{debug, warn};

use crate::error::RosterError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContestantUpdate {
    pub registration_number: RegistrationNumber,
    pub status: ContestantStatus,
    pub eliminated_at_question_order: Option<u32>,
    pub rescued_at_question_order: Option<u32>,
}

/// Incremental status update for some contestants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterDelta {
    pub updates: Vec<ContestantUpdate>,
    pub received_at: DateTime<Utc>,
}

impl RosterDelta {
    pub fn from_rescue_update(update: RescueStatusUpdate, received_at: DateTime<Utc>) -> Self {
        let updates = update
            .updated_rescues
            .into_iter()
            .map(|rescue| ContestantUpdate {
                registration_number: rescue.registration_number,
                status: rescue.status,
                eliminated_at_question_order: (rescue.status == ContestantStatus::Eliminated)
                    .then_some(rescue.question_order)
                    .flatten(),
                rescued_at_question_order: (rescue.status == ContestantStatus::Rescued)
                    .then_some(rescue.question_order)
                    .flatten(),
            })
            .collect();
        Self {
            updates,
            received_at,
        }
    }

    /// Stamps `question_order` on eliminations and rescues that arrived
    /// without a round.
    pub fn fill_missing_rounds(&mut self, question_order: u32) {
        for update in &mut self.updates {
            match update.status {
                ContestantStatus::Eliminated => {
                    update
                        .eliminated_at_question_order
                        .get_or_insert(question_order);
                }
                ContestantStatus::Rescued => {
                    update.rescued_at_question_order.get_or_insert(question_order);
                }
                _ => {}
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub registration_number: RegistrationNumber,
    /// `None` when the contestant was not on the roster before.
    pub previous: Option<ContestantStatus>,
    pub record: ContestantRecord,
}

fn validate_fields(
    registration_number: RegistrationNumber,
    status: ContestantStatus,
    eliminated_at: Option<u32>,
    rescued_at: Option<u32>,
) -> Result<(), RosterError> {
    if registration_number.0 == 0 {
        return Err(RosterError::ZeroRegistrationNumber);
    }
    let eliminated = status == ContestantStatus::Eliminated;
    let rescued = status == ContestantStatus::Rescued;
    match (eliminated, eliminated_at.is_some()) {
        (true, false) => return Err(RosterError::MissingEliminationRound(registration_number)),
        (false, true) => return Err(RosterError::UnexpectedEliminationRound(registration_number)),
        _ => {}
    }
    match (rescued, rescued_at.is_some()) {
        (true, false) => Err(RosterError::MissingRescueRound(registration_number)),
        (false, true) => Err(RosterError::UnexpectedRescueRound(registration_number)),
        _ => Ok(()),
    }
}

pub fn validate_record(record: &ContestantRecord) -> Result<(), RosterError> {
    validate_fields(
        record.registration_number,
        record.status,
        record.eliminated_at_question_order,
        record.rescued_at_question_order,
    )
}

/// Every contestant of the match keyed by registration number.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    contestants: BTreeMap<RegistrationNumber, ContestantRecord>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a full roster snapshot and reports every contestant whose
    /// status or rounds differ from what was known before.
    pub fn replace(&mut self, records: Vec<ContestantRecord>) -> Vec<StatusChange> {
        let mut next = BTreeMap::new();
        for record in records {
            if let Err(err) = validate_record(&record) {
                warn!(
                    registration_number = record.registration_number.0,
                    "roster: dropping invalid contestant record: {err}"
                );
                continue;
            }
            next.insert(record.registration_number, record);
        }

        let removed = self
            .contestants
            .keys()
            .filter(|number| !next.contains_key(*number))
            .count();
        if removed > 0 {
            debug!(removed, "roster: contestants no longer present in snapshot");
        }

        let changes = next
            .values()
            .filter_map(|record| {
                let previous = self.contestants.get(&record.registration_number);
                if previous == Some(record) {
                    return None;
                }
                Some(StatusChange {
                    registration_number: record.registration_number,
                    previous: previous.map(|previous| previous.status),
                    record: record.clone(),
                })
            })
            .collect();
        self.contestants = next;
        changes
    }

    /// Applies every update of `delta` or none of them.
    pub fn apply_delta(&mut self, delta: &RosterDelta) -> Result<Vec<StatusChange>, RosterError> {
        for update in &delta.updates {
            validate_fields(
                update.registration_number,
                update.status,
                update.eliminated_at_question_order,
                update.rescued_at_question_order,
            )?;
            if !self.contestants.contains_key(&update.registration_number) {
                return Err(RosterError::UnknownContestant(update.registration_number));
            }
        }

        let mut changes = Vec::new();
        for update in &delta.updates {
            let Some(record) = self.contestants.get_mut(&update.registration_number) else {
                continue;
            };
            let unchanged = record.status == update.status
                && record.eliminated_at_question_order == update.eliminated_at_question_order
                && record.rescued_at_question_order == update.rescued_at_question_order;
            if unchanged {
                continue;
            }
            let previous = record.status;
            record.status = update.status;
            record.eliminated_at_question_order = update.eliminated_at_question_order;
            record.rescued_at_question_order = update.rescued_at_question_order;
            changes.push(StatusChange {
                registration_number: update.registration_number,
                previous: Some(previous),
                record: record.clone(),
            });
        }
        Ok(changes)
    }

    pub fn get(&self, registration_number: RegistrationNumber) -> Option<&ContestantRecord> {
        self.contestants.get(&registration_number)
    }

    pub fn records(&self) -> impl Iterator<Item = &ContestantRecord> {
        self.contestants.values()
    }

    pub fn len(&self) -> usize {
        self.contestants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contestants.is_empty()
    }
}

#[cfg(test)]
#[path = "tests/roster_tests.rs"]
mod tests;
