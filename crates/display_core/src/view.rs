//! Pure projection of session state into what the renderer draws.

use serde::Serialize;
use serde_json::Value;
use shared::{
    domain::{ContestantStatus, ControlCommand, RegistrationNumber, RenderMode, RescueStatus},
    protocol::{BackgroundRef, CurrentQuestion, MatchInfo, RescueEntry},
};

use crate::{
    channel::ConnectionState,
    lifecycle::{AnimationPhase, ContestantLifecycleEngine},
    reconciler::ScreenControlReconciler,
    roster::Roster,
    timer::TimerState,
};

pub struct ProjectionInput<'a> {
    pub reconciler: &'a ScreenControlReconciler,
    pub match_info: Option<&'a MatchInfo>,
    pub question: Option<&'a CurrentQuestion>,
    pub background: Option<&'a BackgroundRef>,
    pub question_count: u32,
    pub timer: TimerState,
    pub roster: &'a Roster,
    pub lifecycle: &'a ContestantLifecycleEngine,
    pub rescues: &'a [RescueEntry],
    pub connection: ConnectionState,
    pub grid_columns: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenView {
    pub mode: RenderMode,
    pub command: Option<ControlCommand>,
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionView {
    pub order: u32,
    pub content: String,
    pub question_type: Option<String>,
    pub time_limit: Option<u32>,
    pub answer: Option<String>,
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridCell {
    pub registration_number: RegistrationNumber,
    pub full_name: String,
    pub row: usize,
    pub column: usize,
    pub status: ContestantStatus,
    pub phase: AnimationPhase,
    /// False only once the icon has disintegrated.
    pub visible: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SidebarCounts {
    pub total: usize,
    pub active: usize,
    pub eliminated: usize,
    pub rescued: usize,
    pub banned: usize,
    pub completed: usize,
    pub rescues_remaining: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankEntry {
    pub registration_number: RegistrationNumber,
    pub rank: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewModel {
    pub screen: ScreenView,
    pub match_name: Option<String>,
    pub question: Option<QuestionView>,
    pub background_url: Option<String>,
    pub question_count: u32,
    pub timer: TimerState,
    pub grid: Vec<GridCell>,
    pub sidebar: SidebarCounts,
    pub ranking: Vec<RankEntry>,
    pub connection: ConnectionState,
}

impl ViewModel {
    pub fn cell(&self, registration_number: RegistrationNumber) -> Option<&GridCell> {
        self.grid
            .iter()
            .find(|cell| cell.registration_number == registration_number)
    }
}

pub fn project(input: &ProjectionInput<'_>) -> ViewModel {
    let current = input.reconciler.current();
    let screen = ScreenView {
        mode: input.reconciler.render_mode(),
        command: current.and_then(|signal| signal.value.clone()),
        payload: current.and_then(|signal| signal.payload.clone()),
    };

    ViewModel {
        screen,
        match_name: input.match_info.map(|info| info.name.clone()),
        question: input.question.map(|question| QuestionView {
            order: question.order,
            content: question.content.clone(),
            question_type: question.question_type.clone(),
            time_limit: question.time_limit,
            answer: question.answer.clone(),
            explanation: question.explanation.clone(),
        }),
        background_url: input
            .background
            .and_then(|background| background.image_url.clone()),
        question_count: input.question_count,
        timer: input.timer,
        grid: grid(input),
        sidebar: sidebar(input.roster, input.rescues),
        ranking: ranking(input.roster),
        connection: input.connection,
    }
}

fn grid(input: &ProjectionInput<'_>) -> Vec<GridCell> {
    let columns = input.grid_columns.max(1);
    input
        .roster
        .records()
        .enumerate()
        .map(|(index, record)| {
            let phase = input.lifecycle.state(record.registration_number).phase();
            GridCell {
                registration_number: record.registration_number,
                full_name: record.full_name.clone(),
                row: index / columns,
                column: index % columns,
                status: record.status,
                phase,
                visible: phase != AnimationPhase::Disintegrated,
            }
        })
        .collect()
}

fn sidebar(roster: &Roster, rescues: &[RescueEntry]) -> SidebarCounts {
    let mut counts = SidebarCounts {
        total: roster.len(),
        rescues_remaining: rescues
            .iter()
            .filter(|rescue| rescue.status != RescueStatus::Used)
            .count(),
        ..SidebarCounts::default()
    };
    for record in roster.records() {
        if record.status.is_in_play() {
            counts.active += 1;
        }
        match record.status {
            ContestantStatus::Eliminated => counts.eliminated += 1,
            ContestantStatus::Rescued => counts.rescued += 1,
            ContestantStatus::Banned => counts.banned += 1,
            ContestantStatus::Completed => counts.completed += 1,
            _ => {}
        }
    }
    counts
}

/// Standings: everyone still in play shares first place, eliminated
/// contestants follow ordered by how late they went out. Banned contestants
/// are not ranked.
fn ranking(roster: &Roster) -> Vec<RankEntry> {
    let in_play: Vec<RegistrationNumber> = roster
        .records()
        .filter(|record| record.status.is_in_play())
        .map(|record| record.registration_number)
        .collect();

    let mut eliminated: Vec<(u32, RegistrationNumber)> = roster
        .records()
        .filter(|record| record.status == ContestantStatus::Eliminated)
        .map(|record| {
            (
                record.eliminated_at_question_order.unwrap_or_default(),
                record.registration_number,
            )
        })
        .collect();
    eliminated.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    let mut ranking: Vec<RankEntry> = in_play
        .iter()
        .map(|&registration_number| RankEntry {
            registration_number,
            rank: 1,
        })
        .collect();

    // Ties share a rank and the next rank skips past them.
    let mut previous: Option<(u32, usize)> = None;
    for (position, (round, registration_number)) in eliminated.into_iter().enumerate() {
        let rank = match previous {
            Some((previous_round, rank)) if previous_round == round => rank,
            _ => in_play.len() + position + 1,
        };
        previous = Some((round, rank));
        ranking.push(RankEntry {
            registration_number,
            rank,
        });
    }
    ranking
}

#[cfg(test)]
#[path = "tests/view_tests.rs"]
mod tests;
