use super::*;

const FADE: Duration = Duration::from_secs(1);

fn record(number: u32, status: ContestantStatus) -> ContestantRecord {
    ContestantRecord {
        registration_number: RegistrationNumber(number),
        full_name: format!("Contestant {number}"),
        status,
        eliminated_at_question_order: None,
        rescued_at_question_order: None,
    }
}

fn eliminated(number: u32, round: u32) -> ContestantRecord {
    ContestantRecord {
        eliminated_at_question_order: Some(round),
        ..record(number, ContestantStatus::Eliminated)
    }
}

fn rescued(number: u32, round: u32) -> ContestantRecord {
    ContestantRecord {
        rescued_at_question_order: Some(round),
        ..record(number, ContestantStatus::Rescued)
    }
}

fn change(record: ContestantRecord, previous: Option<ContestantStatus>) -> StatusChange {
    StatusChange {
        registration_number: record.registration_number,
        previous,
        record,
    }
}

/// Loads `records` as a snapshot and seeds the engine the way a session does.
fn seeded(
    records: Vec<ContestantRecord>,
    current_order: u32,
) -> (Roster, ContestantLifecycleEngine) {
    let mut roster = Roster::new();
    let mut engine = ContestantLifecycleEngine::new(AnimationTiming::default());
    for change in roster.replace(records) {
        engine.seed(&change, current_order);
    }
    (roster, engine)
}

fn phases(changes: &[PhaseChange]) -> Vec<(u32, AnimationPhase)> {
    changes
        .iter()
        .map(|change| (change.registration_number.0, change.to))
        .collect()
}

#[test]
fn eliminate_command_plays_fade_then_disintegrate_once() {
    let (roster, mut engine) = seeded(
        vec![eliminated(12, 4), record(13, ContestantStatus::InProgress)],
        4,
    );
    let now = Instant::now();
    let contestant = RegistrationNumber(12);
    assert_eq!(engine.state(contestant).phase(), AnimationPhase::Idle);

    let mut observed = vec![engine.state(contestant).phase()];
    let first = engine.command(BatchCommand::Eliminate, &roster, 4, now);
    let second = engine.command(BatchCommand::Eliminate, &roster, 4, now);
    observed.extend(first.iter().map(|change| change.to));
    assert!(second.is_empty());

    let settled = engine.advance_due(now + FADE);
    observed.extend(settled.iter().map(|change| change.to));
    let replay = engine.command(BatchCommand::Eliminate, &roster, 4, now + FADE);

    assert_eq!(
        observed,
        vec![
            AnimationPhase::Idle,
            AnimationPhase::Fading,
            AnimationPhase::Disintegrated
        ]
    );
    assert!(replay.is_empty());
    assert_eq!(engine.state(contestant).round_id(), 4);
    assert_eq!(engine.state(RegistrationNumber(13)).phase(), AnimationPhase::Idle);
}

#[test]
fn eliminate_command_transitions_exactly_the_matching_contestants() {
    let (roster, mut engine) = seeded(
        vec![
            record(1, ContestantStatus::InProgress),
            eliminated(2, 2),
            eliminated(3, 5),
            record(4, ContestantStatus::Banned),
            rescued(5, 3),
            eliminated(7, 5),
            record(8, ContestantStatus::Confirmed1),
            eliminated(9, 5),
        ],
        5,
    );

    let changes = engine.command(BatchCommand::Eliminate, &roster, 5, Instant::now());

    assert_eq!(
        phases(&changes),
        vec![
            (3, AnimationPhase::Fading),
            (7, AnimationPhase::Fading),
            (9, AnimationPhase::Fading)
        ]
    );
    assert_eq!(engine.state(RegistrationNumber(2)).phase(), AnimationPhase::Disintegrated);
    assert_eq!(engine.state(RegistrationNumber(5)).phase(), AnimationPhase::Settled);
}

#[test]
fn command_with_no_matching_contestants_is_a_no_op() {
    let (roster, mut engine) = seeded(vec![record(1, ContestantStatus::InProgress)], 3);
    let before = engine.states().clone();

    assert!(engine
        .command(BatchCommand::Eliminate, &roster, 3, Instant::now())
        .is_empty());
    assert!(engine
        .command(BatchCommand::Rescued, &roster, 3, Instant::now())
        .is_empty());
    assert_eq!(engine.states(), &before);
}

#[test]
fn replayed_delta_leaves_animation_state_unchanged() {
    let (_roster, mut engine) = seeded(vec![record(6, ContestantStatus::InProgress)], 4);
    let now = Instant::now();
    let delta = change(eliminated(6, 4), Some(ContestantStatus::InProgress));

    let first = engine.observe(&delta, 4, now);
    assert_eq!(first.map(|change| change.to), Some(AnimationPhase::Fading));
    let after_first = engine.state(RegistrationNumber(6));

    assert!(engine
        .observe(&delta, 4, now + Duration::from_millis(300))
        .is_none());
    assert_eq!(engine.state(RegistrationNumber(6)), after_first);

    engine.advance_due(now + FADE);
    let disintegrated = engine.state(RegistrationNumber(6));
    assert!(engine.observe(&delta, 4, now + FADE * 3).is_none());
    assert_eq!(engine.state(RegistrationNumber(6)), disintegrated);
}

#[test]
fn rescue_mid_fade_cancels_pending_disintegration() {
    let (_roster, mut engine) = seeded(vec![record(8, ContestantStatus::InProgress)], 4);
    let start = Instant::now();
    let number = RegistrationNumber(8);

    engine.observe(&change(eliminated(8, 4), Some(ContestantStatus::InProgress)), 4, start);
    let restored = engine.observe(
        &change(rescued(8, 4), Some(ContestantStatus::Eliminated)),
        4,
        start + Duration::from_millis(500),
    );

    assert_eq!(
        restored.map(|change| (change.from, change.to)),
        Some((AnimationPhase::Fading, AnimationPhase::Restoring))
    );
    assert!(engine.advance_due(start + FADE).is_empty());
    assert_eq!(engine.state(number).phase(), AnimationPhase::Restoring);

    let settled = engine.advance_due(start + Duration::from_millis(1_500));
    assert_eq!(phases(&settled), vec![(8, AnimationPhase::Settled)]);
    assert_eq!(engine.next_deadline(), None);
}

#[test]
fn rescued_command_restores_disintegrated_contestants_rescued_this_round() {
    let (mut roster, mut engine) = seeded(vec![eliminated(2, 3), eliminated(4, 3)], 4);
    assert_eq!(engine.state(RegistrationNumber(2)).phase(), AnimationPhase::Disintegrated);

    for change in roster.replace(vec![rescued(2, 4), eliminated(4, 3)]) {
        assert!(engine.seed(&change, 4).is_none());
    }
    assert_eq!(engine.state(RegistrationNumber(2)).phase(), AnimationPhase::Disintegrated);

    let now = Instant::now();
    let restoring = engine.command(BatchCommand::Rescued, &roster, 4, now);
    assert_eq!(phases(&restoring), vec![(2, AnimationPhase::Restoring)]);
    assert!(engine.command(BatchCommand::Rescued, &roster, 4, now).is_empty());

    let settled = engine.advance_due(now + Duration::from_secs(1));
    assert_eq!(phases(&settled), vec![(2, AnimationPhase::Settled)]);
    assert_eq!(engine.state(RegistrationNumber(4)).phase(), AnimationPhase::Disintegrated);
}

#[test]
fn snapshot_shows_earlier_rounds_as_final() {
    let (_roster, engine) = seeded(
        vec![eliminated(1, 2), rescued(2, 3), eliminated(3, 5)],
        5,
    );
    assert_eq!(engine.state(RegistrationNumber(1)).phase(), AnimationPhase::Disintegrated);
    assert_eq!(engine.state(RegistrationNumber(2)).phase(), AnimationPhase::Settled);
    assert_eq!(engine.state(RegistrationNumber(3)).phase(), AnimationPhase::Idle);
    assert_eq!(engine.next_deadline(), None);
}

#[test]
fn snapshot_refetch_does_not_restart_a_running_fade() {
    let (mut roster, mut engine) = seeded(vec![eliminated(5, 4)], 4);
    let now = Instant::now();
    engine.command(BatchCommand::Eliminate, &roster, 4, now);

    let mut renamed = eliminated(5, 4);
    renamed.full_name = "Contestant Five".into();
    for change in roster.replace(vec![renamed]) {
        assert!(engine.seed(&change, 4).is_none());
    }
    assert_eq!(engine.state(RegistrationNumber(5)).phase(), AnimationPhase::Fading);
    assert_eq!(engine.next_deadline(), Some(now + FADE));
}

#[test]
fn leaving_elimination_for_another_status_resets_to_idle() {
    let (_roster, mut engine) = seeded(vec![eliminated(3, 1)], 2);
    let now = Instant::now();

    let reset = engine.observe(
        &change(record(3, ContestantStatus::InProgress), Some(ContestantStatus::Eliminated)),
        2,
        now,
    );

    assert_eq!(
        reset.map(|change| (change.from, change.to)),
        Some((AnimationPhase::Disintegrated, AnimationPhase::Idle))
    );
}

#[test]
fn next_deadline_tracks_earliest_pending_advance() {
    let (_roster, mut engine) = seeded(
        vec![
            record(1, ContestantStatus::InProgress),
            record(2, ContestantStatus::InProgress),
        ],
        1,
    );
    let start = Instant::now();
    engine.observe(&change(eliminated(2, 1), Some(ContestantStatus::InProgress)), 1, start);
    engine.observe(
        &change(eliminated(1, 1), Some(ContestantStatus::InProgress)),
        1,
        start + Duration::from_millis(200),
    );

    assert_eq!(engine.next_deadline(), Some(start + FADE));
    assert_eq!(phases(&engine.advance_due(start + FADE)), vec![(2, AnimationPhase::Disintegrated)]);
    assert_eq!(
        engine.next_deadline(),
        Some(start + Duration::from_millis(1_200))
    );
}

#[test]
fn control_values_map_to_batch_commands() {
    assert_eq!(
        BatchCommand::from_control(&ControlCommand::Eliminate),
        Some(BatchCommand::Eliminate)
    );
    assert_eq!(
        BatchCommand::from_control(&ControlCommand::Rescued),
        Some(BatchCommand::Rescued)
    );
    assert_eq!(
        BatchCommand::from_control(&ControlCommand::Custom("spotlight".into())),
        None
    );
}
