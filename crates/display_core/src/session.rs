//! One live display session for one match.
//!
//! All state lives in [`MatchState`], a synchronous reducer. A single driver
//! task feeds it every input (snapshot slices, push events, operator
//! commands, countdown and animation deadlines) in arrival order,
//! executes the effects it asks for and republishes the view.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use shared::{
    domain::{ContestantStatus, MatchId, RenderMode},
    protocol::{BackgroundRef, CurrentQuestion, MatchInfo, RescueEntry},
};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        mpsc, watch,
    },
    task::{JoinHandle, JoinSet},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    channel::{ChannelEvent, ConnectionState, EventChannel, PushConnector, ReconnectPolicy},
    coordinator::{Outcome, RequestCoordinator},
    lifecycle::{
        AnimationPhase, AnimationTiming, BatchCommand, ContestantLifecycleEngine, PhaseChange,
    },
    reconciler::{
        ControlSignal, ScreenControlReconciler, SignalDecision, SignalOrderingKind, SignalOrigin,
    },
    roster::{Roster, StatusChange},
    snapshot::{SliceKind, SnapshotLoader, SnapshotSlice, SnapshotSource},
    timer::{TimerProjector, TimerTick},
    view::{project, ProjectionInput, ViewModel},
};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Quiet period before a roster refetch triggered by a question change.
    pub refetch_debounce: Duration,
    pub animation: AnimationTiming,
    pub reconnect: ReconnectPolicy,
    /// Extra attempts for a slice whose load failed.
    pub snapshot_retry_attempts: u32,
    pub snapshot_retry_delay: Duration,
    pub resync_on_reconnect: bool,
    pub ordering: SignalOrderingKind,
    pub grid_columns: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refetch_debounce: Duration::from_millis(300),
            animation: AnimationTiming::default(),
            reconnect: ReconnectPolicy::default(),
            snapshot_retry_attempts: 3,
            snapshot_retry_delay: Duration::from_secs(1),
            resync_on_reconnect: true,
            ordering: SignalOrderingKind::default(),
            grid_columns: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisplayEvent {
    RenderModeChanged {
        from: Option<RenderMode>,
        to: RenderMode,
    },
    AnimationPhaseChanged(PhaseChange),
    ConnectionStateChanged(ConnectionState),
    SliceFailed {
        kind: SliceKind,
        attempt: u32,
        error: String,
    },
    /// Every slice has loaded at least once.
    SnapshotReady,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    Slice(SnapshotSlice),
    /// `attempt` counts from 1 for the first load.
    SliceFailed {
        kind: SliceKind,
        attempt: u32,
        error: String,
    },
    Channel(ChannelEvent),
    /// Push events were dropped before the session could read them.
    EventsLost { skipped: u64 },
    Command(ControlSignal),
    /// The countdown reached its next whole second.
    ClockTick,
    AnimationDue,
    Resync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    LoadSlice { kind: SliceKind, delay: Duration },
    RetrySlice { kind: SliceKind, attempt: u32 },
    Resync,
}

#[derive(Debug, Default)]
pub struct Transition {
    pub events: Vec<DisplayEvent>,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn phases(&mut self, changes: impl IntoIterator<Item = PhaseChange>) {
        self.events
            .extend(changes.into_iter().map(DisplayEvent::AnimationPhaseChanged));
    }
}

/// Everything the display knows about the match.
pub struct MatchState {
    config: SessionConfig,
    reconciler: ScreenControlReconciler,
    timer: TimerProjector,
    roster: Roster,
    lifecycle: ContestantLifecycleEngine,
    match_info: Option<MatchInfo>,
    question: Option<CurrentQuestion>,
    background: Option<BackgroundRef>,
    rescues: Vec<RescueEntry>,
    question_count: u32,
    connection: ConnectionState,
    loaded: BTreeSet<SliceKind>,
}

impl MatchState {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            reconciler: ScreenControlReconciler::new(config.ordering.build()),
            lifecycle: ContestantLifecycleEngine::new(config.animation),
            timer: TimerProjector::new(),
            roster: Roster::new(),
            match_info: None,
            question: None,
            background: None,
            rescues: Vec::new(),
            question_count: 0,
            connection: ConnectionState::default(),
            loaded: BTreeSet::new(),
            config,
        }
    }

    /// Order of the question on screen, 0 before the first one.
    pub fn current_question_order(&self) -> u32 {
        self.question
            .as_ref()
            .map(|question| question.order)
            .or_else(|| {
                self.match_info
                    .as_ref()
                    .and_then(|info| info.current_question_order)
            })
            .or_else(|| self.timer.question_order())
            .unwrap_or_default()
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn lifecycle(&self) -> &ContestantLifecycleEngine {
        &self.lifecycle
    }

    pub fn reconciler(&self) -> &ScreenControlReconciler {
        &self.reconciler
    }

    pub fn is_ready(&self) -> bool {
        SliceKind::ALL.iter().all(|kind| self.loaded.contains(kind))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.lifecycle.next_deadline()
    }

    /// Next instant the countdown moves, measured from the last timer tick.
    pub fn next_clock_tick(&self) -> Option<Instant> {
        self.timer.next_change_at()
    }

    pub fn view(&self) -> ViewModel {
        project(&ProjectionInput {
            reconciler: &self.reconciler,
            match_info: self.match_info.as_ref(),
            question: self.question.as_ref(),
            background: self.background.as_ref(),
            question_count: self.question_count,
            timer: self.timer.state(),
            roster: &self.roster,
            lifecycle: &self.lifecycle,
            rescues: &self.rescues,
            connection: self.connection,
            grid_columns: self.config.grid_columns,
        })
    }

    pub fn apply(&mut self, input: SessionInput, now: Instant) -> Transition {
        let mut transition = Transition::default();
        match input {
            SessionInput::Slice(slice) => self.apply_slice(slice, now, &mut transition),
            SessionInput::SliceFailed {
                kind,
                attempt,
                error,
            } => {
                warn!(slice = %kind, attempt, "session: slice load failed: {error}");
                if attempt <= self.config.snapshot_retry_attempts {
                    transition.effects.push(Effect::RetrySlice {
                        kind,
                        attempt: attempt + 1,
                    });
                }
                transition.events.push(DisplayEvent::SliceFailed {
                    kind,
                    attempt,
                    error,
                });
            }
            SessionInput::Channel(event) => self.apply_channel(event, now, &mut transition),
            SessionInput::EventsLost { skipped } => {
                warn!(skipped, "session: push events lost");
                if self.config.resync_on_reconnect {
                    transition.effects.push(Effect::Resync);
                }
            }
            SessionInput::Command(signal) => self.apply_signal(signal, now, &mut transition),
            SessionInput::ClockTick => {
                self.timer.advance(now);
            }
            SessionInput::AnimationDue => {
                let changes = self.lifecycle.advance_due(now);
                transition.phases(changes);
            }
            SessionInput::Resync => transition.effects.push(Effect::Resync),
        }
        transition
    }

    fn apply_slice(&mut self, slice: SnapshotSlice, now: Instant, transition: &mut Transition) {
        let kind = slice.kind();
        let order_before = self.current_question_order();
        match slice {
            SnapshotSlice::MatchInfo { info, tick } => {
                self.match_info = Some(info);
                if let Some(tick) = tick {
                    self.timer.on_tick(tick, now);
                }
            }
            SnapshotSlice::Background(background) => self.background = Some(background),
            SnapshotSlice::CurrentQuestion(question) => self.question = question,
            SnapshotSlice::Roster(records) => {
                let order = self.current_question_order();
                let changes = self.roster.replace(records);
                self.lifecycle.retain(&self.roster);
                let seeded: Vec<PhaseChange> = changes
                    .iter()
                    .filter_map(|change| self.lifecycle.seed(change, order))
                    .collect();
                transition.phases(seeded);
                // The screen may already be showing a reveal that the
                // freshly seeded contestants have not played yet.
                if let Some(command) = self.active_batch_command() {
                    let changes = self.lifecycle.command(command, &self.roster, order, now);
                    transition.phases(changes);
                }
            }
            SnapshotSlice::RescueList(rescues) => self.rescues = rescues,
            SnapshotSlice::ScreenControl { signal, .. } => {
                self.apply_signal(signal, now, transition)
            }
            SnapshotSlice::QuestionCount(count) => self.question_count = count,
        }
        self.settle_earlier_rounds(order_before, transition);

        let was_ready = self.is_ready();
        self.loaded.insert(kind);
        if !was_ready && self.is_ready() {
            info!("session: snapshot ready");
            transition.events.push(DisplayEvent::SnapshotReady);
        }
    }

    fn apply_channel(&mut self, event: ChannelEvent, now: Instant, transition: &mut Transition) {
        match event {
            ChannelEvent::Control(signal) => self.apply_signal(signal, now, transition),
            ChannelEvent::QuestionChanged {
                match_info,
                question,
                received_at,
            } => {
                info!(question_order = question.order, "session: question changed");
                let order_before = self.current_question_order();
                let remaining = match_info.time_remaining.or(question.time_limit);
                match remaining {
                    Some(remaining_seconds) => self.timer.on_tick(
                        TimerTick {
                            remaining_seconds,
                            for_question_order: question.order,
                            received_at,
                        },
                        now,
                    ),
                    None => self.timer.clear(),
                }
                self.match_info = Some(match_info);
                self.question = Some(question);
                self.settle_earlier_rounds(order_before, transition);

                let mut signal = ControlSignal::new(RenderMode::Question, None, SignalOrigin::Push);
                signal.received_at = received_at;
                self.apply_signal(signal, now, transition);

                transition.effects.push(Effect::LoadSlice {
                    kind: SliceKind::Roster,
                    delay: self.config.refetch_debounce,
                });
            }
            ChannelEvent::Timer(remaining) => {
                let tick = remaining.for_question(self.current_question_order());
                self.timer.on_tick(tick, now);
            }
            ChannelEvent::Roster(mut delta) => {
                let order = self.current_question_order();
                delta.fill_missing_rounds(order);
                match self.roster.apply_delta(&delta) {
                    Ok(changes) => {
                        let observed: Vec<PhaseChange> = changes
                            .iter()
                            .filter_map(|change| self.lifecycle.observe(change, order, now))
                            .collect();
                        transition.phases(observed);
                    }
                    Err(err) => {
                        warn!("session: rejecting roster delta, refetching roster: {err}");
                        transition.events.push(DisplayEvent::Error(err.to_string()));
                        transition.effects.push(Effect::LoadSlice {
                            kind: SliceKind::Roster,
                            delay: self.config.refetch_debounce,
                        });
                    }
                }
            }
            ChannelEvent::ConnectionChanged(state) => {
                self.connection = state;
                transition
                    .events
                    .push(DisplayEvent::ConnectionStateChanged(state));
            }
            ChannelEvent::Reconnected => {
                if self.config.resync_on_reconnect {
                    info!("session: reconnected, resyncing snapshot");
                    transition.effects.push(Effect::Resync);
                }
            }
        }
    }

    fn apply_signal(&mut self, signal: ControlSignal, now: Instant, transition: &mut Transition) {
        let key = signal.key;
        let command = signal.value.as_ref().and_then(BatchCommand::from_control);
        match self.reconciler.apply(signal) {
            Ok(SignalDecision::Applied { previous }) => {
                if previous != Some(key) {
                    debug!(from = ?previous, to = %key, "session: render mode changed");
                    transition.events.push(DisplayEvent::RenderModeChanged {
                        from: previous,
                        to: key,
                    });
                }
                if let Some(command) = command {
                    let order = self.current_question_order();
                    let changes = self.lifecycle.command(command, &self.roster, order, now);
                    transition.phases(changes);
                }
            }
            Ok(SignalDecision::Stale) => {}
            Err(err) => {
                warn!("session: rejecting control signal: {err}");
                transition.events.push(DisplayEvent::Error(err.to_string()));
            }
        }
    }

    /// Contestants left waiting for a reveal (eliminations seeded `idle`,
    /// rescues still shown disintegrated) are shown as final once their
    /// round lies in the past.
    fn settle_earlier_rounds(&mut self, order_before: u32, transition: &mut Transition) {
        let order = self.current_question_order();
        if order == order_before {
            return;
        }
        let pending: Vec<StatusChange> = self
            .roster
            .records()
            .filter(|record| {
                let phase = self.lifecycle.state(record.registration_number).phase();
                match record.status {
                    ContestantStatus::Eliminated => phase == AnimationPhase::Idle,
                    ContestantStatus::Rescued => matches!(
                        phase,
                        AnimationPhase::Fading | AnimationPhase::Disintegrated
                    ),
                    _ => false,
                }
            })
            .map(|record| StatusChange {
                registration_number: record.registration_number,
                previous: Some(record.status),
                record: record.clone(),
            })
            .collect();
        let settled: Vec<PhaseChange> = pending
            .iter()
            .filter_map(|change| self.lifecycle.seed(change, order))
            .collect();
        transition.phases(settled);
    }

    fn active_batch_command(&self) -> Option<BatchCommand> {
        self.reconciler
            .current()
            .and_then(|signal| signal.value.as_ref())
            .and_then(BatchCommand::from_control)
    }
}

/// Handle to a running session. Dropping it stops the session; prefer
/// [`dispose`](Self::dispose), which also waits for the driver to finish.
pub struct MatchSession {
    match_id: MatchId,
    session_id: Uuid,
    view: watch::Receiver<ViewModel>,
    events: broadcast::Sender<DisplayEvent>,
    connection: watch::Receiver<ConnectionState>,
    inputs: mpsc::UnboundedSender<SessionInput>,
    coordinator: RequestCoordinator,
    shutdown: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl MatchSession {
    /// Opens the push channel, starts the initial snapshot load and returns
    /// immediately. Must be called from within a tokio runtime.
    pub fn start(
        config: SessionConfig,
        match_id: MatchId,
        source: Arc<dyn SnapshotSource>,
        connector: Arc<dyn PushConnector>,
    ) -> Self {
        let session_id = Uuid::new_v4();
        let span = info_span!("match_session", %session_id, match_id = match_id.0);

        let coordinator = RequestCoordinator::new();
        let (slice_tx, slices) = mpsc::unbounded_channel();
        let loader = SnapshotLoader::new(source, coordinator.clone(), slice_tx);
        let (channel, channel_rx) = {
            let _entered = span.enter();
            EventChannel::open(match_id, connector, config.reconnect)
        };
        let connection = channel.connection_state();

        let (input_tx, inputs) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let state = MatchState::new(config);
        let (view_tx, view) = watch::channel(state.view());
        let shutdown = CancellationToken::new();

        let driver = Driver {
            match_id,
            state,
            loader,
            channel,
            channel_rx,
            slices,
            inputs,
            input_tx: input_tx.clone(),
            view: view_tx,
            events: events.clone(),
            shutdown: shutdown.clone(),
            tasks: JoinSet::new(),
        };
        let driver = tokio::spawn(driver.run().instrument(span));

        Self {
            match_id,
            session_id,
            view,
            events,
            connection,
            inputs: input_tx,
            coordinator,
            shutdown,
            driver: Some(driver),
        }
    }

    pub fn match_id(&self) -> MatchId {
        self.match_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Latest view; intermediate values may be skipped.
    pub fn view(&self) -> watch::Receiver<ViewModel> {
        self.view.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<DisplayEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Feeds an operator command into the session as if the controller had
    /// pushed it.
    pub fn submit(&self, mut signal: ControlSignal) -> Result<()> {
        signal.origin = SignalOrigin::Operator;
        self.inputs
            .send(SessionInput::Command(signal))
            .map_err(|_| anyhow!("match session {} is disposed", self.match_id))
    }

    /// Reloads every slice from REST.
    pub fn resync(&self) -> Result<()> {
        self.inputs
            .send(SessionInput::Resync)
            .map_err(|_| anyhow!("match session {} is disposed", self.match_id))
    }

    /// Cancels every in-flight request, closes the push channel and waits
    /// for the driver task to stop.
    pub async fn dispose(mut self) {
        let cancelled = self.coordinator.cancel_all().await;
        self.shutdown.cancel();
        if let Some(driver) = self.driver.take() {
            if let Err(err) = driver.await {
                warn!(session_id = %self.session_id, "session: driver ended abnormally: {err}");
            }
        }
        info!(
            session_id = %self.session_id,
            match_id = self.match_id.0,
            cancelled,
            "session: disposed"
        );
    }
}

impl Drop for MatchSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Driver {
    match_id: MatchId,
    state: MatchState,
    loader: SnapshotLoader,
    channel: EventChannel,
    channel_rx: broadcast::Receiver<ChannelEvent>,
    slices: mpsc::UnboundedReceiver<SnapshotSlice>,
    inputs: mpsc::UnboundedReceiver<SessionInput>,
    input_tx: mpsc::UnboundedSender<SessionInput>,
    view: watch::Sender<ViewModel>,
    events: broadcast::Sender<DisplayEvent>,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl Driver {
    async fn run(mut self) {
        info!("session: started");
        self.execute(Effect::Resync);

        loop {
            let deadline = self.state.next_deadline();
            let animation_due = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now));
            let clock_deadline = self.state.next_clock_tick();
            let clock_due = tokio::time::sleep_until(clock_deadline.unwrap_or_else(Instant::now));
            let input = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(input) = self.inputs.recv() => input,
                Some(slice) = self.slices.recv() => SessionInput::Slice(slice),
                received = self.channel_rx.recv() => match received {
                    Ok(event) => SessionInput::Channel(event),
                    Err(RecvError::Lagged(skipped)) => SessionInput::EventsLost { skipped },
                    Err(RecvError::Closed) => break,
                },
                _ = animation_due, if deadline.is_some() => SessionInput::AnimationDue,
                _ = clock_due, if clock_deadline.is_some() => SessionInput::ClockTick,
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => continue,
            };
            self.handle(input);
        }

        self.loader.coordinator().cancel_all().await;
        self.tasks.shutdown().await;
        self.channel.shutdown().await;
        info!("session: stopped");
    }

    fn handle(&mut self, input: SessionInput) {
        let transition = self.state.apply(input, Instant::now());
        for event in transition.events {
            let _ = self.events.send(event);
        }
        for effect in transition.effects {
            self.execute(effect);
        }

        let next = self.state.view();
        self.view.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn execute(&mut self, effect: Effect) {
        let loader = self.loader.clone();
        let inputs = self.input_tx.clone();
        let match_id = self.match_id;

        match effect {
            Effect::Resync => {
                self.tasks.spawn(
                    async move {
                        let report = loader.load_snapshot(match_id).await;
                        for failure in report.failed {
                            let _ = inputs.send(SessionInput::SliceFailed {
                                kind: failure.kind,
                                attempt: 1,
                                error: failure.error,
                            });
                        }
                    }
                    .in_current_span(),
                );
            }
            Effect::LoadSlice { kind, delay } => {
                self.spawn_slice(loader, inputs, kind, delay, 1);
            }
            Effect::RetrySlice { kind, attempt } => {
                let delay = self.state.config.snapshot_retry_delay;
                self.spawn_slice(loader, inputs, kind, delay, attempt);
            }
        }
    }

    fn spawn_slice(
        &mut self,
        loader: SnapshotLoader,
        inputs: mpsc::UnboundedSender<SessionInput>,
        kind: SliceKind,
        delay: Duration,
        attempt: u32,
    ) {
        let match_id = self.match_id;
        self.tasks.spawn(
            async move {
                match loader.load_slice(match_id, kind, delay).await {
                    Ok(Outcome::Applied(_)) => {}
                    Ok(Outcome::Superseded) => {
                        debug!(slice = %kind, attempt, "session: slice load superseded");
                    }
                    Err(err) => {
                        let _ = inputs.send(SessionInput::SliceFailed {
                            kind,
                            attempt,
                            error: format!("{err:#}"),
                        });
                    }
                }
            }
            .in_current_span(),
        );
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
