use super::*;
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::anyhow;
use futures::stream;
use shared::domain::{ContestantStatus, ControlCommand, RegistrationNumber, RenderMode};
use tokio::sync::Mutex;

use crate::reconciler::SignalOrigin;

/// Hands out one scripted connection per `connect` call. Once the script is
/// exhausted the connection stays open without frames.
struct ScriptedConnector {
    sessions: Mutex<VecDeque<Result<Vec<String>>>>,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    fn new(sessions: Vec<Result<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(sessions.into()),
            connects: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PushConnector for ScriptedConnector {
    async fn connect(&self, _match_id: MatchId) -> Result<PushStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.sessions.lock().await.pop_front() {
            Some(Ok(frames)) => Ok(stream::iter(frames.into_iter().map(Ok)).boxed()),
            Some(Err(err)) => Err(err),
            None => Ok(stream::pending::<Result<String>>().boxed()),
        }
    }
}

fn screen_frame(key: &str) -> String {
    format!(r#"{{"event":"screen:update","data":{{"controlKey":"{key}"}}}}"#)
}

fn timer_frame(remaining: u32) -> String {
    format!(r#"{{"event":"timer:update","data":{{"timeRemaining":{remaining}}}}}"#)
}

async fn next_event(rx: &mut broadcast::Receiver<ChannelEvent>) -> ChannelEvent {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("event in time")
        .expect("channel open")
}

async fn collect_until(
    rx: &mut broadcast::Receiver<ChannelEvent>,
    done: impl Fn(&ChannelEvent) -> bool,
) -> Vec<ChannelEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(rx).await;
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

#[test]
fn parses_screen_update_into_push_signal() {
    let received_at = Utc::now();
    let event = parse_push_event(
        r#"{"event":"screen:update","data":{"controlKey":"rosterEliminated","controlValue":"Eliminate","media":{"title":"Round 4"},"sequence":12}}"#,
        received_at,
    )
    .expect("parse");

    let ChannelEvent::Control(signal) = event else {
        panic!("expected control signal, got {event:?}");
    };
    assert_eq!(signal.key, RenderMode::RosterEliminated);
    assert_eq!(signal.value, Some(ControlCommand::Eliminate));
    assert_eq!(signal.origin, SignalOrigin::Push);
    assert_eq!(signal.sequence, Some(12));
    assert_eq!(signal.received_at, received_at);
}

#[test]
fn parses_timer_and_rescue_pushes() {
    let now = Utc::now();
    assert_eq!(
        parse_push_event(&timer_frame(18), now).expect("timer"),
        ChannelEvent::Timer(RemainingTime {
            remaining_seconds: 18,
            received_at: now,
        })
    );

    let event = parse_push_event(
        r#"{"event":"rescue:statusUpdated","data":{"updatedRescues":[{"registrationNumber":4,"status":"rescued","questionOrder":6}]}}"#,
        now,
    )
    .expect("rescue");
    let ChannelEvent::Roster(delta) = event else {
        panic!("expected roster delta, got {event:?}");
    };
    assert_eq!(delta.updates.len(), 1);
    assert_eq!(delta.updates[0].registration_number, RegistrationNumber(4));
    assert_eq!(delta.updates[0].status, ContestantStatus::Rescued);
    assert_eq!(delta.updates[0].rescued_at_question_order, Some(6));
}

#[test]
fn rejects_unknown_and_invalid_frames() {
    let now = Utc::now();
    assert!(matches!(
        parse_push_event(r#"{"event":"chat:message","data":{}}"#, now),
        Err(ChannelError::Malformed(_))
    ));
    assert!(matches!(
        parse_push_event("not json", now),
        Err(ChannelError::Malformed(_))
    ));
    assert!(matches!(
        parse_push_event(
            r#"{"event":"screen:update","data":{"controlKey":"answer","media":[1,2]}}"#,
            now
        ),
        Err(ChannelError::InvalidPayload {
            event: "screen:update",
            ..
        })
    ));
    assert!(matches!(
        parse_push_event(
            r#"{"event":"rescue:statusUpdated","data":{"updatedRescues":[{"registrationNumber":0,"status":"rescued"}]}}"#,
            now
        ),
        Err(ChannelError::InvalidPayload { .. })
    ));
}

#[test]
fn remaining_time_is_stamped_with_question() {
    let now = Utc::now();
    let tick = RemainingTime {
        remaining_seconds: 9,
        received_at: now,
    }
    .for_question(5);
    assert_eq!(tick.remaining_seconds, 9);
    assert_eq!(tick.for_question_order, 5);
}

#[test]
fn backoff_doubles_up_to_the_cap() {
    let policy = ReconnectPolicy {
        initial: Duration::from_millis(500),
        max: Duration::from_secs(3),
    };
    assert_eq!(policy.delay_for(0), Duration::from_millis(500));
    assert_eq!(policy.delay_for(1), Duration::from_secs(1));
    assert_eq!(policy.delay_for(2), Duration::from_secs(2));
    assert_eq!(policy.delay_for(3), Duration::from_secs(3));
    assert_eq!(policy.delay_for(64), Duration::from_secs(3));
}

#[test]
fn websocket_endpoint_follows_server_scheme() {
    let secure = WsConnector::new("https://quiz.example.org/");
    assert_eq!(
        secure.endpoint(MatchId(42)).expect("https").as_str(),
        "wss://quiz.example.org/ws?matchId=42"
    );
    let plain = WsConnector::new("http://127.0.0.1:8080");
    assert_eq!(
        plain.endpoint(MatchId(7)).expect("http").as_str(),
        "ws://127.0.0.1:8080/ws?matchId=7"
    );
    assert!(matches!(
        WsConnector::new("ftp://quiz.example.org").endpoint(MatchId(1)),
        Err(ChannelError::UnsupportedScheme(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_drop_and_reports_it() {
    let connector = ScriptedConnector::new(vec![
        Ok(vec![screen_frame("question")]),
        Ok(vec![timer_frame(12)]),
    ]);
    let (mut channel, mut rx) =
        EventChannel::open(MatchId(1), connector.clone(), ReconnectPolicy::default());

    let seen = collect_until(&mut rx, |event| matches!(event, ChannelEvent::Timer(_))).await;
    let kinds: Vec<&str> = seen
        .iter()
        .map(|event| match event {
            ChannelEvent::Control(_) => "control",
            ChannelEvent::Timer(_) => "timer",
            ChannelEvent::ConnectionChanged(ConnectionState::Open) => "open",
            ChannelEvent::ConnectionChanged(ConnectionState::Degraded) => "degraded",
            ChannelEvent::ConnectionChanged(ConnectionState::Reconnecting) => "reconnecting",
            ChannelEvent::Reconnected => "reconnected",
            _ => "other",
        })
        .collect();

    assert_eq!(
        kinds,
        vec![
            "open",
            "control",
            "degraded",
            "reconnecting",
            "open",
            "reconnected",
            "timer"
        ]
    );
    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

    channel.shutdown().await;
    assert_eq!(*channel.connection_state().borrow(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn keeps_retrying_failed_connects_with_backoff() {
    let connector = ScriptedConnector::new(vec![
        Err(anyhow!("connection refused")),
        Err(anyhow!("connection refused")),
        Ok(vec![timer_frame(30)]),
    ]);
    let started = tokio::time::Instant::now();
    let (mut channel, mut rx) =
        EventChannel::open(MatchId(1), connector.clone(), ReconnectPolicy::default());

    let seen = collect_until(&mut rx, |event| matches!(event, ChannelEvent::Timer(_))).await;

    assert!(!seen.contains(&ChannelEvent::Reconnected));
    assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    // 500ms after the first failure, 1s after the second.
    assert!(started.elapsed() >= Duration::from_millis(1_500));
    channel.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_dropped_without_closing_the_connection() {
    let connector = ScriptedConnector::new(vec![Ok(vec![
        "{".to_string(),
        r#"{"event":"chat:message","data":{}}"#.to_string(),
        screen_frame("answer"),
    ])]);
    let (mut channel, mut rx) =
        EventChannel::open(MatchId(1), connector.clone(), ReconnectPolicy::default());

    assert_eq!(
        next_event(&mut rx).await,
        ChannelEvent::ConnectionChanged(ConnectionState::Open)
    );
    let ChannelEvent::Control(signal) = next_event(&mut rx).await else {
        panic!("expected the valid frame to come through");
    };
    assert_eq!(signal.key, RenderMode::Answer);
    channel.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn typed_streams_only_yield_their_kind() {
    let connector = ScriptedConnector::new(vec![]);
    let (mut channel, _rx) =
        EventChannel::open(MatchId(1), connector, ReconnectPolicy::default());
    let signals = channel.on_control_signal();
    let ticks = channel.on_timer_tick();
    tokio::pin!(signals);
    tokio::pin!(ticks);

    channel
        .events
        .send(ChannelEvent::Timer(RemainingTime {
            remaining_seconds: 3,
            received_at: Utc::now(),
        }))
        .expect("send timer");
    channel
        .events
        .send(ChannelEvent::Control(ControlSignal::new(
            RenderMode::Winners,
            None,
            SignalOrigin::Push,
        )))
        .expect("send control");

    let signal = signals.next().await.expect("signal");
    assert_eq!(signal.key, RenderMode::Winners);
    let tick = ticks.next().await.expect("tick");
    assert_eq!(tick.remaining_seconds, 3);
    channel.shutdown().await;
}
