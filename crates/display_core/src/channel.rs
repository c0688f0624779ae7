//! Push connection to the controller.
//!
//! One long-lived task owns the websocket: it decodes every frame into a
//! [`ChannelEvent`], republishes it on a broadcast feed and reconnects with
//! exponential backoff when the connection drops.

use std::{future, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream::BoxStream, Stream, StreamExt};
use serde::Serialize;
use shared::{
    domain::MatchId,
    protocol::{CurrentQuestion, MatchInfo, PushEvent},
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::BroadcastStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use url::Url;

use crate::{
    error::ChannelError,
    reconciler::ControlSignal,
    roster::RosterDelta,
    timer::TimerTick,
};

const EVENT_BUFFER: usize = 256;

/// Text frames of one push connection. The stream ends when the connection
/// closes.
pub type PushStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, match_id: MatchId) -> Result<PushStream>;
}

/// Connects to `{server}/ws?matchId={id}` over websocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    server_url: String,
}

impl WsConnector {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }

    pub fn endpoint(&self, match_id: MatchId) -> Result<Url, ChannelError> {
        let server_url = self.server_url.trim_end_matches('/');
        let ws_url = if server_url.starts_with("https://") {
            server_url.replacen("https://", "wss://", 1)
        } else if server_url.starts_with("http://") {
            server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(ChannelError::UnsupportedScheme(server_url.to_string()));
        };
        let mut url = Url::parse(&format!("{ws_url}/ws"))?;
        url.query_pairs_mut().append_pair("matchId", &match_id.to_string());
        Ok(url)
    }
}

#[async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self, match_id: MatchId) -> Result<PushStream> {
        let url = self.endpoint(match_id)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (_, ws_reader) = ws_stream.split();

        let frames = ws_reader
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(_) => None,
                    Err(err) => {
                        Some(Err(anyhow::Error::new(err).context("websocket receive failed")))
                    }
                })
            })
            .boxed();
        Ok(frames)
    }
}

/// Backoff between reconnect attempts: `initial`, doubling up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the attempt following `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never connected yet.
    #[default]
    Connecting,
    Open,
    /// The connection dropped; waiting before the next attempt.
    Degraded,
    Reconnecting,
    Closed,
}

/// Remaining time pushed by the controller. It names no question, so the
/// receiver stamps the question it currently shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemainingTime {
    pub remaining_seconds: u32,
    pub received_at: DateTime<Utc>,
}

impl RemainingTime {
    pub fn for_question(self, question_order: u32) -> TimerTick {
        TimerTick {
            remaining_seconds: self.remaining_seconds,
            for_question_order: question_order,
            received_at: self.received_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Control(ControlSignal),
    QuestionChanged {
        match_info: MatchInfo,
        question: CurrentQuestion,
        received_at: DateTime<Utc>,
    },
    Timer(RemainingTime),
    Roster(RosterDelta),
    ConnectionChanged(ConnectionState),
    /// The connection came back after a drop; events may have been missed.
    Reconnected,
}

/// Decodes one push frame. Unknown event names and payloads that fail
/// validation are errors the caller logs and drops.
pub fn parse_push_event(
    text: &str,
    received_at: DateTime<Utc>,
) -> Result<ChannelEvent, ChannelError> {
    let event: PushEvent = serde_json::from_str(text)?;
    let name = event.name();
    match event {
        PushEvent::ScreenUpdate(update) => {
            let signal = ControlSignal::from_screen_update(update, received_at);
            signal
                .validate()
                .map_err(|err| ChannelError::InvalidPayload {
                    event: name,
                    reason: err.to_string(),
                })?;
            Ok(ChannelEvent::Control(signal))
        }
        PushEvent::CurrentQuestion(push) => Ok(ChannelEvent::QuestionChanged {
            match_info: push.match_info,
            question: push.current_question,
            received_at,
        }),
        PushEvent::TimerUpdate(update) => Ok(ChannelEvent::Timer(RemainingTime {
            remaining_seconds: update.time_remaining,
            received_at,
        })),
        PushEvent::RescueStatusUpdated(update) => {
            if update
                .updated_rescues
                .iter()
                .any(|rescue| rescue.registration_number.0 == 0)
            {
                return Err(ChannelError::InvalidPayload {
                    event: name,
                    reason: "registration number must start at 1".into(),
                });
            }
            Ok(ChannelEvent::Roster(RosterDelta::from_rescue_update(
                update,
                received_at,
            )))
        }
    }
}

pub struct EventChannel {
    events: broadcast::Sender<ChannelEvent>,
    state: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl EventChannel {
    /// Starts the connection task. The returned receiver is subscribed before
    /// the task starts, so it sees every event.
    pub fn open(
        match_id: MatchId,
        connector: Arc<dyn PushConnector>,
        policy: ReconnectPolicy,
    ) -> (Self, broadcast::Receiver<ChannelEvent>) {
        let (events, receiver) = broadcast::channel(EVENT_BUFFER);
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(
            run(
                match_id,
                connector,
                policy,
                events.clone(),
                state_tx,
                shutdown.clone(),
            )
            .in_current_span(),
        );

        let channel = Self {
            events,
            state,
            shutdown,
            task: Some(task),
        };
        (channel, receiver)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn on_control_signal(&self) -> impl Stream<Item = ControlSignal> + Send + 'static {
        self.typed(|event| match event {
            ChannelEvent::Control(signal) => Some(signal),
            _ => None,
        })
    }

    pub fn on_timer_tick(&self) -> impl Stream<Item = RemainingTime> + Send + 'static {
        self.typed(|event| match event {
            ChannelEvent::Timer(remaining) => Some(remaining),
            _ => None,
        })
    }

    pub fn on_roster_delta(&self) -> impl Stream<Item = RosterDelta> + Send + 'static {
        self.typed(|event| match event {
            ChannelEvent::Roster(delta) => Some(delta),
            _ => None,
        })
    }

    fn typed<T, F>(&self, select: F) -> impl Stream<Item = T> + Send + 'static
    where
        T: Send + 'static,
        F: Fn(ChannelEvent) -> Option<T> + Send + 'static,
    {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(move |event| future::ready(event.ok().and_then(&select)))
    }

    /// Stops the connection task and waits for it to finish.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!("channel: connection task ended abnormally: {err}");
            }
        }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn publish_state(
    state_tx: &watch::Sender<ConnectionState>,
    events: &broadcast::Sender<ChannelEvent>,
    next: ConnectionState,
) {
    let changed = state_tx.send_if_modified(|state| {
        if *state == next {
            return false;
        }
        *state = next;
        true
    });
    if changed {
        debug!(state = ?next, "channel: connection state changed");
        let _ = events.send(ChannelEvent::ConnectionChanged(next));
    }
}

async fn run(
    match_id: MatchId,
    connector: Arc<dyn PushConnector>,
    policy: ReconnectPolicy,
    events: broadcast::Sender<ChannelEvent>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
) {
    let mut failures = 0u32;
    let mut opened_before = false;

    'connection: loop {
        let attempting = if opened_before {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };
        publish_state(&state_tx, &events, attempting);

        let connected = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break 'connection,
            connected = connector.connect(match_id) => connected,
        };

        match connected {
            Ok(mut frames) => {
                info!(match_id = match_id.0, "channel: push connection open");
                failures = 0;
                publish_state(&state_tx, &events, ConnectionState::Open);
                if opened_before {
                    let _ = events.send(ChannelEvent::Reconnected);
                }
                opened_before = true;

                loop {
                    let frame = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break 'connection,
                        frame = frames.next() => frame,
                    };
                    match frame {
                        Some(Ok(text)) => match parse_push_event(&text, Utc::now()) {
                            Ok(event) => {
                                let _ = events.send(event);
                            }
                            Err(err) => warn!("channel: dropping push frame: {err}"),
                        },
                        Some(Err(err)) => {
                            warn!("channel: push connection failed: {err:#}");
                            break;
                        }
                        None => {
                            info!(
                                match_id = match_id.0,
                                "channel: push connection closed by server"
                            );
                            break;
                        }
                    }
                }
                publish_state(&state_tx, &events, ConnectionState::Degraded);
            }
            Err(err) => {
                warn!(failures, "channel: connect failed: {err:#}");
                failures = failures.saturating_add(1);
            }
        }

        let delay = policy.delay_for(failures.saturating_sub(1));
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break 'connection,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    publish_state(&state_tx, &events, ConnectionState::Closed);
    info!(match_id = match_id.0, "channel: closed");
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
