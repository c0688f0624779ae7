//! Initial (and re-) load of everything the display needs from REST.
//!
//! Each slice is fetched independently through the [`RequestCoordinator`]
//! and handed to the session as soon as it lands, so a slow slice never
//! holds back the others.

use std::{collections::BTreeSet, fmt, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ContestantRecord, MatchId},
    error::ApiError,
    protocol::{
        BackgroundRef, CurrentQuestion, MatchInfo, QuestionSummary, RescueEntry,
        ScreenControlState,
    },
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    coordinator::{Outcome, RequestCoordinator},
    error::SnapshotError,
    reconciler::ControlSignal,
    timer::TimerTick,
};

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn match_info(&self, match_id: MatchId) -> Result<MatchInfo>;
    async fn background(&self, match_id: MatchId) -> Result<BackgroundRef>;
    /// `None` until the controller has opened a question.
    async fn current_question(&self, match_id: MatchId) -> Result<Option<CurrentQuestion>>;
    async fn contestants(&self, match_id: MatchId) -> Result<Vec<ContestantRecord>>;
    async fn rescues(&self, match_id: MatchId) -> Result<Vec<RescueEntry>>;
    async fn screen_control(&self, match_id: MatchId) -> Result<ScreenControlState>;
    async fn questions(&self, match_id: MatchId) -> Result<Vec<QuestionSummary>>;
}

#[derive(Clone)]
pub struct HttpSnapshotSource {
    http: Client,
    base_url: Url,
}

impl HttpSnapshotSource {
    pub fn new(server_url: &str) -> Result<Self, SnapshotError> {
        Self::with_client(Client::new(), server_url)
    }

    pub fn with_client(http: Client, server_url: &str) -> Result<Self, SnapshotError> {
        let mut base = server_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).map_err(|source| SnapshotError::Endpoint {
            path: server_url.to_string(),
            source,
        })?;
        Ok(Self { http, base_url })
    }

    async fn get(&self, path: &str) -> Result<Response> {
        let url = self
            .base_url
            .join(path)
            .map_err(|source| SnapshotError::Endpoint {
                path: path.to_string(),
                source,
            })?;
        self.http
            .get(url)
            .send()
            .await
            .with_context(|| format!("snapshot request {path} failed"))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.get(path).await?;
        let response = check_status(path, response).await?;
        response
            .json()
            .await
            .with_context(|| format!("invalid snapshot body for {path}"))
    }
}

async fn check_status(path: &str, response: Response) -> Result<Response, SnapshotError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let status = status.as_u16();
    match response.json::<ApiError>().await {
        Ok(body) => Err(SnapshotError::Api {
            path: path.to_string(),
            status,
            code: body.code,
            message: body.message,
        }),
        Err(_) => Err(SnapshotError::Status {
            path: path.to_string(),
            status,
        }),
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn match_info(&self, match_id: MatchId) -> Result<MatchInfo> {
        self.get_json(&format!("matches/{match_id}")).await
    }

    async fn background(&self, match_id: MatchId) -> Result<BackgroundRef> {
        self.get_json(&format!("matches/{match_id}/background")).await
    }

    async fn current_question(&self, match_id: MatchId) -> Result<Option<CurrentQuestion>> {
        let path = format!("matches/{match_id}/current-question");
        let response = self.get(&path).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(match_id = match_id.0, "snapshot: no current question yet");
            return Ok(None);
        }
        let response = check_status(&path, response).await?;
        let question = response
            .json()
            .await
            .with_context(|| format!("invalid snapshot body for {path}"))?;
        Ok(Some(question))
    }

    async fn contestants(&self, match_id: MatchId) -> Result<Vec<ContestantRecord>> {
        self.get_json(&format!("matches/{match_id}/contestants")).await
    }

    async fn rescues(&self, match_id: MatchId) -> Result<Vec<RescueEntry>> {
        self.get_json(&format!("matches/{match_id}/rescues")).await
    }

    async fn screen_control(&self, match_id: MatchId) -> Result<ScreenControlState> {
        self.get_json(&format!("matches/{match_id}/screen-control")).await
    }

    async fn questions(&self, match_id: MatchId) -> Result<Vec<QuestionSummary>> {
        self.get_json(&format!("matches/{match_id}/questions")).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SliceKind {
    MatchInfo,
    Background,
    CurrentQuestion,
    Roster,
    RescueList,
    ScreenControl,
    QuestionCount,
}

impl SliceKind {
    pub const ALL: [SliceKind; 7] = [
        SliceKind::MatchInfo,
        SliceKind::Background,
        SliceKind::CurrentQuestion,
        SliceKind::Roster,
        SliceKind::RescueList,
        SliceKind::ScreenControl,
        SliceKind::QuestionCount,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MatchInfo => "match_info",
            Self::Background => "background",
            Self::CurrentQuestion => "current_question",
            Self::Roster => "roster",
            Self::RescueList => "rescue_list",
            Self::ScreenControl => "screen_control",
            Self::QuestionCount => "question_count",
        }
    }
}

impl fmt::Display for SliceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotSlice {
    /// `tick` primes the countdown when the match reports a running question.
    MatchInfo {
        info: MatchInfo,
        tick: Option<TimerTick>,
    },
    Background(BackgroundRef),
    CurrentQuestion(Option<CurrentQuestion>),
    Roster(Vec<ContestantRecord>),
    RescueList(Vec<RescueEntry>),
    /// `signal` primes the reconciler with what the controller last showed.
    ScreenControl {
        state: ScreenControlState,
        signal: ControlSignal,
    },
    QuestionCount(u32),
}

impl SnapshotSlice {
    pub fn kind(&self) -> SliceKind {
        match self {
            Self::MatchInfo { .. } => SliceKind::MatchInfo,
            Self::Background(_) => SliceKind::Background,
            Self::CurrentQuestion(_) => SliceKind::CurrentQuestion,
            Self::Roster(_) => SliceKind::Roster,
            Self::RescueList(_) => SliceKind::RescueList,
            Self::ScreenControl { .. } => SliceKind::ScreenControl,
            Self::QuestionCount(_) => SliceKind::QuestionCount,
        }
    }
}

/// Latest value of every slice loaded so far.
#[derive(Debug, Clone, Default)]
pub struct MatchSnapshot {
    pub match_info: Option<MatchInfo>,
    pub background: Option<BackgroundRef>,
    pub current_question: Option<CurrentQuestion>,
    pub contestants: Vec<ContestantRecord>,
    pub rescues: Vec<RescueEntry>,
    pub screen_control: Option<ScreenControlState>,
    pub question_count: u32,
    loaded: BTreeSet<SliceKind>,
}

impl MatchSnapshot {
    pub fn merge(&mut self, slice: &SnapshotSlice) {
        match slice {
            SnapshotSlice::MatchInfo { info, .. } => self.match_info = Some(info.clone()),
            SnapshotSlice::Background(background) => self.background = Some(background.clone()),
            SnapshotSlice::CurrentQuestion(question) => self.current_question = question.clone(),
            SnapshotSlice::Roster(records) => self.contestants = records.clone(),
            SnapshotSlice::RescueList(rescues) => self.rescues = rescues.clone(),
            SnapshotSlice::ScreenControl { state, .. } => self.screen_control = Some(state.clone()),
            SnapshotSlice::QuestionCount(count) => self.question_count = *count,
        }
        self.loaded.insert(slice.kind());
    }

    pub fn is_loaded(&self, kind: SliceKind) -> bool {
        self.loaded.contains(&kind)
    }

    /// True once every slice has loaded at least once.
    pub fn is_ready(&self) -> bool {
        SliceKind::ALL.iter().all(|kind| self.loaded.contains(kind))
    }
}

#[derive(Debug, Clone)]
pub struct SliceFailure {
    pub kind: SliceKind,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotReport {
    pub loaded: Vec<SliceKind>,
    pub superseded: Vec<SliceKind>,
    pub failed: Vec<SliceFailure>,
}

#[derive(Clone)]
pub struct SnapshotLoader {
    source: Arc<dyn SnapshotSource>,
    coordinator: RequestCoordinator,
    sink: mpsc::UnboundedSender<SnapshotSlice>,
    snapshot: Arc<watch::Sender<MatchSnapshot>>,
}

impl SnapshotLoader {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        coordinator: RequestCoordinator,
        sink: mpsc::UnboundedSender<SnapshotSlice>,
    ) -> Self {
        let (snapshot, _) = watch::channel(MatchSnapshot::default());
        Self {
            source,
            coordinator,
            sink,
            snapshot: Arc::new(snapshot),
        }
    }

    pub fn coordinator(&self) -> &RequestCoordinator {
        &self.coordinator
    }

    pub fn snapshot(&self) -> MatchSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn slice_key(match_id: MatchId, kind: SliceKind) -> String {
        format!("snapshot:{match_id}:{kind}")
    }

    /// Loads every slice concurrently. Slices are delivered to the sink as
    /// they land; the report tells which ones made it.
    pub async fn load_snapshot(&self, match_id: MatchId) -> SnapshotReport {
        let loads = SliceKind::ALL.into_iter().map(|kind| async move {
            (kind, self.load_slice(match_id, kind, Duration::ZERO).await)
        });

        let mut report = SnapshotReport::default();
        for (kind, result) in join_all(loads).await {
            match result {
                Ok(Outcome::Applied(_)) => report.loaded.push(kind),
                Ok(Outcome::Superseded) => report.superseded.push(kind),
                Err(err) => {
                    warn!(match_id = match_id.0, slice = %kind, "snapshot: slice failed: {err:#}");
                    report.failed.push(SliceFailure {
                        kind,
                        error: format!("{err:#}"),
                    });
                }
            }
        }
        info!(
            match_id = match_id.0,
            loaded = report.loaded.len(),
            superseded = report.superseded.len(),
            failed = report.failed.len(),
            "snapshot: load finished"
        );
        report
    }

    /// (Re)loads one slice after `delay` of quiet. A newer call for the same
    /// slice supersedes this one.
    pub async fn load_slice(
        &self,
        match_id: MatchId,
        kind: SliceKind,
        delay: Duration,
    ) -> Result<Outcome<SliceKind>> {
        let source = Arc::clone(&self.source);
        let sink = self.sink.clone();
        let snapshot = Arc::clone(&self.snapshot);

        self.coordinator
            .schedule_with(
                Self::slice_key(match_id, kind),
                delay,
                move |_token| async move { fetch_slice(source.as_ref(), match_id, kind).await },
                move |slice| {
                    snapshot.send_modify(|current| current.merge(&slice));
                    if sink.send(slice).is_err() {
                        debug!(slice = %kind, "snapshot: session gone, slice dropped");
                    }
                    kind
                },
            )
            .await
    }
}

async fn fetch_slice(
    source: &dyn SnapshotSource,
    match_id: MatchId,
    kind: SliceKind,
) -> Result<SnapshotSlice> {
    let slice = match kind {
        SliceKind::MatchInfo => {
            let info = source.match_info(match_id).await?;
            let tick = match (info.current_question_order, info.time_remaining) {
                (Some(order), Some(remaining)) => Some(TimerTick {
                    remaining_seconds: remaining,
                    for_question_order: order,
                    received_at: Utc::now(),
                }),
                _ => None,
            };
            SnapshotSlice::MatchInfo { info, tick }
        }
        SliceKind::Background => SnapshotSlice::Background(source.background(match_id).await?),
        SliceKind::CurrentQuestion => {
            SnapshotSlice::CurrentQuestion(source.current_question(match_id).await?)
        }
        SliceKind::Roster => SnapshotSlice::Roster(source.contestants(match_id).await?),
        SliceKind::RescueList => SnapshotSlice::RescueList(source.rescues(match_id).await?),
        SliceKind::ScreenControl => {
            let state = source.screen_control(match_id).await?;
            let signal = ControlSignal::from_snapshot(&state, Utc::now());
            SnapshotSlice::ScreenControl { state, signal }
        }
        SliceKind::QuestionCount => {
            let questions = source.questions(match_id).await?;
            SnapshotSlice::QuestionCount(u32::try_from(questions.len()).unwrap_or(u32::MAX))
        }
    };
    Ok(slice)
}

#[cfg(test)]
#[path = "tests/snapshot_tests.rs"]
mod tests;
